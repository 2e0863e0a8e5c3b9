//! How sessions reach a tmux server
//!
//! [`Connector`] is the seam between the session lifecycle and the tmux
//! processes it starts. [`TmuxProcessConnector`] runs the real binary;
//! tests substitute an in-process host.

use crate::client::ProtocolClient;
use crate::commands::{HOST_SESSION_FORMAT, session_target};
use crate::error::{Result, TmuxError};
use crate::types::{HostSessionInfo, TmuxSupportStatus};
use async_trait::async_trait;
use chrono::DateTime;
use devhaven_config::Config;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// stderr fragments tmux prints when there is no server or no session to
/// list
const NO_SERVER_MARKERS: &[&str] = &[
    "no server running",
    "failed to connect to server",
    "no sessions",
    "error connecting to",
];

/// stderr fragments tmux prints when a target session does not exist
const MISSING_SESSION_MARKERS: &[&str] = &["can't find session", "no such session"];

/// Oldest tmux with `pause-after` flow control and `refresh-client -B`
pub const MIN_TMUX_VERSION: (u32, u32) = (3, 2);

/// Parameters for opening a control channel to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// tmux session name; created if missing
    pub session: String,
    /// Working directory for a newly created session
    pub cwd: PathBuf,
    pub command_timeout: Duration,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a control channel attached to `request.session`.
    async fn connect(&self, request: &ConnectRequest) -> Result<ProtocolClient>;

    /// Kill a session without attaching to it. Killing a session that does
    /// not exist succeeds.
    async fn kill_session(&self, session: &str) -> Result<()>;

    /// Every session on the server; empty when no server is running.
    async fn list_sessions(&self) -> Result<Vec<HostSessionInfo>>;

    /// `tmux -V` output, e.g. `tmux 3.4`.
    async fn version(&self) -> Result<String>;
}

/// Starts real tmux processes.
#[derive(Debug, Clone)]
pub struct TmuxProcessConnector {
    tmux_path: PathBuf,
}

impl TmuxProcessConnector {
    pub fn new(tmux_path: impl Into<PathBuf>) -> Self {
        Self {
            tmux_path: tmux_path.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.tmux_path)
    }

    /// Run a one-shot tmux command, returning stdout on success and stderr
    /// as the error otherwise.
    async fn run(&self, args: &[&str]) -> Result<std::result::Result<String, String>> {
        log::debug!("Running {} {}", self.tmux_path.display(), args.join(" "));
        let output = Command::new(&self.tmux_path)
            .args(args)
            .env_remove("TMUX")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TmuxError::Spawn {
                path: self.tmux_path.display().to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

#[async_trait]
impl Connector for TmuxProcessConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<ProtocolClient> {
        ProtocolClient::spawn(
            &self.tmux_path,
            &request.session,
            &request.cwd,
            request.command_timeout,
        )
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        let target = session_target(session);
        match self.run(&["kill-session", "-t", &target]).await? {
            Ok(_) => Ok(()),
            Err(stderr) if is_missing_session(&stderr) || is_no_server(&stderr) => {
                log::debug!("Session {session} already gone: {stderr}");
                Ok(())
            }
            Err(stderr) => Err(TmuxError::CommandFailed {
                command: format!("kill-session -t {target}"),
                message: stderr,
            }),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<HostSessionInfo>> {
        match self.run(&["list-sessions", "-F", HOST_SESSION_FORMAT]).await? {
            Ok(stdout) => Ok(parse_host_sessions(&stdout)),
            Err(stderr) if is_no_server(&stderr) => Ok(Vec::new()),
            Err(stderr) => Err(TmuxError::CommandFailed {
                command: "list-sessions".to_string(),
                message: stderr,
            }),
        }
    }

    async fn version(&self) -> Result<String> {
        match self.run(&["-V"]).await? {
            Ok(stdout) => Ok(stdout.trim().to_string()),
            Err(stderr) => Err(TmuxError::CommandFailed {
                command: "-V".to_string(),
                message: stderr,
            }),
        }
    }
}

/// Parse `tmux -V` output into `(major, minor)`.
///
/// Development builds (`tmux master`, `tmux next-3.5`) and letter suffixes
/// (`3.3a`) are handled; anything else yields `None`.
pub fn parse_version(output: &str) -> Option<(u32, u32)> {
    let version = output.trim().strip_prefix("tmux ")?;
    if version == "master" {
        return Some((u32::MAX, 0));
    }
    let version = version.strip_prefix("next-").unwrap_or(version);
    let (major, rest) = version.split_once('.')?;
    let minor: String = rest.chars().take_while(char::is_ascii_digit).collect();
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Judge a `tmux -V` result.
pub fn support_status(version: Result<String>) -> TmuxSupportStatus {
    let version = match version {
        Ok(version) => version,
        Err(e) => {
            return TmuxSupportStatus {
                supported: false,
                version: None,
                reason: Some(format!("tmux is not available: {e}")),
            };
        }
    };

    let reason = match parse_version(&version) {
        Some(parsed) if parsed < MIN_TMUX_VERSION => Some(format!(
            "{version} is too old, control mode needs tmux {}.{} or newer",
            MIN_TMUX_VERSION.0, MIN_TMUX_VERSION.1
        )),
        Some(_) => None,
        None => {
            log::warn!("Unrecognized tmux version {version:?}, assuming it is recent");
            None
        }
    };
    TmuxSupportStatus {
        supported: reason.is_none(),
        version: Some(version),
        reason,
    }
}

pub(crate) fn is_no_server(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    NO_SERVER_MARKERS.iter().any(|m| stderr.contains(m))
}

pub(crate) fn is_missing_session(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    MISSING_SESSION_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Parse `list-sessions -F HOST_SESSION_FORMAT` output.
pub(crate) fn parse_host_sessions(stdout: &str) -> Vec<HostSessionInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.to_string();
            let created = fields
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            let attached = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let windows = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            Some(HostSessionInfo {
                name,
                created,
                attached,
                windows,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_sessions() {
        let sessions = parse_host_sessions("api\t1700000000\t1\t3\nweb\tbogus\t0\t1\n\n");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "api");
        assert_eq!(sessions[0].created.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(sessions[0].attached, 1);
        assert_eq!(sessions[0].windows, 3);
        assert_eq!(sessions[1].created, None);
    }

    #[test]
    fn test_stderr_classification() {
        assert!(is_no_server("no server running on /tmp/tmux-501/default"));
        assert!(is_no_server("error connecting to /tmp/tmux-0/default (No such file or directory)"));
        assert!(!is_no_server("unknown option -- z"));
        assert!(is_missing_session("can't find session: api"));
        assert!(!is_missing_session("no server running"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let connector = TmuxProcessConnector::new("/nonexistent/devhaven/tmux");
        let err = connector.list_sessions().await.unwrap_err();
        assert!(matches!(err, TmuxError::Spawn { .. }));

        let status = support_status(connector.version().await);
        assert!(!status.supported);
        assert_eq!(status.version, None);
        assert!(status.reason.unwrap().contains("not available"));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("tmux 3.4\n"), Some((3, 4)));
        assert_eq!(parse_version("tmux 3.3a"), Some((3, 3)));
        assert_eq!(parse_version("tmux next-3.5"), Some((3, 5)));
        assert_eq!(parse_version("tmux master"), Some((u32::MAX, 0)));
        assert_eq!(parse_version("tmux openbsd-7.4"), None);
        assert_eq!(parse_version("screen 4.9"), None);
    }

    #[test]
    fn test_support_status_checks_minimum() {
        let status = support_status(Ok("tmux 3.3a".to_string()));
        assert!(status.supported);
        assert_eq!(status.version.as_deref(), Some("tmux 3.3a"));

        let status = support_status(Ok("tmux 2.9".to_string()));
        assert!(!status.supported);
        assert!(status.reason.unwrap().contains("too old"));

        assert!(support_status(Ok("tmux openbsd-7.4".to_string())).supported);
    }

    #[tokio::test]
    #[ignore = "requires a tmux binary on PATH"]
    async fn test_list_sessions_against_real_tmux() {
        let connector = TmuxProcessConnector::from_config(&Config::default());
        assert!(connector.list_sessions().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    #[ignore = "requires a tmux binary on PATH"]
    async fn test_kill_session_does_not_prefix_match() {
        let socket = format!("devhaven-test-{}", std::process::id());
        let tmux = Config::default().tmux_path;
        let tmux_on = |args: &[&str]| {
            std::process::Command::new(&tmux)
                .args(["-L", socket.as_str()])
                .args(args)
                .output()
                .unwrap()
        };
        assert!(tmux_on(&["new-session", "-d", "-s", "webapp"]).status.success());

        // Point the connector at the private socket through a wrapper script
        let dir = tempfile::tempdir().unwrap();
        let wrapper = dir.path().join("tmux");
        std::fs::write(&wrapper, format!("#!/bin/sh\nexec {tmux} -L {socket} \"$@\"\n")).unwrap();
        let mut perms = std::fs::metadata(&wrapper).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&wrapper, perms).unwrap();

        let connector = TmuxProcessConnector::new(wrapper.clone());
        connector.kill_session("web").await.unwrap();
        let names: Vec<_> = connector
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        tmux_on(&["kill-server"]);
        assert_eq!(names, vec!["webapp".to_string()]);
    }
}
