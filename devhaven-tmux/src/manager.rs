//! Workspace sessions, keyed by tmux session name
//!
//! The manager is the engine's front door. It maps workspaces to tmux
//! sessions, keeps at most one [`Session`] entry per workspace, and routes
//! pane and window commands to the session that owns the target.

use crate::buffer::{OutputAttachment, OutputBufferStore};
use crate::connector::{self, Connector, TmuxProcessConnector};
use crate::error::{Result, TmuxError};
use crate::events::EventReceiver;
use crate::session::{Session, SessionInfo, SessionOptions};
use crate::types::{
    HostSessionInfo, PaneDirection, SessionStatus, SplitDirection, TmuxPane, TmuxPaneId,
    TmuxSupportStatus, TmuxWindow, TmuxWindowId,
};
use devhaven_config::Config;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

static INVALID_NAME_CHARS: OnceLock<Regex> = OnceLock::new();

fn invalid_name_chars() -> &'static Regex {
    INVALID_NAME_CHARS
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").expect("Failed to compile session name regex"))
}

/// tmux session name for a workspace.
///
/// Characters tmux treats specially in targets (`.`, `:`) and anything
/// outside `[A-Za-z0-9_-]` become `_`. A name with nothing usable left
/// falls back to `prefix`.
pub fn session_name_for(workspace_id: &str, prefix: &str) -> String {
    let sanitized = invalid_name_chars().replace_all(workspace_id.trim(), "_");
    if sanitized.chars().all(|c| c == '_') {
        prefix.to_string()
    } else {
        sanitized.into_owned()
    }
}

pub struct SessionManager {
    config: Config,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    buffers: Arc<OutputBufferStore>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Keeps two opens of the same workspace from racing
    open_lock: tokio::sync::Mutex<()>,
    /// Set once tmux has been found usable
    tmux_checked: tokio::sync::OnceCell<()>,
}

impl SessionManager {
    /// Manager backed by the tmux binary named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        let connector = Arc::new(TmuxProcessConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Session manager: tmux={} buffer_limit={} debounce={}ms",
            config.tmux_path,
            config.output_buffer_limit,
            config.refresh_debounce_ms
        );
        Ok(Self {
            options: SessionOptions::from(&config),
            buffers: Arc::new(OutputBufferStore::new(config.output_buffer_limit)),
            config,
            connector,
            sessions: RwLock::new(HashMap::new()),
            open_lock: tokio::sync::Mutex::new(()),
            tmux_checked: tokio::sync::OnceCell::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The process-wide output buffer store.
    pub fn buffers(&self) -> &Arc<OutputBufferStore> {
        &self.buffers
    }

    pub fn session_name(&self, workspace_id: &str) -> String {
        session_name_for(workspace_id, &self.config.session_prefix)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a workspace's session, reusing an existing entry for the same
    /// session name or directory. Detached sessions are reattached; closed
    /// ones are replaced.
    pub async fn open_session(&self, workspace_id: &str, cwd: &Path) -> Result<Arc<Session>> {
        self.ensure_tmux().await?;
        let _open = self.open_lock.lock().await;
        let name = self.session_name(workspace_id);

        let existing = {
            let sessions = self.sessions.read();
            sessions.get(&name).cloned().or_else(|| {
                sessions
                    .values()
                    .find(|s| s.cwd() == cwd && s.status() != SessionStatus::Closed)
                    .cloned()
            })
        };

        if let Some(session) = existing {
            match session.status() {
                SessionStatus::Attached => return Ok(session),
                SessionStatus::Closed => {
                    log::debug!("Replacing closed session {}", session.id());
                    self.sessions.write().remove(session.id());
                }
                SessionStatus::Detached | SessionStatus::Starting => {
                    log::info!("Reattaching session {} for {workspace_id}", session.id());
                    if let Err(e) = session.attach().await {
                        self.sessions.write().remove(session.id());
                        return Err(e);
                    }
                    return Ok(session);
                }
            }
        }

        log::info!("Opening session {name} for {workspace_id} in {}", cwd.display());
        let session = Session::new(
            name.clone(),
            workspace_id,
            cwd,
            Arc::clone(&self.buffers),
            Arc::clone(&self.connector),
            self.options.clone(),
        );
        self.sessions.write().insert(name.clone(), Arc::clone(&session));

        if let Err(e) = session.attach().await {
            self.sessions.write().remove(&name);
            return Err(e);
        }
        Ok(session)
    }

    /// Whether the configured tmux exists and is new enough.
    pub async fn tmux_status(&self) -> TmuxSupportStatus {
        connector::support_status(self.connector.version().await)
    }

    /// Fail fast with a clear reason instead of a spawn error. Only a
    /// successful check is remembered.
    async fn ensure_tmux(&self) -> Result<()> {
        self.tmux_checked
            .get_or_try_init(|| async {
                let status = self.tmux_status().await;
                match status.reason {
                    Some(reason) if !status.supported => {
                        log::error!("tmux check failed: {reason}");
                        Err(TmuxError::Unsupported(reason))
                    }
                    _ => {
                        log::info!("Using {}", status.version.as_deref().unwrap_or("tmux"));
                        Ok(())
                    }
                }
            })
            .await
            .map(|_| ())
    }

    /// Hide a workspace: drop its control channel, keep the tmux session.
    pub async fn detach_session(&self, id: &str) -> Result<()> {
        self.session(id)?.detach().await
    }

    /// Kill a workspace's tmux session and forget it.
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = self.session(id)?;
        session.close().await?;
        self.sessions.write().remove(id);
        Ok(())
    }

    /// Detach every attached session, leaving the tmux sessions running.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            if session.status() == SessionStatus::Attached
                && let Err(e) = session.detach().await
            {
                log::warn!("Detaching {} failed: {e}", session.id());
            }
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TmuxError::UnknownSession(id.to_string()))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.read().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn events(&self, id: &str) -> Result<EventReceiver> {
        Ok(self.session(id)?.events())
    }

    fn pane_owner(&self, pane_id: TmuxPaneId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.owns_pane(pane_id))
            .cloned()
            .ok_or(TmuxError::UnknownPane(pane_id))
    }

    fn window_owner(&self, window_id: TmuxWindowId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.owns_window(window_id))
            .cloned()
            .ok_or(TmuxError::UnknownWindow(window_id))
    }

    /// Sessions present on the tmux server, including ones not opened here.
    pub async fn discover_sessions(&self) -> Result<Vec<HostSessionInfo>> {
        self.connector.list_sessions().await
    }

    // ========================================================================
    // Windows
    // ========================================================================

    pub fn list_windows(&self, id: &str) -> Result<Vec<TmuxWindow>> {
        self.session(id)?.list_windows()
    }

    pub fn list_panes(&self, window_id: TmuxWindowId) -> Result<Vec<TmuxPane>> {
        self.window_owner(window_id)?.list_panes(window_id)
    }

    pub async fn select_window(&self, window_id: TmuxWindowId) -> Result<()> {
        self.window_owner(window_id)?.select_window(window_id).await
    }

    pub async fn select_window_index(&self, id: &str, index: usize) -> Result<()> {
        self.session(id)?.select_window_index(index).await
    }

    pub async fn next_window(&self, id: &str) -> Result<()> {
        self.session(id)?.next_window().await
    }

    pub async fn previous_window(&self, id: &str) -> Result<()> {
        self.session(id)?.previous_window().await
    }

    pub async fn new_window(&self, id: &str) -> Result<()> {
        self.session(id)?.new_window().await
    }

    pub async fn resize_client(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.session(id)?.resize_client(cols, rows).await
    }

    // ========================================================================
    // Panes
    // ========================================================================

    pub async fn select_pane(&self, pane_id: TmuxPaneId) -> Result<()> {
        self.pane_owner(pane_id)?.select_pane(pane_id).await
    }

    pub async fn select_pane_direction(
        &self,
        pane_id: TmuxPaneId,
        direction: PaneDirection,
    ) -> Result<()> {
        self.pane_owner(pane_id)?
            .select_pane_direction(pane_id, direction)
            .await
    }

    pub async fn split_pane(&self, pane_id: TmuxPaneId, direction: SplitDirection) -> Result<()> {
        self.pane_owner(pane_id)?.split_pane(pane_id, direction).await
    }

    pub async fn kill_pane(&self, pane_id: TmuxPaneId) -> Result<()> {
        self.pane_owner(pane_id)?.kill_pane(pane_id).await
    }

    pub async fn resize_pane(
        &self,
        pane_id: TmuxPaneId,
        direction: PaneDirection,
        amount: u16,
    ) -> Result<()> {
        self.pane_owner(pane_id)?
            .resize_pane(pane_id, direction, amount)
            .await
    }

    pub async fn send_input(&self, pane_id: TmuxPaneId, data: &[u8]) -> Result<()> {
        self.pane_owner(pane_id)?.send_input(pane_id, data).await
    }

    pub async fn capture_pane(&self, pane_id: TmuxPaneId) -> Result<Vec<u8>> {
        self.pane_owner(pane_id)?.capture_pane(pane_id).await
    }

    pub async fn pane_cursor(&self, pane_id: TmuxPaneId) -> Result<(u16, u16)> {
        self.pane_owner(pane_id)?.pane_cursor(pane_id).await
    }

    /// Snapshot of a pane's output plus a receiver for everything after it.
    pub fn attach_output(&self, pane_id: TmuxPaneId) -> Result<OutputAttachment> {
        self.pane_owner(pane_id)?.attach_output(pane_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_sanitizing() {
        assert_eq!(session_name_for("api-server", "devhaven"), "api-server");
        assert_eq!(session_name_for("my app.v2:main", "devhaven"), "my_app_v2_main");
        assert_eq!(session_name_for("  ", "devhaven"), "devhaven");
        assert_eq!(session_name_for("...", "devhaven"), "devhaven");
        assert_eq!(session_name_for("日本", "dh"), "dh");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            output_buffer_limit: 0,
            ..Config::default()
        };
        assert!(matches!(SessionManager::new(config), Err(TmuxError::Config(_))));
    }

    #[test]
    fn test_unknown_ids() {
        let manager = SessionManager::new(Config::default()).unwrap();
        assert!(matches!(manager.session("nope"), Err(TmuxError::UnknownSession(_))));
        assert!(matches!(manager.list_panes(3), Err(TmuxError::UnknownWindow(3))));
        assert!(matches!(manager.attach_output(7), Err(TmuxError::UnknownPane(7))));
        assert!(manager.sessions().is_empty());
    }
}
