use crate::cli::{Commands, RuntimeOptions, WorkspaceArgs};
use anyhow::{Context, Result};
use devhaven_config::Config;
use devhaven_tmux::{Session, SessionEvent, SessionManager, SessionStatus, TmuxPaneId};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::error::RecvError;

/// Main application state
pub struct App {
    config: Config,
    runtime: Arc<Runtime>,
    options: RuntimeOptions,
}

impl App {
    /// Load configuration and prepare to run `options.command`.
    pub fn new(runtime: Arc<Runtime>, options: RuntimeOptions) -> Result<Self> {
        let config = match &options.config_path {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::load()?,
        };
        crate::debug::apply_config_level(config.log_level.to_level_filter());
        Ok(Self {
            config,
            runtime,
            options,
        })
    }

    /// Run the command to completion
    pub fn run(self) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        runtime.block_on(self.execute())
    }

    async fn execute(self) -> Result<()> {
        crate::debug_info!("APP", "Running {:?}", self.options.command);
        let manager = SessionManager::new(self.config.clone())?;

        match &self.options.command {
            Commands::Open { target, watch } => {
                let session = open(&manager, target).await?;
                print_json(&json!({
                    "session": session.info(),
                    "topology": &*session.snapshot()?,
                }))?;
                if *watch {
                    watch_session(&session).await?;
                }
            }
            Commands::Check => {
                let status = manager.tmux_status().await;
                print_json(&json!(status))?;
                if !status.supported {
                    anyhow::bail!(status.reason.unwrap_or_else(|| "tmux is unsupported".to_string()));
                }
            }
            Commands::Sessions => {
                let sessions = manager.discover_sessions().await?;
                print_json(&json!(sessions))?;
            }
            Commands::Capture { target, pane } => {
                let session = open(&manager, target).await?;
                let pane_id = resolve_pane(&session, *pane)?;
                let contents = manager.capture_pane(pane_id).await?;
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&contents)?;
                stdout.write_all(b"\n")?;
            }
            Commands::Send {
                target,
                pane,
                enter,
                text,
            } => {
                let session = open(&manager, target).await?;
                let pane_id = resolve_pane(&session, *pane)?;
                let mut input = text.clone().into_bytes();
                if *enter {
                    input.push(b'\r');
                }
                manager.send_input(pane_id, &input).await?;
            }
            Commands::Close { target } => {
                let session = open(&manager, target).await?;
                manager.close_session(session.id()).await?;
                log::info!("Closed {}", session.id());
                return Ok(());
            }
            Commands::InitConfig { .. } => {
                anyhow::bail!("init-config is handled before the app starts")
            }
        }

        // Leave tmux sessions running for the next invocation
        manager.shutdown().await;
        Ok(())
    }
}

async fn open(manager: &SessionManager, target: &WorkspaceArgs) -> Result<Arc<Session>> {
    let cwd = match &target.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    manager
        .open_session(&target.workspace, &cwd)
        .await
        .with_context(|| format!("opening workspace {}", target.workspace))
}

/// The requested pane, or the session's active pane.
fn resolve_pane(session: &Session, pane: Option<TmuxPaneId>) -> Result<TmuxPaneId> {
    if let Some(pane_id) = pane {
        return Ok(pane_id);
    }
    let snapshot = session.snapshot()?;
    snapshot
        .active_pane()
        .map(|p| p.id)
        .context("session has no active pane")
}

/// Print session events until Ctrl-C or the session ends.
async fn watch_session(session: &Session) -> Result<()> {
    let mut events = session.events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, detaching {}", session.id());
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_json(&event_json(&event))?;
                    if matches!(event, SessionEvent::StatusChanged(SessionStatus::Closed)) {
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Event stream lagged, {missed} events dropped");
                    print_json(&json!({
                        "event": "state_changed",
                        "snapshot": &*session.snapshot()?,
                    }))?;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// JSON form of a session event, one object per line in `open --watch`.
pub fn event_json(event: &SessionEvent) -> serde_json::Value {
    match event {
        SessionEvent::StateChanged(snapshot) => json!({
            "event": "state_changed",
            "snapshot": &**snapshot,
        }),
        SessionEvent::FlowChanged {
            pane_id,
            state,
            degraded,
        } => json!({
            "event": "flow_changed",
            "pane_id": pane_id,
            "state": state,
            "degraded": degraded,
        }),
        SessionEvent::StatusChanged(status) => json!({
            "event": "status_changed",
            "status": status,
        }),
        SessionEvent::Disconnected { reason } => json!({
            "event": "disconnected",
            "reason": reason,
        }),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}
