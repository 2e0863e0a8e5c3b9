//! Error types for the tmux control-mode engine.

use crate::types::{TmuxPaneId, TmuxWindowId};
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, TmuxError>;

/// Errors produced by the control-mode engine.
///
/// Only transport failures are fatal to a session. Parse failures are logged
/// and the offending line skipped by the reader, so callers never see them
/// unless they call [`crate::parser::parse_line`] directly.
#[derive(Debug, Error)]
pub enum TmuxError {
    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------
    /// Writing to or reading from the host process failed.
    #[error("tmux transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The host process exited; the notification stream has ended.
    #[error("tmux control channel closed")]
    ChannelClosed,

    /// The tmux binary could not be started.
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // -----------------------------------------------------------------------
    // Protocol
    // -----------------------------------------------------------------------
    /// A control-mode line did not match the shape of its notification.
    #[error("malformed control line {line:?}: {reason}")]
    Parse { line: String, reason: String },

    /// tmux answered a command with `%error`.
    #[error("tmux rejected `{command}`: {message}")]
    CommandFailed { command: String, message: String },

    /// The refresh this request was merged into failed or was dropped.
    #[error("refresh abandoned before it ran")]
    RefreshAbandoned,

    /// tmux did not answer an awaited command in time.
    #[error("tmux did not answer `{command}` within {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------
    /// A command was issued to a session that is starting, detached or closed.
    #[error("session {0} is not attached")]
    SessionNotAttached(String),

    /// The configured tmux is missing or too old.
    #[error("tmux unavailable: {0}")]
    Unsupported(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("unknown pane %{0}")]
    UnknownPane(TmuxPaneId),

    #[error("unknown window @{0}")]
    UnknownWindow(TmuxWindowId),

    #[error(transparent)]
    Config(#[from] devhaven_config::ConfigError),
}

impl TmuxError {
    pub(crate) fn parse(line: impl Into<String>, reason: impl Into<String>) -> Self {
        TmuxError::Parse {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the control channel to the host is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TmuxError::Transport(_) | TmuxError::ChannelClosed)
    }
}
