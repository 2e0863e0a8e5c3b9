//! tmux control-mode session engine for DevHaven workspaces.
//!
//! Each workspace gets a tmux session driven over a `tmux -C` control
//! channel. The engine keeps a client-side mirror of the session's windows
//! and panes, buffers pane output for replay into any number of views, and
//! keeps the channel flowing under output pressure.
//!
//! ## Architecture
//!
//! - [`parser`] / [`commands`] / [`client`]: the control-mode line protocol,
//!   typed command builders, and the channel owning reply correlation
//! - [`mirror`] / [`refresh`] / [`layout`]: topology mirror with debounced,
//!   coalesced refreshes and layout-driven geometry
//! - [`buffer`]: bounded per-pane output history with snapshot + subscribe
//! - [`flow_control`] / [`subscriptions`]: pause-after auto-resume and
//!   `refresh-client -B` change detection
//! - [`session`] / [`manager`]: lifecycle (`Starting → Attached → Detached →
//!   Closed`) and the public entry point, [`SessionManager`]
//! - [`connector`]: how control channels are opened, swappable for tests

pub mod buffer;
pub mod client;
pub mod commands;
pub mod connector;
pub mod error;
pub mod events;
pub mod flow_control;
pub mod layout;
pub mod manager;
pub mod mirror;
pub mod parser;
pub mod refresh;
pub mod session;
pub mod subscriptions;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use buffer::{OutputAttachment, OutputBufferStore};
pub use client::{NotificationStream, PendingReply, ProtocolClient};
pub use commands::TmuxCommand;
pub use connector::{ConnectRequest, Connector, TmuxProcessConnector};
pub use error::{Result, TmuxError};
pub use events::{EventReceiver, SessionEvent};
pub use manager::{SessionManager, session_name_for};
pub use parser::Notification;
pub use session::{Session, SessionInfo, SessionOptions};
pub use types::{
    FlowState, HostSessionInfo, PaneDirection, SessionStatus, SplitDirection, TmuxPane,
    TmuxPaneId, TmuxSupportStatus, TmuxWindow, TmuxWindowId, TopologySnapshot,
};
