//! Core types for the control-mode engine
//!
//! These types mirror tmux's own objects (sessions, windows, panes) and the
//! client-side state layered on top of them (lifecycle, flow control).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// tmux window ID (e.g., @0, @1)
pub type TmuxWindowId = u64;

/// tmux pane ID (e.g., %0, %1)
pub type TmuxPaneId = u64;

/// tmux session ID (e.g., $0, $1)
pub type TmuxSessionId = u64;

/// A sigil-prefixed tmux identifier as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedId {
    /// `%N`
    Pane(TmuxPaneId),
    /// `@N`
    Window(TmuxWindowId),
    /// `$N`
    Session(TmuxSessionId),
}

impl ParsedId {
    /// Parse `%5`, `@5` or `$5`. Anything else yields `None`.
    pub fn parse(token: &str) -> Option<Self> {
        let mut chars = token.chars();
        let sigil = chars.next()?;
        let number: u64 = chars.as_str().parse().ok()?;
        match sigil {
            '%' => Some(ParsedId::Pane(number)),
            '@' => Some(ParsedId::Window(number)),
            '$' => Some(ParsedId::Session(number)),
            _ => None,
        }
    }

    pub fn as_pane(self) -> Option<TmuxPaneId> {
        match self {
            ParsedId::Pane(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_window(self) -> Option<TmuxWindowId> {
        match self {
            ParsedId::Window(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_session(self) -> Option<TmuxSessionId> {
        match self {
            ParsedId::Session(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ParsedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedId::Pane(id) => write!(f, "%{id}"),
            ParsedId::Window(id) => write!(f, "@{id}"),
            ParsedId::Session(id) => write!(f, "${id}"),
        }
    }
}

/// Lifecycle state of a workspace session.
///
/// `Starting → Attached → Detached → Closed`, with `Starting → Closed` on a
/// failed open and `Detached → Starting` when a hidden workspace is reopened.
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Attached,
    Detached,
    Closed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Starting, Attached)
                | (Starting, Closed)
                | (Attached, Detached)
                | (Attached, Closed)
                | (Detached, Starting)
                | (Detached, Closed)
        )
    }
}

/// Flow-control state of a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Flowing,
    /// tmux stopped sending output for this pane (`%pause`)
    Paused,
}

/// Direction of a new split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDirection {
    /// New pane to the right (`split-window -h`)
    Horizontal,
    /// New pane below (`split-window -v`)
    Vertical,
}

impl SplitDirection {
    pub fn flag(self) -> &'static str {
        match self {
            SplitDirection::Horizontal => "-h",
            SplitDirection::Vertical => "-v",
        }
    }
}

impl FromStr for SplitDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vertical" | "v" | "down" => Ok(SplitDirection::Vertical),
            "horizontal" | "h" | "right" => Ok(SplitDirection::Horizontal),
            other => Err(format!("unknown split direction: {other}")),
        }
    }
}

/// Edge moved by `resize-pane`, or the neighbor picked by `select-pane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneDirection {
    Left,
    Right,
    Up,
    Down,
}

impl PaneDirection {
    pub fn flag(self) -> &'static str {
        match self {
            PaneDirection::Left => "-L",
            PaneDirection::Right => "-R",
            PaneDirection::Up => "-U",
            PaneDirection::Down => "-D",
        }
    }
}

impl FromStr for PaneDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" | "l" => Ok(PaneDirection::Left),
            "right" | "r" => Ok(PaneDirection::Right),
            "up" | "u" => Ok(PaneDirection::Up),
            "down" | "d" => Ok(PaneDirection::Down),
            other => Err(format!("unknown pane direction: {other}")),
        }
    }
}

/// A tmux window as mirrored on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxWindow {
    /// Window ID (e.g., @0)
    pub id: TmuxWindowId,
    /// Window index (0-based unless the user changed `base-index`)
    pub index: usize,
    /// Window name/title
    pub name: String,
    /// Whether this is the active window
    pub active: bool,
    pub width: usize,
    pub height: usize,
    /// Layout string (e.g., "89x24,0,0{44x24,0,0,1,44x24,45,0,2}")
    pub layout: String,
    /// Panes in this window, ordered by pane index
    pub panes: Vec<TmuxPaneId>,
}

impl TmuxWindow {
    pub fn new(id: TmuxWindowId, index: usize, name: impl Into<String>) -> Self {
        Self {
            id,
            index,
            name: name.into(),
            active: false,
            width: 0,
            height: 0,
            layout: String::new(),
            panes: Vec::new(),
        }
    }
}

/// A tmux pane as mirrored on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxPane {
    /// Pane ID (e.g., %0)
    pub id: TmuxPaneId,
    /// Window that owns this pane
    pub window_id: TmuxWindowId,
    /// Position within the window
    pub index: usize,
    /// Whether this pane is active in its window
    pub active: bool,
    /// Pane width in characters
    pub width: usize,
    /// Pane height in characters
    pub height: usize,
    /// Pane X position in characters
    pub x: usize,
    /// Pane Y position in characters
    pub y: usize,
    /// Current command running in the pane
    pub current_command: String,
    pub flow: FlowState,
}

impl TmuxPane {
    pub fn new(id: TmuxPaneId, window_id: TmuxWindowId) -> Self {
        Self {
            id,
            window_id,
            index: 0,
            active: false,
            width: 80,
            height: 24,
            x: 0,
            y: 0,
            current_command: String::new(),
            flow: FlowState::Flowing,
        }
    }

    /// Set pane geometry, returning whether anything changed.
    pub fn set_geometry(&mut self, x: usize, y: usize, width: usize, height: usize) -> bool {
        let changed = (self.x, self.y, self.width, self.height) != (x, y, width, height);
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
        changed
    }
}

/// Immutable view of one session's topology, published after every change.
///
/// Windows are ordered by index; panes are grouped by window in that same
/// order and ordered by pane index within each window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologySnapshot {
    pub session: String,
    pub windows: Vec<TmuxWindow>,
    pub panes: Vec<TmuxPane>,
}

impl TopologySnapshot {
    pub fn empty(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Self::default()
        }
    }

    pub fn window(&self, id: TmuxWindowId) -> Option<&TmuxWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    pub fn pane(&self, id: TmuxPaneId) -> Option<&TmuxPane> {
        self.panes.iter().find(|p| p.id == id)
    }

    pub fn panes_of(&self, window: TmuxWindowId) -> Vec<&TmuxPane> {
        self.panes.iter().filter(|p| p.window_id == window).collect()
    }

    pub fn active_window(&self) -> Option<&TmuxWindow> {
        self.windows.iter().find(|w| w.active)
    }

    /// Active pane of the active window.
    pub fn active_pane(&self) -> Option<&TmuxPane> {
        let window = self.active_window()?;
        self.panes
            .iter()
            .find(|p| p.window_id == window.id && p.active)
    }
}

/// A session found on the tmux server by `list-sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSessionInfo {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    /// Number of clients attached to the session
    pub attached: usize,
    pub windows: usize,
}

/// Whether the configured tmux can drive workspace sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TmuxSupportStatus {
    pub supported: bool,
    /// `tmux -V` output when the binary ran
    pub version: Option<String>,
    pub reason: Option<String>,
}
