//! tmux command builders for control mode
//!
//! Commands are written to the control client's stdin one per line. User
//! supplied values (session names, paths, text) are quoted with
//! `shell_words::quote`, which produces single-quoted strings that the tmux
//! command parser accepts.
//!
//! Sessions are always targeted as `=NAME`. A bare name that matches no
//! session makes tmux fall back to prefix matching, so `web` would resolve
//! to `webapp`.

use crate::types::{PaneDirection, SplitDirection, TmuxPaneId, TmuxWindowId};
use std::path::Path;

/// `list-windows` / `display-message` format for one window row.
///
/// The name is last so a tab inside it cannot shift the other fields.
pub const WINDOW_FORMAT: &str = "#{window_id}\t#{window_index}\t#{window_active}\t#{window_width}\t#{window_height}\t#{window_layout}\t#{window_name}";

/// `list-panes` format for one pane row.
pub const PANE_FORMAT: &str = "#{pane_id}\t#{window_id}\t#{pane_index}\t#{pane_active}\t#{pane_width}\t#{pane_height}\t#{pane_left}\t#{pane_top}\t#{pane_current_command}";

/// `display-message` format identifying the attached session.
pub const SESSION_FORMAT: &str = "#{session_id}\t#{session_name}";

/// `list-sessions` format used for host discovery.
pub const HOST_SESSION_FORMAT: &str =
    "#{session_name}\t#{session_created}\t#{session_attached}\t#{session_windows}";

/// A tmux command ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmuxCommand {
    /// The command string (without trailing newline)
    command: String,
}

impl TmuxCommand {
    fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Wrap an arbitrary command line.
    ///
    /// Embedded newlines would split the command on the wire, so they are
    /// replaced with spaces.
    pub fn raw(command: &str) -> Self {
        Self::new(command.replace(['\n', '\r'], " "))
    }

    pub fn as_str(&self) -> &str {
        &self.command
    }

    /// Get the command as bytes for writing to the control mode session
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = self.command.as_bytes().to_vec();
        bytes.push(b'\n');
        bytes
    }

    // =========================================================================
    // Session Commands
    // =========================================================================

    /// Identify the session this control client is attached to
    pub fn describe_session() -> Self {
        Self::new(format!("display-message -p {}", quote(SESSION_FORMAT)))
    }

    pub fn kill_session(session: &str) -> Self {
        Self::new(format!("kill-session -t {}", target(session)))
    }

    /// Set a session option (`@user` options included)
    pub fn set_session_option(session: &str, option: &str, value: &str) -> Self {
        Self::new(format!(
            "set-option -t {} {} {}",
            target(session),
            quote(option),
            quote(value)
        ))
    }

    /// Detach this control client, leaving the session running
    pub fn detach_client() -> Self {
        Self::new("detach-client")
    }

    // =========================================================================
    // Window Commands
    // =========================================================================

    pub fn list_windows(session: &str) -> Self {
        Self::new(format!(
            "list-windows -t {} -F {}",
            target(session),
            quote(WINDOW_FORMAT)
        ))
    }

    /// One window row for a targeted refresh
    pub fn describe_window(window_id: TmuxWindowId) -> Self {
        Self::new(format!(
            "display-message -p -t @{} {}",
            window_id,
            quote(WINDOW_FORMAT)
        ))
    }

    pub fn new_window(session: &str, cwd: Option<&Path>) -> Self {
        let mut cmd = format!("new-window -t {}", target(session));
        if let Some(cwd) = cwd {
            cmd.push_str(" -c ");
            cmd.push_str(&quote(&cwd.to_string_lossy()));
        }
        Self::new(cmd)
    }

    /// Select a window by ID
    pub fn select_window(window_id: TmuxWindowId) -> Self {
        Self::new(format!("select-window -t @{}", window_id))
    }

    /// Select a window by its index within a session
    pub fn select_window_index(session: &str, index: usize) -> Self {
        Self::new(format!(
            "select-window -t {}",
            quote(&format!("{}:{index}", session_target(session)))
        ))
    }

    pub fn next_window(session: &str) -> Self {
        Self::new(format!("next-window -t {}", target(session)))
    }

    pub fn previous_window(session: &str) -> Self {
        Self::new(format!("previous-window -t {}", target(session)))
    }

    // =========================================================================
    // Pane Commands
    // =========================================================================

    /// All panes of every window in a session
    pub fn list_session_panes(session: &str) -> Self {
        Self::new(format!(
            "list-panes -s -t {} -F {}",
            target(session),
            quote(PANE_FORMAT)
        ))
    }

    /// Panes of one window
    pub fn list_window_panes(window_id: TmuxWindowId) -> Self {
        Self::new(format!(
            "list-panes -t @{} -F {}",
            window_id,
            quote(PANE_FORMAT)
        ))
    }

    /// Split a pane, starting the new shell in the pane's current directory
    pub fn split_pane(pane_id: TmuxPaneId, direction: SplitDirection) -> Self {
        Self::new(format!(
            "split-window {} -t %{} -c {}",
            direction.flag(),
            pane_id,
            quote("#{pane_current_path}")
        ))
    }

    /// Select a pane by ID
    pub fn select_pane(pane_id: TmuxPaneId) -> Self {
        Self::new(format!("select-pane -t %{}", pane_id))
    }

    /// Select the neighbor of a pane in `direction`
    pub fn select_pane_direction(pane_id: TmuxPaneId, direction: PaneDirection) -> Self {
        Self::new(format!("select-pane {} -t %{}", direction.flag(), pane_id))
    }

    /// Kill a pane
    pub fn kill_pane(pane_id: TmuxPaneId) -> Self {
        Self::new(format!("kill-pane -t %{}", pane_id))
    }

    /// Move one edge of a pane by `amount` cells
    pub fn resize_pane(pane_id: TmuxPaneId, direction: PaneDirection, amount: u16) -> Self {
        Self::new(format!(
            "resize-pane {} -t %{} {}",
            direction.flag(),
            pane_id,
            amount
        ))
    }

    // =========================================================================
    // Input/Output Commands
    // =========================================================================

    /// Send input bytes to a pane.
    ///
    /// Printable ASCII goes through `send-keys -l` so it is typed verbatim.
    /// Anything else (control characters, escape sequences, UTF-8) is sent
    /// as hex with `send-keys -H`, which tmux writes to the pane unchanged.
    pub fn send_input(pane_id: TmuxPaneId, data: &[u8]) -> Self {
        let printable = data.iter().all(|b| (0x20..0x7f).contains(b));
        if printable && !data.is_empty() && data[0] != b'-' {
            // A leading '-' would be taken as a flag even when quoted
            let text = String::from_utf8_lossy(data);
            Self::new(format!("send-keys -l -t %{} {}", pane_id, quote(&text)))
        } else {
            let hex: Vec<String> = data.iter().map(|b| format!("{b:02x}")).collect();
            Self::new(format!("send-keys -H -t %{} {}", pane_id, hex.join(" ")))
        }
    }

    /// Capture the visible screen plus history, with escape sequences
    pub fn capture_pane(pane_id: TmuxPaneId) -> Self {
        Self::new(format!("capture-pane -p -e -S - -t %{}", pane_id))
    }

    /// Report the cursor position of a pane as `x\ty`
    pub fn pane_cursor(pane_id: TmuxPaneId) -> Self {
        Self::new(format!(
            "display-message -p -t %{} {}",
            pane_id,
            quote("#{cursor_x}\t#{cursor_y}")
        ))
    }

    // =========================================================================
    // Control Mode Specific
    // =========================================================================

    /// Ask tmux to pause a pane once its output is `seconds` behind
    pub fn enable_pause_after(seconds: u32) -> Self {
        Self::new(format!("refresh-client -f pause-after={}", seconds))
    }

    /// Resume output for a paused pane
    pub fn continue_pane(pane_id: TmuxPaneId) -> Self {
        Self::new(format!("refresh-client -A '%{}:continue'", pane_id))
    }

    /// Register a format subscription.
    ///
    /// `target` is empty for the session, `@*`/`%*` for every window/pane, or
    /// a single `@N`/`%N`.
    pub fn subscribe(name: &str, target: &str, format: &str) -> Self {
        Self::new(format!(
            "refresh-client -B {}",
            quote(&format!("{name}:{target}:{format}"))
        ))
    }

    pub fn unsubscribe(name: &str) -> Self {
        Self::new(format!("refresh-client -B {}", quote(name)))
    }

    /// Set the control client size
    ///
    /// In control mode, tmux doesn't know the terminal size unless we tell it.
    pub fn set_client_size(cols: u16, rows: u16) -> Self {
        // tmux requires -C XxY format (lowercase x), not comma
        Self::new(format!("refresh-client -C {}x{}", cols, rows))
    }
}

/// Exact-match target for a session name.
pub fn session_target(session: &str) -> String {
    format!("={session}")
}

fn target(session: &str) -> String {
    quote(&session_target(session))
}

fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}
