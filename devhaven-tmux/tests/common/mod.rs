//! Shared integration test helpers for devhaven-tmux.
//!
//! [`FakeConnector`] stands in for the tmux binary: every `connect` opens an
//! in-memory control channel served by a small simulated tmux server that
//! keeps sessions, windows and panes in [`HostState`] and answers the
//! commands the engine issues.
//!
//! Include with `mod common;` at the top of each test file. The
//! `#[allow(dead_code)]` below covers helpers only some files use.

#![allow(dead_code)]

use async_trait::async_trait;
use devhaven_config::Config;
use devhaven_tmux::{
    ConnectRequest, Connector, HostSessionInfo, ProtocolClient, Result, SessionManager, TmuxError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

pub const WIDTH: usize = 80;
pub const HEIGHT: usize = 24;

/// Lines every fake `capture-pane` returns.
pub const CAPTURE_LINES: [&str; 2] = ["$ echo ready", "ready"];

// ============================================================================
// Simulated server state
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakePane {
    pub id: u64,
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct FakeWindow {
    pub id: u64,
    pub index: usize,
    pub name: String,
    pub panes: Vec<FakePane>,
    pub active_pane: u64,
}

impl FakeWindow {
    /// Panes side by side, separated by one border column.
    fn geometry(&self) -> Vec<(u64, usize, usize)> {
        let count = self.panes.len().max(1);
        let width = (WIDTH - (count - 1)) / count;
        self.panes
            .iter()
            .enumerate()
            .map(|(i, pane)| (pane.id, i * (width + 1), width))
            .collect()
    }

    pub fn layout(&self) -> String {
        let cells = self.geometry();
        if let [(id, _, _)] = cells.as_slice() {
            return format!("b25f,{WIDTH}x{HEIGHT},0,0,{id}");
        }
        let children: Vec<String> = cells
            .iter()
            .map(|(id, x, width)| format!("{width}x{HEIGHT},{x},0,{id}"))
            .collect();
        format!("b25f,{WIDTH}x{HEIGHT},0,0{{{}}}", children.join(","))
    }

    fn row(&self, active: bool) -> String {
        format!(
            "@{}\t{}\t{}\t{WIDTH}\t{HEIGHT}\t{}\t{}",
            self.id,
            self.index,
            u8::from(active),
            self.layout(),
            self.name
        )
    }

    fn pane_rows(&self) -> Vec<String> {
        self.geometry()
            .into_iter()
            .zip(&self.panes)
            .enumerate()
            .map(|(index, ((id, x, width), pane))| {
                format!(
                    "%{id}\t@{}\t{index}\t{}\t{width}\t{HEIGHT}\t{x}\t0\t{}",
                    self.id,
                    u8::from(id == self.active_pane),
                    pane.command
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FakeSession {
    pub id: u64,
    pub name: String,
    pub windows: Vec<FakeWindow>,
    pub active_window: u64,
    pub options: BTreeMap<String, String>,
}

impl FakeSession {
    fn window_rows(&self) -> Vec<String> {
        self.windows
            .iter()
            .map(|w| w.row(w.id == self.active_window))
            .collect()
    }

    fn pane_rows(&self) -> Vec<String> {
        self.windows.iter().flat_map(FakeWindow::pane_rows).collect()
    }

    pub fn pane_ids(&self) -> Vec<u64> {
        self.windows
            .iter()
            .flat_map(|w| w.panes.iter().map(|p| p.id))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct HostState {
    pub sessions: BTreeMap<String, FakeSession>,
    next_session: u64,
    next_window: u64,
    next_pane: u64,
}

impl HostState {
    fn new_pane(&mut self) -> FakePane {
        self.next_pane += 1;
        FakePane {
            id: self.next_pane,
            command: "zsh".to_string(),
        }
    }

    fn new_window(&mut self, index: usize) -> FakeWindow {
        self.next_window += 1;
        let pane = self.new_pane();
        FakeWindow {
            id: self.next_window,
            index,
            name: "zsh".to_string(),
            active_pane: pane.id,
            panes: vec![pane],
        }
    }

    /// Create `name` with one window and one pane unless it exists.
    pub fn ensure_session(&mut self, name: &str) {
        if self.sessions.contains_key(name) {
            return;
        }
        self.next_session += 1;
        let window = self.new_window(0);
        let session = FakeSession {
            id: self.next_session,
            name: name.to_string(),
            active_window: window.id,
            windows: vec![window],
            options: BTreeMap::new(),
        };
        self.sessions.insert(name.to_string(), session);
    }

    pub fn add_window(&mut self, session: &str) -> Option<u64> {
        let index = self
            .sessions
            .get(session)?
            .windows
            .iter()
            .map(|w| w.index + 1)
            .max()
            .unwrap_or(0);
        let window = self.new_window(index);
        let id = window.id;
        self.sessions.get_mut(session)?.windows.push(window);
        Some(id)
    }

    fn window_mut(&mut self, session: &str, window_id: u64) -> Option<&mut FakeWindow> {
        self.sessions
            .get_mut(session)?
            .windows
            .iter_mut()
            .find(|w| w.id == window_id)
    }

    fn pane_window(&self, session: &str, pane_id: u64) -> Option<u64> {
        self.sessions
            .get(session)?
            .windows
            .iter()
            .find(|w| w.panes.iter().any(|p| p.id == pane_id))
            .map(|w| w.id)
    }

    /// Split a pane; returns its window.
    fn split(&mut self, session: &str, pane_id: u64) -> Option<u64> {
        let window_id = self.pane_window(session, pane_id)?;
        let pane = self.new_pane();
        let window = self.window_mut(session, window_id)?;
        window.active_pane = pane.id;
        window.panes.push(pane);
        Some(window_id)
    }

    /// Kill a pane; returns its window and whether the window closed with it.
    fn kill_pane(&mut self, session: &str, pane_id: u64) -> Option<(u64, bool)> {
        let window_id = self.pane_window(session, pane_id)?;
        let window = self.window_mut(session, window_id)?;
        window.panes.retain(|p| p.id != pane_id);
        if let Some(first) = window.panes.first() {
            if window.active_pane == pane_id {
                window.active_pane = first.id;
            }
            return Some((window_id, false));
        }

        let fake = self.sessions.get_mut(session)?;
        fake.windows.retain(|w| w.id != window_id);
        if fake.active_window == window_id
            && let Some(first) = fake.windows.first()
        {
            fake.active_window = first.id;
        }
        Some((window_id, true))
    }
}

// ============================================================================
// Control channel
// ============================================================================

enum HostInput {
    Line(String),
    Close,
}

/// What the simulated server does with one command.
struct Outcome {
    reply: std::result::Result<Vec<String>, String>,
    notifications: Vec<String>,
    exit: bool,
}

impl Outcome {
    fn ok(lines: Vec<String>) -> Self {
        Self {
            reply: Ok(lines),
            notifications: Vec::new(),
            exit: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            reply: Err(message.into()),
            notifications: Vec::new(),
            exit: false,
        }
    }

    fn notify(mut self, line: String) -> Self {
        self.notifications.push(line);
        self
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn id_after(target: Option<&str>, sigil: char) -> Option<u64> {
    target?.strip_prefix(sigil)?.parse().ok()
}

struct Host {
    state: Arc<Mutex<HostState>>,
    session: String,
    resume_fails: Arc<AtomicBool>,
}

impl Host {
    /// tmux prefix-matches bare session names, so only `=NAME` is accepted.
    fn targets_own_session(&self, target: Option<&str>) -> bool {
        target.and_then(|t| t.strip_prefix('=')) == Some(self.session.as_str())
    }

    fn handle(&self, line: &str) -> Outcome {
        let args = shell_words::split(line).unwrap_or_default();
        let Some(name) = args.first() else {
            return Outcome::error("empty command");
        };
        let target = flag_value(&args, "-t");
        let session_scoped = matches!(name.as_str(), "list-windows" | "set-option" | "new-window")
            || (name.as_str() == "list-panes" && args.iter().any(|a| a == "-s"));
        if session_scoped && !self.targets_own_session(target) {
            return Outcome::error(format!("can't find session: {}", target.unwrap_or("")));
        }
        let mut state = self.state.lock();

        match name.as_str() {
            "display-message" => {
                let format = args.last().map(String::as_str).unwrap_or_default();
                if format.contains("cursor_x") {
                    return Outcome::ok(vec!["3\t1".to_string()]);
                }
                let Some(session) = state.sessions.get(&self.session) else {
                    return Outcome::error("no current session");
                };
                match id_after(target, '@') {
                    Some(window_id) => match session.windows.iter().find(|w| w.id == window_id) {
                        Some(w) => Outcome::ok(vec![w.row(w.id == session.active_window)]),
                        None => Outcome::error(format!("can't find window: @{window_id}")),
                    },
                    None => Outcome::ok(vec![format!("${}\t{}", session.id, session.name)]),
                }
            }
            "list-windows" => match state.sessions.get(&self.session) {
                Some(session) => Outcome::ok(session.window_rows()),
                None => Outcome::error("can't find session"),
            },
            "list-panes" => {
                let Some(session) = state.sessions.get(&self.session) else {
                    return Outcome::error("can't find session");
                };
                if args.iter().any(|a| a == "-s") {
                    return Outcome::ok(session.pane_rows());
                }
                let window_id = id_after(target, '@');
                match session.windows.iter().find(|w| Some(w.id) == window_id) {
                    Some(w) => Outcome::ok(w.pane_rows()),
                    None => Outcome::error(format!("can't find window: {}", target.unwrap_or(""))),
                }
            }
            "capture-pane" => Outcome::ok(CAPTURE_LINES.iter().map(|l| l.to_string()).collect()),
            "set-option" => {
                if let (Some(session), [.., option, value]) =
                    (state.sessions.get_mut(&self.session), args.as_slice())
                {
                    session.options.insert(option.clone(), value.clone());
                }
                Outcome::ok(Vec::new())
            }
            "refresh-client" => {
                if args.iter().any(|a| a == "-A") && self.resume_fails.load(Ordering::SeqCst) {
                    Outcome::error("resume rejected")
                } else {
                    Outcome::ok(Vec::new())
                }
            }
            "new-window" => match state.add_window(&self.session) {
                Some(window_id) => Outcome::ok(Vec::new()).notify(format!("%window-add @{window_id}")),
                None => Outcome::error("can't find session"),
            },
            "split-window" => {
                let pane_id = id_after(target, '%').unwrap_or_default();
                match state.split(&self.session, pane_id) {
                    Some(window_id) => {
                        let layout = state
                            .window_mut(&self.session, window_id)
                            .map(|w| w.layout())
                            .unwrap_or_default();
                        Outcome::ok(Vec::new())
                            .notify(format!("%layout-change @{window_id} {layout} {layout} *"))
                    }
                    None => Outcome::error(format!("can't find pane: %{pane_id}")),
                }
            }
            "kill-pane" => {
                let pane_id = id_after(target, '%').unwrap_or_default();
                match state.kill_pane(&self.session, pane_id) {
                    Some((window_id, true)) => {
                        Outcome::ok(Vec::new()).notify(format!("%window-close @{window_id}"))
                    }
                    Some((window_id, false)) => {
                        let layout = state
                            .window_mut(&self.session, window_id)
                            .map(|w| w.layout())
                            .unwrap_or_default();
                        Outcome::ok(Vec::new())
                            .notify(format!("%layout-change @{window_id} {layout} {layout} *"))
                    }
                    None => Outcome::error(format!("can't find pane: %{pane_id}")),
                }
            }
            "select-pane" => {
                let pane_id = id_after(target, '%').unwrap_or_default();
                let Some(window_id) = state.pane_window(&self.session, pane_id) else {
                    return Outcome::error(format!("can't find pane: %{pane_id}"));
                };
                if let Some(window) = state.window_mut(&self.session, window_id) {
                    window.active_pane = pane_id;
                }
                Outcome::ok(Vec::new()).notify(format!("%window-pane-changed @{window_id} %{pane_id}"))
            }
            "select-window" => {
                let window_id = id_after(target, '@').unwrap_or_default();
                let Some(session) = state.sessions.get_mut(&self.session) else {
                    return Outcome::error("can't find session");
                };
                if !session.windows.iter().any(|w| w.id == window_id) {
                    return Outcome::error(format!("can't find window: @{window_id}"));
                }
                session.active_window = window_id;
                let session_id = session.id;
                Outcome::ok(Vec::new())
                    .notify(format!("%session-window-changed ${session_id} @{window_id}"))
            }
            "kill-session" => {
                state.sessions.remove(&self.session);
                let mut outcome = Outcome::ok(Vec::new()).notify("%exit".to_string());
                outcome.exit = true;
                outcome
            }
            "detach-client" => {
                let mut outcome = Outcome::ok(Vec::new()).notify("%exit".to_string());
                outcome.exit = true;
                outcome
            }
            _ => Outcome::ok(Vec::new()),
        }
    }
}

fn reply_block(number: u64, reply: &std::result::Result<Vec<String>, String>) -> String {
    let (lines, terminator) = match reply {
        Ok(lines) => (lines.clone(), "%end"),
        Err(message) => (vec![message.clone()], "%error"),
    };
    let mut out = format!("%begin 1700000000 {number} 1\n");
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(&format!("{terminator} 1700000000 {number} 1\n"));
    out
}

async fn serve(
    host: Host,
    io: DuplexStream,
    log: Arc<Mutex<Vec<String>>>,
    mut input: mpsc::UnboundedReceiver<HostInput>,
) {
    let (read, mut write) = tokio::io::split(io);
    let mut lines = BufReader::new(read).lines();

    // tmux opens every control client with an empty reply block
    if write
        .write_all(b"%begin 1700000000 0 0\n%end 1700000000 0 0\n")
        .await
        .is_err()
    {
        return;
    }

    let mut number = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                log.lock().push(line.clone());
                number += 1;
                let outcome = host.handle(&line);
                let mut out = reply_block(number, &outcome.reply);
                for notification in &outcome.notifications {
                    out.push_str(notification);
                    out.push('\n');
                }
                if write.write_all(out.as_bytes()).await.is_err() || outcome.exit {
                    break;
                }
            }
            injected = input.recv() => match injected {
                Some(HostInput::Line(line)) => {
                    if write.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(HostInput::Close) | None => break,
            },
        }
    }
}

// ============================================================================
// Connector
// ============================================================================

/// In-process replacement for the tmux binary.
#[derive(Default)]
pub struct FakeConnector {
    pub state: Arc<Mutex<HostState>>,
    commands: Arc<Mutex<Vec<String>>>,
    links: Mutex<HashMap<String, mpsc::UnboundedSender<HostInput>>>,
    connects: AtomicUsize,
    pub resume_fails: Arc<AtomicBool>,
    /// Makes `version` fail like a missing binary
    pub tmux_missing: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every command line received, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Write a raw notification line to a session's live channel.
    pub fn inject(&self, session: &str, line: &str) {
        if let Some(link) = self.links.lock().get(session) {
            let _ = link.send(HostInput::Line(line.to_string()));
        }
    }

    /// End a session's channel without a `%exit`, like a crashed server.
    pub fn drop_connection(&self, session: &str) {
        if let Some(link) = self.links.lock().remove(session) {
            let _ = link.send(HostInput::Close);
        }
    }

    /// Add a window on the server side and announce it.
    pub fn add_window(&self, session: &str) -> u64 {
        let window_id = self
            .state
            .lock()
            .add_window(session)
            .expect("session exists");
        self.inject(session, &format!("%window-add @{window_id}"));
        window_id
    }

    pub fn session(&self, name: &str) -> Option<FakeSession> {
        self.state.lock().sessions.get(name).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<ProtocolClient> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.state.lock().ensure_session(&request.session);

        let (client_io, host_io) = tokio::io::duplex(256 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().insert(request.session.clone(), tx);

        let host = Host {
            state: Arc::clone(&self.state),
            session: request.session.clone(),
            resume_fails: Arc::clone(&self.resume_fails),
        };
        tokio::spawn(serve(host, host_io, Arc::clone(&self.commands), rx));

        let (reader, writer) = tokio::io::split(client_io);
        Ok(ProtocolClient::from_io(reader, writer, request.command_timeout))
    }

    async fn kill_session(&self, session: &str) -> Result<()> {
        self.state.lock().sessions.remove(session);
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        if self.tmux_missing.load(Ordering::SeqCst) {
            return Err(TmuxError::Spawn {
                path: "tmux".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok("tmux 3.4".to_string())
    }

    async fn list_sessions(&self) -> Result<Vec<HostSessionInfo>> {
        let links = self.links.lock();
        Ok(self
            .state
            .lock()
            .sessions
            .values()
            .map(|s| HostSessionInfo {
                name: s.name.clone(),
                created: None,
                attached: usize::from(links.contains_key(&s.name)),
                windows: s.windows.len(),
            })
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn test_config() -> Config {
    Config {
        refresh_debounce_ms: 40,
        command_timeout_ms: 2_000,
        ..Config::default()
    }
}

pub fn manager(connector: &Arc<FakeConnector>) -> SessionManager {
    SessionManager::with_connector(test_config(), Arc::clone(connector) as Arc<dyn Connector>)
        .expect("valid test config")
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Let scheduled refreshes fire and settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
