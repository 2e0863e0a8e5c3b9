//! Client-side mirror of one tmux session's windows and panes
//!
//! The mirror is the only writer of topology state. It changes in two ways:
//!
//! - cheap in-place edits driven straight from notifications (renames,
//!   active pane/window changes, layout geometry, window close)
//! - refreshes that re-read windows and panes from tmux and reconcile them
//!   by id, keeping per-pane client state such as flow control
//!
//! Every change publishes a fresh [`TopologySnapshot`] through an
//! [`ArcSwap`], so readers never take the mirror's lock.

use crate::buffer::OutputBufferStore;
use crate::client::ProtocolClient;
use crate::commands::TmuxCommand;
use crate::error::{Result, TmuxError};
use crate::events::{EventSender, SessionEvent, emit};
use crate::layout::TmuxLayout;
use crate::parser::Notification;
use crate::refresh::{Admission, Debouncer, RefreshGate, RefreshScope};
use crate::types::{
    FlowState, ParsedId, TmuxPane, TmuxPaneId, TmuxSessionId, TmuxWindow, TmuxWindowId,
    TopologySnapshot,
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

// ============================================================================
// Rows returned by tmux
// ============================================================================

/// One line of `list-windows -F WINDOW_FORMAT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WindowRow {
    pub id: TmuxWindowId,
    pub index: usize,
    pub active: bool,
    pub width: usize,
    pub height: usize,
    pub layout: String,
    pub name: String,
}

impl WindowRow {
    pub fn parse(line: &str) -> Option<Self> {
        // The name is last so tabs inside it survive
        let mut fields = line.splitn(7, '\t');
        let id = ParsedId::parse(fields.next()?)?.as_window()?;
        Some(Self {
            id,
            index: fields.next()?.parse().ok()?,
            active: fields.next()? == "1",
            width: fields.next()?.parse().ok()?,
            height: fields.next()?.parse().ok()?,
            layout: fields.next()?.to_string(),
            name: fields.next().unwrap_or_default().to_string(),
        })
    }
}

/// One line of `list-panes -F PANE_FORMAT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PaneRow {
    pub id: TmuxPaneId,
    pub window_id: TmuxWindowId,
    pub index: usize,
    pub active: bool,
    pub width: usize,
    pub height: usize,
    pub x: usize,
    pub y: usize,
    pub command: String,
}

impl PaneRow {
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(9, '\t');
        Some(Self {
            id: ParsedId::parse(fields.next()?)?.as_pane()?,
            window_id: ParsedId::parse(fields.next()?)?.as_window()?,
            index: fields.next()?.parse().ok()?,
            active: fields.next()? == "1",
            width: fields.next()?.parse().ok()?,
            height: fields.next()?.parse().ok()?,
            x: fields.next()?.parse().ok()?,
            y: fields.next()?.parse().ok()?,
            command: fields.next().unwrap_or_default().to_string(),
        })
    }
}

fn parse_rows<T>(lines: &[String], parse: fn(&str) -> Option<T>, what: &str) -> Vec<T> {
    lines
        .iter()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let row = parse(line);
            if row.is_none() {
                log::warn!("Skipping malformed {what} row: {line:?}");
            }
            row
        })
        .collect()
}

// ============================================================================
// Topology
// ============================================================================

/// The mutable topology graph behind the mirror.
#[derive(Debug, Default)]
pub(crate) struct Topology {
    pub session_id: Option<TmuxSessionId>,
    windows: BTreeMap<TmuxWindowId, TmuxWindow>,
    panes: HashMap<TmuxPaneId, TmuxPane>,
}

impl Topology {
    /// Replace everything with a full listing. Returns the panes that no
    /// longer exist.
    pub fn reconcile_full(&mut self, windows: Vec<WindowRow>, panes: Vec<PaneRow>) -> Vec<TmuxPaneId> {
        let window_ids: HashSet<_> = windows.iter().map(|w| w.id).collect();
        self.windows.retain(|id, _| window_ids.contains(id));
        for row in windows {
            self.upsert_window(row);
        }

        let panes: Vec<_> = panes
            .into_iter()
            .filter(|p| {
                let known = self.windows.contains_key(&p.window_id);
                if !known {
                    log::debug!("Pane %{} listed before its window @{}", p.id, p.window_id);
                }
                known
            })
            .collect();
        let pane_ids: HashSet<_> = panes.iter().map(|p| p.id).collect();
        let removed = self.remove_panes_where(|pane| !pane_ids.contains(&pane.id));
        for row in panes {
            self.upsert_pane(row);
        }

        self.rebuild_pane_lists();
        removed
    }

    /// Reconcile one window and its panes.
    pub fn reconcile_window(&mut self, window: WindowRow, panes: Vec<PaneRow>) -> Vec<TmuxPaneId> {
        let window_id = window.id;
        self.upsert_window(window);

        let panes: Vec<_> = panes.into_iter().filter(|p| p.window_id == window_id).collect();
        let pane_ids: HashSet<_> = panes.iter().map(|p| p.id).collect();
        let removed =
            self.remove_panes_where(|pane| pane.window_id == window_id && !pane_ids.contains(&pane.id));
        for row in panes {
            self.upsert_pane(row);
        }

        self.rebuild_pane_lists();
        removed
    }

    /// Drop a window and its panes, returning the pane ids.
    pub fn remove_window(&mut self, window_id: TmuxWindowId) -> Vec<TmuxPaneId> {
        if self.windows.remove(&window_id).is_none() {
            return Vec::new();
        }
        self.remove_panes_where(|pane| pane.window_id == window_id)
    }

    /// Apply pane geometry from a layout string. Returns whether anything
    /// changed.
    pub fn apply_layout(&mut self, window_id: TmuxWindowId, layout: &str) -> bool {
        let Some(window) = self.windows.get_mut(&window_id) else {
            return false;
        };
        let Some(parsed) = TmuxLayout::parse(layout) else {
            log::warn!("Unparseable layout for @{window_id}: {layout}");
            return false;
        };

        let mut changed = window.layout != layout;
        window.layout = layout.to_string();
        let root = parsed.root.geometry();
        if (window.width, window.height) != (root.width, root.height) {
            window.width = root.width;
            window.height = root.height;
            changed = true;
        }

        for (pane_id, geometry) in parsed.panes() {
            match self.panes.get_mut(&pane_id) {
                Some(pane) if pane.window_id == window_id => {
                    changed |= pane.set_geometry(geometry.x, geometry.y, geometry.width, geometry.height);
                }
                // New panes show up with the refresh that follows
                _ => {}
            }
        }
        changed
    }

    pub fn rename_window(&mut self, window_id: TmuxWindowId, name: &str) -> bool {
        match self.windows.get_mut(&window_id) {
            Some(window) if window.name != name => {
                window.name = name.to_string();
                true
            }
            _ => false,
        }
    }

    /// Make `pane_id` the only active pane of its window.
    pub fn set_active_pane(&mut self, window_id: TmuxWindowId, pane_id: TmuxPaneId) -> bool {
        if self.panes.get(&pane_id).map(|p| p.window_id) != Some(window_id) {
            return false;
        }
        let mut changed = false;
        for pane in self.panes.values_mut().filter(|p| p.window_id == window_id) {
            let active = pane.id == pane_id;
            changed |= pane.active != active;
            pane.active = active;
        }
        changed
    }

    /// Make `window_id` the only active window.
    pub fn set_active_window(&mut self, window_id: TmuxWindowId) -> bool {
        if !self.windows.contains_key(&window_id) {
            return false;
        }
        let mut changed = false;
        for window in self.windows.values_mut() {
            let active = window.id == window_id;
            changed |= window.active != active;
            window.active = active;
        }
        changed
    }

    pub fn set_flow(&mut self, pane_id: TmuxPaneId, state: FlowState) -> bool {
        match self.panes.get_mut(&pane_id) {
            Some(pane) if pane.flow != state => {
                pane.flow = state;
                true
            }
            _ => false,
        }
    }

    /// Enforce one active window and one active pane per non-empty window:
    /// the host-flagged entry with the lowest index wins, else the lowest
    /// index overall.
    pub fn normalize_selection(&mut self) {
        let mut windows: Vec<_> = self.windows.values().map(|w| (w.index, w.id, w.active)).collect();
        windows.sort_unstable();
        if let Some(chosen) = pick_active(&windows) {
            for window in self.windows.values_mut() {
                window.active = window.id == chosen;
            }
        }

        let mut by_window: HashMap<TmuxWindowId, Vec<(usize, TmuxPaneId, bool)>> = HashMap::new();
        for pane in self.panes.values() {
            by_window
                .entry(pane.window_id)
                .or_default()
                .push((pane.index, pane.id, pane.active));
        }
        for (window_id, mut panes) in by_window {
            panes.sort_unstable();
            if let Some(chosen) = pick_active(&panes) {
                for pane in self.panes.values_mut().filter(|p| p.window_id == window_id) {
                    pane.active = pane.id == chosen;
                }
            }
        }
    }

    pub fn clear(&mut self) -> Vec<TmuxPaneId> {
        self.windows.clear();
        let removed = self.panes.keys().copied().collect();
        self.panes.clear();
        removed
    }

    pub fn contains_pane(&self, pane_id: TmuxPaneId) -> bool {
        self.panes.contains_key(&pane_id)
    }

    /// Ordered, immutable view of the current state.
    pub fn snapshot(&self, session: &str) -> TopologySnapshot {
        let mut windows: Vec<TmuxWindow> = self.windows.values().cloned().collect();
        windows.sort_by_key(|w| (w.index, w.id));

        let mut panes = Vec::with_capacity(self.panes.len());
        for window in &windows {
            panes.extend(window.panes.iter().filter_map(|id| self.panes.get(id)).cloned());
        }

        TopologySnapshot {
            session: session.to_string(),
            windows,
            panes,
        }
    }

    fn upsert_window(&mut self, row: WindowRow) {
        let window = self
            .windows
            .entry(row.id)
            .or_insert_with(|| TmuxWindow::new(row.id, row.index, ""));
        window.index = row.index;
        window.name = row.name;
        window.active = row.active;
        window.width = row.width;
        window.height = row.height;
        window.layout = row.layout;
    }

    fn upsert_pane(&mut self, row: PaneRow) {
        let pane = self
            .panes
            .entry(row.id)
            .or_insert_with(|| TmuxPane::new(row.id, row.window_id));
        pane.window_id = row.window_id;
        pane.index = row.index;
        pane.active = row.active;
        pane.set_geometry(row.x, row.y, row.width, row.height);
        pane.current_command = row.command;
    }

    fn remove_panes_where(&mut self, gone: impl Fn(&TmuxPane) -> bool) -> Vec<TmuxPaneId> {
        let mut removed: Vec<_> = self.panes.values().filter(|p| gone(p)).map(|p| p.id).collect();
        removed.sort_unstable();
        for id in &removed {
            self.panes.remove(id);
        }
        removed
    }

    fn rebuild_pane_lists(&mut self) {
        let mut lists: HashMap<TmuxWindowId, Vec<(usize, TmuxPaneId)>> = HashMap::new();
        for pane in self.panes.values() {
            lists.entry(pane.window_id).or_default().push((pane.index, pane.id));
        }
        for window in self.windows.values_mut() {
            let mut panes = lists.remove(&window.id).unwrap_or_default();
            panes.sort_unstable();
            window.panes = panes.into_iter().map(|(_, id)| id).collect();
        }
    }
}

/// `entries` must be sorted by index.
fn pick_active<Id: Copy>(entries: &[(usize, Id, bool)]) -> Option<Id> {
    entries
        .iter()
        .find(|(_, _, active)| *active)
        .or_else(|| entries.first())
        .map(|(_, id, _)| *id)
}

// ============================================================================
// StateMirror
// ============================================================================

/// How many released pane ids are remembered for dropping late output
const RELEASED_PANE_MEMORY: usize = 1024;

/// Called with the window and pane ids a commit removed.
type ReleaseHook = Box<dyn Fn(&[TmuxWindowId], &[TmuxPaneId]) + Send + Sync>;

/// Live mirror of one attached session.
pub struct StateMirror {
    session: String,
    client: Arc<ProtocolClient>,
    buffers: Arc<OutputBufferStore>,
    events: EventSender,
    topology: Mutex<Topology>,
    published: ArcSwap<TopologySnapshot>,
    gate: Arc<RefreshGate>,
    debouncer: Debouncer,
    /// Bumped by `reset`; refresh results from an older generation are
    /// dropped
    generation: AtomicU64,
    /// Most recently released panes, oldest first
    released: Mutex<VecDeque<TmuxPaneId>>,
    release_hooks: Mutex<Vec<ReleaseHook>>,
}

impl StateMirror {
    pub fn new(
        session: impl Into<String>,
        client: Arc<ProtocolClient>,
        buffers: Arc<OutputBufferStore>,
        events: EventSender,
        debounce: Duration,
    ) -> Arc<Self> {
        let session = session.into();
        Arc::new_cyclic(|weak: &Weak<StateMirror>| {
            let weak = weak.clone();
            let debouncer = Debouncer::new(debounce, move |scope| {
                let Some(mirror) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = mirror.refresh(scope).await {
                        log::warn!("[{}] Debounced refresh failed: {e}", mirror.session);
                    }
                });
            });

            Self {
                published: ArcSwap::from_pointee(TopologySnapshot::empty(session.clone())),
                session,
                client,
                buffers,
                events,
                topology: Mutex::new(Topology::default()),
                gate: Arc::new(RefreshGate::new()),
                debouncer,
                generation: AtomicU64::new(0),
                released: Mutex::new(VecDeque::new()),
                release_hooks: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Latest published topology.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.published.load_full()
    }

    pub fn windows(&self) -> Vec<TmuxWindow> {
        self.snapshot().windows.clone()
    }

    pub fn panes(&self, window_id: TmuxWindowId) -> Result<Vec<TmuxPane>> {
        let snapshot = self.snapshot();
        if snapshot.window(window_id).is_none() {
            return Err(TmuxError::UnknownWindow(window_id));
        }
        Ok(snapshot.panes_of(window_id).into_iter().cloned().collect())
    }

    pub fn pane(&self, pane_id: TmuxPaneId) -> Option<TmuxPane> {
        self.snapshot().pane(pane_id).cloned()
    }

    pub fn has_window(&self, window_id: TmuxWindowId) -> bool {
        self.snapshot().window(window_id).is_some()
    }

    /// Number of refresh runs that actually queried tmux.
    pub fn refresh_runs(&self) -> u64 {
        self.gate.runs()
    }

    pub fn set_session_id(&self, session_id: TmuxSessionId) {
        self.topology.lock().session_id = Some(session_id);
    }

    /// Re-read `scope` from tmux and reconcile.
    ///
    /// When another refresh is already running the request is merged into
    /// one follow-up run and this call returns once that run is done.
    pub async fn refresh(&self, scope: RefreshScope) -> Result<()> {
        let mut permit = match self.gate.admit(scope) {
            Admission::Run(permit) => permit,
            // A closed channel means the run failed before reaching this request
            Admission::Joined(done) => return done.await.map_err(|_| TmuxError::RefreshAbandoned),
        };

        loop {
            let scope = permit.scope().clone();
            self.run_refresh(&scope).await?;
            if !permit.complete() {
                return Ok(());
            }
        }
    }

    /// Request a refresh after the debounce quiet period.
    pub fn schedule_refresh(&self, scope: RefreshScope) {
        self.debouncer.schedule(scope);
    }

    pub fn cancel_pending_refresh(&self) {
        self.debouncer.cancel();
    }

    async fn run_refresh(&self, scope: &RefreshScope) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        match scope {
            RefreshScope::Full => {
                log::debug!("[{}] Full refresh", self.session);
                let windows = self.client.submit(&TmuxCommand::list_windows(&self.session)).await?;
                let panes = self
                    .client
                    .submit(&TmuxCommand::list_session_panes(&self.session))
                    .await?;
                let windows = parse_rows(&windows.wait().await?, WindowRow::parse, "window");
                let panes = parse_rows(&panes.wait().await?, PaneRow::parse, "pane");
                self.commit(generation, |topology| topology.reconcile_full(windows, panes));
            }
            RefreshScope::Windows(ids) => {
                for &window_id in ids {
                    log::debug!("[{}] Refreshing window @{window_id}", self.session);
                    let window = self.client.submit(&TmuxCommand::describe_window(window_id)).await?;
                    let panes = self
                        .client
                        .submit(&TmuxCommand::list_window_panes(window_id))
                        .await?;
                    let (window, panes) = (window.wait().await, panes.wait().await);

                    let row = match (window, panes) {
                        (Ok(window), Ok(panes)) => parse_rows(&window, WindowRow::parse, "window")
                            .into_iter()
                            .next()
                            .map(|row| (row, parse_rows(&panes, PaneRow::parse, "pane"))),
                        (Err(e), _) | (_, Err(e))
                            if !matches!(e, TmuxError::CommandFailed { .. }) =>
                        {
                            return Err(e);
                        }
                        // tmux no longer knows the window
                        _ => None,
                    };

                    match row {
                        Some((window, panes)) => {
                            self.commit(generation, |topology| topology.reconcile_window(window, panes));
                        }
                        None => {
                            log::debug!("[{}] Window @{window_id} is gone", self.session);
                            self.commit(generation, |topology| topology.remove_window(window_id));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply an edit under the lock, normalize, release buffers of removed
    /// panes and publish. Skipped when a reset happened since `generation`.
    fn commit(&self, generation: u64, edit: impl FnOnce(&mut Topology) -> Vec<TmuxPaneId>) {
        let (snapshot, closed, removed) = {
            let mut topology = self.topology.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                log::debug!("[{}] Dropping refresh result from before reset", self.session);
                return;
            }
            let before: Vec<TmuxWindowId> = topology.windows.keys().copied().collect();
            let removed = edit(&mut topology);
            let closed: Vec<_> = before
                .into_iter()
                .filter(|id| !topology.windows.contains_key(id))
                .collect();
            topology.normalize_selection();
            (topology.snapshot(&self.session), closed, removed)
        };

        self.release(&closed, &removed);
        self.publish(snapshot);
    }

    /// Drop buffers of removed panes and tell release hooks.
    fn release(&self, windows: &[TmuxWindowId], panes: &[TmuxPaneId]) {
        if windows.is_empty() && panes.is_empty() {
            return;
        }
        {
            let mut released = self.released.lock();
            for &pane_id in panes {
                self.buffers.release(pane_id);
                released.push_back(pane_id);
            }
            let excess = released.len().saturating_sub(RELEASED_PANE_MEMORY);
            released.drain(..excess);
        }
        for hook in self.release_hooks.lock().iter() {
            hook(windows, panes);
        }
    }

    /// Run `hook` whenever windows or panes leave the mirror.
    pub fn on_release(&self, hook: impl Fn(&[TmuxWindowId], &[TmuxPaneId]) + Send + Sync + 'static) {
        self.release_hooks.lock().push(Box::new(hook));
    }

    /// Whether `pane_id` left the mirror recently. Output still arriving for
    /// it must not bring its buffer back.
    pub fn was_released(&self, pane_id: TmuxPaneId) -> bool {
        self.released.lock().contains(&pane_id)
    }

    /// In-place edit that reports whether it changed anything.
    fn edit(&self, edit: impl FnOnce(&mut Topology) -> bool) -> bool {
        let snapshot = {
            let mut topology = self.topology.lock();
            if !edit(&mut topology) {
                return false;
            }
            topology.normalize_selection();
            topology.snapshot(&self.session)
        };
        self.publish(snapshot);
        true
    }

    fn publish(&self, snapshot: TopologySnapshot) {
        if **self.published.load() == snapshot {
            return;
        }
        let snapshot = Arc::new(snapshot);
        self.published.store(Arc::clone(&snapshot));
        emit(&self.events, SessionEvent::StateChanged(snapshot));
    }

    /// Update a pane's flow state. Returns whether the pane was known and
    /// changed.
    pub fn set_flow(&self, pane_id: TmuxPaneId, state: FlowState) -> bool {
        self.edit(|topology| topology.set_flow(pane_id, state))
    }

    /// Route a topology notification. Output, flow and subscription
    /// notifications are handled elsewhere and ignored here.
    pub fn apply_notification(&self, notification: &Notification) {
        match notification {
            Notification::WindowAdd { window_id } => {
                log::debug!("[{}] Window @{window_id} added", self.session);
                self.schedule_refresh(RefreshScope::Full);
            }
            Notification::WindowClose { window_id } => {
                let generation = self.generation.load(Ordering::SeqCst);
                self.commit(generation, |topology| topology.remove_window(*window_id));
                self.schedule_refresh(RefreshScope::Full);
            }
            Notification::LayoutChange { window_id, layout } => {
                self.edit(|topology| topology.apply_layout(*window_id, layout));
                self.schedule_refresh(RefreshScope::window(*window_id));
            }
            Notification::WindowRenamed { window_id, name } => {
                self.edit(|topology| topology.rename_window(*window_id, name));
            }
            Notification::WindowPaneChanged { window_id, pane_id } => {
                self.edit(|topology| topology.set_active_pane(*window_id, *pane_id));
            }
            Notification::SessionWindowChanged {
                session_id,
                window_id,
            } => {
                let ours = self.topology.lock().session_id;
                match ours {
                    Some(ours) if ours == *session_id => {
                        if !self.edit(|topology| topology.set_active_window(*window_id)) {
                            self.schedule_refresh(RefreshScope::Full);
                        }
                    }
                    Some(_) => {}
                    None => self.schedule_refresh(RefreshScope::Full),
                }
            }
            Notification::SessionChanged { session_id, name } => {
                log::info!("[{}] Attached to session ${session_id} ({name})", self.session);
                self.set_session_id(*session_id);
                self.schedule_refresh(RefreshScope::Full);
            }
            Notification::SessionRenamed { name } => {
                log::warn!("[{}] Session renamed to {name} outside the engine", self.session);
            }
            Notification::PaneModeChanged { pane_id } => {
                log::trace!("[{}] Pane %{pane_id} changed mode", self.session);
            }
            Notification::Output { .. }
            | Notification::Pause { .. }
            | Notification::Continue { .. }
            | Notification::SubscriptionChanged { .. }
            | Notification::SessionsChanged
            | Notification::Exit { .. }
            | Notification::Unknown { .. } => {}
        }
    }

    /// Forget everything: cancel pending refreshes, drop the topology and
    /// release the buffers of every mirrored pane.
    pub fn reset(&self) {
        self.debouncer.cancel();
        let (closed, removed) = {
            let mut topology = self.topology.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            topology.session_id = None;
            let closed: Vec<_> = topology.windows.keys().copied().collect();
            (closed, topology.clear())
        };
        self.release(&closed, &removed);
        self.publish(TopologySnapshot::empty(self.session.clone()));
    }
}
