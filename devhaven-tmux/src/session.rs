//! One workspace's tmux session
//!
//! A [`Session`] outlives its control channel: detaching drops the channel
//! and the mirrored state but keeps the entry, so reopening the workspace
//! reattaches to the same tmux session. While attached, a single dispatcher
//! task applies notifications in the order tmux sent them:
//!
//! - `%output` is appended to the pane's output buffer
//! - `%pause`/`%continue` go to flow control
//! - `%subscription-changed` is turned into a refresh request
//! - everything topological goes to the state mirror

use crate::buffer::{OutputAttachment, OutputBufferStore};
use crate::client::{NotificationStream, ProtocolClient};
use crate::commands::TmuxCommand;
use crate::connector::{ConnectRequest, Connector};
use crate::error::{Result, TmuxError};
use crate::events::{self, EventReceiver, EventSender, SessionEvent, emit};
use crate::flow_control::FlowControlManager;
use crate::mirror::StateMirror;
use crate::parser::Notification;
use crate::refresh::RefreshScope;
use crate::subscriptions::SubscriptionManager;
use crate::types::{
    PaneDirection, ParsedId, SessionStatus, SplitDirection, TmuxPane, TmuxPaneId, TmuxWindow,
    TmuxWindowId, TopologySnapshot,
};
use chrono::{DateTime, Utc};
use devhaven_config::{ClientSize, Config};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Session option recording the workspace a session belongs to
pub const WORKSPACE_ID_OPTION: &str = "@devhaven_workspace_id";
/// Session option recording the workspace directory
pub const WORKSPACE_PATH_OPTION: &str = "@devhaven_workspace_path";

/// Per-session settings taken from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub command_timeout: Duration,
    pub refresh_debounce: Duration,
    /// 0 leaves flow control off
    pub pause_after_secs: u32,
    pub history_limit: u32,
    pub client_size: Option<ClientSize>,
    /// Empty leaves tmux's style alone
    pub pane_border_style: String,
    pub pane_active_border_style: String,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            refresh_debounce: config.refresh_debounce(),
            pause_after_secs: config.pause_after_secs,
            history_limit: config.history_limit,
            client_size: config.client_size,
            pane_border_style: config.pane_border_style.clone(),
            pane_active_border_style: config.pane_active_border_style.clone(),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Serializable summary of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub workspace_id: String,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Everything that exists only while a control channel is up.
struct Attachment {
    client: Arc<ProtocolClient>,
    mirror: Arc<StateMirror>,
    flow: Arc<FlowControlManager>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Attachment {
    fn stop_dispatcher(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

pub struct Session {
    id: String,
    workspace_id: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    status: Mutex<SessionStatus>,
    /// Serializes attach, detach and close
    lifecycle: tokio::sync::Mutex<()>,
    attachment: Mutex<Option<Arc<Attachment>>>,
    /// Set once kill-session has been issued for the host session
    killed: AtomicBool,
    buffers: Arc<OutputBufferStore>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    events: EventSender,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("workspace_id", &self.workspace_id)
            .field("cwd", &self.cwd)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        buffers: Arc<OutputBufferStore>,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            cwd: cwd.into(),
            created_at: Utc::now(),
            status: Mutex::new(SessionStatus::Starting),
            lifecycle: tokio::sync::Mutex::new(()),
            attachment: Mutex::new(None),
            killed: AtomicBool::new(false),
            buffers,
            connector,
            options,
            events: events::channel(),
        })
    }

    /// tmux session name
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            workspace_id: self.workspace_id.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            status: self.status(),
        }
    }

    pub fn events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn set_status(&self, next: SessionStatus) {
        {
            let mut status = self.status.lock();
            if *status == next {
                return;
            }
            if !status.can_transition_to(next) {
                log::warn!("[{}] Unexpected status change {:?} -> {next:?}", self.id, *status);
            }
            *status = next;
        }
        log::info!("[{}] Session {next:?}", self.id);
        emit(&self.events, SessionEvent::StatusChanged(next));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect and bring the mirror up to date. A detached session is
    /// reattached; an attached one is left alone.
    pub async fn attach(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.status() {
            SessionStatus::Attached => return Ok(()),
            SessionStatus::Closed => return Err(TmuxError::SessionNotAttached(self.id.clone())),
            SessionStatus::Detached => self.set_status(SessionStatus::Starting),
            SessionStatus::Starting => {}
        }

        let request = ConnectRequest {
            session: self.id.clone(),
            cwd: self.cwd.clone(),
            command_timeout: self.options.command_timeout,
        };
        let client = match self.connector.connect(&request).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                log::error!("[{}] Could not start control channel: {e}", self.id);
                self.set_status(SessionStatus::Closed);
                return Err(e);
            }
        };

        match self.synchronize(&client).await {
            Ok((attachment, notifications)) => {
                self.set_status(SessionStatus::Attached);
                let handle = tokio::spawn(dispatch(
                    Arc::downgrade(self),
                    Arc::clone(&attachment),
                    Arc::clone(&self.buffers),
                    notifications,
                ));
                *attachment.dispatcher.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] Attach failed: {e}", self.id);
                let attachment = self.attachment.lock().take();
                if let Some(attachment) = attachment {
                    attachment.stop_dispatcher();
                    attachment.mirror.reset();
                }
                client.shutdown().await;
                self.set_status(SessionStatus::Closed);
                Err(e)
            }
        }
    }

    async fn synchronize(
        &self,
        client: &Arc<ProtocolClient>,
    ) -> Result<(Arc<Attachment>, NotificationStream)> {
        let notifications = client.take_notifications().ok_or(TmuxError::ChannelClosed)?;

        // Verify the channel answers and learn which session we landed in
        let identity = client.execute(&TmuxCommand::describe_session()).await?;
        let session_id = identity
            .first()
            .and_then(|line| line.split('\t').next())
            .and_then(ParsedId::parse)
            .and_then(ParsedId::as_session);
        log::info!("[{}] Control channel up (session {:?})", self.id, session_id);

        self.apply_session_options(client).await?;

        let mirror = StateMirror::new(
            self.id.clone(),
            Arc::clone(client),
            Arc::clone(&self.buffers),
            self.events.clone(),
            self.options.refresh_debounce,
        );
        if let Some(session_id) = session_id {
            mirror.set_session_id(session_id);
        }

        let flow = FlowControlManager::new(Arc::clone(client), Arc::clone(&mirror), self.events.clone());
        if self.options.pause_after_secs > 0 {
            flow.enable(self.options.pause_after_secs).await;
        }

        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(client)));
        subscriptions.register_defaults().await?;
        let watched = Arc::downgrade(&subscriptions);
        mirror.on_release(move |windows, panes| {
            if let Some(subscriptions) = watched.upgrade() {
                subscriptions.forget_targets(windows, panes);
            }
        });

        let attachment = Arc::new(Attachment {
            client: Arc::clone(client),
            mirror: Arc::clone(&mirror),
            flow,
            subscriptions,
            dispatcher: Mutex::new(None),
        });
        *self.attachment.lock() = Some(Arc::clone(&attachment));

        mirror.refresh(RefreshScope::Full).await?;
        self.prime_buffers(client, &mirror).await;
        Ok((attachment, notifications))
    }

    async fn apply_session_options(&self, client: &ProtocolClient) -> Result<()> {
        let history = self.options.history_limit.to_string();
        let cwd = self.cwd.to_string_lossy();
        let options = [
            ("history-limit", history.as_str()),
            ("pane-border-style", self.options.pane_border_style.as_str()),
            ("pane-active-border-style", self.options.pane_active_border_style.as_str()),
            (WORKSPACE_ID_OPTION, self.workspace_id.as_str()),
            (WORKSPACE_PATH_OPTION, &*cwd),
        ];
        for (option, value) in options.into_iter().filter(|(_, value)| !value.is_empty()) {
            client
                .send(&TmuxCommand::set_session_option(&self.id, option, value))
                .await?;
        }

        if let Some(size) = self.options.client_size {
            client
                .send(&TmuxCommand::set_client_size(size.cols, size.rows))
                .await?;
        }
        Ok(())
    }

    /// Seed empty output buffers with each pane's current screen and history.
    async fn prime_buffers(&self, client: &ProtocolClient, mirror: &StateMirror) {
        for pane in &mirror.snapshot().panes {
            if self.buffers.len(pane.id) > 0 {
                continue;
            }
            match client.execute(&TmuxCommand::capture_pane(pane.id)).await {
                Ok(lines) => {
                    self.buffers.prime(pane.id, lines.join("\r\n").as_bytes());
                }
                Err(e) => log::warn!("[{}] Could not capture pane %{}: {e}", self.id, pane.id),
            }
        }
    }

    /// Drop the control channel but keep the tmux session running.
    pub async fn detach(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.status() {
            SessionStatus::Attached => {}
            SessionStatus::Detached => return Ok(()),
            _ => return Err(TmuxError::SessionNotAttached(self.id.clone())),
        }

        // Status first so the dispatcher reads the coming EOF as requested
        self.set_status(SessionStatus::Detached);
        let attachment = self.attachment.lock().take();
        if let Some(attachment) = attachment {
            if let Err(e) = attachment.client.send(&TmuxCommand::detach_client()).await {
                log::debug!("[{}] detach-client not delivered: {e}", self.id);
            }
            self.teardown(&attachment).await;
        }
        Ok(())
    }

    /// Kill the tmux session and forget everything about it. Terminal.
    ///
    /// A session that closed because its channel was lost still has its host
    /// session killed here.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.killed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let attachment = self.attachment.lock().take();
        match attachment {
            Some(attachment) => {
                self.set_status(SessionStatus::Closed);
                match attachment.client.send(&TmuxCommand::kill_session(&self.id)).await {
                    Ok(()) => self.killed.store(true, Ordering::SeqCst),
                    Err(e) => log::debug!("[{}] kill-session not delivered: {e}", self.id),
                }
                self.teardown(&attachment).await;
                if !self.killed.load(Ordering::SeqCst) {
                    self.connector.kill_session(&self.id).await?;
                    self.killed.store(true, Ordering::SeqCst);
                }
            }
            None => {
                self.connector.kill_session(&self.id).await?;
                self.killed.store(true, Ordering::SeqCst);
                self.set_status(SessionStatus::Closed);
            }
        }
        Ok(())
    }

    async fn teardown(&self, attachment: &Attachment) {
        attachment.mirror.cancel_pending_refresh();
        attachment.stop_dispatcher();
        attachment.client.shutdown().await;
        attachment.subscriptions.clear();
        attachment.mirror.reset();
    }

    /// The control channel ended while attached: tmux exited, the session
    /// was killed elsewhere, or the transport broke.
    async fn on_channel_lost(&self, attachment: &Arc<Attachment>, reason: String) {
        {
            let mut current = self.attachment.lock();
            let still_current = current
                .as_ref()
                .is_some_and(|a| Arc::ptr_eq(a, attachment));
            if !still_current || self.status() != SessionStatus::Attached {
                return;
            }
            current.take();
        }

        log::warn!("[{}] Control channel lost: {reason}", self.id);
        attachment.mirror.cancel_pending_refresh();
        attachment.mirror.reset();
        emit(&self.events, SessionEvent::Disconnected { reason });
        self.set_status(SessionStatus::Closed);
        attachment.client.shutdown().await;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn attached(&self) -> Result<Arc<Attachment>> {
        if self.status() != SessionStatus::Attached {
            return Err(TmuxError::SessionNotAttached(self.id.clone()));
        }
        self.attachment
            .lock()
            .clone()
            .ok_or_else(|| TmuxError::SessionNotAttached(self.id.clone()))
    }

    /// Attachment plus a check that the pane belongs to this session.
    fn attached_with_pane(&self, pane_id: TmuxPaneId) -> Result<Arc<Attachment>> {
        let attachment = self.attached()?;
        if attachment.mirror.pane(pane_id).is_none() {
            return Err(TmuxError::UnknownPane(pane_id));
        }
        Ok(attachment)
    }

    pub fn snapshot(&self) -> Result<Arc<TopologySnapshot>> {
        Ok(self.attached()?.mirror.snapshot())
    }

    pub fn list_windows(&self) -> Result<Vec<TmuxWindow>> {
        Ok(self.attached()?.mirror.windows())
    }

    pub fn list_panes(&self, window_id: TmuxWindowId) -> Result<Vec<TmuxPane>> {
        self.attached()?.mirror.panes(window_id)
    }

    pub fn owns_pane(&self, pane_id: TmuxPaneId) -> bool {
        self.attachment
            .lock()
            .as_ref()
            .is_some_and(|a| a.mirror.pane(pane_id).is_some())
    }

    pub fn owns_window(&self, window_id: TmuxWindowId) -> bool {
        self.attachment
            .lock()
            .as_ref()
            .is_some_and(|a| a.mirror.has_window(window_id))
    }

    /// Refresh runs issued by the current attachment, if any.
    pub fn refresh_runs(&self) -> Option<u64> {
        self.attachment.lock().as_ref().map(|a| a.mirror.refresh_runs())
    }

    /// Subscription values remembered for change detection, if attached.
    pub fn tracked_subscription_values(&self) -> Option<usize> {
        self.attachment
            .lock()
            .as_ref()
            .map(|a| a.subscriptions.tracked_values())
    }

    /// Re-read the whole topology now instead of waiting for notifications.
    pub async fn refresh(&self) -> Result<()> {
        let attachment = self.attached()?;
        attachment.mirror.refresh(RefreshScope::Full).await
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn select_pane(&self, pane_id: TmuxPaneId) -> Result<()> {
        let attachment = self.attached_with_pane(pane_id)?;
        attachment.client.send(&TmuxCommand::select_pane(pane_id)).await
    }

    /// Select the pane left of, right of, above or below `pane_id`.
    pub async fn select_pane_direction(
        &self,
        pane_id: TmuxPaneId,
        direction: PaneDirection,
    ) -> Result<()> {
        let attachment = self.attached_with_pane(pane_id)?;
        attachment
            .client
            .send(&TmuxCommand::select_pane_direction(pane_id, direction))
            .await
    }

    pub async fn select_window(&self, window_id: TmuxWindowId) -> Result<()> {
        let attachment = self.attached()?;
        if !attachment.mirror.has_window(window_id) {
            return Err(TmuxError::UnknownWindow(window_id));
        }
        attachment.client.send(&TmuxCommand::select_window(window_id)).await
    }

    pub async fn select_window_index(&self, index: usize) -> Result<()> {
        let attachment = self.attached()?;
        attachment
            .client
            .send(&TmuxCommand::select_window_index(&self.id, index))
            .await
    }

    pub async fn next_window(&self) -> Result<()> {
        let attachment = self.attached()?;
        attachment.client.send(&TmuxCommand::next_window(&self.id)).await
    }

    pub async fn previous_window(&self) -> Result<()> {
        let attachment = self.attached()?;
        attachment.client.send(&TmuxCommand::previous_window(&self.id)).await
    }

    /// Open a new window in the workspace directory.
    pub async fn new_window(&self) -> Result<()> {
        let attachment = self.attached()?;
        attachment
            .client
            .send(&TmuxCommand::new_window(&self.id, Some(&self.cwd)))
            .await
    }

    pub async fn split_pane(&self, pane_id: TmuxPaneId, direction: SplitDirection) -> Result<()> {
        let attachment = self.attached_with_pane(pane_id)?;
        attachment
            .client
            .send(&TmuxCommand::split_pane(pane_id, direction))
            .await
    }

    /// Kill a pane. Killing the last pane of a window closes the window,
    /// which tmux reports with `%window-close`.
    pub async fn kill_pane(&self, pane_id: TmuxPaneId) -> Result<()> {
        let attachment = self.attached_with_pane(pane_id)?;
        attachment.client.send(&TmuxCommand::kill_pane(pane_id)).await
    }

    pub async fn resize_pane(
        &self,
        pane_id: TmuxPaneId,
        direction: PaneDirection,
        amount: u16,
    ) -> Result<()> {
        let attachment = self.attached_with_pane(pane_id)?;
        if amount == 0 {
            return Ok(());
        }
        attachment
            .client
            .send(&TmuxCommand::resize_pane(pane_id, direction, amount))
            .await
    }

    pub async fn send_input(&self, pane_id: TmuxPaneId, data: &[u8]) -> Result<()> {
        let attachment = self.attached_with_pane(pane_id)?;
        if data.is_empty() {
            return Ok(());
        }
        attachment
            .client
            .send(&TmuxCommand::send_input(pane_id, data))
            .await
    }

    /// Screen contents plus scrollback, with escape sequences, lines joined
    /// by CRLF.
    pub async fn capture_pane(&self, pane_id: TmuxPaneId) -> Result<Vec<u8>> {
        let attachment = self.attached_with_pane(pane_id)?;
        let lines = attachment
            .client
            .execute(&TmuxCommand::capture_pane(pane_id))
            .await?;
        Ok(lines.join("\r\n").into_bytes())
    }

    /// Cursor position of a pane as `(x, y)`.
    pub async fn pane_cursor(&self, pane_id: TmuxPaneId) -> Result<(u16, u16)> {
        let attachment = self.attached_with_pane(pane_id)?;
        let command = TmuxCommand::pane_cursor(pane_id);
        let lines = attachment.client.execute(&command).await?;
        let line = lines.first().map(String::as_str).unwrap_or_default();
        line.split_once('\t')
            .and_then(|(x, y)| Some((x.trim().parse().ok()?, y.trim().parse().ok()?)))
            .ok_or_else(|| TmuxError::parse(line, "expected cursor_x<TAB>cursor_y"))
    }

    /// Tell tmux how large the control client is.
    pub async fn resize_client(&self, cols: u16, rows: u16) -> Result<()> {
        let attachment = self.attached()?;
        attachment
            .client
            .send(&TmuxCommand::set_client_size(cols, rows))
            .await
    }

    /// Snapshot of a pane's output plus a receiver for what follows.
    pub fn attach_output(&self, pane_id: TmuxPaneId) -> Result<OutputAttachment> {
        self.attached_with_pane(pane_id)?;
        Ok(self.buffers.attach(pane_id))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Apply notifications in order until the channel ends.
async fn dispatch(
    session: Weak<Session>,
    attachment: Arc<Attachment>,
    buffers: Arc<OutputBufferStore>,
    mut notifications: NotificationStream,
) {
    let name = attachment.mirror.session().to_string();
    let mut exit_reason = None;

    loop {
        let notification = match notifications.next().await {
            Ok(notification) => notification,
            Err(_) => break,
        };

        match notification {
            Notification::Output { pane_id, data } => {
                if attachment.mirror.was_released(pane_id) {
                    log::trace!("[{name}] Dropping output for released pane %{pane_id}");
                    continue;
                }
                let evicted = buffers.append(pane_id, &data);
                if evicted > 0 {
                    log::trace!("[{name}] Pane %{pane_id} evicted {evicted} bytes");
                }
            }
            Notification::Pause { pane_id } => attachment.flow.on_pause(pane_id).await,
            Notification::Continue { pane_id } => attachment.flow.on_continue(pane_id),
            Notification::SubscriptionChanged {
                name: subscription,
                value,
                window_id,
                pane_id,
            } => {
                let mirror = &attachment.mirror;
                let scope = attachment.subscriptions.on_change(
                    &subscription,
                    &value,
                    window_id,
                    pane_id,
                    |window| mirror.has_window(window),
                );
                if let Some(scope) = scope {
                    mirror.schedule_refresh(scope);
                }
            }
            Notification::Exit { reason } => {
                log::info!("[{name}] tmux control client exiting: {reason:?}");
                exit_reason = reason;
            }
            Notification::SessionsChanged => log::debug!("[{name}] Sessions changed on server"),
            Notification::Unknown { raw } => log::debug!("[{name}] Unhandled notification: {raw}"),
            other => attachment.mirror.apply_notification(&other),
        }
    }

    if let Some(session) = session.upgrade() {
        let reason = exit_reason.unwrap_or_else(|| "control channel closed".to_string());
        session.on_channel_lost(&attachment, reason).await;
    }
}
