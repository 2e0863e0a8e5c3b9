//! Pause-after flow control
//!
//! With `pause-after` enabled tmux stops sending `%output` for a pane once
//! the client falls more than N seconds behind, and says so with `%pause`.
//! Output for these panes lands in their output buffers rather than being
//! rendered synchronously, so the manager resumes every paused pane at once;
//! a pane whose resume cannot be delivered stays paused and is reported as
//! degraded.

use crate::client::ProtocolClient;
use crate::commands::TmuxCommand;
use crate::events::{EventSender, SessionEvent, emit};
use crate::mirror::StateMirror;
use crate::types::{FlowState, TmuxPaneId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub struct FlowControlManager {
    client: Arc<ProtocolClient>,
    mirror: Arc<StateMirror>,
    events: EventSender,
    /// Panes whose last resume attempt failed
    degraded: Mutex<HashSet<TmuxPaneId>>,
}

impl FlowControlManager {
    pub fn new(client: Arc<ProtocolClient>, mirror: Arc<StateMirror>, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            client,
            mirror,
            events,
            degraded: Mutex::new(HashSet::new()),
        })
    }

    /// Turn on `pause-after`. Older tmux versions reject the flag; the
    /// session then simply runs without flow control.
    pub async fn enable(&self, pause_after_secs: u32) {
        match self
            .client
            .execute(&TmuxCommand::enable_pause_after(pause_after_secs))
            .await
        {
            Ok(_) => log::info!("Flow control enabled: pause-after={pause_after_secs}s"),
            Err(e) => log::warn!("Flow control unavailable, continuing without it: {e}"),
        }
    }

    /// `%pause`: mark the pane paused and ask tmux to continue it.
    pub async fn on_pause(self: &Arc<Self>, pane_id: TmuxPaneId) {
        log::debug!("Pane %{pane_id} paused by tmux");
        self.transition(pane_id, FlowState::Paused, false);

        let reply = match self.client.submit(&TmuxCommand::continue_pane(pane_id)).await {
            Ok(reply) => reply,
            Err(e) => {
                self.resume_failed(pane_id, &e.to_string());
                return;
            }
        };

        // Waiting here would stall the dispatcher behind tmux's reply
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match reply.wait().await {
                Ok(_) => {
                    log::debug!("Pane %{pane_id} resumed");
                    this.degraded.lock().remove(&pane_id);
                    this.transition(pane_id, FlowState::Flowing, false);
                }
                Err(e) => this.resume_failed(pane_id, &e.to_string()),
            }
        });
    }

    /// `%continue`: tmux resumed the pane on its own.
    pub fn on_continue(&self, pane_id: TmuxPaneId) {
        self.degraded.lock().remove(&pane_id);
        self.transition(pane_id, FlowState::Flowing, false);
    }

    pub fn is_degraded(&self, pane_id: TmuxPaneId) -> bool {
        self.degraded.lock().contains(&pane_id)
    }

    fn resume_failed(&self, pane_id: TmuxPaneId, reason: &str) {
        // The session is going away; its own teardown reports that
        if !self.client.is_open() {
            log::debug!("Not resuming pane %{pane_id}: channel closed");
            return;
        }
        log::warn!("Could not resume pane %{pane_id}, leaving it paused: {reason}");
        self.degraded.lock().insert(pane_id);
        self.transition(pane_id, FlowState::Paused, true);
    }

    fn transition(&self, pane_id: TmuxPaneId, state: FlowState, degraded: bool) {
        let changed = self.mirror.set_flow(pane_id, state);
        if changed || degraded {
            emit(
                &self.events,
                SessionEvent::FlowChanged {
                    pane_id,
                    state,
                    degraded,
                },
            );
        }
    }
}
