//! Events published by a session to its observers

use crate::types::{FlowState, SessionStatus, TmuxPaneId, TopologySnapshot};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each session's event channel. Observers that fall further
/// behind miss events and should re-read the current snapshot.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observers of a session may want to react to.
///
/// Pane output is not an event; it is read through
/// [`crate::buffer::OutputBufferStore::attach`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The mirrored topology changed
    StateChanged(Arc<TopologySnapshot>),
    /// A pane was paused or resumed. `degraded` is set when the automatic
    /// resume could not be delivered and the pane stays paused.
    FlowChanged {
        pane_id: TmuxPaneId,
        state: FlowState,
        degraded: bool,
    },
    StatusChanged(SessionStatus),
    /// The control channel ended without a detach or close being requested
    Disconnected { reason: String },
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Publish without caring whether anyone is listening.
pub(crate) fn emit(sender: &EventSender, event: SessionEvent) {
    if sender.send(event).is_err() {
        log::trace!("No session event listeners");
    }
}
