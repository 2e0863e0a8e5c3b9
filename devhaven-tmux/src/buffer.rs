//! Per-pane output history with a byte cap
//!
//! Every pane keeps the most recent output bytes up to a fixed limit. When an
//! append pushes a pane over the limit the oldest bytes are evicted, and any
//! UTF-8 continuation bytes left dangling at the new front are dropped too so
//! a snapshot never starts in the middle of a character.
//!
//! Live listeners registered through [`OutputBufferStore::attach`] receive
//! every chunk after the snapshot they were handed, with no gap and no
//! overlap.

use crate::types::TmuxPaneId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Longest run of continuation bytes a UTF-8 sequence can have
const MAX_CONTINUATION: usize = 3;

#[derive(Default)]
struct PaneBufferInner {
    data: VecDeque<u8>,
    listeners: Vec<mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct PaneBuffer {
    inner: Mutex<PaneBufferInner>,
}

/// Snapshot of a pane's history plus a receiver for everything after it.
pub struct OutputAttachment {
    pub snapshot: Vec<u8>,
    pub live: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Output history for every pane of every session.
pub struct OutputBufferStore {
    limit: usize,
    panes: RwLock<HashMap<TmuxPaneId, Arc<PaneBuffer>>>,
}

impl OutputBufferStore {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            panes: RwLock::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn pane(&self, pane_id: TmuxPaneId) -> Arc<PaneBuffer> {
        if let Some(pane) = self.panes.read().get(&pane_id) {
            return Arc::clone(pane);
        }
        Arc::clone(self.panes.write().entry(pane_id).or_default())
    }

    /// Append output for a pane, returning how many bytes were evicted.
    pub fn append(&self, pane_id: TmuxPaneId, chunk: &[u8]) -> usize {
        if chunk.is_empty() {
            return 0;
        }
        let pane = self.pane(pane_id);
        let mut inner = pane.inner.lock();

        inner.listeners.retain(|tx| tx.send(chunk.to_vec()).is_ok());
        inner.data.extend(chunk);

        let evicted = trim_to_limit(&mut inner.data, self.limit);
        if evicted > 0 {
            log::debug!("Pane %{pane_id} output buffer full, evicted {evicted} bytes");
        }
        evicted
    }

    /// Seed an empty pane with captured history. Panes that already hold
    /// output are left alone.
    pub fn prime(&self, pane_id: TmuxPaneId, history: &[u8]) -> bool {
        let pane = self.pane(pane_id);
        let mut inner = pane.inner.lock();
        if !inner.data.is_empty() {
            return false;
        }
        inner.data.extend(history);
        trim_to_limit(&mut inner.data, self.limit);
        true
    }

    pub fn snapshot(&self, pane_id: TmuxPaneId) -> Vec<u8> {
        match self.panes.read().get(&pane_id) {
            Some(pane) => pane.inner.lock().data.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot the pane and subscribe to what follows it atomically.
    pub fn attach(&self, pane_id: TmuxPaneId) -> OutputAttachment {
        let pane = self.pane(pane_id);
        let mut inner = pane.inner.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.push(tx);
        OutputAttachment {
            snapshot: inner.data.iter().copied().collect(),
            live: rx,
        }
    }

    /// Drop a pane's history. Live listeners see their channel close.
    pub fn release(&self, pane_id: TmuxPaneId) -> bool {
        let released = self.panes.write().remove(&pane_id).is_some();
        if released {
            log::debug!("Released output buffer for pane %{pane_id}");
        }
        released
    }

    pub fn contains(&self, pane_id: TmuxPaneId) -> bool {
        self.panes.read().contains_key(&pane_id)
    }

    pub fn len(&self, pane_id: TmuxPaneId) -> usize {
        self.panes
            .read()
            .get(&pane_id)
            .map(|pane| pane.inner.lock().data.len())
            .unwrap_or(0)
    }

    pub fn pane_ids(&self) -> Vec<TmuxPaneId> {
        let mut ids: Vec<_> = self.panes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Drop bytes from the front until `data` fits, then skip continuation
/// bytes orphaned by the cut.
fn trim_to_limit(data: &mut VecDeque<u8>, limit: usize) -> usize {
    if data.len() <= limit {
        return 0;
    }
    let overflow = data.len() - limit;
    data.drain(..overflow);

    let dangling = data
        .iter()
        .take(MAX_CONTINUATION)
        .take_while(|&&b| is_continuation(b))
        .count();
    data.drain(..dangling);
    overflow + dangling
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}
