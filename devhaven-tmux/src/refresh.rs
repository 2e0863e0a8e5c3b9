//! Refresh scheduling for the state mirror
//!
//! Topology notifications arrive in bursts (a split emits a layout change
//! per window, a new window emits add + layout + session-window-changed).
//! [`Debouncer`] folds a burst into one refresh request after a quiet
//! period, and [`RefreshGate`] makes sure at most one refresh talks to tmux
//! at a time: requests arriving while one runs are merged into a single
//! follow-up run.

use crate::types::TmuxWindowId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// What a refresh has to re-read from tmux.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    /// Every window and pane of the session
    Full,
    /// Only these windows and their panes
    Windows(BTreeSet<TmuxWindowId>),
}

impl RefreshScope {
    pub fn window(window_id: TmuxWindowId) -> Self {
        RefreshScope::Windows(BTreeSet::from([window_id]))
    }

    /// Smallest scope covering both.
    pub fn merge(self, other: RefreshScope) -> RefreshScope {
        match (self, other) {
            (RefreshScope::Windows(mut a), RefreshScope::Windows(b)) => {
                a.extend(b);
                RefreshScope::Windows(a)
            }
            _ => RefreshScope::Full,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, RefreshScope::Full)
    }
}

fn merge_into(slot: &mut Option<RefreshScope>, scope: RefreshScope) {
    *slot = Some(match slot.take() {
        Some(existing) => existing.merge(scope),
        None => scope,
    });
}

// ============================================================================
// Debouncer
// ============================================================================

type FireFn = Box<dyn Fn(RefreshScope) + Send + Sync>;

struct DebounceState {
    pending: Option<RefreshScope>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every schedule/cancel; a timer only fires for its own epoch
    epoch: u64,
}

struct DebouncerInner {
    delay: Duration,
    on_fire: FireFn,
    state: Mutex<DebounceState>,
}

/// Trailing-edge debouncer: fires once, `delay` after the last request,
/// with the union of every scope requested since the previous fire.
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    pub fn new(delay: Duration, on_fire: impl Fn(RefreshScope) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(DebouncerInner {
                delay,
                on_fire: Box::new(on_fire),
                state: Mutex::new(DebounceState {
                    pending: None,
                    timer: None,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Request a refresh of `scope`, restarting the quiet period.
    pub fn schedule(&self, scope: RefreshScope) {
        let mut state = self.inner.state.lock();
        merge_into(&mut state.pending, scope);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        let epoch = state.epoch;

        let inner = Arc::clone(&self.inner);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.delay).await;
            let scope = {
                let mut state = inner.state.lock();
                if state.epoch != epoch {
                    return;
                }
                state.timer = None;
                state.pending.take()
            };
            if let Some(scope) = scope {
                log::debug!("Debounced refresh firing: {scope:?}");
                (inner.on_fire)(scope);
            }
        }));
    }

    /// Drop any pending request without firing it.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.epoch += 1;
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Refresh gate
// ============================================================================

#[derive(Default)]
struct GateState {
    in_flight: bool,
    queued: Option<RefreshScope>,
    /// Callers waiting for the queued follow-up run
    queued_waiters: Vec<oneshot::Sender<()>>,
}

/// Serializes refresh runs and coalesces requests made during one.
#[derive(Default)]
pub struct RefreshGate {
    state: Mutex<GateState>,
    runs: AtomicU64,
}

/// Outcome of asking the gate for a refresh.
pub enum Admission {
    /// No refresh was running; the caller runs this one
    Run(RefreshPermit),
    /// A refresh is running; the request was merged into its follow-up,
    /// which completes this receiver when done
    Joined(oneshot::Receiver<()>),
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(self: &Arc<Self>, scope: RefreshScope) -> Admission {
        let mut state = self.state.lock();
        if state.in_flight {
            log::debug!("Refresh coalesced: {scope:?}");
            merge_into(&mut state.queued, scope);
            let (tx, rx) = oneshot::channel();
            state.queued_waiters.push(tx);
            return Admission::Joined(rx);
        }

        state.in_flight = true;
        self.runs.fetch_add(1, Ordering::Relaxed);
        Admission::Run(RefreshPermit {
            gate: Arc::clone(self),
            scope,
            waiters: Vec::new(),
            active: true,
        })
    }

    /// Number of refresh runs started so far.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().in_flight
    }
}

/// The right to run one refresh, plus any follow-ups queued behind it.
pub struct RefreshPermit {
    gate: Arc<RefreshGate>,
    scope: RefreshScope,
    waiters: Vec<oneshot::Sender<()>>,
    active: bool,
}

impl RefreshPermit {
    pub fn scope(&self) -> &RefreshScope {
        &self.scope
    }

    /// Mark the current run done. Returns `true` when requests queued up
    /// meanwhile, in which case [`scope`](Self::scope) now holds their merged
    /// scope and the caller must run again.
    pub fn complete(&mut self) -> bool {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }

        let mut state = self.gate.state.lock();
        match state.queued.take() {
            Some(scope) => {
                self.scope = scope;
                self.waiters = std::mem::take(&mut state.queued_waiters);
                self.gate.runs.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                state.in_flight = false;
                self.active = false;
                false
            }
        }
    }
}

impl Drop for RefreshPermit {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        // Abandoned mid-run; queued requests are dropped with it and their
        // waiters see the channel close
        let mut state = self.gate.state.lock();
        state.in_flight = false;
        state.queued = None;
        state.queued_waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scope_merge() {
        let merged = RefreshScope::window(1).merge(RefreshScope::window(2));
        assert_eq!(merged, RefreshScope::Windows(BTreeSet::from([1, 2])));
        assert!(merged.merge(RefreshScope::Full).is_full());
        assert!(RefreshScope::Full.merge(RefreshScope::window(3)).is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_burst() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let debouncer = Debouncer::new(Duration::from_millis(50), move |scope| {
            sink.lock().push(scope);
        });

        debouncer.schedule(RefreshScope::window(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        debouncer.schedule(RefreshScope::window(2));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            *fired.lock(),
            vec![RefreshScope::Windows(BTreeSet::from([1, 2]))]
        );
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let debouncer = Debouncer::new(Duration::from_millis(50), move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        debouncer.schedule(RefreshScope::Full);
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_gate_coalesces_concurrent_requests() {
        let gate = Arc::new(RefreshGate::new());
        let Admission::Run(mut permit) = gate.admit(RefreshScope::window(1)) else {
            panic!("first request should run");
        };

        let Admission::Joined(mut first) = gate.admit(RefreshScope::window(2)) else {
            panic!("second request should join");
        };
        let Admission::Joined(mut second) = gate.admit(RefreshScope::window(3)) else {
            panic!("third request should join");
        };

        assert!(permit.complete());
        assert_eq!(
            permit.scope(),
            &RefreshScope::Windows(BTreeSet::from([2, 3]))
        );
        assert!(first.try_recv().is_err());

        assert!(!permit.complete());
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
        assert_eq!(gate.runs(), 2);
        assert!(!gate.is_running());
    }

    #[test]
    fn test_abandoned_permit_releases_gate() {
        let gate = Arc::new(RefreshGate::new());
        let Admission::Run(permit) = gate.admit(RefreshScope::Full) else {
            panic!("first request should run");
        };
        let Admission::Joined(mut waiter) = gate.admit(RefreshScope::Full) else {
            panic!("second request should join");
        };
        drop(permit);

        assert!(!gate.is_running());
        assert!(matches!(
            waiter.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(matches!(gate.admit(RefreshScope::Full), Admission::Run(_)));
    }
}
