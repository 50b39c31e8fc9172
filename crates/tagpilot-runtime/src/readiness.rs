//! Settle-once readiness tracking.
//!
//! One readiness cycle settles exactly once with the set of script states.
//! Futures from `wait` and callbacks from `on_ready` all observe the same
//! result. A reset starts a new cycle; anything registered against the old
//! one is dropped.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;

use tagpilot_core::ScriptLoadState;

pub type ReadyCallback = Box<dyn FnOnce(&[ScriptLoadState]) + Send>;

type Settled = Option<Arc<Vec<ScriptLoadState>>>;

struct ReadinessState {
    cycle: u64,
    tx: watch::Sender<Settled>,
    callbacks: BTreeMap<u64, ReadyCallback>,
    next_id: u64,
}

/// Shared readiness cell for one script manager.
#[derive(Clone)]
pub(crate) struct Readiness {
    inner: Arc<Mutex<ReadinessState>>,
}

impl Readiness {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Mutex::new(ReadinessState {
                cycle: 0,
                tx,
                callbacks: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReadinessState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.lock().tx.borrow().is_some()
    }

    pub(crate) fn settled_states(&self) -> Option<Vec<ScriptLoadState>> {
        self.lock()
            .tx
            .borrow()
            .as_ref()
            .map(|states| Vec::clone(states))
    }

    /// Resolve once the current cycle settles.
    pub(crate) async fn wait(&self) -> Vec<ScriptLoadState> {
        let mut rx = self.lock().tx.subscribe();
        let states = match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled
                .as_ref()
                .map(|states| Vec::clone(states))
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        states
    }

    /// Register a callback, or run it now if the cycle already settled.
    pub(crate) fn on_ready(&self, callback: ReadyCallback) -> ReadySubscription {
        let mut state = self.lock();
        let settled = state.tx.borrow().clone();
        if let Some(states) = settled {
            drop(state);
            run_callback(callback, &states);
            return ReadySubscription::inert();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, callback);
        ReadySubscription {
            readiness: Some(Arc::downgrade(&self.inner)),
            cycle: state.cycle,
            id,
        }
    }

    /// Settle the current cycle. Returns false if it had already settled.
    pub(crate) fn settle(&self, states: Vec<ScriptLoadState>) -> bool {
        let states = Arc::new(states);
        let callbacks = {
            let mut state = self.lock();
            if state.tx.borrow().is_some() {
                return false;
            }
            state.tx.send_replace(Some(states.clone()));
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks.into_values() {
            run_callback(callback, &states);
        }
        true
    }

    /// Start a fresh, unsettled cycle.
    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        let (tx, _) = watch::channel(None);
        state.tx = tx;
        state.callbacks.clear();
        state.cycle += 1;
    }
}

fn run_callback(callback: ReadyCallback, states: &[ScriptLoadState]) {
    if catch_unwind(AssertUnwindSafe(|| callback(states))).is_err() {
        tracing::warn!("ready callback panicked");
    }
}

/// Handle returned by `on_ready`; drop it to keep the callback registered.
#[must_use = "dropping the subscription keeps the callback; call unsubscribe() to remove it"]
pub struct ReadySubscription {
    readiness: Option<Weak<Mutex<ReadinessState>>>,
    cycle: u64,
    id: u64,
}

impl ReadySubscription {
    fn inert() -> Self {
        Self {
            readiness: None,
            cycle: 0,
            id: 0,
        }
    }

    /// Remove the callback if it has not fired yet.
    /// Returns true when a pending callback was removed.
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.readiness.and_then(|weak| weak.upgrade()) else {
            return false;
        };
        let mut state = inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.cycle != self.cycle {
            return false;
        }
        state.callbacks.remove(&self.id).is_some()
    }
}
