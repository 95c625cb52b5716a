//! Shared acceptor state implementation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::core::AcceptorCore;
use crate::traits::{DecisionOf, Protocol};

/// Type alias for the core state machine with protocol-specific types
pub(crate) type CoreState<P> = AcceptorCore<<P as Protocol>::NodeId, <P as Protocol>::Value>;

/// State of one instance on this acceptor
pub(crate) struct Slot<P: Protocol> {
    pub(crate) core: CoreState<P>,
    /// When this acceptor first learned the decision
    decided_at: Option<Instant>,
}

impl<P: Protocol> Slot<P> {
    fn new(seed: Option<DecisionOf<P>>) -> Self {
        match seed {
            Some((proposal, value)) => Self {
                core: AcceptorCore::decided_with(proposal, value),
                decided_at: Some(Instant::now()),
            },
            None => Self {
                core: AcceptorCore::new(),
                decided_at: None,
            },
        }
    }

    /// Record a decision, stamping the time it was first learned.
    pub(crate) fn learn(&mut self, decision: DecisionOf<P>) -> bool {
        let (proposal, value) = decision;
        let learned = self.core.learn(proposal, value);
        if learned {
            self.decided_at = Some(Instant::now());
        }
        learned
    }
}

/// In-memory acceptor state for every instance, using `Arc<Mutex>`.
///
/// Each instance lives behind its own mutex. The map of instances is only
/// locked to look up, insert or remove a slot, so instances never contend
/// with each other.
pub struct SharedAcceptorState<P: Protocol> {
    slots: Arc<Mutex<HashMap<P::Key, Arc<Mutex<Slot<P>>>>>>,
}

impl<P: Protocol> Clone for SharedAcceptorState<P> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<P: Protocol> Default for SharedAcceptorState<P> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Protocol> SharedAcceptorState<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `f` on the slot for `key`, creating it if needed.
    ///
    /// A new slot is seeded with `seed()`, the decision already known for the
    /// key (if any), so instances collected earlier keep answering with it.
    pub(crate) fn with_slot<T>(
        &self,
        key: &P::Key,
        seed: impl FnOnce() -> Option<DecisionOf<P>>,
        f: impl FnOnce(&mut Slot<P>) -> T,
    ) -> T {
        let slot = {
            let mut slots = lock(&self.slots);
            match slots.get(key) {
                Some(slot) => Arc::clone(slot),
                None => {
                    let slot = Arc::new(Mutex::new(Slot::new(seed())));
                    slots.insert(key.clone(), Arc::clone(&slot));
                    slot
                }
            }
        };
        let mut slot = lock(&slot);
        f(&mut slot)
    }

    /// Read-only view of an instance: `(accepted, decided)`.
    ///
    /// Never creates a slot.
    #[must_use]
    pub fn inspect(&self, key: &P::Key) -> Option<(Option<DecisionOf<P>>, Option<DecisionOf<P>>)> {
        let slot = lock(&self.slots).get(key).map(Arc::clone)?;
        let slot = lock(&slot);
        Some((slot.core.accepted().cloned(), slot.core.decided().cloned()))
    }

    /// Highest round promised for `key`, if any.
    #[must_use]
    pub fn promised_round(&self, key: &P::Key) -> Option<u64> {
        let slot = lock(&self.slots).get(key).map(Arc::clone)?;
        let slot = lock(&slot);
        slot.core.promised().map(|p| p.round)
    }

    /// Number of instances currently held
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop instances decided at least `retention` ago. Returns their keys.
    ///
    /// Undecided instances are never dropped.
    pub fn collect_garbage(&self, retention: Duration) -> Vec<P::Key> {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        let expired: Vec<P::Key> = slots
            .iter()
            .filter(|(_, slot)| {
                lock(slot)
                    .decided_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= retention)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            slots.remove(key);
        }
        expired
    }
}
