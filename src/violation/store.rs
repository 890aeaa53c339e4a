//! Bounded in-memory violation store with broadcast and per-execution
//! subscribers.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::violation::event::ViolationEvent;

/// Ring capacity; oldest entries are evicted on overflow.
pub const MAX_VIOLATIONS: usize = 500;

/// Broadcast listeners receive the full visible snapshot.
pub type BroadcastListener = Box<dyn Fn(&[ViolationEvent]) + Send + Sync>;

/// Per-execution listeners receive matching events only.
pub type ExecutionListener = Box<dyn Fn(&ViolationEvent) + Send + Sync>;

struct Inner {
    ring: VecDeque<ViolationEvent>,
    total_count: u64,
    next_event_id: u64,
    next_token: u64,
    broadcast: Vec<(u64, Arc<BroadcastListener>)>,
    per_execution: HashMap<u64, Vec<(u64, Arc<ExecutionListener>)>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(MAX_VIOLATIONS),
            total_count: 0,
            next_event_id: 1,
            next_token: 1,
            broadcast: Vec::new(),
            per_execution: HashMap::new(),
        }
    }

    fn visible_snapshot(&self) -> Vec<ViolationEvent> {
        self.ring.iter().filter(|v| !v.suppressed).cloned().collect()
    }
}

/// In-memory store for sandbox violations. Producers never block on
/// subscribers; callbacks run outside the store lock and a panicking
/// callback is logged and removed.
pub struct SandboxViolationStore {
    inner: Arc<RwLock<Inner>>,
}

/// Unsubscribe token. Holds only a weak reference, so dropping the store
/// first (e.g. on `reset`) leaves the token inert.
pub struct Subscription {
    token: u64,
    execution_id: Option<u64>,
    inner: Weak<RwLock<Inner>>,
}

impl Subscription {
    /// Remove the subscriber. Safe to call after the store is gone.
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut guard = inner.write();
        match self.execution_id {
            None => guard.broadcast.retain(|(t, _)| *t != self.token),
            Some(eid) => {
                if let Some(listeners) = guard.per_execution.get_mut(&eid) {
                    listeners.retain(|(t, _)| *t != self.token);
                    if listeners.is_empty() {
                        guard.per_execution.remove(&eid);
                    }
                }
            }
        }
    }
}

impl Default for SandboxViolationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxViolationStore {
    /// Create a new violation store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::new())),
        }
    }

    /// Add a violation. The event gets a store-assigned id; listeners are
    /// notified after the lock is released.
    pub fn add(&self, mut event: ViolationEvent) {
        let (snapshot, broadcast, execution_listeners, event) = {
            let mut inner = self.inner.write();

            event.id = inner.next_event_id;
            inner.next_event_id += 1;
            inner.total_count += 1;

            if inner.ring.len() == MAX_VIOLATIONS {
                inner.ring.pop_front();
            }
            inner.ring.push_back(event.clone());

            if event.suppressed {
                return;
            }

            let broadcast = inner.broadcast.clone();
            let execution_listeners = event
                .execution_id
                .and_then(|eid| inner.per_execution.get(&eid).cloned())
                .unwrap_or_default();

            (inner.visible_snapshot(), broadcast, execution_listeners, event)
        };

        let mut dead = Vec::new();
        for (token, listener) in &broadcast {
            if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                tracing::warn!("broadcast violation subscriber panicked; removing");
                dead.push((*token, None));
            }
        }
        for (token, listener) in &execution_listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!("per-execution violation subscriber panicked; removing");
                dead.push((*token, event.execution_id));
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.write();
            for (token, eid) in dead {
                match eid {
                    None => inner.broadcast.retain(|(t, _)| *t != token),
                    Some(eid) => {
                        if let Some(listeners) = inner.per_execution.get_mut(&eid) {
                            listeners.retain(|(t, _)| *t != token);
                            if listeners.is_empty() {
                                inner.per_execution.remove(&eid);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Get visible violations, newest last, up to an optional limit.
    pub fn get_violations(&self, limit: Option<usize>) -> Vec<ViolationEvent> {
        let snapshot = self.inner.read().visible_snapshot();
        match limit {
            Some(n) if n < snapshot.len() => snapshot[snapshot.len() - n..].to_vec(),
            _ => snapshot,
        }
    }

    /// Get visible violations attributed to a command string.
    pub fn get_violations_for_command(&self, command: &str) -> Vec<ViolationEvent> {
        self.get_violations_for_encoded(&crate::violation::encode_command(command))
    }

    /// Get visible violations by encoded command digest.
    pub fn get_violations_for_encoded(&self, encoded: &str) -> Vec<ViolationEvent> {
        self.inner
            .read()
            .ring
            .iter()
            .filter(|v| !v.suppressed && v.encoded_command == encoded)
            .cloned()
            .collect()
    }

    /// Number of events currently in the ring (suppressed included).
    pub fn current_count(&self) -> usize {
        self.inner.read().ring.len()
    }

    /// Number of events ever added. Never decreased by eviction or `clear`.
    pub fn total_count(&self) -> u64 {
        self.inner.read().total_count
    }

    /// Empty the ring without touching the total count.
    pub fn clear(&self) {
        self.inner.write().ring.clear();
    }

    /// Subscribe to every visible violation. The callback immediately
    /// receives the current snapshot, then the full snapshot on every add.
    pub fn subscribe(&self, listener: BroadcastListener) -> Subscription {
        let listener = Arc::new(listener);
        let (token, snapshot) = {
            let mut inner = self.inner.write();
            let token = inner.next_token;
            inner.next_token += 1;
            inner.broadcast.push((token, listener.clone()));
            (token, inner.visible_snapshot())
        };

        if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
            tracing::warn!("broadcast violation subscriber panicked at registration; removing");
            self.inner.write().broadcast.retain(|(t, _)| *t != token);
        }

        Subscription {
            token,
            execution_id: None,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to violations of a single execution.
    pub fn subscribe_to_execution(
        &self,
        execution_id: u64,
        listener: ExecutionListener,
    ) -> Subscription {
        let mut inner = self.inner.write();
        let token = inner.next_token;
        inner.next_token += 1;
        inner
            .per_execution
            .entry(execution_id)
            .or_default()
            .push((token, Arc::new(listener)));

        Subscription {
            token,
            execution_id: Some(execution_id),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Drop all subscribers. Outstanding tokens become inert.
    pub fn clear_subscribers(&self) {
        let mut inner = self.inner.write();
        inner.broadcast.clear();
        inner.per_execution.clear();
    }
}
