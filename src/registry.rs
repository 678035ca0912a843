//! Pending-request registry
//!
//! Tracks every authentication context that is waiting on the security
//! service. Completion callbacks arrive from background tasks, so every
//! membership check and the mutation that follows it run under one lock.
//! The registry lock is taken before any context lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::coordinator::{AuthContext, ContextKey};

/// Reason recorded on contexts aborted by [`PendingRegistry::reset_all`]
pub const RESET_REASON: &str = "pending requests reset";

/// Registry of pending authentication contexts
#[derive(Default)]
pub struct PendingRegistry {
    entries: Mutex<HashMap<ContextKey, Weak<AuthContext>>>,
}

impl PendingRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context. Returns `false` if it was already present.
    pub fn add(&self, ctx: &Arc<AuthContext>) -> bool {
        self.lock().insert(ctx)
    }

    /// Unregister a context. Returns whether it was present.
    pub fn remove(&self, ctx: &AuthContext) -> bool {
        self.lock().remove(ctx.key())
    }

    /// Whether a context is registered
    #[must_use]
    pub fn contains(&self, ctx: &AuthContext) -> bool {
        self.lock().contains(ctx.key())
    }

    /// Number of registered contexts
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no context is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drain the registry, erroring out every drained context that is still
    /// pending. Returns whether anything was drained.
    pub fn reset_all(&self) -> bool {
        !self.lock().drain_and_abort(RESET_REASON).is_empty()
    }

    /// Take the registry lock for a check-then-mutate sequence
    pub fn lock(&self) -> PendingGuard<'_> {
        PendingGuard {
            entries: self.entries.lock(),
        }
    }
}

/// Exclusive access to the registry
pub struct PendingGuard<'a> {
    entries: MutexGuard<'a, HashMap<ContextKey, Weak<AuthContext>>>,
}

impl PendingGuard<'_> {
    /// Whether `key` is registered
    #[must_use]
    pub fn contains(&self, key: ContextKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Register a context. Returns `false` if it was already present.
    pub fn insert(&mut self, ctx: &Arc<AuthContext>) -> bool {
        let key = ctx.key();
        let added = self.entries.insert(key, Arc::downgrade(ctx)).is_none();
        debug!(context = %key, pending = self.entries.len(), "Context registered");
        added
    }

    /// Unregister `key`. Returns whether it was present.
    pub fn remove(&mut self, key: ContextKey) -> bool {
        let removed = self.entries.remove(&key).is_some();
        if removed {
            debug!(context = %key, pending = self.entries.len(), "Context unregistered");
        }
        removed
    }

    /// Remove every entry, error out the live pending ones and hand back the
    /// live contexts so their connections can be resumed.
    pub fn drain_and_abort(&mut self, reason: &str) -> Vec<Arc<AuthContext>> {
        let drained: Vec<Arc<AuthContext>> = self
            .entries
            .drain()
            .filter_map(|(_, ctx)| ctx.upgrade())
            .collect();

        let aborted = drained.iter().filter(|ctx| ctx.abort(reason)).count();
        if !drained.is_empty() {
            warn!(drained = drained.len(), aborted, reason, "Pending registry reset");
        }
        drained
    }
}
