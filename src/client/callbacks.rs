//! Client-side registry of function arguments.
//!
//! A function passed to `call` stays here under its callback id until the
//! server invokes it. Registrations have a bounded lifetime: the registry
//! holds at most `capacity` entries (oldest evicted first) and drops entries
//! older than `ttl`. Both limits are enforced on every registration.

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identifiers::CallbackId;
use crate::protocol::ClientCallback;

// ============================================================================
// Registration
// ============================================================================

/// One registered function.
struct Registration {
    callback: ClientCallback,
    registered_at: Instant,
}

// ============================================================================
// CallbackRegistry
// ============================================================================

/// Callback id → function table with capacity and TTL limits.
///
/// Ids are allocated monotonically, so map order is registration order.
pub(crate) struct CallbackRegistry {
    next_id: u64,
    entries: BTreeMap<CallbackId, Registration>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
        }
    }
}

impl CallbackRegistry {
    /// Registers a function and returns its token id.
    pub(crate) fn register(
        &mut self,
        callback: ClientCallback,
        capacity: usize,
        ttl: Duration,
    ) -> CallbackId {
        let now = Instant::now();
        self.prune(now, ttl);

        while self.entries.len() >= capacity.max(1) {
            if let Some((evicted, _)) = self.entries.pop_first() {
                debug!(callback_id = %evicted, capacity, "Callback evicted");
            }
        }

        let id = CallbackId::new(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Registration {
                callback,
                registered_at: now,
            },
        );
        trace!(callback_id = %id, live = self.entries.len(), "Callback registered");
        id
    }

    /// Returns the function registered under `id`, if still live.
    pub(crate) fn get(&self, id: CallbackId, ttl: Duration) -> Option<ClientCallback> {
        let entry = self.entries.get(&id)?;
        if entry.registered_at.elapsed() >= ttl {
            return None;
        }
        Some(entry.callback.clone())
    }

    /// Returns the number of live registrations.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every registration older than `ttl`.
    fn prune(&mut self, now: Instant, ttl: Duration) {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.registered_at) < ttl);
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!(expired, "Expired callbacks pruned");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use serde_json::Value;

    const TTL: Duration = Duration::from_secs(60);

    fn noop() -> ClientCallback {
        Arc::new(|_: Vec<Value>| {})
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_monotonic() {
        let mut registry = CallbackRegistry::default();
        let a = registry.register(noop(), 10, TTL);
        let b = registry.register(noop(), 10, TTL);
        assert_eq!(a, CallbackId::new(1));
        assert_eq!(b, CallbackId::new(2));
        assert!(registry.get(a, TTL).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let mut registry = CallbackRegistry::default();
        let first = registry.register(noop(), 2, TTL);
        let second = registry.register(noop(), 2, TTL);
        let third = registry.register(noop(), 2, TTL);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(first, TTL).is_none());
        assert!(registry.get(second, TTL).is_some());
        assert!(registry.get(third, TTL).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_entries() {
        let mut registry = CallbackRegistry::default();
        let old = registry.register(noop(), 10, TTL);

        tokio::time::advance(TTL).await;
        assert!(registry.get(old, TTL).is_none());

        let fresh = registry.register(noop(), 10, TTL);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(fresh, TTL).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_not_reused_after_eviction() {
        let mut registry = CallbackRegistry::default();
        registry.register(noop(), 1, TTL);
        let next = registry.register(noop(), 1, TTL);
        assert_eq!(next, CallbackId::new(2));
    }
}
