//! # HLP Connection Registry
//!
//! The process-wide index of live HLP stream processors. Two maps live
//! under one reader/writer lock: by connection id, and by client id once
//! a handshake claims the connection. `get_or_create` uses double-checked
//! locking so the factory runs at most once per id no matter how many
//! push/poll requests race on a fresh connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::processor::HlpProcessor;

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, Arc<HlpProcessor>>,
    /// client id → connection id currently claimed by that client.
    by_client: HashMap<i64, String>,
}

/// Registry of live processors; created once per process.
#[derive(Default)]
pub struct HlpRegistry {
    indexes: RwLock<Indexes>,
}

impl HlpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<HlpProcessor>> {
        self.indexes
            .read()
            .expect("registry lock poisoned")
            .by_id
            .get(connection_id)
            .cloned()
    }

    /// Atomic lookup-or-insert. The factory is invoked at most once per
    /// connection id across any concurrent schedule; the boolean reports
    /// whether this call created the processor.
    pub fn get_or_create(
        &self,
        connection_id: &str,
        factory: impl FnOnce() -> Arc<HlpProcessor>,
    ) -> (Arc<HlpProcessor>, bool) {
        if let Some(existing) = self.get(connection_id) {
            return (existing, false);
        }
        let mut indexes = self.indexes.write().expect("registry lock poisoned");
        if let Some(existing) = indexes.by_id.get(connection_id) {
            return (Arc::clone(existing), false);
        }
        let created = factory();
        indexes
            .by_id
            .insert(connection_id.to_string(), Arc::clone(&created));
        (created, true)
    }

    /// Claims a still-anonymous connection for `client_id` once its
    /// handshake succeeds. The by-id index keeps the processor; the
    /// by-client index now names it. Returns the previously claimed
    /// processor when the client already had one on this node, so the
    /// caller can close the superseded connection.
    pub fn bind_client(&self, connection_id: &str, client_id: i64) -> Option<Arc<HlpProcessor>> {
        let mut indexes = self.indexes.write().expect("registry lock poisoned");
        if !indexes.by_id.contains_key(connection_id) {
            return None;
        }
        let superseded = indexes
            .by_client
            .insert(client_id, connection_id.to_string())
            .filter(|old| old != connection_id)
            .and_then(|old| indexes.by_id.get(&old).cloned());
        superseded
    }

    /// Resolves the control connection a client currently holds.
    pub fn client_connection(&self, client_id: i64) -> Option<Arc<HlpProcessor>> {
        let indexes = self.indexes.read().expect("registry lock poisoned");
        indexes
            .by_client
            .get(&client_id)
            .and_then(|id| indexes.by_id.get(id))
            .cloned()
    }

    /// Removes a connection from both indexes. Idempotent.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<HlpProcessor>> {
        let mut indexes = self.indexes.write().expect("registry lock poisoned");
        let removed = indexes.by_id.remove(connection_id);
        if let Some(processor) = &removed {
            let client_id = processor.client_id();
            // Drop the claim only if it still points at this connection.
            if indexes
                .by_client
                .get(&client_id)
                .is_some_and(|id| id == connection_id)
            {
                indexes.by_client.remove(&client_id);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.indexes
            .read()
            .expect("registry lock poisoned")
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live processors, for sweeps and listings.
    pub fn snapshot(&self) -> Vec<Arc<HlpProcessor>> {
        self.indexes
            .read()
            .expect("registry lock poisoned")
            .by_id
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn proc(id: &str) -> Arc<HlpProcessor> {
        Arc::new(HlpProcessor::new(id, 1024, 16, 1024 * 1024))
    }

    #[test]
    fn factory_runs_at_most_once_per_id() {
        let registry = Arc::new(HlpRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let registry = Arc::clone(&registry);
                let calls = Arc::clone(&calls);
                scope.spawn(move || {
                    registry.get_or_create("conn_shared00", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        proc("conn_shared00")
                    });
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn claim_migration_keeps_both_indexes_consistent() {
        let registry = HlpRegistry::new();
        let (created, fresh) = registry.get_or_create("conn_xyz00000", || proc("conn_xyz00000"));
        assert!(fresh);
        created.bind_identity(42, "");

        assert!(registry.bind_client("conn_xyz00000", 42).is_none());
        // by-id still holds it, by-client now names it.
        assert!(registry.get("conn_xyz00000").is_some());
        let claimed = registry.client_connection(42).unwrap();
        assert_eq!(claimed.connection_id(), "conn_xyz00000");
    }

    #[test]
    fn a_second_connection_supersedes_the_first() {
        let registry = HlpRegistry::new();
        registry.get_or_create("conn_old000000", || proc("conn_old000000"));
        registry.get_or_create("conn_new000000", || proc("conn_new000000"));
        registry.bind_client("conn_old000000", 42);

        let superseded = registry.bind_client("conn_new000000", 42).unwrap();
        assert_eq!(superseded.connection_id(), "conn_old000000");
        assert_eq!(
            registry.client_connection(42).unwrap().connection_id(),
            "conn_new000000"
        );
    }

    #[test]
    fn rebinding_the_same_connection_is_not_a_supersede() {
        let registry = HlpRegistry::new();
        registry.get_or_create("conn_same00000", || proc("conn_same00000"));
        registry.bind_client("conn_same00000", 7);
        assert!(registry.bind_client("conn_same00000", 7).is_none());
    }

    #[test]
    fn remove_clears_the_claim_only_for_the_owner() {
        let registry = HlpRegistry::new();
        let (p_old, _) = registry.get_or_create("conn_a0000000", || proc("conn_a0000000"));
        p_old.bind_identity(9, "");
        registry.bind_client("conn_a0000000", 9);

        let (p_new, _) = registry.get_or_create("conn_b0000000", || proc("conn_b0000000"));
        p_new.bind_identity(9, "");
        registry.bind_client("conn_b0000000", 9);

        // Removing the superseded connection must not clear the new claim.
        registry.remove("conn_a0000000");
        assert!(registry.client_connection(9).is_some());

        registry.remove("conn_b0000000");
        assert!(registry.client_connection(9).is_none());
        assert!(registry.is_empty());
    }
}
