//! Config Snapshot (C6): the immutable value shared by the Broker and the
//! Router, swapped atomically on reload.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::federation::{FederationIndex, ToolNameCollision};
use crate::model::ServerRecord;

/// An immutable bundle of registered servers plus their derived
/// federation index.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Servers in configuration order; this order is authoritative for
    /// both collision resolution (§4.2) and hostname tie-breaks (§4.5).
    pub servers: Vec<ServerRecord>,
    pub index: FederationIndex,
}

impl ConfigSnapshot {
    /// An empty snapshot, used before the first successful registration
    /// pass completes.
    #[must_use]
    pub fn empty() -> Self {
        Self { servers: Vec::new(), index: FederationIndex::new() }
    }

    #[must_use]
    pub fn server(&self, server_id: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.id == server_id)
    }

    /// Build a snapshot from servers plus each enabled server's
    /// successfully discovered tool list. Returns the snapshot and the
    /// collisions encountered while building it, so the caller can log
    /// them with call-site context.
    #[must_use]
    pub fn build(
        servers: Vec<ServerRecord>,
        discovered: &std::collections::HashMap<String, Vec<(String, serde_json::Value)>>,
    ) -> (Self, Vec<ToolNameCollision>) {
        let mut index = FederationIndex::new();
        let mut collisions = Vec::new();

        for server in &servers {
            if !server.enabled {
                continue;
            }
            let Some(tools) = discovered.get(&server.id) else { continue };
            for (original_name, schema) in tools {
                let entry = crate::model::ToolEntry {
                    exposed_name: server.exposed_name(original_name),
                    original_name: original_name.clone(),
                    server_id: server.id.clone(),
                    schema: schema.clone(),
                };
                if let Err(collision) = index.insert(entry) {
                    collisions.push(collision);
                }
            }
        }

        (Self { servers, index }, collisions)
    }
}

/// Lock-free, single-writer atomic cell holding the current snapshot.
///
/// Readers call [`SnapshotStore::load`] and hold the returned `Arc` across
/// their operation, so a concurrent reconfiguration never produces a torn
/// read: a request that started against snapshot N completes entirely
/// against snapshot N even if the store is replaced mid-flight.
pub struct SnapshotStore {
    inner: ArcSwap<ConfigSnapshot>,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self { inner: ArcSwap::from_pointee(initial) }
    }

    /// Take a reference-counted handle to the current snapshot. Safe to
    /// hold across an `.await`.
    #[must_use]
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Publish a new snapshot. Old snapshots still referenced by in-flight
    /// requests are released when their last `Arc` drops.
    pub fn store(&self, snapshot: ConfigSnapshot) {
        self.inner.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(ConfigSnapshot::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerRecord;

    fn server(id: &str) -> ServerRecord {
        ServerRecord {
            id: id.into(),
            url: format!("http://{id}.svc/mcp"),
            hostname: format!("{id}.svc"),
            tool_prefix: format!("{id}_"),
            credential: None,
            enabled: true,
            cluster_hint: None,
        }
    }

    #[test]
    fn build_snapshot_indexes_discovered_tools() {
        let servers = vec![server("a"), server("b")];
        let mut discovered = std::collections::HashMap::new();
        discovered.insert("a".to_string(), vec![("echo".to_string(), serde_json::json!({}))]);
        discovered.insert("b".to_string(), vec![("echo".to_string(), serde_json::json!({}))]);

        let (snapshot, collisions) = ConfigSnapshot::build(servers, &discovered);
        assert!(collisions.is_empty());
        assert_eq!(snapshot.index.len(), 2);
        assert_eq!(snapshot.index.resolve("a_echo"), Some(("a", "echo")));
        assert_eq!(snapshot.index.resolve("b_echo"), Some(("b", "echo")));
    }

    #[test]
    fn build_snapshot_skips_disabled_servers() {
        let mut disabled = server("c");
        disabled.enabled = false;
        let mut discovered = std::collections::HashMap::new();
        discovered.insert("c".to_string(), vec![("echo".to_string(), serde_json::json!({}))]);

        let (snapshot, _) = ConfigSnapshot::build(vec![disabled], &discovered);
        assert!(snapshot.index.is_empty());
    }

    #[test]
    fn store_swap_is_atomic_and_old_reads_survive() {
        let store = SnapshotStore::new(ConfigSnapshot::empty());
        let held = store.load();
        store.store(ConfigSnapshot::build(vec![server("a")], &std::collections::HashMap::new()).0);
        // The reader's handle still reflects the snapshot it loaded, not
        // the newly published one.
        assert!(held.servers.is_empty());
        assert_eq!(store.load().servers.len(), 1);
    }
}
