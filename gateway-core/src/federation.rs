//! Tool Federation Index (C2): a collision-free view of all upstream tools.

use std::collections::HashMap;

use crate::model::ToolEntry;

/// Mapping `exposedName -> ToolEntry`, plus a reverse index by server for
/// per-server invalidation.
#[derive(Debug, Clone, Default)]
pub struct FederationIndex {
    by_exposed_name: HashMap<String, ToolEntry>,
    by_server: HashMap<String, Vec<String>>,
    /// Stable insertion order, so `list()` is deterministic within a
    /// snapshot.
    order: Vec<String>,
}

/// A logged collision event: two servers both produced the same exposed
/// name; `winner` is the one already registered (earlier in snapshot
/// order), `loser` is the one skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolNameCollision {
    pub exposed_name: String,
    pub winner_server_id: String,
    pub loser_server_id: String,
}

impl FederationIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tool entry. Returns `Ok(())` if inserted, or
    /// `Err(ToolNameCollision)` if `exposed_name` was already present —
    /// in which case the existing entry is left untouched and the new one
    /// is dropped, matching the "first-registered-in-snapshot-order wins"
    /// policy.
    pub fn insert(&mut self, entry: ToolEntry) -> Result<(), ToolNameCollision> {
        if let Some(existing) = self.by_exposed_name.get(&entry.exposed_name) {
            let collision = ToolNameCollision {
                exposed_name: entry.exposed_name.clone(),
                winner_server_id: existing.server_id.clone(),
                loser_server_id: entry.server_id.clone(),
            };
            tracing::warn!(
                exposed_name = %collision.exposed_name,
                winner = %collision.winner_server_id,
                loser = %collision.loser_server_id,
                "tool name collision, keeping earlier server"
            );
            return Err(collision);
        }

        self.by_server.entry(entry.server_id.clone()).or_default().push(entry.exposed_name.clone());
        self.order.push(entry.exposed_name.clone());
        self.by_exposed_name.insert(entry.exposed_name.clone(), entry);
        Ok(())
    }

    /// Remove every tool owned by `server_id` (used when a record is torn
    /// down or materially changed on reconfiguration).
    pub fn purge_server(&mut self, server_id: &str) {
        if let Some(names) = self.by_server.remove(server_id) {
            for name in names {
                self.by_exposed_name.remove(&name);
                self.order.retain(|n| n != &name);
            }
        }
    }

    /// Resolve an exposed name to its owning server and original name.
    #[must_use]
    pub fn resolve(&self, exposed_name: &str) -> Option<(&str, &str)> {
        self.by_exposed_name.get(exposed_name).map(|e| (e.server_id.as_str(), e.original_name.as_str()))
    }

    /// The full entry for an exposed name, if present.
    #[must_use]
    pub fn get(&self, exposed_name: &str) -> Option<&ToolEntry> {
        self.by_exposed_name.get(exposed_name)
    }

    /// All tool entries, in stable insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<&ToolEntry> {
        self.order.iter().filter_map(|name| self.by_exposed_name.get(name)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_exposed_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_exposed_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(exposed: &str, original: &str, server: &str) -> ToolEntry {
        ToolEntry {
            exposed_name: exposed.into(),
            original_name: original.into(),
            server_id: server.into(),
            schema: serde_json::json!({}),
        }
    }

    #[test]
    fn unique_exposure_first_wins() {
        let mut index = FederationIndex::new();
        index.insert(entry("a_echo", "echo", "A")).unwrap();
        let collision = index.insert(entry("a_echo", "echo", "C")).unwrap_err();
        assert_eq!(collision.winner_server_id, "A");
        assert_eq!(collision.loser_server_id, "C");
        assert_eq!(index.len(), 1);
        assert_eq!(index.resolve("a_echo"), Some(("A", "echo")));
    }

    #[test]
    fn prefix_round_trip() {
        let mut index = FederationIndex::new();
        index.insert(entry("a_echo", "echo", "A")).unwrap();
        index.insert(entry("b_echo", "echo", "B")).unwrap();
        assert_eq!(index.resolve("a_echo"), Some(("A", "echo")));
        assert_eq!(index.resolve("b_echo"), Some(("B", "echo")));
        assert_eq!(index.resolve("c_echo"), None);
    }

    #[test]
    fn list_is_stable_insertion_order() {
        let mut index = FederationIndex::new();
        index.insert(entry("a_echo", "echo", "A")).unwrap();
        index.insert(entry("a_sum", "sum", "A")).unwrap();
        let names: Vec<&str> = index.list().iter().map(|e| e.exposed_name.as_str()).collect();
        assert_eq!(names, vec!["a_echo", "a_sum"]);
    }

    #[test]
    fn purge_server_removes_only_its_tools() {
        let mut index = FederationIndex::new();
        index.insert(entry("a_echo", "echo", "A")).unwrap();
        index.insert(entry("b_echo", "echo", "B")).unwrap();
        index.purge_server("A");
        assert_eq!(index.len(), 1);
        assert_eq!(index.resolve("a_echo"), None);
        assert_eq!(index.resolve("b_echo"), Some(("B", "echo")));
    }
}
