// ── Ordered tunnel registry ──
//
// Name-keyed collection with deterministic iteration order and push-based
// change notification. Owned and mutated exclusively by the manager's
// service task; readers consume immutable ordered snapshots, so lookups
// during iteration never contend with mutation.

use std::cmp::Ordering;
use std::sync::Arc;

use tokio::sync::watch;

use crate::model::Tunnel;

/// An ordered snapshot of the tunnel collection.
pub type TunnelList = Arc<Vec<Arc<Tunnel>>>;

/// Iteration order: case-insensitive comparison first, case-sensitive
/// tie-break second. Only byte-identical names compare equal.
pub(crate) fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_ascii_lowercase()
        .cmp(&b.to_ascii_lowercase())
        .then_with(|| a.cmp(b))
}

/// Name-ordered tunnel collection.
///
/// Invariant: at most one entry per name, where uniqueness is
/// case-insensitive. The manager validates before inserting; the registry
/// keeps the entries sorted and republishes the snapshot on every
/// mutation.
pub(crate) struct TunnelRegistry {
    entries: Vec<Arc<Tunnel>>,
    snapshot: watch::Sender<TunnelList>,
}

impl TunnelRegistry {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            entries: Vec::new(),
            snapshot,
        }
    }

    /// Insert a tunnel at its sorted position and republish.
    ///
    /// The caller has already established that no entry with a
    /// case-insensitively equal name exists.
    pub(crate) fn insert(&mut self, tunnel: Arc<Tunnel>) {
        let name = tunnel.name();
        let position = match self
            .entries
            .binary_search_by(|entry| compare_names(&entry.name(), &name))
        {
            Ok(position) | Err(position) => position,
        };
        self.entries.insert(position, tunnel);
        self.publish();
    }

    /// Remove a tunnel by identity. Remaining order is untouched.
    /// Returns `true` if the tunnel was present.
    pub(crate) fn remove(&mut self, tunnel: &Arc<Tunnel>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| !Arc::ptr_eq(entry, tunnel));
        let removed = self.entries.len() != before;
        if removed {
            self.publish();
        }
        removed
    }

    /// Case-insensitive lookup by name.
    pub(crate) fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        let needle = name.to_ascii_lowercase();
        self.entries
            .binary_search_by(|entry| entry.name().to_ascii_lowercase().cmp(&needle))
            .ok()
            .map(|position| Arc::clone(&self.entries[position]))
    }

    pub(crate) fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Entries in iteration order, for the service task's own passes.
    pub(crate) fn entries(&self) -> &[Arc<Tunnel>] {
        &self.entries
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TunnelList> {
        self.snapshot.subscribe()
    }

    /// Rebuild the ordered snapshot and broadcast to subscribers.
    fn publish(&self) {
        let entries = Arc::new(self.entries.clone());
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snapshot| *snapshot = entries);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TunnelState;

    fn tunnel(name: &str) -> Arc<Tunnel> {
        Arc::new(Tunnel::new(name.into(), None, TunnelState::Down))
    }

    fn names(registry: &TunnelRegistry) -> Vec<String> {
        registry.entries().iter().map(|t| t.name()).collect()
    }

    #[test]
    fn insert_keeps_case_insensitive_order() {
        let mut registry = TunnelRegistry::new();
        for name in ["office", "Berlin", "azure", "Zoo"] {
            registry.insert(tunnel(name));
        }
        assert_eq!(names(&registry), ["azure", "Berlin", "office", "Zoo"]);
    }

    #[test]
    fn compare_names_breaks_ties_case_sensitively() {
        assert_eq!(compare_names("Foo", "foo"), Ordering::Less);
        assert_eq!(compare_names("foo", "foo"), Ordering::Equal);
        assert_eq!(compare_names("bar", "Foo"), Ordering::Less);
    }

    #[test]
    fn get_is_case_insensitive() {
        let mut registry = TunnelRegistry::new();
        registry.insert(tunnel("Office"));

        assert!(registry.get("office").is_some());
        assert!(registry.get("OFFICE").is_some());
        assert!(registry.get("offic").is_none());
        assert!(registry.contains_key("oFFice"));
    }

    #[test]
    fn remove_is_by_identity_and_preserves_order() {
        let mut registry = TunnelRegistry::new();
        let a = tunnel("alpha");
        let b = tunnel("bravo");
        let c = tunnel("charlie");
        for t in [&a, &b, &c] {
            registry.insert(Arc::clone(t));
        }

        assert!(registry.remove(&b));
        assert_eq!(names(&registry), ["alpha", "charlie"]);

        // A fresh entity with the same name is not the same identity.
        assert!(!registry.remove(&tunnel("alpha")));
        assert_eq!(names(&registry), ["alpha", "charlie"]);
    }

    #[test]
    fn mutations_publish_snapshots() {
        let mut registry = TunnelRegistry::new();
        let snapshots = crate::stream::ValueStream::new(registry.subscribe());

        registry.insert(tunnel("wg0"));
        assert!(snapshots.has_changed());
        assert_eq!(snapshots.latest().len(), 1);

        let entry = registry.get("wg0").unwrap();
        registry.remove(&entry);
        assert!(snapshots.latest().is_empty());
    }
}
