//! Keyed in-memory mirror with atomically swapped snapshots.
//!
//! Readers call [`Mirror::snapshot`] and get an immutable map they can
//! iterate at leisure; the watch task publishes changes by swapping in a
//! new map. No mutation is ever visible half-applied, and a full relist
//! replaces the whole map so stale entries cannot outlive the listing
//! they came from.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use specular_core::ResourceKey;

/// Immutable view of a mirror at one point in time.
pub type Snapshot<K> = Arc<FxHashMap<ResourceKey, Arc<K>>>;

pub struct Mirror<K> {
    map: ArcSwap<FxHashMap<ResourceKey, Arc<K>>>,
}

impl<K> Default for Mirror<K> {
    fn default() -> Self {
        Self {
            map: ArcSwap::from_pointee(FxHashMap::default()),
        }
    }
}

impl<K> Mirror<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot<K> {
        self.map.load_full()
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.map.load().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    /// Replace the whole mirror with a keyed listing result.
    pub fn replace(&self, entries: impl IntoIterator<Item = (ResourceKey, K)>) {
        let next: FxHashMap<_, _> = entries
            .into_iter()
            .map(|(key, value)| (key, Arc::new(value)))
            .collect();
        self.map.store(Arc::new(next));
    }

    /// Add or overwrite one entry (ADDED/MODIFIED watch events).
    pub fn upsert(&self, key: ResourceKey, value: K) {
        let mut next = (*self.map.load_full()).clone();
        next.insert(key, Arc::new(value));
        self.map.store(Arc::new(next));
    }

    /// Remove one entry (DELETED watch events). Removing an absent key is
    /// a no-op: a relist may already have dropped it.
    pub fn remove(&self, key: &str) -> bool {
        if !self.map.load().contains_key(key) {
            return false;
        }
        let mut next = (*self.map.load_full()).clone();
        let removed = next.remove(key).is_some();
        self.map.store(Arc::new(next));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[&str]) -> Vec<(ResourceKey, String)> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("body-{n}")))
            .collect()
    }

    #[test]
    fn upsert_keeps_latest_value_per_key() {
        let mirror = Mirror::new();
        mirror.upsert("p1".into(), "v1".to_string());
        mirror.upsert("p2".into(), "v1".to_string());
        mirror.upsert("p1".into(), "v2".to_string());
        assert_eq!(mirror.len(), 2);
        assert_eq!(*mirror.get("p1").unwrap(), "v2");
    }

    #[test]
    fn remove_missing_key_is_noop() {
        let mirror: Mirror<String> = Mirror::new();
        mirror.upsert("p1".into(), "v1".to_string());
        assert!(!mirror.remove("ghost"));
        assert!(mirror.remove("p1"));
        assert!(!mirror.remove("p1"));
        assert!(mirror.is_empty());
    }

    #[test]
    fn replace_supersedes_all_prior_entries() {
        let mirror = Mirror::new();
        mirror.replace(listing(&["a", "b", "c"]));
        mirror.upsert("d".into(), "body-d".to_string());
        mirror.replace(listing(&["b", "e"]));
        let snap = mirror.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.contains_key("b"));
        assert!(snap.contains_key("e"));
        assert!(!snap.contains_key("a"));
        assert!(!snap.contains_key("d"));
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let mirror = Mirror::new();
        mirror.replace(listing(&["a"]));
        let before = mirror.snapshot();
        mirror.upsert("b".into(), "body-b".to_string());
        mirror.remove("a");
        assert_eq!(before.len(), 1);
        assert!(before.contains_key("a"));
        assert_eq!(mirror.len(), 1);
        assert!(mirror.get("b").is_some());
    }

    #[test]
    fn every_write_publishes_a_new_snapshot() {
        let mirror = Mirror::new();
        mirror.replace(listing(&["a"]));
        let before = mirror.snapshot();
        // Overwriting a key leaves the size unchanged but still swaps the
        // map, so pointer identity works as a change signal.
        mirror.upsert("a".into(), "body-a2".to_string());
        let after = mirror.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.len(), after.len());
        assert!(Arc::ptr_eq(&after, &mirror.snapshot()));
    }

    #[test]
    fn repeated_identical_listings_are_stable() {
        let mirror = Mirror::new();
        mirror.replace(listing(&["a", "b"]));
        let first: Vec<_> = {
            let mut keys: Vec<_> = mirror.snapshot().keys().cloned().collect();
            keys.sort();
            keys
        };
        mirror.replace(listing(&["a", "b"]));
        let second: Vec<_> = {
            let mut keys: Vec<_> = mirror.snapshot().keys().cloned().collect();
            keys.sort();
            keys
        };
        assert_eq!(first, second);
    }
}
