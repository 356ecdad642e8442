//! Indexed local mirror of backend objects
//!
//! One store per object kind. The primary map is keyed by identity; a single
//! secondary index maps the owner tag (SecurityPolicy UID) to the identities
//! it owns. Writers are serialized so the index always moves together with
//! the primary map; readers never block each other.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use netfence_common::model::BackendObject;

/// Thread-safe store of one backend object kind with an owner-tag index
#[derive(Debug)]
pub struct IndexedStore<T: BackendObject> {
    /// Objects: id -> object
    objects: DashMap<String, T>,

    /// Owner index: owner uid -> ids
    owner_index: DashMap<String, BTreeSet<String>>,

    /// Serializes mutations across both maps
    write_lock: Mutex<()>,
}

impl<T: BackendObject> Default for IndexedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: BackendObject> IndexedStore<T> {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            owner_index: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert or replace an object, keeping the owner index in step
    pub fn put(&self, obj: T) {
        let _guard = self.write_lock.lock();

        let id = obj.id().to_string();
        let owner = obj.owner().map(str::to_string);

        // Object first so a reader following the index never finds a dangling id
        let previous = self.objects.insert(id.clone(), obj);

        if let Some(old_owner) = previous.as_ref().and_then(|p| p.owner()) {
            if owner.as_deref() != Some(old_owner) {
                self.unindex(old_owner, &id);
            }
        }

        if let Some(owner) = owner {
            self.owner_index.entry(owner).or_default().insert(id.clone());
        }

        trace!(kind = T::KIND, id = %id, "stored object");
    }

    /// Get an object by identity
    pub fn get(&self, id: &str) -> Option<T> {
        self.objects.get(id).map(|entry| entry.value().clone())
    }

    /// Remove an object by identity; removing an absent id is a no-op
    pub fn delete(&self, id: &str) {
        let _guard = self.write_lock.lock();

        // Index first, mirror image of put
        if let Some(owner) = self
            .objects
            .get(id)
            .and_then(|entry| entry.value().owner().map(str::to_string))
        {
            self.unindex(&owner, id);
        }
        self.objects.remove(id);

        trace!(kind = T::KIND, id = %id, "removed object");
    }

    /// Remove the object if it carries deletion intent, otherwise store it
    pub fn apply(&self, obj: T) {
        if obj.marked_for_delete() {
            self.delete(obj.id());
        } else {
            self.put(obj);
        }
    }

    /// All objects owned by `owner`, ordered by identity
    pub fn list_by_index(&self, owner: &str) -> Vec<T> {
        self.owner_index
            .get(owner)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Every owner value currently present in the index
    pub fn list_index_values(&self) -> BTreeSet<String> {
        self.owner_index
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Caller must hold `write_lock`
    fn unindex(&self, owner: &str, id: &str) {
        if let Some(mut ids) = self.owner_index.get_mut(owner) {
            ids.remove(id);
        }
        self.owner_index.remove_if(owner, |_, ids| ids.is_empty());
    }
}

/// Thread-safe shared reference to a store
pub type SharedStore<T> = Arc<IndexedStore<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use netfence_common::model::{Group, Tag};
    use netfence_common::TAG_SCOPE_SECURITY_POLICY_UID;

    fn group(id: &str, owner: Option<&str>) -> Group {
        Group {
            id: id.to_string(),
            tags: owner
                .map(|o| vec![Tag::new(TAG_SCOPE_SECURITY_POLICY_UID, o)])
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn put_then_get_and_list_by_owner() {
        let store = IndexedStore::new();
        store.put(group("g2", Some("t1")));
        store.put(group("g1", Some("t1")));
        store.put(group("g3", Some("t2")));

        assert_eq!(store.len(), 3);
        assert_eq!(store.get("g1").map(|g| g.id), Some("g1".to_string()));

        let ids: Vec<String> = store.list_by_index("t1").into_iter().map(|g| g.id).collect();
        assert_eq!(ids, vec!["g1", "g2"]);
        assert_eq!(store.list_by_index("t2").len(), 1);
    }

    #[test]
    fn unknown_owner_and_id_are_empty_results() {
        let store: IndexedStore<Group> = IndexedStore::new();
        assert!(store.get("missing").is_none());
        assert!(store.list_by_index("nobody").is_empty());
        assert!(store.is_empty());
        store.delete("missing");
        assert!(store.is_empty());
    }

    #[test]
    fn owner_change_moves_index_entry() {
        let store = IndexedStore::new();
        store.put(group("g1", Some("t1")));
        store.put(group("g1", Some("t2")));

        assert!(store.list_by_index("t1").is_empty());
        assert_eq!(store.list_by_index("t2").len(), 1);
        assert_eq!(
            store.list_index_values(),
            BTreeSet::from(["t2".to_string()])
        );
    }

    #[test]
    fn unowned_objects_are_stored_but_not_indexed() {
        let store = IndexedStore::new();
        store.put(group("g1", None));

        assert_eq!(store.len(), 1);
        assert!(store.list_index_values().is_empty());
    }

    #[test]
    fn delete_drops_index_value_when_last_object_goes() {
        let store = IndexedStore::new();
        store.put(group("g1", Some("t1")));
        store.put(group("g2", Some("t1")));

        store.delete("g1");
        assert_eq!(store.list_index_values().len(), 1);

        store.delete("g2");
        assert!(store.list_index_values().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn apply_removes_objects_marked_for_delete() {
        let store = IndexedStore::new();
        store.apply(group("g1", Some("t1")));
        assert_eq!(store.len(), 1);

        let mut marked = group("g1", Some("t1"));
        marked.marked_for_delete = true;
        store.apply(marked);

        assert!(store.get("g1").is_none());
        assert!(store.list_by_index("t1").is_empty());
    }

    #[test]
    fn concurrent_writers_keep_index_consistent() {
        let store = Arc::new(IndexedStore::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let owner = format!("t{}", i % 2);
                        store.put(group(&format!("g{}-{}", t, i), Some(&owner)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 400);
        let indexed: usize = store
            .list_index_values()
            .iter()
            .map(|o| store.list_by_index(o).len())
            .sum();
        assert_eq!(indexed, 400);
    }
}
