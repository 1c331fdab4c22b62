//! Per-collection bookkeeping kept by the persistence context.

use orm_core::{CollectionHandle, Element, EntityHandle, Error, Result, Value};
use std::fmt;

/// What the session knows about one collection.
///
/// The *loaded* role and key describe the rows currently in the database;
/// the *current* role and key are recomputed by every flush from the owner
/// that references the collection. A difference between the two means the
/// collection was moved, dereferenced or is new.
#[derive(Clone)]
pub struct CollectionEntry {
    owner: Option<EntityHandle>,
    loaded_role: Option<String>,
    loaded_key: Option<Value>,
    current_role: Option<String>,
    current_key: Option<Value>,
    snapshot: Option<Vec<Element>>,
    reached: bool,
    processed: bool,
    do_update: bool,
    do_remove: bool,
    do_recreate: bool,
    ignore: bool,
}

impl CollectionEntry {
    fn blank(owner: Option<EntityHandle>) -> Self {
        Self {
            owner,
            loaded_role: None,
            loaded_key: None,
            current_role: None,
            current_key: None,
            snapshot: None,
            reached: false,
            processed: false,
            do_update: false,
            do_remove: false,
            do_recreate: false,
            ignore: false,
        }
    }

    /// Entry for a collection that has never been written.
    pub(crate) fn new_unloaded(owner: &EntityHandle) -> Self {
        Self::blank(Some(owner.clone()))
    }

    /// Entry for a collection whose rows exist under `key`.
    pub(crate) fn loaded(
        owner: Option<&EntityHandle>,
        role: &str,
        key: Value,
        snapshot: Option<Vec<Element>>,
    ) -> Self {
        Self {
            loaded_role: Some(role.to_string()),
            loaded_key: Some(key),
            snapshot,
            ..Self::blank(owner.cloned())
        }
    }

    /// Owning instance, when known.
    pub fn owner(&self) -> Option<&EntityHandle> {
        self.owner.as_ref()
    }

    /// Role of the rows in the database.
    pub fn loaded_role(&self) -> Option<&str> {
        self.loaded_role.as_deref()
    }

    /// Owner key of the rows in the database.
    pub fn loaded_key(&self) -> Option<&Value> {
        self.loaded_key.as_ref()
    }

    /// Role as of the current flush.
    pub fn current_role(&self) -> Option<&str> {
        self.current_role.as_deref()
    }

    /// Owner key as of the current flush.
    pub fn current_key(&self) -> Option<&Value> {
        self.current_key.as_ref()
    }

    /// Elements as of the last load or flush.
    pub fn snapshot(&self) -> Option<&[Element]> {
        self.snapshot.as_deref()
    }

    /// Was the snapshot empty (or absent)?
    pub fn is_snapshot_empty(&self) -> bool {
        self.snapshot.as_ref().is_none_or(Vec::is_empty)
    }

    /// Was the collection reached from an owner during this flush?
    pub fn is_reached(&self) -> bool {
        self.reached
    }

    /// Scheduled for an element diff.
    pub fn is_do_update(&self) -> bool {
        self.do_update
    }

    /// Scheduled for removal of its rows.
    pub fn is_do_remove(&self) -> bool {
        self.do_remove
    }

    /// Scheduled for a full write.
    pub fn is_do_recreate(&self) -> bool {
        self.do_recreate
    }

    pub(crate) fn set_owner(&mut self, owner: &EntityHandle) {
        self.owner = Some(owner.clone());
    }

    pub(crate) fn set_ignore(&mut self) {
        self.ignore = true;
    }

    pub(crate) fn is_ignore(&self) -> bool {
        self.ignore
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Option<Vec<Element>>) {
        self.snapshot = snapshot;
    }

    /// Does the collection differ from its snapshot?
    pub fn is_dirty(&self, collection: &CollectionHandle) -> bool {
        if collection.is_dirty() {
            return true;
        }
        if !collection.is_initialized() {
            return false;
        }
        match &self.snapshot {
            Some(snapshot) => !same_elements(snapshot, &collection.loaded_elements()),
            None => false,
        }
    }

    /// Reset per-flush flags and fold snapshot differences into the
    /// collection's dirty flag.
    pub(crate) fn pre_flush(&mut self, collection: &CollectionHandle, mutable: bool) -> Result<()> {
        if self.loaded_key.is_none() && !collection.key().is_null() && self.loaded_role.is_some() {
            self.loaded_key = Some(collection.key());
        }
        let dirty = self.is_dirty(collection);
        if dirty && self.loaded_role.is_some() && !mutable {
            return Err(Error::Usage(format!(
                "changed an immutable collection instance: {}",
                collection.role()
            )));
        }
        if dirty {
            collection.mark_dirty();
        }
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;
        self.reached = false;
        self.processed = false;
        Ok(())
    }

    /// Record that an owner references the collection in this flush.
    pub(crate) fn reach(&mut self, role: &str, key: Value) -> Result<()> {
        if self.reached {
            return Err(Error::Usage(format!(
                "found shared references to a collection: {role}"
            )));
        }
        self.reached = true;
        self.current_role = Some(role.to_string());
        self.current_key = Some(key);
        Ok(())
    }

    /// Record that no owner references the collection any more.
    pub(crate) fn dereference(&mut self) {
        self.current_role = None;
        self.current_key = None;
    }

    /// Decide the work a flush must do for this collection.
    pub(crate) fn prepare_for_update(&mut self, collection: &CollectionHandle) -> Result<()> {
        if self.processed {
            return Err(Error::AssertionFailure(format!(
                "collection was processed twice by flush: {}",
                collection.role()
            )));
        }
        self.processed = true;
        if self.loaded_role.is_none() && self.current_role.is_none() {
            return Ok(());
        }
        let key_changed = self.current_role.is_some()
            && match (&self.loaded_key, &self.current_key) {
                (Some(loaded), Some(current)) => {
                    !loaded.is_generated_placeholder() && !loaded.same_identifier(current)
                }
                _ => false,
            };
        let owner_changed = self.loaded_role != self.current_role || key_changed;
        if owner_changed {
            if self.current_role.is_some() {
                self.do_recreate = true;
            }
            if self.loaded_role.is_some() {
                self.do_remove = true;
            }
        } else if collection.is_dirty() {
            self.do_update = true;
        }
        Ok(())
    }

    /// Record that a scheduled action was written under `key`.
    pub(crate) fn after_action(&mut self, collection: &CollectionHandle, key: Option<Value>) {
        self.loaded_key = key;
        self.loaded_role.clone_from(&self.current_role);
        if self.loaded_key.is_none() {
            self.loaded_role = None;
        }
        self.snapshot = if collection.is_initialized() && self.loaded_role.is_some() {
            Some(collection.loaded_elements())
        } else {
            None
        };
        collection.clear_dirty();
    }

    /// End-of-flush check. Every reachable collection must have been processed.
    pub(crate) fn post_flush(&mut self, collection: &CollectionHandle) -> Result<()> {
        if self.ignore {
            self.ignore = false;
        } else if !self.processed {
            return Err(Error::AssertionFailure(format!(
                "collection was not processed by flush: {}",
                collection.role()
            )));
        }
        if let Some(key) = &self.loaded_key {
            collection.set_snapshot(key.clone(), self.snapshot.clone());
        }
        Ok(())
    }

    /// Install freshly loaded elements as the snapshot.
    pub(crate) fn post_initialize(&mut self, collection: &CollectionHandle) {
        self.snapshot = Some(collection.loaded_elements());
    }
}

/// Multiset comparison of two element lists.
pub(crate) fn same_elements(a: &[Element], b: &[Element]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut remaining: Vec<&Element> = b.iter().collect();
    for element in a {
        match remaining.iter().position(|e| e.same_as(element)) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => return false,
        }
    }
    true
}

/// Elements of `current` not present in `previous` (multiset difference).
pub(crate) fn added_elements(previous: &[Element], current: &[Element]) -> Vec<Element> {
    let mut remaining: Vec<&Element> = previous.iter().collect();
    let mut added = Vec::new();
    for element in current {
        match remaining.iter().position(|e| e.same_as(element)) {
            Some(index) => {
                remaining.swap_remove(index);
            }
            None => added.push(element.clone()),
        }
    }
    added
}

impl fmt::Debug for CollectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionEntry")
            .field("loaded_role", &self.loaded_role)
            .field("loaded_key", &self.loaded_key)
            .field("current_role", &self.current_role)
            .field("current_key", &self.current_key)
            .field("reached", &self.reached)
            .field("do_update", &self.do_update)
            .field("do_remove", &self.do_remove)
            .field("do_recreate", &self.do_recreate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> CollectionHandle {
        CollectionHandle::with_elements(
            "Team.tags",
            vec![Element::Value(Value::from("a")), Element::Value(Value::from("b"))],
        )
    }

    #[test]
    fn test_new_collection_is_recreated() {
        let coll = tags();
        let mut entry = CollectionEntry::blank(None);
        entry.pre_flush(&coll, true).unwrap();
        entry.reach("Team.tags", Value::BigInt(1)).unwrap();
        entry.prepare_for_update(&coll).unwrap();
        assert!(entry.is_do_recreate());
        assert!(!entry.is_do_remove());
        assert!(!entry.is_do_update());
    }

    #[test]
    fn test_mutated_collection_is_updated() {
        let coll = tags();
        let mut entry =
            CollectionEntry::loaded(None, "Team.tags", Value::BigInt(1), Some(coll.loaded_elements()));
        coll.add(Value::from("c")).unwrap();
        entry.pre_flush(&coll, true).unwrap();
        entry.reach("Team.tags", Value::BigInt(1)).unwrap();
        entry.prepare_for_update(&coll).unwrap();
        assert!(entry.is_do_update());
        assert!(!entry.is_do_recreate());
    }

    #[test]
    fn test_snapshot_difference_marks_dirty() {
        let coll = tags();
        let mut entry = CollectionEntry::loaded(
            None,
            "Team.tags",
            Value::BigInt(1),
            Some(vec![Element::Value(Value::from("a"))]),
        );
        assert!(!coll.is_dirty());
        entry.pre_flush(&coll, true).unwrap();
        assert!(coll.is_dirty());
    }

    #[test]
    fn test_dereferenced_collection_is_removed() {
        let coll = tags();
        let mut entry =
            CollectionEntry::loaded(None, "Team.tags", Value::BigInt(1), Some(coll.loaded_elements()));
        entry.pre_flush(&coll, true).unwrap();
        entry.dereference();
        entry.prepare_for_update(&coll).unwrap();
        assert!(entry.is_do_remove());
        assert!(!entry.is_do_recreate());

        entry.after_action(&coll, None);
        assert!(entry.loaded_role().is_none());
        assert!(entry.snapshot().is_none());
    }

    #[test]
    fn test_shared_reference_rejected() {
        let coll = tags();
        let mut entry = CollectionEntry::blank(None);
        entry.pre_flush(&coll, true).unwrap();
        entry.reach("Team.tags", Value::BigInt(1)).unwrap();
        let err = entry.reach("Team.tags", Value::BigInt(2)).unwrap_err();
        assert!(err.to_string().contains("shared references"));
    }

    #[test]
    fn test_immutable_collection_change_rejected() {
        let coll = tags();
        let mut entry =
            CollectionEntry::loaded(None, "Team.tags", Value::BigInt(1), Some(coll.loaded_elements()));
        coll.add(Value::from("c")).unwrap();
        assert!(entry.pre_flush(&coll, false).is_err());
    }

    #[test]
    fn test_placeholder_key_is_not_a_move() {
        let coll = tags();
        let mut entry = CollectionEntry::loaded(
            None,
            "Team.tags",
            Value::Generated(1),
            Some(coll.loaded_elements()),
        );
        entry.pre_flush(&coll, true).unwrap();
        entry.reach("Team.tags", Value::BigInt(7)).unwrap();
        entry.prepare_for_update(&coll).unwrap();
        assert!(!entry.is_do_recreate());
        assert!(!entry.is_do_remove());
    }

    #[test]
    fn test_element_diffs() {
        let a = Element::Value(Value::from("a"));
        let b = Element::Value(Value::from("b"));
        let c = Element::Value(Value::from("c"));
        assert!(same_elements(&[a.clone(), b.clone()], &[b.clone(), a.clone()]));
        assert!(!same_elements(&[a.clone(), a.clone()], &[a.clone(), b.clone()]));
        let added = added_elements(&[a.clone(), b.clone()], &[b, c.clone(), a]);
        assert_eq!(added, vec![c]);
    }
}
