//! Bookmark table of one workflow instance.
//!
//! Maps `(name, scope)` to the activity instance that suspended on it.
//! Resumption is consuming: `take` removes the entry, so a second resume of
//! the same name fails exactly like a resume of a name that never existed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use canopy_types::activity::ActivityInstanceId;
use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
use canopy_types::error::{BookmarkError, EngineError};
use serde_json::Value;

use super::context::ActivityContext;

/// Per-bookmark resumption callback. Bookmarks without one resume into the
/// owner's `on_resumed`.
pub type BookmarkCallback = Arc<
    dyn Fn(&mut ActivityContext<'_>, &BookmarkInfo, Value) -> Result<(), EngineError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookmarkKey {
    pub name: String,
    pub scope: Option<BookmarkScope>,
}

impl BookmarkKey {
    pub fn new(name: impl Into<String>, scope: Option<BookmarkScope>) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }
}

impl fmt::Display for BookmarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}@{}", self.name, scope),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Clone)]
pub(crate) struct BookmarkEntry {
    pub key: BookmarkKey,
    pub owner: ActivityInstanceId,
    pub owner_display_name: String,
    pub suppresses_persistable_idle: bool,
    pub callback: Option<BookmarkCallback>,
    sequence: u64,
}

impl BookmarkEntry {
    pub fn new(
        key: BookmarkKey,
        owner: ActivityInstanceId,
        owner_display_name: impl Into<String>,
        suppresses_persistable_idle: bool,
        callback: Option<BookmarkCallback>,
    ) -> Self {
        Self {
            key,
            owner,
            owner_display_name: owner_display_name.into(),
            suppresses_persistable_idle,
            callback,
            sequence: 0,
        }
    }

    pub fn info(&self) -> BookmarkInfo {
        BookmarkInfo {
            name: self.key.name.clone(),
            scope: self.key.scope.clone(),
            owner: self.owner,
            owner_display_name: self.owner_display_name.clone(),
            suppresses_persistable_idle: self.suppresses_persistable_idle,
        }
    }
}

impl fmt::Debug for BookmarkEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BookmarkEntry")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("suppresses_persistable_idle", &self.suppresses_persistable_idle)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct BookmarkTable {
    entries: HashMap<BookmarkKey, BookmarkEntry>,
    next_sequence: u64,
}

impl BookmarkTable {
    pub fn insert(&mut self, mut entry: BookmarkEntry) -> Result<(), BookmarkError> {
        if self.entries.contains_key(&entry.key) {
            return Err(BookmarkError::Duplicate {
                name: entry.key.name,
                scope: entry.key.scope,
            });
        }
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Remove and return the entry for a resumption.
    pub fn take(
        &mut self,
        name: &str,
        scope: Option<&BookmarkScope>,
    ) -> Result<BookmarkEntry, BookmarkError> {
        let key = BookmarkKey::new(name, scope.cloned());
        self.entries
            .remove(&key)
            .ok_or(BookmarkError::NotFound {
                name: key.name,
                scope: key.scope,
            })
    }

    pub fn take_key(&mut self, key: &BookmarkKey) -> Option<BookmarkEntry> {
        self.entries.remove(key)
    }

    pub fn owner_of(&self, key: &BookmarkKey) -> Option<ActivityInstanceId> {
        self.entries.get(key).map(|e| e.owner)
    }

    /// Remove every bookmark owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: ActivityInstanceId) -> Vec<BookmarkEntry> {
        let keys: Vec<BookmarkKey> = self
            .entries
            .values()
            .filter(|e| e.owner == owner)
            .map(|e| e.key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .collect()
    }

    pub fn count_owned_by(&self, owner: ActivityInstanceId) -> usize {
        self.entries.values().filter(|e| e.owner == owner).count()
    }

    /// Number of outstanding bookmarks that withhold persistable idle.
    pub fn suppressing_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.suppresses_persistable_idle)
            .count()
    }

    /// Outstanding bookmarks in creation order.
    pub fn infos(&self) -> Vec<BookmarkInfo> {
        let mut entries: Vec<&BookmarkEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries.into_iter().map(BookmarkEntry::info).collect()
    }

    pub fn drain_all(&mut self) -> Vec<BookmarkEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, scope: Option<&str>, owner: u64, suppress: bool) -> BookmarkEntry {
        BookmarkEntry::new(
            BookmarkKey::new(name, scope.map(BookmarkScope::from)),
            ActivityInstanceId(owner),
            format!("owner-{owner}"),
            suppress,
            None,
        )
    }

    #[test]
    fn duplicate_name_in_same_scope_is_rejected() {
        let mut table = BookmarkTable::default();
        table.insert(entry("approve", None, 1, false)).unwrap();
        let err = table.insert(entry("approve", None, 2, false)).unwrap_err();
        assert!(matches!(
            err,
            BookmarkError::Duplicate { ref name, scope: None } if name == "approve"
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn scopes_partition_the_namespace() {
        let mut table = BookmarkTable::default();
        table.insert(entry("approve", Some("left"), 1, false)).unwrap();
        table.insert(entry("approve", Some("right"), 2, false)).unwrap();
        table.insert(entry("approve", None, 3, false)).unwrap();
        assert_eq!(table.len(), 3);

        let right = table.take("approve", Some(&BookmarkScope::from("right"))).unwrap();
        assert_eq!(right.owner, ActivityInstanceId(2));
    }

    #[test]
    fn take_is_consuming() {
        let mut table = BookmarkTable::default();
        table.insert(entry("approve", None, 1, false)).unwrap();

        assert!(table.take("approve", None).is_ok());
        let err = table.take("approve", None).unwrap_err();
        assert!(matches!(err, BookmarkError::NotFound { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_name_is_not_found() {
        let mut table = BookmarkTable::default();
        table.insert(entry("approve", Some("left"), 1, false)).unwrap();
        assert!(table.take("approve", None).is_err());
        assert!(table.take("reject", Some(&BookmarkScope::from("left"))).is_err());
    }

    #[test]
    fn remove_owned_by_only_touches_that_owner() {
        let mut table = BookmarkTable::default();
        table.insert(entry("a", None, 1, false)).unwrap();
        table.insert(entry("b", None, 1, true)).unwrap();
        table.insert(entry("c", None, 2, false)).unwrap();

        assert_eq!(table.count_owned_by(ActivityInstanceId(1)), 2);
        let removed = table.remove_owned_by(ActivityInstanceId(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.suppressing_count(), 0);
    }

    #[test]
    fn infos_are_in_creation_order() {
        let mut table = BookmarkTable::default();
        for name in ["first", "second", "third"] {
            table.insert(entry(name, None, 1, name == "second")).unwrap();
        }
        let names: Vec<String> = table.infos().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert_eq!(table.suppressing_count(), 1);
    }
}
