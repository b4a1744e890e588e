//! Bookmark scope and the public description of an outstanding bookmark.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activity::ActivityInstanceId;

/// Partitions the bookmark namespace of one workflow instance.
///
/// A bookmark without a scope is unique across the whole instance; scoped
/// bookmarks only need to be unique within their scope, so sibling branches
/// can reuse names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkScope(String);

impl BookmarkScope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookmarkScope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BookmarkScope {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Snapshot of one outstanding bookmark, as reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<BookmarkScope>,
    /// Activity instance that resumes when the bookmark does.
    pub owner: ActivityInstanceId,
    pub owner_display_name: String,
    /// Whether this bookmark withholds the persistable-idle signal while
    /// it is outstanding.
    #[serde(default)]
    pub suppresses_persistable_idle: bool,
}
