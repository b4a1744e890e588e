//! Blocks until the host resumes a named bookmark.

use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
use canopy_types::error::EngineError;
use serde_json::Value;

use super::ActivityBehavior;
use crate::runtime::context::{ActivityContext, BookmarkOptions};

/// Creates a bookmark on entry and completes with the value it is resumed
/// with, optionally storing that value in a variable or argument in scope.
#[derive(Debug, Clone)]
pub struct WaitForBookmark {
    bookmark: String,
    scope: Option<BookmarkScope>,
    assign_to: Option<String>,
}

impl WaitForBookmark {
    pub fn new(bookmark: impl Into<String>) -> Self {
        Self {
            bookmark: bookmark.into(),
            scope: None,
            assign_to: None,
        }
    }

    pub fn in_scope(mut self, scope: impl Into<BookmarkScope>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Write the resumed value to `target` before completing.
    pub fn assign_to(mut self, target: impl Into<String>) -> Self {
        self.assign_to = Some(target.into());
        self
    }
}

impl ActivityBehavior for WaitForBookmark {
    fn kind(&self) -> &'static str {
        "wait_for_bookmark"
    }

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        let mut options = BookmarkOptions::new();
        if let Some(scope) = &self.scope {
            options = options.scope(scope.clone());
        }
        ctx.create_bookmark(self.bookmark.clone(), options)?;
        Ok(())
    }

    fn on_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _bookmark: &BookmarkInfo,
        value: Value,
    ) -> Result<(), EngineError> {
        if let Some(target) = &self.assign_to {
            ctx.set_variable(target, value.clone())?;
        }
        ctx.complete(Some(value))
    }
}
