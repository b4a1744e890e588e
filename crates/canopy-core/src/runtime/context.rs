//! The view of the scheduler handed to activity behaviors.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use canopy_types::activity::{ActivityInstanceId, Environment};
use canopy_types::bookmark::{BookmarkInfo, BookmarkScope};
use canopy_types::error::{EngineError, ExtensionRequiredError, ValidationError};
use serde_json::Value;
use uuid::Uuid;

use super::bookmark::BookmarkCallback;
use super::scheduler::Scheduler;
use crate::activity::Activity;
use crate::extension::ExtensionType;

/// How a bookmark should be registered.
#[derive(Clone, Default)]
pub struct BookmarkOptions {
    pub(crate) scope: Option<BookmarkScope>,
    pub(crate) suppress_persistable_idle: bool,
    pub(crate) callback: Option<BookmarkCallback>,
}

impl BookmarkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: impl Into<BookmarkScope>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Withhold persistable idle for as long as this bookmark is outstanding.
    pub fn suppress_persistable_idle(mut self, suppress: bool) -> Self {
        self.suppress_persistable_idle = suppress;
        self
    }

    /// Resume into `callback` instead of the owner's `on_resumed`.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&mut ActivityContext<'_>, &BookmarkInfo, Value) -> Result<(), EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for BookmarkOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookmarkOptions")
            .field("scope", &self.scope)
            .field("suppress_persistable_idle", &self.suppress_persistable_idle)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Execution context of one activity instance during one dispatch.
///
/// Scheduling, completion and cancellation requests made here only enqueue
/// work items; nothing runs until the current dispatch returns.
pub struct ActivityContext<'a> {
    scheduler: &'a mut Scheduler,
    instance: ActivityInstanceId,
    activity: Arc<Activity>,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(
        scheduler: &'a mut Scheduler,
        instance: ActivityInstanceId,
        activity: Arc<Activity>,
    ) -> Self {
        Self {
            scheduler,
            instance,
            activity,
        }
    }

    pub fn instance_id(&self) -> ActivityInstanceId {
        self.instance
    }

    pub fn workflow_instance_id(&self) -> Uuid {
        self.scheduler.instance_id()
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    pub fn display_name(&self) -> &str {
        self.activity.display_name()
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    /// Schedule a new child instance of `child` under this activity.
    pub fn schedule_child(
        &mut self,
        child: &Arc<Activity>,
        arguments: Environment,
    ) -> Result<ActivityInstanceId, EngineError> {
        self.scheduler
            .schedule(self.instance, child.clone(), arguments)
    }

    /// Children this activity has not yet recorded, open or closed.
    pub fn children(&self) -> Vec<ActivityInstanceId> {
        self.scheduler
            .tree
            .get(self.instance)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn has_children(&self) -> bool {
        self.scheduler
            .tree
            .get(self.instance)
            .is_some_and(|node| !node.children.is_empty())
    }

    pub fn open_children(&self) -> Vec<ActivityInstanceId> {
        self.scheduler.tree.open_children(self.instance)
    }

    pub fn has_open_children(&self) -> bool {
        self.scheduler.tree.has_open_children(self.instance)
    }

    pub fn cancel_child(&mut self, child: ActivityInstanceId) -> Result<(), EngineError> {
        let is_own = self
            .scheduler
            .tree
            .get(child)
            .is_some_and(|node| node.parent == Some(self.instance));
        if !is_own {
            return Err(EngineError::InvalidState(format!(
                "{child} is not a child of '{}'",
                self.display_name()
            )));
        }
        self.scheduler.request_cancel(child);
        Ok(())
    }

    pub fn cancel_children(&mut self) {
        for child in self.open_children() {
            self.scheduler.request_cancel(child);
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Close this activity. Fails with `InvariantViolation`, which aborts the
    /// whole workflow instance, if any child is still open.
    pub fn complete(&mut self, result: Option<Value>) -> Result<(), EngineError> {
        self.scheduler.complete(self.instance, result)
    }

    // -----------------------------------------------------------------------
    // Bookmarks
    // -----------------------------------------------------------------------

    pub fn create_bookmark(
        &mut self,
        name: impl Into<String>,
        options: BookmarkOptions,
    ) -> Result<BookmarkInfo, EngineError> {
        let BookmarkOptions {
            scope,
            suppress_persistable_idle,
            callback,
        } = options;
        self.scheduler.create_bookmark(
            self.instance,
            name.into(),
            scope,
            suppress_persistable_idle,
            callback,
        )
    }

    /// Create a bookmark that resumes itself with `null` after `after`.
    pub fn create_timer(
        &mut self,
        after: Duration,
        options: BookmarkOptions,
    ) -> Result<BookmarkInfo, EngineError> {
        self.scheduler.create_timer(self.instance, after, options)
    }

    /// Withdraw a bookmark this activity created. Returns false if it does
    /// not exist or belongs to another activity.
    pub fn remove_bookmark(&mut self, name: &str, scope: Option<&BookmarkScope>) -> bool {
        self.scheduler.remove_bookmark(self.instance, name, scope)
    }

    // -----------------------------------------------------------------------
    // Extensions
    // -----------------------------------------------------------------------

    pub fn get_extension<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.scheduler.extensions.get::<T>()
    }

    /// Like [`get_extension`](Self::get_extension) but fails the same way
    /// pre-start validation would when nothing provides `T`.
    pub fn require_extension<T: Any + Send + Sync>(&mut self) -> Result<Arc<T>, EngineError> {
        self.get_extension::<T>().ok_or_else(|| {
            EngineError::Validation(ValidationError {
                errors: vec![ExtensionRequiredError {
                    type_name: ExtensionType::of::<T>().type_name().to_string(),
                    activity: self.display_name().to_string(),
                }],
            })
        })
    }

    // -----------------------------------------------------------------------
    // Data
    // -----------------------------------------------------------------------

    /// Value of an argument declared by this activity.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.activity.argument(name)?;
        self.scheduler
            .tree
            .get(self.instance)
            .and_then(|node| node.environment.get(name))
    }

    pub fn set_argument(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        let Some(decl) = self.activity.argument(name) else {
            return Err(EngineError::InvalidArgument {
                name: name.to_string(),
                reason: format!("not declared by '{}'", self.display_name()),
            });
        };
        if !value.is_null() && !decl.kind.matches(&value) {
            return Err(EngineError::InvalidArgument {
                name: name.to_string(),
                reason: format!("expected {}, got {value}", decl.kind),
            });
        }
        if let Some(node) = self.scheduler.tree.get_mut(self.instance) {
            node.environment.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Resolve a variable or argument through the enclosing scopes.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.scheduler.tree.lookup(self.instance, name)
    }

    /// Assign to the nearest enclosing scope that declares `name`.
    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        self.scheduler.tree.assign(self.instance, name, value)
    }

    /// Behavior-private state of this activity instance.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.scheduler
            .tree
            .get(self.instance)
            .and_then(|node| node.properties.get(key))
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        if let Some(node) = self.scheduler.tree.get_mut(self.instance) {
            node.properties.insert(key.into(), value);
        }
    }
}
