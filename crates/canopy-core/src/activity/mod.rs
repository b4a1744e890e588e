//! Activity definitions: the immutable graph nodes and the behavior trait
//! every activity kind implements.
//!
//! An [`Activity`] is a template. It owns its children, its argument and
//! variable declarations and a shared [`ActivityBehavior`], but never any
//! execution state, so one graph can drive many concurrent instances.

pub mod assign;
pub mod delay;
pub mod invoke;
pub mod parallel;
pub mod sequence;
pub mod wait;

use std::fmt;
use std::sync::Arc;

use canopy_types::activity::{
    ActivityInstanceId, ArgumentDecl, CloseReason, Environment, FaultInfo, VariableDecl,
};
use canopy_types::bookmark::BookmarkInfo;
use canopy_types::error::EngineError;
use serde_json::Value;
use uuid::Uuid;

use crate::extension::metadata::ActivityMetadata;
use crate::runtime::context::ActivityContext;

pub use assign::Assign;
pub use delay::Delay;
pub use invoke::InvokeFn;
pub use parallel::Parallel;
pub use sequence::Sequence;
pub use wait::WaitForBookmark;

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

/// What an activity does when the scheduler dispatches work to it.
///
/// Built-in kinds and host-defined activities implement the same trait.
/// Every method runs inside the instance's single-writer drain loop and may
/// only touch execution state through the supplied [`ActivityContext`].
/// Returning `Err` faults the activity instance.
pub trait ActivityBehavior: Send + Sync + 'static {
    /// Short kind name used in logs ("sequence", "delay", ...).
    fn kind(&self) -> &'static str {
        "custom"
    }

    /// Declare extension requirements and default providers. Called once
    /// per distinct graph, before any instance of it runs.
    fn cache_metadata(&self, _metadata: &mut ActivityMetadata) {}

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError>;

    /// A child closed as completed or canceled. The default completes this
    /// activity once every child has been recorded.
    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _child: &CompletedChild,
    ) -> Result<(), EngineError> {
        if !ctx.has_children() {
            ctx.complete(None)?;
        }
        Ok(())
    }

    /// A child closed as faulted. The default re-raises the fault so it
    /// keeps propagating; returning `Ok` handles it.
    fn on_child_faulted(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _child: &CompletedChild,
        fault: &FaultInfo,
    ) -> Result<(), EngineError> {
        Err(EngineError::Faulted(fault.clone()))
    }

    /// A bookmark owned by this activity was resumed and it carried no
    /// callback of its own. The default completes with the resumed value.
    fn on_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _bookmark: &BookmarkInfo,
        value: Value,
    ) -> Result<(), EngineError> {
        ctx.complete(Some(value))
    }

    /// Cancellation reached this activity. Owned bookmarks and timers are
    /// already gone; open children are canceled after this returns.
    fn on_cancel(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Graph node
// ---------------------------------------------------------------------------

/// An immutable node of an activity graph.
pub struct Activity {
    id: Uuid,
    display_name: String,
    behavior: Arc<dyn ActivityBehavior>,
    children: Vec<Arc<Activity>>,
    arguments: Vec<ArgumentDecl>,
    variables: Vec<VariableDecl>,
}

impl Activity {
    pub fn new(display_name: impl Into<String>, behavior: impl ActivityBehavior) -> Self {
        Self {
            id: Uuid::now_v7(),
            display_name: display_name.into(),
            behavior: Arc::new(behavior),
            children: Vec::new(),
            arguments: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn sequence(
        display_name: impl Into<String>,
        children: impl IntoIterator<Item = Activity>,
    ) -> Self {
        Self::new(display_name, Sequence).with_children(children)
    }

    pub fn parallel(
        display_name: impl Into<String>,
        branches: impl IntoIterator<Item = Activity>,
    ) -> Self {
        Self::new(display_name, Parallel).with_children(branches)
    }

    pub fn delay(display_name: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::new(display_name, Delay::new(duration))
    }

    pub fn wait_for_bookmark(display_name: impl Into<String>, bookmark: impl Into<String>) -> Self {
        Self::new(display_name, WaitForBookmark::new(bookmark))
    }

    pub fn with_child(mut self, child: Activity) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Activity>) -> Self {
        self.children.extend(children.into_iter().map(Arc::new));
        self
    }

    /// Attach an already-shared subgraph.
    pub fn with_shared_child(mut self, child: Arc<Activity>) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_argument(mut self, argument: ArgumentDecl) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_variable(mut self, variable: VariableDecl) -> Self {
        self.variables.push(variable);
        self
    }

    /// Freeze the node so it can be shared across instances.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn behavior(&self) -> &Arc<dyn ActivityBehavior> {
        &self.behavior
    }

    pub fn children(&self) -> &[Arc<Activity>] {
        &self.children
    }

    pub fn arguments(&self) -> &[ArgumentDecl] {
        &self.arguments
    }

    pub fn variables(&self) -> &[VariableDecl] {
        &self.variables
    }

    pub fn argument(&self, name: &str) -> Option<&ArgumentDecl> {
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Visit this node and all descendants in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Activity)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// Build the environment of a new instance of this node from the values
    /// supplied by whoever schedules it.
    pub fn bind_arguments(&self, mut supplied: Environment) -> Result<Environment, EngineError> {
        let mut env = Environment::new();

        for decl in &self.arguments {
            let value = match supplied.remove(&decl.name) {
                Some(_) if !decl.direction.accepts_input() => {
                    return Err(EngineError::InvalidArgument {
                        name: decl.name.clone(),
                        reason: "output arguments cannot be supplied".to_string(),
                    });
                }
                Some(Value::Null) | None if decl.required && decl.direction.accepts_input() => {
                    return Err(EngineError::InvalidArgument {
                        name: decl.name.clone(),
                        reason: format!("required by '{}' but not supplied", self.display_name),
                    });
                }
                Some(Value::Null) | None => decl.default.clone().unwrap_or(Value::Null),
                Some(value) if !decl.kind.matches(&value) => {
                    return Err(EngineError::InvalidArgument {
                        name: decl.name.clone(),
                        reason: format!("expected {}, got {value}", decl.kind),
                    });
                }
                Some(value) => value,
            };
            env.insert(decl.name.clone(), value);
        }

        if let Some(name) = supplied.into_keys().next() {
            return Err(EngineError::InvalidArgument {
                name,
                reason: format!("not declared by '{}'", self.display_name),
            });
        }

        for var in &self.variables {
            env.entry(var.name.clone())
                .or_insert_with(|| var.default.clone());
        }

        Ok(env)
    }

    /// The subset of `env` reported to the parent on completion.
    pub fn collect_outputs(&self, env: &Environment) -> Environment {
        self.arguments
            .iter()
            .filter(|decl| decl.direction.produces_output())
            .filter_map(|decl| env.get(&decl.name).map(|v| (decl.name.clone(), v.clone())))
            .collect()
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("kind", &self.behavior.kind())
            .field("children", &self.children.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Completion record
// ---------------------------------------------------------------------------

/// What a parent learns about a child that has closed.
#[derive(Debug, Clone)]
pub struct CompletedChild {
    pub id: ActivityInstanceId,
    pub activity: Arc<Activity>,
    pub reason: CloseReason,
    pub result: Option<Value>,
    /// Values of the child's `Out`/`InOut` arguments.
    pub outputs: Environment,
    pub fault: Option<FaultInfo>,
}

impl CompletedChild {
    pub fn is_completed(&self) -> bool {
        self.reason == CloseReason::Completed
    }
}
