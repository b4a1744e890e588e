//! Host-supplied code run as an activity.

use std::sync::Arc;

use canopy_types::error::EngineError;
use serde_json::Value;

use super::ActivityBehavior;
use crate::extension::metadata::ActivityMetadata;
use crate::runtime::context::ActivityContext;

type InvokeBody =
    dyn Fn(&mut ActivityContext<'_>) -> Result<Option<Value>, EngineError> + Send + Sync;
type MetadataHook = dyn Fn(&mut ActivityMetadata) + Send + Sync;

/// Runs a closure on entry and completes with its result.
#[derive(Clone)]
pub struct InvokeFn {
    body: Arc<InvokeBody>,
    metadata: Option<Arc<MetadataHook>>,
}

impl InvokeFn {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut ActivityContext<'_>) -> Result<Option<Value>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            body: Arc::new(body),
            metadata: None,
        }
    }

    /// Declare extension requirements or default providers for the closure.
    pub fn with_metadata<F>(mut self, declare: F) -> Self
    where
        F: Fn(&mut ActivityMetadata) + Send + Sync + 'static,
    {
        self.metadata = Some(Arc::new(declare));
        self
    }
}

impl std::fmt::Debug for InvokeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeFn")
            .field("has_metadata", &self.metadata.is_some())
            .finish()
    }
}

impl ActivityBehavior for InvokeFn {
    fn kind(&self) -> &'static str {
        "invoke"
    }

    fn cache_metadata(&self, metadata: &mut ActivityMetadata) {
        if let Some(declare) = &self.metadata {
            declare(metadata);
        }
    }

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        let result = (self.body)(ctx)?;
        ctx.complete(result)
    }
}
