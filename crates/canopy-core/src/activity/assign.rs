use canopy_types::error::EngineError;
use serde_json::Value;

use super::ActivityBehavior;
use crate::runtime::context::ActivityContext;

/// Writes a constant into the nearest scope that declares `target`.
#[derive(Debug, Clone)]
pub struct Assign {
    target: String,
    value: Value,
}

impl Assign {
    pub fn new(target: impl Into<String>, value: Value) -> Self {
        Self {
            target: target.into(),
            value,
        }
    }
}

impl ActivityBehavior for Assign {
    fn kind(&self) -> &'static str {
        "assign"
    }

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        ctx.set_variable(&self.target, self.value.clone())?;
        ctx.complete(None)
    }
}
