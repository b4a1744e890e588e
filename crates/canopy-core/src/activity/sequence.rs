//! Runs children one after another in declaration order.

use canopy_types::error::EngineError;
use serde_json::{Value, json};

use super::{ActivityBehavior, CompletedChild};
use crate::runtime::context::ActivityContext;

const NEXT_CHILD: &str = "sequence.next";

/// Schedules the next child only after the previous one has been recorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequence;

impl Sequence {
    fn schedule_at(ctx: &mut ActivityContext<'_>, index: usize) -> Result<(), EngineError> {
        let Some(child) = ctx.activity().children().get(index).cloned() else {
            return ctx.complete(None);
        };
        ctx.set_property(NEXT_CHILD, json!(index + 1));
        ctx.schedule_child(&child, Default::default())?;
        Ok(())
    }
}

impl ActivityBehavior for Sequence {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        Self::schedule_at(ctx, 0)
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _child: &CompletedChild,
    ) -> Result<(), EngineError> {
        let next = ctx
            .property(NEXT_CHILD)
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Self::schedule_at(ctx, next)
    }
}
