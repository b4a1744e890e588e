//! Runs every branch concurrently by interleaving their work items.

use canopy_types::error::EngineError;

use super::ActivityBehavior;
use crate::runtime::context::ActivityContext;

/// Schedules all branches in declaration order and completes once every
/// branch has been recorded (the default child-completion behavior).
#[derive(Debug, Default, Clone, Copy)]
pub struct Parallel;

impl ActivityBehavior for Parallel {
    fn kind(&self) -> &'static str {
        "parallel"
    }

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        let branches = ctx.activity().children().to_vec();
        if branches.is_empty() {
            return ctx.complete(None);
        }
        for branch in &branches {
            ctx.schedule_child(branch, Default::default())?;
        }
        Ok(())
    }
}
