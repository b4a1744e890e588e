//! Suspends for a fixed duration using a timer-backed bookmark.

use std::time::Duration;

use canopy_types::bookmark::BookmarkInfo;
use canopy_types::error::EngineError;
use serde_json::Value;

use super::ActivityBehavior;
use crate::extension::behavior::StatementsBehavior;
use crate::runtime::context::{ActivityContext, BookmarkOptions};

#[derive(Debug, Clone, Copy)]
pub struct Delay {
    duration: Duration,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl ActivityBehavior for Delay {
    fn kind(&self) -> &'static str {
        "delay"
    }

    fn on_enter(&self, ctx: &mut ActivityContext<'_>) -> Result<(), EngineError> {
        if self.duration.is_zero() {
            return ctx.complete(None);
        }

        let blocking = ctx
            .get_extension::<StatementsBehavior>()
            .is_some_and(|hook| hook.blocking_delay);

        let timer = ctx.create_timer(
            self.duration,
            BookmarkOptions::new().suppress_persistable_idle(blocking),
        )?;
        tracing::debug!(
            bookmark = %timer.name,
            delay = ?self.duration,
            blocking,
            "delay armed"
        );
        Ok(())
    }

    fn on_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _bookmark: &BookmarkInfo,
        _value: Value,
    ) -> Result<(), EngineError> {
        ctx.complete(None)
    }
}
