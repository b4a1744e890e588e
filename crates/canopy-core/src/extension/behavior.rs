//! Behavior extension hooks.
//!
//! A hook is an ordinary extension that built-in activities look up when
//! they are about to suspend. It lets the host decide that certain waits
//! must not be treated as a safe point for persistence.

/// Host policy for built-in statements.
///
/// With `blocking_delay` set, every `Delay` marks its timer bookmark as
/// suppressing persistable idle, so the instance reports `Idle` but never
/// `PersistableIdle` while a delay is outstanding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementsBehavior {
    pub blocking_delay: bool,
}

impl StatementsBehavior {
    pub fn blocking_delay() -> Self {
        Self {
            blocking_delay: true,
        }
    }
}
