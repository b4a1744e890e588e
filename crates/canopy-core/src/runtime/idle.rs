//! Idle and persistable-idle detection.
//!
//! The coordinator is only consulted at quiescent points: the work queue is
//! empty and no command is waiting. It turns the bookmark table's state into
//! edge-triggered transitions so the host hears about each idle period once.

use canopy_types::instance::InstanceStatus;

use super::bookmark::BookmarkTable;

/// What changed when the coordinator evaluated a quiescent instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct IdleTransition {
    pub entered_idle: bool,
    pub entered_persistable_idle: bool,
}

#[derive(Debug)]
pub(crate) struct IdleCoordinator {
    status: InstanceStatus,
    /// Already warned about the current stalled period.
    stalled: bool,
}

impl Default for IdleCoordinator {
    fn default() -> Self {
        Self {
            status: InstanceStatus::Running,
            stalled: false,
        }
    }
}

impl IdleCoordinator {
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Work arrived. Returns true if this left an idle state.
    pub fn mark_running(&mut self) -> bool {
        let was_idle = self.status.is_idle();
        self.stalled = false;
        if !self.status.is_terminal() {
            self.status = InstanceStatus::Running;
        }
        was_idle
    }

    pub fn mark_terminal(&mut self, status: InstanceStatus) {
        self.status = status;
    }

    /// Evaluate a quiescent, still-open instance.
    ///
    /// Idle requires at least one outstanding bookmark. Persistable idle
    /// additionally requires that none carries a suppression marker; markers
    /// compose by logical AND.
    pub fn evaluate(&mut self, bookmarks: &BookmarkTable) -> IdleTransition {
        if bookmarks.is_empty() {
            if !self.stalled {
                self.stalled = true;
                tracing::warn!(
                    "open workflow instance has no queued work and nothing to resume"
                );
            }
            return IdleTransition::default();
        }

        let persistable = bookmarks.suppressing_count() == 0;
        let mut transition = IdleTransition::default();

        match self.status {
            InstanceStatus::Running => {
                transition.entered_idle = true;
                transition.entered_persistable_idle = persistable;
                self.status = if persistable {
                    InstanceStatus::PersistableIdle
                } else {
                    InstanceStatus::Idle
                };
            }
            InstanceStatus::Idle if persistable => {
                transition.entered_persistable_idle = true;
                self.status = InstanceStatus::PersistableIdle;
            }
            InstanceStatus::PersistableIdle if !persistable => {
                self.status = InstanceStatus::Idle;
            }
            _ => {}
        }

        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_types::activity::ActivityInstanceId;

    use crate::runtime::bookmark::{BookmarkEntry, BookmarkKey};

    fn table_with(suppressing: &[bool]) -> BookmarkTable {
        let mut table = BookmarkTable::default();
        for (i, suppress) in suppressing.iter().enumerate() {
            table
                .insert(BookmarkEntry::new(
                    BookmarkKey::new(format!("b{i}"), None),
                    ActivityInstanceId(i as u64),
                    "owner",
                    *suppress,
                    None,
                ))
                .unwrap();
        }
        table
    }

    #[test]
    fn without_markers_idle_and_persistable_idle_coincide() {
        let mut coordinator = IdleCoordinator::default();
        let transition = coordinator.evaluate(&table_with(&[false, false]));
        assert!(transition.entered_idle);
        assert!(transition.entered_persistable_idle);
        assert_eq!(coordinator.status(), InstanceStatus::PersistableIdle);
    }

    #[test]
    fn any_marker_withholds_persistable_idle() {
        let mut coordinator = IdleCoordinator::default();
        let transition = coordinator.evaluate(&table_with(&[false, true]));
        assert!(transition.entered_idle);
        assert!(!transition.entered_persistable_idle);
        assert_eq!(coordinator.status(), InstanceStatus::Idle);
    }

    #[test]
    fn transitions_fire_once_per_idle_period() {
        let mut coordinator = IdleCoordinator::default();
        let table = table_with(&[false]);
        assert!(coordinator.evaluate(&table).entered_persistable_idle);
        assert_eq!(coordinator.evaluate(&table), IdleTransition::default());

        assert!(coordinator.mark_running());
        assert!(coordinator.evaluate(&table).entered_persistable_idle);
    }

    #[test]
    fn idle_becomes_persistable_once_marker_clears() {
        let mut coordinator = IdleCoordinator::default();
        coordinator.evaluate(&table_with(&[true]));

        let transition = coordinator.evaluate(&table_with(&[false]));
        assert!(!transition.entered_idle);
        assert!(transition.entered_persistable_idle);
    }

    #[test]
    fn no_outstanding_bookmarks_is_not_idle() {
        let mut coordinator = IdleCoordinator::default();

        let transition = coordinator.evaluate(&BookmarkTable::default());

        assert_eq!(transition, IdleTransition::default());
        assert_eq!(coordinator.status(), InstanceStatus::Running);
        assert!(!coordinator.mark_running());
        assert!(coordinator.evaluate(&table_with(&[false])).entered_persistable_idle);
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut coordinator = IdleCoordinator::default();
        coordinator.mark_terminal(InstanceStatus::Completed);
        assert!(!coordinator.mark_running());
        assert_eq!(coordinator.status(), InstanceStatus::Completed);
    }
}
