//! FIFO work queue drained by the scheduler.

use std::collections::VecDeque;

use canopy_types::activity::ActivityInstanceId;
use serde_json::Value;

use super::bookmark::BookmarkEntry;

#[derive(Debug)]
pub(crate) enum WorkItem {
    /// Run `on_enter` of a freshly scheduled instance.
    Enter { instance: ActivityInstanceId },
    /// `child` closed; let `parent` record it.
    Completed {
        parent: ActivityInstanceId,
        child: ActivityInstanceId,
    },
    /// The host resumed a bookmark.
    BookmarkResumed { entry: BookmarkEntry, value: Value },
    /// A timer-backed bookmark elapsed.
    TimerFired { entry: BookmarkEntry },
    /// Propagate cancellation into `instance`.
    Cancel { instance: ActivityInstanceId },
}

impl WorkItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Enter { .. } => "enter",
            Self::Completed { .. } => "completed",
            Self::BookmarkResumed { .. } => "bookmark_resumed",
            Self::TimerFired { .. } => "timer_fired",
            Self::Cancel { .. } => "cancel",
        }
    }

    /// The activity instance whose behavior this item dispatches into.
    pub fn target(&self) -> ActivityInstanceId {
        match self {
            Self::Enter { instance } | Self::Cancel { instance } => *instance,
            Self::Completed { parent, .. } => *parent,
            Self::BookmarkResumed { entry, .. } | Self::TimerFired { entry } => entry.owner,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    items: VecDeque<WorkItem>,
    dispatched: u64,
}

impl WorkQueue {
    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        let item = self.items.pop_front()?;
        self.dispatched += 1;
        Some(item)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of items popped since the instance started.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}
