//! Events emitted by a running workflow instance.
//!
//! Hosts observe instances exclusively through these events (published on a
//! broadcast bus) instead of registering callbacks that the scheduler would
//! invoke re-entrantly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{ActivityInstanceId, CloseReason, Environment, FaultInfo};
use crate::bookmark::{BookmarkInfo, BookmarkScope};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    InstanceStarted {
        instance_id: Uuid,
        workflow_name: String,
    },

    ActivityScheduled {
        instance_id: Uuid,
        activity_instance: ActivityInstanceId,
        activity: String,
    },

    ActivityClosed {
        instance_id: Uuid,
        activity_instance: ActivityInstanceId,
        activity: String,
        reason: CloseReason,
    },

    BookmarkCreated {
        instance_id: Uuid,
        bookmark: BookmarkInfo,
    },

    BookmarkResumed {
        instance_id: Uuid,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<BookmarkScope>,
    },

    /// The work queue drained and the instance waits on bookmarks.
    Idle {
        instance_id: Uuid,
        bookmarks: Vec<BookmarkInfo>,
    },

    /// Idle and no outstanding bookmark suppresses persistence. Emitted once
    /// per transition into this state.
    PersistableIdle { instance_id: Uuid },

    Persisted { instance_id: Uuid },

    Unloaded { instance_id: Uuid },

    Completed {
        instance_id: Uuid,
        outputs: Environment,
    },

    Canceled { instance_id: Uuid },

    Faulted { instance_id: Uuid, fault: FaultInfo },
}

impl WorkflowEvent {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::InstanceStarted { instance_id, .. }
            | Self::ActivityScheduled { instance_id, .. }
            | Self::ActivityClosed { instance_id, .. }
            | Self::BookmarkCreated { instance_id, .. }
            | Self::BookmarkResumed { instance_id, .. }
            | Self::Idle { instance_id, .. }
            | Self::PersistableIdle { instance_id }
            | Self::Persisted { instance_id }
            | Self::Unloaded { instance_id }
            | Self::Completed { instance_id, .. }
            | Self::Canceled { instance_id }
            | Self::Faulted { instance_id, .. } => *instance_id,
        }
    }

    /// Whether no further events follow for this instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. }
                | Self::Canceled { .. }
                | Self::Faulted { .. }
                | Self::Unloaded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let id = Uuid::now_v7();
        let event = WorkflowEvent::PersistableIdle { instance_id: id };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "persistable_idle");
        assert_eq!(event.instance_id(), id);
        assert!(!event.is_terminal());
    }

    #[test]
    fn faulted_is_terminal() {
        let event = WorkflowEvent::Faulted {
            instance_id: Uuid::now_v7(),
            fault: FaultInfo {
                activity: "root".to_string(),
                message: "boom".to_string(),
            },
        };
        assert!(event.is_terminal());
        let json = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
