//! Workflow-instance level status, outcomes and persisted snapshots.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{Environment, FaultInfo};
use crate::bookmark::BookmarkInfo;

/// Coarse status of a whole workflow instance.
///
/// `Idle` means the work queue is empty and the instance waits on
/// bookmarks. `PersistableIdle` is the sub-state of idle in which no
/// outstanding bookmark suppresses persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Idle,
    PersistableIdle,
    Completed,
    Canceled,
    Faulted,
    Unloaded,
}

impl InstanceStatus {
    /// Whether the instance will never make progress again in this process.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Faulted | Self::Unloaded
        )
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::PersistableIdle)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Idle => write!(f, "idle"),
            Self::PersistableIdle => write!(f, "persistable_idle"),
            Self::Completed => write!(f, "completed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Faulted => write!(f, "faulted"),
            Self::Unloaded => write!(f, "unloaded"),
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "idle" => Ok(Self::Idle),
            "persistable_idle" => Ok(Self::PersistableIdle),
            "completed" => Ok(Self::Completed),
            "canceled" => Ok(Self::Canceled),
            "faulted" => Ok(Self::Faulted),
            "unloaded" => Ok(Self::Unloaded),
            other => Err(format!("invalid instance status: '{other}'")),
        }
    }
}

/// What the host wants done when the instance becomes persistable idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistableIdleAction {
    /// Keep running in memory.
    #[default]
    None,
    /// Save a snapshot and keep running.
    Persist,
    /// Save a snapshot and stop the in-memory instance.
    PersistAndUnload,
}

/// How a workflow instance finished in this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Root activity completed; carries the root's output arguments.
    Completed { outputs: Environment },
    Canceled,
    Faulted { fault: FaultInfo },
    /// Persisted and removed from memory while still idle.
    Unloaded,
}

impl WorkflowOutcome {
    pub fn status(&self) -> InstanceStatus {
        match self {
            Self::Completed { .. } => InstanceStatus::Completed,
            Self::Canceled => InstanceStatus::Canceled,
            Self::Faulted { .. } => InstanceStatus::Faulted,
            Self::Unloaded => InstanceStatus::Unloaded,
        }
    }
}

/// Descriptive snapshot handed to an instance store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: Uuid,
    pub workflow_name: String,
    pub status: InstanceStatus,
    /// Bookmarks outstanding at the time of the save, in creation order.
    #[serde(default)]
    pub bookmarks: Vec<BookmarkInfo>,
    /// Root environment (workflow arguments and root variables).
    #[serde(default)]
    pub variables: Environment,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_round_trips_through_from_str() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::PersistableIdle,
            InstanceStatus::Unloaded,
        ] {
            let parsed: InstanceStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("sleeping".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn terminal_and_idle_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Unloaded.is_terminal());
        assert!(!InstanceStatus::PersistableIdle.is_terminal());
        assert!(InstanceStatus::PersistableIdle.is_idle());
        assert!(!InstanceStatus::Running.is_idle());
    }

    #[test]
    fn persistable_idle_action_defaults_to_none() {
        assert_eq!(PersistableIdleAction::default(), PersistableIdleAction::None);
        let parsed: PersistableIdleAction =
            serde_json::from_str("\"persist_and_unload\"").unwrap();
        assert_eq!(parsed, PersistableIdleAction::PersistAndUnload);
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        let outcome = WorkflowOutcome::Faulted {
            fault: FaultInfo {
                activity: "Charge card".to_string(),
                message: "declined".to_string(),
            },
        };
        assert_eq!(outcome.status(), InstanceStatus::Faulted);
        assert_eq!(WorkflowOutcome::Canceled.status(), InstanceStatus::Canceled);
    }
}
