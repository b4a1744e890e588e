use thiserror::Error;
use uuid::Uuid;

use crate::activity::FaultInfo;
use crate::bookmark::BookmarkScope;

/// A declared extension requirement that nothing could satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("activity '{activity}' requires extension '{type_name}', but none was provided and no default provider is declared")]
pub struct ExtensionRequiredError {
    /// Full Rust type name of the missing capability.
    pub type_name: String,
    /// Display name of the first activity that declared the requirement.
    pub activity: String,
}

/// Pre-start validation failure. Always reported before any activity runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow validation failed: {}", join_messages(.errors))]
pub struct ValidationError {
    pub errors: Vec<ExtensionRequiredError>,
}

fn join_messages(errors: &[ExtensionRequiredError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors related to bookmark creation and resumption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookmarkError {
    /// Unknown, already resumed, or the instance is no longer running.
    #[error("bookmark '{name}' not found{}", scope_suffix(.scope))]
    NotFound {
        name: String,
        scope: Option<BookmarkScope>,
    },

    #[error("bookmark '{name}' already exists{}", scope_suffix(.scope))]
    Duplicate {
        name: String,
        scope: Option<BookmarkScope>,
    },
}

fn scope_suffix(scope: &Option<BookmarkScope>) -> String {
    match scope {
        Some(scope) => format!(" in scope '{scope}'"),
        None => String::new(),
    }
}

/// Errors related to persistence operations.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),
}

/// Errors raised by the engine and by activity logic.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Bookmark(#[from] BookmarkError),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Fatal to the whole workflow instance.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    /// Raised by activity logic.
    #[error("{0}")]
    Fault(String),

    /// A fault re-raised while propagating from a descendant.
    #[error("activity '{}' faulted: {}", .0.activity, .0.message)]
    Faulted(FaultInfo),

    #[error("persistence error: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("workflow instance {0} is not running")]
    InstanceUnavailable(Uuid),
}

impl EngineError {
    /// Convenience constructor for faults raised by activity logic.
    pub fn fault(message: impl Into<String>) -> Self {
        Self::Fault(message.into())
    }

    /// The fault description to record for `activity`. Propagated faults
    /// keep their origin.
    pub fn into_fault_info(self, activity: &str) -> FaultInfo {
        match self {
            Self::Faulted(info) => info,
            other => FaultInfo {
                activity: activity.to_string(),
                message: other.to_string(),
            },
        }
    }
}
