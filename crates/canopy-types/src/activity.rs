//! Activity instance identity, lifecycle status and argument declarations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Variable and argument bindings of one activity instance.
pub type Environment = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Instance identity and status
// ---------------------------------------------------------------------------

/// Identifier of one activity instance inside a workflow instance.
///
/// Ids are allocated sequentially by the scheduler and never reused within
/// the same workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityInstanceId(pub u64);

impl fmt::Display for ActivityInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an activity instance closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    Canceled,
    Faulted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Execution status of an activity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ActivityInstanceState {
    /// Scheduled but not yet entered.
    Created,
    /// Entered and able to make progress.
    Executing,
    /// Waiting on at least one bookmark.
    Suspended,
    /// Terminal.
    Closed(CloseReason),
}

impl ActivityInstanceState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Executing => write!(f, "executing"),
            Self::Suspended => write!(f, "suspended"),
            Self::Closed(reason) => write!(f, "closed({reason})"),
        }
    }
}

/// Describes where a fault originated, carried up the instance tree
/// unchanged while it propagates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInfo {
    /// Display name of the activity whose logic raised the fault.
    pub activity: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Argument and variable declarations
// ---------------------------------------------------------------------------

/// Data flow direction of a declared argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentDirection {
    In,
    Out,
    InOut,
}

impl ArgumentDirection {
    /// Whether callers may supply a value when scheduling.
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    /// Whether the value is reported back to the parent on completion.
    pub fn produces_output(&self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// The JSON shape an argument accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Any,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// Whether `value` has this shape. `null` never matches a concrete kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Bool => value.is_boolean(),
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

/// An argument declared on an activity definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDecl {
    pub name: String,
    pub direction: ArgumentDirection,
    #[serde(default)]
    pub kind: ValueKind,
    /// Required `In`/`InOut` arguments must be supplied when scheduling.
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ArgumentDecl {
    fn new(name: impl Into<String>, direction: ArgumentDirection) -> Self {
        Self {
            name: name.into(),
            direction,
            kind: ValueKind::Any,
            required: false,
            default: None,
        }
    }

    pub fn input(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentDirection::In)
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentDirection::Out)
    }

    pub fn in_out(name: impl Into<String>) -> Self {
        Self::new(name, ArgumentDirection::InOut)
    }

    pub fn of_kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A variable declared on an activity definition, visible to the activity
/// and all of its descendants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

impl VariableDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = value;
        self
    }
}
