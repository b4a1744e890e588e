//! Execution engine and persistence-port definitions for Canopy.
//!
//! This crate drives trees of activities: the scheduler and its work queue,
//! the bookmark table, the extension registry with its pre-start validation,
//! the idle/persistable-idle coordinator and the host-facing application
//! handle. It defines the `InstanceStore` port that the infrastructure layer
//! implements and depends only on `canopy-types` -- never on `canopy-infra`.

pub mod activity;
pub mod event;
pub mod extension;
pub mod host;
pub mod repository;
pub mod runtime;

pub use activity::{Activity, ActivityBehavior, CompletedChild};
pub use extension::behavior::StatementsBehavior;
pub use host::{InstanceHandle, WorkflowApplication, WorkflowRuntime};
pub use runtime::context::{ActivityContext, BookmarkOptions};
