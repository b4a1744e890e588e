//! Per-instance execution machinery.
//!
//! A workflow instance is owned by exactly one scheduler, which in turn is
//! owned by exactly one driver task (see [`crate::host`]). Everything in this
//! module is single-threaded by construction; concurrency only exists at the
//! command channel in front of it.

pub mod bookmark;
pub(crate) mod command;
pub mod context;
pub(crate) mod idle;
pub(crate) mod queue;
pub(crate) mod scheduler;
pub(crate) mod timer;
pub(crate) mod tree;

pub use bookmark::{BookmarkCallback, BookmarkKey};
pub use context::{ActivityContext, BookmarkOptions};
