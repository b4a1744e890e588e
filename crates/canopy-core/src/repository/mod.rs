//! Repository trait definitions (ports).
//!
//! The infrastructure layer (canopy-infra) implements these with SQLite.
//! The in-memory store here backs tests and hosts that never need to
//! survive a restart.

pub mod instance_store;

pub use instance_store::{InMemoryInstanceStore, InstanceStore};
