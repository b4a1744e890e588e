//! Shared domain types for Canopy.
//!
//! This crate contains the types exchanged between the engine core, the host
//! and the persistence layer: activity instance ids and statuses, argument
//! declarations, bookmark descriptions, workflow events, snapshots, runtime
//! configuration and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod activity;
pub mod bookmark;
pub mod config;
pub mod error;
pub mod event;
pub mod instance;
