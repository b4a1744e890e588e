//! Infrastructure layer for Canopy.
//!
//! Implements the `InstanceStore` port from `canopy-core` on SQLite and
//! loads `canopy.toml` runtime configuration from the data directory.

pub mod config;
pub mod sqlite;
