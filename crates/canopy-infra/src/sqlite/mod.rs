//! SQLite storage layer.
//!
//! Store implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod instance_store;
pub mod pool;

pub use instance_store::SqliteInstanceStore;
pub use pool::DatabasePool;
