//! SQLite storage layer.
//!
//! The storage port backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod records;

pub use pool::DatabasePool;
pub use records::SqliteStorage;
