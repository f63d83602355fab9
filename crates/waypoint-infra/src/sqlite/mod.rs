//! SQLite storage layer.
//!
//! `CheckpointRepository` backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod checkpoint;
pub mod pool;

pub use checkpoint::SqliteCheckpointRepository;
pub use pool::DatabasePool;
