//! Workflow engine core: definition parsing, DAG ordering, sequential
//! execution, and durable checkpointing.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load/save
//! - `dag` -- cycle detection and deterministic topological order
//! - `state` -- per-session execution state persisted inside checkpoints
//! - `stage` -- the pluggable stage contract and handler registry
//! - `retry` -- retry decisions and exponential backoff
//! - `checkpoint` -- append-only checkpoint store with consent gating
//! - `rollback` -- target parsing, resolution, and crash-safe rollback
//! - `executor` -- the sequential orchestrator

pub mod checkpoint;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod retry;
pub mod rollback;
pub mod stage;
pub mod state;
