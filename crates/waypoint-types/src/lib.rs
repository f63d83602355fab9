//! Shared domain types for Waypoint.
//!
//! Workflow definitions, stage results, checkpoint records, rollback targets,
//! engine configuration, and the events broadcast while a session runs.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
