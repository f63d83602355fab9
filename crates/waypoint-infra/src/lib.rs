//! Infrastructure layer for Waypoint.
//!
//! Implementations of the ports defined in `waypoint-core`: SQLite checkpoint
//! storage, the git version-control collaborator, the shell stage handler,
//! and configuration/data-directory loading.

pub mod config;
pub mod filesystem;
pub mod sqlite;
pub mod stage;
pub mod vcs;
