//! Business logic and port definitions for Waypoint.
//!
//! This crate defines the "ports" (repository and version-control traits)
//! that the infrastructure layer implements. It depends only on
//! `waypoint-types` -- never on `waypoint-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod vcs;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
