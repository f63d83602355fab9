//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (waypoint-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod checkpoint;
pub mod memory;

pub use checkpoint::CheckpointRepository;
pub use memory::InMemoryCheckpointRepository;
