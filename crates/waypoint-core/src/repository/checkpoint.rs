//! Checkpoint repository trait definition.
//!
//! Defines the storage interface for checkpoint records and the per-session
//! "latest state" rows. The infrastructure layer (waypoint-infra) implements
//! this trait with SQLite persistence; [`super::InMemoryCheckpointRepository`]
//! backs tests and ephemeral runs.

use waypoint_types::checkpoint::{CheckpointRecord, SessionFilter, SessionRecord};
use waypoint_types::error::RepositoryError;
use uuid::Uuid;

/// Repository trait for checkpoint persistence.
///
/// Covers two entity families:
/// - **Checkpoints:** append-only records, never updated in place.
/// - **Sessions:** one mutable row per session holding its latest state.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Append a record. Fails with `Conflict` if `(session_id, phase_label)`
    /// or the record ID already exists.
    fn append_checkpoint(
        &self,
        record: &CheckpointRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All records of a session, ordered by `created_at` ASC.
    fn list_checkpoints(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<CheckpointRecord>, RepositoryError>> + Send;

    /// Get a record by its ID.
    fn get_checkpoint(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Most recent record of a session.
    fn latest_checkpoint(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Distinct session IDs that have at least one record.
    fn list_checkpoint_sessions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Delete records by ID. Returns the number of records removed.
    fn delete_checkpoints(
        &self,
        ids: &[Uuid],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Insert or replace the session row (keyed by `session_id`).
    ///
    /// `started_at` is preserved from the first insert.
    fn upsert_session(
        &self,
        session: &SessionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a session row.
    fn get_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<SessionRecord>, RepositoryError>> + Send;

    /// List sessions matching the filter, ordered by `updated_at` DESC.
    fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<SessionRecord>, RepositoryError>> + Send;
}
