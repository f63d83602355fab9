//! SQLite checkpoint repository implementation.
//!
//! Implements `CheckpointRepository` from `waypoint-core` using sqlx with split
//! read/write pools. Snapshots and session states are stored as JSON text.
//! Timestamps use fixed-width RFC 3339 with microseconds, so `ORDER BY
//! created_at` is chronological.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;
use waypoint_core::repository::CheckpointRepository;
use waypoint_types::checkpoint::{
    CheckpointMetrics, CheckpointRecord, PhaseLabel, SessionFilter, SessionRecord,
};
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::WorkflowStatus;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointRepository`.
pub struct SqliteCheckpointRepository {
    pool: DatabasePool,
}

impl SqliteCheckpointRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    id: String,
    session_id: String,
    phase_label: String,
    created_at: String,
    vcs_reference: Option<String>,
    duration_seconds: f64,
    files_changed: i64,
    lines_added: i64,
    snapshot: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            phase_label: row.try_get("phase_label")?,
            created_at: row.try_get("created_at")?,
            vcs_reference: row.try_get("vcs_reference")?,
            duration_seconds: row.try_get("duration_seconds")?,
            files_changed: row.try_get("files_changed")?,
            lines_added: row.try_get("lines_added")?,
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, RepositoryError> {
        let phase_label: PhaseLabel = self
            .phase_label
            .parse()
            .map_err(RepositoryError::Query)?;
        let snapshot = serde_json::from_str(&self.snapshot)
            .map_err(|e| RepositoryError::Query(format!("invalid snapshot JSON: {e}")))?;

        Ok(CheckpointRecord {
            id: parse_uuid(&self.id)?,
            session_id: self.session_id,
            phase_label,
            created_at: parse_datetime(&self.created_at)?,
            vcs_reference: self.vcs_reference,
            metrics: CheckpointMetrics {
                duration_seconds: self.duration_seconds,
                files_changed: self.files_changed.max(0) as u64,
                lines_added: self.lines_added.max(0) as u64,
            },
            snapshot,
        })
    }
}

struct SessionRow {
    session_id: String,
    workflow_id: String,
    status: String,
    state: String,
    started_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            session_id: row.try_get("session_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            state: row.try_get("state")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_session(self) -> Result<SessionRecord, RepositoryError> {
        let status: WorkflowStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let state = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid session state JSON: {e}")))?;

        Ok(SessionRecord {
            session_id: self.session_id,
            workflow_id: self.workflow_id,
            status,
            state,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn collect_records(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<CheckpointRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = CheckpointRow::from_row(row).map_err(query_error)?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// CheckpointRepository impl
// ---------------------------------------------------------------------------

impl CheckpointRepository for SqliteCheckpointRepository {
    async fn append_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(&record.snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;

        sqlx::query(
            r#"INSERT INTO checkpoints
               (id, session_id, phase_label, created_at, vcs_reference,
                duration_seconds, files_changed, lines_added, snapshot)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.id.to_string())
        .bind(&record.session_id)
        .bind(record.phase_label.to_string())
        .bind(format_datetime(&record.created_at))
        .bind(&record.vcs_reference)
        .bind(record.metrics.duration_seconds)
        .bind(record.metrics.files_changed as i64)
        .bind(record.metrics.lines_added as i64)
        .bind(&snapshot)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "checkpoint '{}' already exists for session '{}'",
                    record.phase_label, record.session_id
                ))
            } else {
                query_error(e)
            }
        })?;

        tracing::debug!(
            session_id = %record.session_id,
            phase_label = %record.phase_label,
            "checkpoint row inserted"
        );
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        session_id: &str,
    ) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        collect_records(&rows)
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn latest_checkpoint(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn list_checkpoint_sessions(&self) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT session_id FROM checkpoints ORDER BY session_id ASC")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_error)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_checkpoints(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let mut deleted = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM checkpoints WHERE id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
            deleted += result.rows_affected();
        }
        tx.commit().await.map_err(query_error)?;

        Ok(deleted)
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), RepositoryError> {
        let state = serde_json::to_string(&session.state)
            .map_err(|e| RepositoryError::Query(format!("serialize session state: {e}")))?;

        sqlx::query(
            r#"INSERT INTO workflow_sessions
               (session_id, workflow_id, status, state, started_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id) DO UPDATE SET
                 workflow_id = excluded.workflow_id,
                 status = excluded.status,
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&session.session_id)
        .bind(&session.workflow_id)
        .bind(session.status.to_string())
        .bind(&state)
        .bind(format_datetime(&session.started_at))
        .bind(format_datetime(&session.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = SessionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_session()?))
            }
            None => Ok(None),
        }
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, RepositoryError> {
        let rows = match &filter.workflow_id {
            Some(workflow_id) => {
                sqlx::query(
                    "SELECT * FROM workflow_sessions WHERE workflow_id = ? ORDER BY updated_at DESC",
                )
                .bind(workflow_id)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_sessions ORDER BY updated_at DESC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = SessionRow::from_row(row).map_err(query_error)?;
            let session = r.into_session()?;
            if filter.matches(&session) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use serde_json::json;
    use tempfile::TempDir;

    async fn repo() -> (SqliteCheckpointRepository, TempDir) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("cp.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteCheckpointRepository::new(pool), dir)
    }

    fn record(session: &str, label: PhaseLabel, at: DateTime<Utc>) -> CheckpointRecord {
        CheckpointRecord {
            id: Uuid::now_v7(),
            session_id: session.to_string(),
            phase_label: label,
            created_at: at.trunc_subsecs(6),
            vcs_reference: None,
            metrics: CheckpointMetrics::default(),
            snapshot: json!({"label": "x"}),
        }
    }

    fn session(id: &str, workflow: &str, status: WorkflowStatus, at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            workflow_id: workflow.to_string(),
            status,
            state: json!({"status": status.to_string()}),
            started_at: at.trunc_subsecs(6),
            updated_at: at.trunc_subsecs(6),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back_exactly() {
        let (repo, _dir) = repo().await;
        let mut rec = record("s1", PhaseLabel::Phase { index: 2, revision: 1 }, Utc::now());
        rec.vcs_reference = Some("abc123".into());
        rec.metrics = CheckpointMetrics {
            duration_seconds: 12.5,
            files_changed: 4,
            lines_added: 87,
        };
        rec.snapshot = json!({"context": {"ticket": "WP-9"}, "stages": {}});
        repo.append_checkpoint(&rec).await.unwrap();

        let loaded = repo.get_checkpoint(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(repo.get_checkpoint(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_chronological_and_latest_is_last() {
        let (repo, _dir) = repo().await;
        let base = Utc::now();
        // Inserted out of order on purpose.
        let later = record("s1", PhaseLabel::Phase { index: 1, revision: 0 }, base + Duration::milliseconds(5));
        let earlier = record("s1", PhaseLabel::PreWork, base);
        let other = record("s2", PhaseLabel::PreWork, base);
        repo.append_checkpoint(&later).await.unwrap();
        repo.append_checkpoint(&earlier).await.unwrap();
        repo.append_checkpoint(&other).await.unwrap();

        let listed = repo.list_checkpoints("s1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].phase_label, PhaseLabel::PreWork);
        assert_eq!(listed[1].id, later.id);

        let latest = repo.latest_checkpoint("s1").await.unwrap().unwrap();
        assert_eq!(latest.id, later.id);
        assert!(repo.latest_checkpoint("missing").await.unwrap().is_none());

        assert_eq!(repo.list_checkpoint_sessions().await.unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn test_duplicate_label_is_a_conflict() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        repo.append_checkpoint(&record("s1", PhaseLabel::PreWork, now))
            .await
            .unwrap();
        let err = repo
            .append_checkpoint(&record("s1", PhaseLabel::PreWork, now + Duration::seconds(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Same label in another session is fine.
        repo.append_checkpoint(&record("s2", PhaseLabel::PreWork, now))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_checkpoints() {
        let (repo, _dir) = repo().await;
        let now = Utc::now();
        let a = record("s1", PhaseLabel::PreWork, now);
        let b = record("s1", PhaseLabel::Safety { seq: 1 }, now + Duration::seconds(1));
        repo.append_checkpoint(&a).await.unwrap();
        repo.append_checkpoint(&b).await.unwrap();

        assert_eq!(repo.delete_checkpoints(&[]).await.unwrap(), 0);
        assert_eq!(repo.delete_checkpoints(&[b.id, Uuid::now_v7()]).await.unwrap(), 1);
        let remaining = repo.list_checkpoints("s1").await.unwrap();
        assert_eq!(remaining, vec![a]);
    }

    #[tokio::test]
    async fn test_upsert_session_preserves_started_at() {
        let (repo, _dir) = repo().await;
        let t0 = Utc::now();
        repo.upsert_session(&session("s1", "wf", WorkflowStatus::Running, t0))
            .await
            .unwrap();

        let mut update = session("s1", "wf", WorkflowStatus::Completed, t0 + Duration::minutes(5));
        update.state = json!({"done": true});
        repo.upsert_session(&update).await.unwrap();

        let loaded = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
        assert_eq!(loaded.started_at, t0.trunc_subsecs(6));
        assert_eq!(loaded.updated_at, update.updated_at);
        assert_eq!(loaded.state, json!({"done": true}));
        assert!(repo.get_session("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_sessions_filters_and_orders_newest_first() {
        let (repo, _dir) = repo().await;
        let t0 = Utc::now();
        repo.upsert_session(&session("alpha-1", "build", WorkflowStatus::Running, t0))
            .await
            .unwrap();
        repo.upsert_session(&session("alpha-2", "build", WorkflowStatus::Aborted, t0 + Duration::seconds(2)))
            .await
            .unwrap();
        repo.upsert_session(&session("beta-1", "fix", WorkflowStatus::Completed, t0 + Duration::seconds(1)))
            .await
            .unwrap();

        let all = repo.list_sessions(&SessionFilter::default()).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha-2", "beta-1", "alpha-1"]);

        let build = repo
            .list_sessions(&SessionFilter {
                workflow_id: Some("build".into()),
                session_prefix: None,
            })
            .await
            .unwrap();
        assert_eq!(build.len(), 2);

        let beta = repo
            .list_sessions(&SessionFilter {
                workflow_id: None,
                session_prefix: Some("beta".into()),
            })
            .await
            .unwrap();
        assert_eq!(beta.len(), 1);
        assert_eq!(beta[0].status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("durable.db").display());
        let rec = record("s1", PhaseLabel::PreWork, Utc::now());
        {
            let repo = SqliteCheckpointRepository::new(DatabasePool::new(&url).await.unwrap());
            repo.append_checkpoint(&rec).await.unwrap();
        }
        let repo = SqliteCheckpointRepository::new(DatabasePool::new(&url).await.unwrap());
        assert_eq!(repo.list_checkpoints("s1").await.unwrap(), vec![rec]);
    }
}
