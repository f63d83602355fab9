//! In-memory `CheckpointRepository` for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;
use waypoint_types::checkpoint::{CheckpointRecord, SessionFilter, SessionRecord};
use waypoint_types::error::RepositoryError;

use super::CheckpointRepository;

#[derive(Debug, Default)]
struct Inner {
    /// Records in insertion order.
    records: Vec<CheckpointRecord>,
    sessions: HashMap<String, SessionRecord>,
}

/// A process-local repository. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointRepository {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryCheckpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, RepositoryError> {
        self.inner
            .lock()
            .map_err(|_| RepositoryError::Query("repository lock poisoned".to_string()))
    }
}

fn sorted(mut records: Vec<CheckpointRecord>) -> Vec<CheckpointRecord> {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    records
}

impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn append_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let duplicate = inner.records.iter().any(|r| {
            r.id == record.id
                || (r.session_id == record.session_id && r.phase_label == record.phase_label)
        });
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint '{}' already exists for session '{}'",
                record.phase_label, record.session_id
            )));
        }
        inner.records.push(record.clone());
        Ok(())
    }

    async fn list_checkpoints(
        &self,
        session_id: &str,
    ) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(sorted(
            inner
                .records
                .iter()
                .filter(|r| r.session_id == session_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner.records.iter().find(|r| r.id == *id).cloned())
    }

    async fn latest_checkpoint(
        &self,
        session_id: &str,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(self.list_checkpoints(session_id).await?.pop())
    }

    async fn list_checkpoint_sessions(&self) -> Result<Vec<String>, RepositoryError> {
        let inner = self.lock()?;
        let mut ids: Vec<String> = inner.records.iter().map(|r| r.session_id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn delete_checkpoints(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        let mut inner = self.lock()?;
        let before = inner.records.len();
        inner.records.retain(|r| !ids.contains(&r.id));
        Ok((before - inner.records.len()) as u64)
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), RepositoryError> {
        let mut inner = self.lock()?;
        let mut row = session.clone();
        if let Some(existing) = inner.sessions.get(&session.session_id) {
            row.started_at = existing.started_at;
        }
        inner.sessions.insert(row.session_id.clone(), row);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, RepositoryError> {
        let inner = self.lock()?;
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, RepositoryError> {
        let inner = self.lock()?;
        let mut sessions: Vec<SessionRecord> = inner
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }
}
