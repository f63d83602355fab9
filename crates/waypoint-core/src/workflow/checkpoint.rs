//! Durable checkpoint store for workflow sessions.
//!
//! Wraps a `CheckpointRepository` to provide the higher-level API the
//! orchestrator and rollback coordinator build on: append-only records with
//! strictly increasing timestamps, optional version-control snapshots taken
//! under a timeout, label allocation, retention pruning, dirty-tree consent,
//! and the per-session "latest state" rows used for resumption.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashSet;
use thiserror::Error;
use uuid::Uuid;
use waypoint_types::checkpoint::{
    CheckpointMetrics, CheckpointRecord, PhaseLabel, ResumableSession, SessionFilter,
    SessionRecord,
};
use waypoint_types::error::RepositoryError;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::WorkflowStatus;

use crate::event::EventBus;
use crate::repository::CheckpointRepository;
use crate::vcs::BoxVcs;

use super::state::{StateError, WorkflowState};

/// Default bound on external snapshot creation.
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("checkpoint '{label}' not found for session '{session_id}' (available: {})", .available.join(", "))]
    NotFound {
        session_id: String,
        label: String,
        available: Vec<String>,
    },

    #[error("uncommitted changes in session '{session_id}' were not approved ({} file(s))", .files.len())]
    DirtyStateRejected {
        session_id: String,
        files: Vec<String>,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// Consent
// ---------------------------------------------------------------------------

/// What the engine is about to do when it asks for consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentPurpose {
    /// First checkpoint of a run (fresh or resumed).
    RunStart,
    /// Safety checkpoint ahead of a rollback.
    Rollback,
}

/// Passed to the consent callback when the working tree is dirty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    pub session_id: String,
    pub purpose: ConsentPurpose,
    /// Staged files, when the collaborator can list them.
    pub staged_files: Vec<String>,
}

/// Returns `true` to proceed despite uncommitted changes.
pub type ConsentCallback = Arc<dyn Fn(&ConsentRequest) -> bool + Send + Sync>;

/// Outcome of a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub sessions_scanned: usize,
    pub deleted: u64,
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Append-only checkpoint store.
///
/// Generic over `R: CheckpointRepository` so it works with any storage
/// backend (SQLite, in-memory, etc.).
pub struct CheckpointStore<R: CheckpointRepository> {
    repo: R,
    vcs: Arc<BoxVcs>,
    snapshot_timeout: Duration,
    consent: Option<ConsentCallback>,
    /// Sessions whose dirty tree has already been approved.
    consented: DashSet<String>,
    events: EventBus,
}

impl<R: CheckpointRepository> CheckpointStore<R> {
    /// Create a store with the no-op version-control collaborator.
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            vcs: Arc::new(BoxVcs::noop()),
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            consent: None,
            consented: DashSet::new(),
            events: EventBus::default(),
        }
    }

    pub fn with_vcs(mut self, vcs: Arc<BoxVcs>) -> Self {
        self.vcs = vcs;
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn with_consent(mut self, consent: ConsentCallback) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn vcs(&self) -> &BoxVcs {
        &self.vcs
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Consent
    // -----------------------------------------------------------------------

    /// Make sure uncommitted changes may be captured for this session.
    ///
    /// A clean tree needs no consent. A dirty tree needs an approving
    /// callback; without one the changes are rejected. Approval is cached per
    /// session; a denial is not, so the next call asks again.
    pub async fn ensure_consent(
        &self,
        session_id: &str,
        purpose: ConsentPurpose,
    ) -> Result<(), CheckpointError> {
        if self.consented.contains(session_id) {
            return Ok(());
        }

        let dirty = match self.vcs.has_uncommitted_changes().await {
            Ok(dirty) => dirty,
            Err(error) => {
                tracing::warn!(session_id, %error, "could not inspect working tree, assuming clean");
                false
            }
        };
        if !dirty {
            return Ok(());
        }

        let staged_files = self.vcs.list_staged_files().await.unwrap_or_else(|error| {
            tracing::warn!(session_id, %error, "could not list staged files");
            Vec::new()
        });

        let Some(consent) = &self.consent else {
            tracing::warn!(session_id, ?purpose, "working tree is dirty and no consent callback is set, refusing");
            return Err(CheckpointError::DirtyStateRejected {
                session_id: session_id.to_string(),
                files: staged_files,
            });
        };

        let request = ConsentRequest {
            session_id: session_id.to_string(),
            purpose,
            staged_files,
        };
        if consent(&request) {
            tracing::info!(session_id, ?purpose, "uncommitted changes approved");
            self.consented.insert(session_id.to_string());
            Ok(())
        } else {
            Err(CheckpointError::DirtyStateRejected {
                session_id: session_id.to_string(),
                files: request.staged_files,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// Append a record for `session_id`.
    ///
    /// The version-control snapshot runs under the snapshot timeout; failure
    /// or timeout still creates the record with no reference. `created_at`
    /// is forced strictly past the session's latest record.
    pub async fn create(
        &self,
        session_id: &str,
        phase_label: PhaseLabel,
        snapshot: serde_json::Value,
        metrics: CheckpointMetrics,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let message = format!("waypoint {session_id} {phase_label}");
        let vcs_reference =
            match tokio::time::timeout(self.snapshot_timeout, self.vcs.create_snapshot(&message))
                .await
            {
                Ok(Ok(reference)) => reference,
                Ok(Err(error)) => {
                    tracing::warn!(session_id, label = %phase_label, %error, "version-control snapshot failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        session_id,
                        label = %phase_label,
                        timeout_ms = self.snapshot_timeout.as_millis() as u64,
                        "version-control snapshot timed out"
                    );
                    None
                }
            };

        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(last) = self.repo.latest_checkpoint(session_id).await? {
            if created_at <= last.created_at {
                created_at = last.created_at + chrono::Duration::microseconds(1);
            }
        }

        let record = CheckpointRecord {
            id: Uuid::now_v7(),
            session_id: session_id.to_string(),
            phase_label,
            created_at,
            vcs_reference,
            metrics,
            snapshot,
        };
        self.repo.append_checkpoint(&record).await?;

        tracing::debug!(
            session_id,
            checkpoint_id = %record.id,
            label = %record.phase_label,
            vcs_reference = record.vcs_reference.as_deref().unwrap_or("-"),
            "checkpoint created"
        );
        self.events.publish(WorkflowEvent::CheckpointCreated {
            session_id: session_id.to_string(),
            checkpoint_id: record.id,
            phase_label: record.phase_label.to_string(),
            has_vcs_reference: record.vcs_reference.is_some(),
        });

        Ok(record)
    }

    /// Records of a session in creation order.
    pub async fn list(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        Ok(self.repo.list_checkpoints(session_id).await?)
    }

    /// The record with `label`, or `NotFound` listing the labels that exist.
    pub async fn get(
        &self,
        session_id: &str,
        label: &PhaseLabel,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let records = self.list(session_id).await?;
        if let Some(record) = records.iter().find(|r| &r.phase_label == label) {
            return Ok(record.clone());
        }
        Err(CheckpointError::NotFound {
            session_id: session_id.to_string(),
            label: label.to_string(),
            available: records.iter().map(|r| r.phase_label.to_string()).collect(),
        })
    }

    pub async fn get_by_id(&self, id: &Uuid) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.repo.get_checkpoint(id).await?)
    }

    pub async fn latest(&self, session_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.repo.latest_checkpoint(session_id).await?)
    }

    // -----------------------------------------------------------------------
    // Label allocation
    // -----------------------------------------------------------------------

    /// `phase-<k>` on the first pass, `phase-<k>.r<n>` with the first free
    /// revision afterwards.
    pub async fn next_phase_label(
        &self,
        session_id: &str,
        phase: usize,
    ) -> Result<PhaseLabel, CheckpointError> {
        let used = self.used_labels(session_id).await?;
        let revision = (0u32..)
            .find(|r| !used.contains(&PhaseLabel::Phase { index: phase, revision: *r }))
            .unwrap_or(0);
        Ok(PhaseLabel::Phase { index: phase, revision })
    }

    pub async fn next_safety_label(&self, session_id: &str) -> Result<PhaseLabel, CheckpointError> {
        self.next_seq_label(session_id, |seq| PhaseLabel::Safety { seq }).await
    }

    pub async fn next_aborted_label(&self, session_id: &str) -> Result<PhaseLabel, CheckpointError> {
        self.next_seq_label(session_id, |seq| PhaseLabel::Aborted { seq }).await
    }

    pub async fn next_restored_label(
        &self,
        session_id: &str,
        boundary: usize,
    ) -> Result<PhaseLabel, CheckpointError> {
        self.next_seq_label(session_id, |seq| PhaseLabel::Restored { seq, boundary })
            .await
    }

    /// `<seq>` starts at the number of records held and skips any value
    /// already taken (pruning can shrink the count).
    async fn next_seq_label(
        &self,
        session_id: &str,
        make: impl Fn(usize) -> PhaseLabel,
    ) -> Result<PhaseLabel, CheckpointError> {
        let used = self.used_labels(session_id).await?;
        let mut seq = used.len();
        while used.contains(&make(seq)) {
            seq += 1;
        }
        Ok(make(seq))
    }

    async fn used_labels(&self, session_id: &str) -> Result<HashSet<PhaseLabel>, CheckpointError> {
        Ok(self
            .list(session_id)
            .await?
            .into_iter()
            .map(|r| r.phase_label)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Delete records created before `older_than`, except the earliest and
    /// latest record of every session and its `keep_last_n` newest records.
    pub async fn prune(
        &self,
        older_than: DateTime<Utc>,
        keep_last_n: usize,
    ) -> Result<PruneReport, CheckpointError> {
        let mut report = PruneReport::default();
        for session_id in self.repo.list_checkpoint_sessions().await? {
            report.sessions_scanned += 1;
            let records = self.list(&session_id).await?;
            let len = records.len();
            let keep_from = len.saturating_sub(keep_last_n.max(1));

            let doomed: Vec<Uuid> = records
                .iter()
                .enumerate()
                .filter(|(i, r)| *i != 0 && *i < keep_from && r.created_at < older_than)
                .map(|(_, r)| r.id)
                .collect();
            if doomed.is_empty() {
                continue;
            }

            let deleted = self.repo.delete_checkpoints(&doomed).await?;
            tracing::debug!(session_id = %session_id, deleted, "pruned checkpoints");
            report.deleted += deleted;
        }

        tracing::info!(
            sessions = report.sessions_scanned,
            deleted = report.deleted,
            "checkpoint retention pass finished"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Persist the latest state of a session.
    pub async fn save_state(&self, state: &WorkflowState) -> Result<(), CheckpointError> {
        let now = Utc::now();
        let session = SessionRecord {
            session_id: state.session_id.clone(),
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            state: state.to_json()?,
            started_at: now,
            updated_at: now,
        };
        self.repo.upsert_session(&session).await?;
        tracing::debug!(session_id = %state.session_id, status = %state.status, "session state saved");
        Ok(())
    }

    pub async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CheckpointError> {
        Ok(self.repo.get_session(session_id).await?)
    }

    /// Sessions that have not completed, newest first.
    ///
    /// Aborted sessions are included: their failed stage can run again.
    pub async fn list_resumable(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<ResumableSession>, CheckpointError> {
        let mut resumable = Vec::new();
        for session in self.repo.list_sessions(filter).await? {
            if session.status == WorkflowStatus::Completed {
                continue;
            }
            let last_phase = self
                .repo
                .latest_checkpoint(&session.session_id)
                .await?
                .map(|r| r.phase_label);
            resumable.push(ResumableSession {
                session_id: session.session_id,
                workflow_id: session.workflow_id,
                last_phase,
                timestamp: session.updated_at,
                status: session.status,
            });
        }
        Ok(resumable)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
