//! Rollback target parsing, resolution, preview, and crash-safe restoration.
//!
//! A rollback always takes a safety checkpoint of the current state first.
//! If any later step fails (the version-control reset, or persisting the
//! restored state), the working tree is put back to the safety reference and
//! the session row is rewritten from the safety snapshot before the error is
//! returned.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;
use waypoint_types::checkpoint::{CheckpointMetrics, CheckpointRecord, PhaseLabel, RollbackTarget};
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{StageStatus, WorkflowStatus};

use crate::repository::CheckpointRepository;
use crate::vcs::{DiffSummary, VcsError};

use super::checkpoint::{CheckpointError, CheckpointStore, ConsentPurpose};
use super::state::{StateError, WorkflowState};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("cannot parse rollback target '{input}': {reason}")]
    Parse { input: String, reason: String },

    #[error("no checkpoint for rollback target '{target}' (available: {})", .available.join(", "))]
    CheckpointNotFound {
        target: String,
        available: Vec<String>,
    },

    #[error("session '{0}' has no recorded state")]
    NoState(String),

    #[error("rollback failed: {reason} (state restored from safety checkpoint {safety_checkpoint_id})")]
    Failed {
        reason: String,
        safety_checkpoint_id: Uuid,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("version-control reset failed: {0}")]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// Target parsing
// ---------------------------------------------------------------------------

/// Parse free text into a rollback target.
///
/// Accepts `complete`, `phase-<n>` and `phases-<n>-<m>`, case-insensitively,
/// with an optional leading `rollback` word. Spaces and dashes are
/// interchangeable (`"Rollback phase 1"`, `"phases 2 to 4"`).
pub fn parse_target(text: &str) -> Result<RollbackTarget, RollbackError> {
    let fail = |reason: &str| RollbackError::Parse {
        input: text.to_string(),
        reason: reason.to_string(),
    };

    let lowered = text.trim().to_lowercase();
    let normalized = lowered.replace(['-', '_'], " ");
    let mut tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.first() == Some(&"rollback") {
        tokens.remove(0);
    }
    tokens.retain(|t| !matches!(*t, "to" | "through"));

    let number = |t: &str| -> Result<usize, RollbackError> {
        let n = t
            .parse::<usize>()
            .map_err(|_| fail(&format!("'{t}' is not a phase number")))?;
        if n == 0 {
            return Err(fail("phase numbers start at 1"));
        }
        Ok(n)
    };

    match tokens.as_slice() {
        ["complete"] => Ok(RollbackTarget::Complete),
        ["phase", n] => Ok(RollbackTarget::SinglePhase(number(*n)?)),
        ["phases" | "phase", n, m] => {
            let (n, m) = (number(*n)?, number(*m)?);
            if n > m {
                return Err(fail(&format!("range start {n} is after end {m}")));
            }
            Ok(RollbackTarget::PhaseRange(n, m))
        }
        [] => Err(fail("empty target")),
        _ => Err(fail("expected 'complete', 'phase-<n>' or 'phases-<n>-<m>'")),
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Boundary records of the session's current timeline, keyed by phase.
///
/// Later records for a phase supersede earlier ones; a rollback to boundary
/// `b` discards every boundary after `b`.
fn timeline(records: &[CheckpointRecord]) -> BTreeMap<usize, &CheckpointRecord> {
    let mut map = BTreeMap::new();
    for record in records {
        match record.phase_label {
            PhaseLabel::PreWork => {
                map.insert(0, record);
            }
            PhaseLabel::Phase { index, .. } => {
                map.insert(index, record);
            }
            PhaseLabel::Restored { boundary, .. } => {
                map.retain(|phase, _| *phase <= boundary);
            }
            PhaseLabel::Safety { .. } | PhaseLabel::Aborted { .. } => {}
        }
    }
    map
}

fn available_from(timeline: &BTreeMap<usize, &CheckpointRecord>) -> Vec<String> {
    let mut available = Vec::new();
    if timeline.contains_key(&0) {
        available.push("complete".to_string());
    }
    available.extend(
        timeline
            .keys()
            .filter(|phase| **phase > 0)
            .map(|phase| format!("phase-{phase}")),
    );
    available
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Read-only impact summary of a rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackPreview {
    pub session_id: String,
    pub target_checkpoint_id: Uuid,
    pub target_label: PhaseLabel,
    /// Phases up to and including this one are kept.
    pub boundary: usize,
    /// Stages that are not `Pending` now and would be reset.
    pub stages_to_reset: Vec<String>,
    /// Files that would change, when the target has a version-control reference.
    pub diff: Option<DiffSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub safety_checkpoint_id: Uuid,
    pub target_checkpoint_id: Uuid,
    pub restored_checkpoint_id: Uuid,
    pub stages_reset: Vec<String>,
    pub state: WorkflowState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    /// The caller did not confirm; nothing changed.
    NotConfirmed,
    Applied(RollbackReport),
}

// ---------------------------------------------------------------------------
// RollbackCoordinator
// ---------------------------------------------------------------------------

pub struct RollbackCoordinator<R: CheckpointRepository> {
    store: Arc<CheckpointStore<R>>,
}

impl<R: CheckpointRepository> RollbackCoordinator<R> {
    pub fn new(store: Arc<CheckpointStore<R>>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CheckpointStore<R> {
        &self.store
    }

    /// Targets that currently resolve: `complete` plus `phase-<k>` for each
    /// phase with a boundary record on the current timeline.
    pub async fn available_targets(&self, session_id: &str) -> Result<Vec<String>, RollbackError> {
        let records = self.store.list(session_id).await?;
        Ok(available_from(&timeline(&records)))
    }

    /// Map a target to the checkpoint it restores.
    ///
    /// `Complete` restores pre-work. `SinglePhase(n)` and `PhaseRange(n, m)`
    /// restore the boundary before phase `n`; phase `n` (and `m`) must
    /// themselves have boundary records.
    pub async fn resolve(
        &self,
        session_id: &str,
        target: RollbackTarget,
    ) -> Result<CheckpointRecord, RollbackError> {
        let records = self.store.list(session_id).await?;
        let timeline = timeline(&records);
        let not_found = || RollbackError::CheckpointNotFound {
            target: target.to_string(),
            available: available_from(&timeline),
        };

        let required: Vec<usize> = match target {
            RollbackTarget::Complete => vec![0],
            RollbackTarget::SinglePhase(n) => vec![n],
            RollbackTarget::PhaseRange(n, m) => {
                if n == 0 || n > m {
                    return Err(RollbackError::Parse {
                        input: target.to_string(),
                        reason: "range must satisfy 1 <= n <= m".to_string(),
                    });
                }
                vec![n, m]
            }
        };
        if required.iter().any(|phase| !timeline.contains_key(phase)) {
            return Err(not_found());
        }

        let boundary = target.first_phase().saturating_sub(1);
        timeline
            .get(&boundary)
            .map(|record| (*record).clone())
            .ok_or_else(not_found)
    }

    /// Parse and resolve in one step.
    pub async fn resolve_text(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<CheckpointRecord, RollbackError> {
        self.resolve(session_id, parse_target(text)?).await
    }

    /// Latest state of a session: its session row, or failing that the
    /// snapshot of its most recent record.
    pub async fn current_state(&self, session_id: &str) -> Result<WorkflowState, RollbackError> {
        if let Some(session) = self.store.load_session(session_id).await? {
            return Ok(WorkflowState::from_json(session.state)?);
        }
        match self.store.latest(session_id).await? {
            Some(record) => Ok(WorkflowState::from_json(record.snapshot)?),
            None => Err(RollbackError::NoState(session_id.to_string())),
        }
    }

    pub async fn preview(&self, record: &CheckpointRecord) -> Result<RollbackPreview, RollbackError> {
        let current = self.current_state(&record.session_id).await?;
        let boundary = boundary_of(record)?;
        let stages_to_reset = current
            .stages_after(boundary)
            .into_iter()
            .filter(|id| current.stage_status(id) != Some(StageStatus::Pending))
            .collect();

        let diff = match &record.vcs_reference {
            Some(reference) => match self.store.vcs().diff_summary(reference).await {
                Ok(diff) => Some(diff),
                Err(error) => {
                    tracing::warn!(session_id = %record.session_id, %error, "diff summary unavailable");
                    None
                }
            },
            None => None,
        };

        Ok(RollbackPreview {
            session_id: record.session_id.clone(),
            target_checkpoint_id: record.id,
            target_label: record.phase_label.clone(),
            boundary,
            stages_to_reset,
            diff,
        })
    }

    /// Apply a rollback to `record`.
    ///
    /// Steps, in order: safety checkpoint of the current state, version-control
    /// reset, state restore, reset of every stage after the boundary. The
    /// target snapshot is decoded before anything changes. Any failure after
    /// the safety checkpoint puts the tree and the session back to the safety
    /// state and returns `Failed`.
    pub async fn execute(
        &self,
        record: &CheckpointRecord,
        confirmed: bool,
    ) -> Result<RollbackOutcome, RollbackError> {
        let session_id = record.session_id.as_str();
        if !confirmed {
            tracing::warn!(session_id, target = %record.phase_label, "rollback not confirmed, nothing applied");
            return Ok(RollbackOutcome::NotConfirmed);
        }

        let boundary = boundary_of(record)?;
        let target = WorkflowState::from_json(record.snapshot.clone())?;

        self.store
            .ensure_consent(session_id, ConsentPurpose::Rollback)
            .await?;

        // 1. Safety checkpoint.
        let current = self.current_state(session_id).await?;
        let safety_label = self.store.next_safety_label(session_id).await?;
        let safety = self
            .store
            .create(session_id, safety_label, current.to_json()?, CheckpointMetrics::default())
            .await?;

        // 2-4. Everything past this point is undone on failure.
        let (state, stages_reset, restored) = match self.apply(record, target, boundary).await {
            Ok(applied) => applied,
            Err(error) => {
                tracing::error!(session_id, target = %record.phase_label, %error, "rollback failed, restoring safety checkpoint");
                self.recover_from_safety(&safety, &current).await;
                return Err(RollbackError::Failed {
                    reason: error.to_string(),
                    safety_checkpoint_id: safety.id,
                });
            }
        };

        tracing::info!(
            session_id,
            target = %record.phase_label,
            safety_checkpoint_id = %safety.id,
            stages_reset = stages_reset.len(),
            "rollback applied"
        );
        self.store.events().publish(WorkflowEvent::RollbackApplied {
            session_id: session_id.to_string(),
            target_checkpoint_id: record.id,
            safety_checkpoint_id: safety.id,
            stages_reset: stages_reset.len(),
        });

        Ok(RollbackOutcome::Applied(RollbackReport {
            safety_checkpoint_id: safety.id,
            target_checkpoint_id: record.id,
            restored_checkpoint_id: restored.id,
            stages_reset,
            state,
        }))
    }

    /// Version-control reset, state restore, and the `restored` record.
    async fn apply(
        &self,
        record: &CheckpointRecord,
        mut state: WorkflowState,
        boundary: usize,
    ) -> Result<(WorkflowState, Vec<String>, CheckpointRecord), RollbackError> {
        let session_id = record.session_id.as_str();

        match &record.vcs_reference {
            Some(reference) => self.store.vcs().reset_to(reference).await?,
            None => {
                tracing::warn!(session_id, target = %record.phase_label, "target has no version-control reference, working tree left as is");
            }
        }

        let stages_reset = state.reset_after(boundary);
        state.status = WorkflowStatus::WaitingForResume;

        let restored_label = self.store.next_restored_label(session_id, boundary).await?;
        let restored = self
            .store
            .create(session_id, restored_label, state.to_json()?, CheckpointMetrics::default())
            .await?;
        self.store.save_state(&state).await?;
        Ok((state, stages_reset, restored))
    }

    async fn recover_from_safety(&self, safety: &CheckpointRecord, current: &WorkflowState) {
        let session_id = safety.session_id.as_str();
        if let Some(reference) = &safety.vcs_reference {
            if let Err(error) = self.store.vcs().reset_to(reference).await {
                tracing::error!(session_id, reference = reference.as_str(), %error, "could not reset working tree to safety reference");
            }
        }
        if let Err(error) = self.store.save_state(current).await {
            tracing::error!(session_id, %error, "could not persist safety state");
        }
    }

    /// Restore the latest boundary record of a session without a safety
    /// checkpoint. Used by the orchestrator when a required stage fails.
    ///
    /// The version-control reset is best effort.
    pub async fn restore_last_checkpoint(
        &self,
        session_id: &str,
    ) -> Result<(WorkflowState, CheckpointRecord), RollbackError> {
        let record = self
            .store
            .list(session_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| r.phase_label.boundary().is_some())
            .ok_or_else(|| RollbackError::NoState(session_id.to_string()))?;

        if let Some(reference) = &record.vcs_reference {
            if let Err(error) = self.store.vcs().reset_to(reference).await {
                tracing::warn!(session_id, reference = reference.as_str(), %error, "version-control reset failed during restore");
            }
        }

        let state = WorkflowState::from_json(record.snapshot.clone())?;
        tracing::info!(session_id, checkpoint = %record.phase_label, "restored last checkpoint");
        Ok((state, record))
    }
}

/// Phase boundary a record stands for. Records without a fixed boundary
/// fall back to the settled prefix of their snapshot.
fn boundary_of(record: &CheckpointRecord) -> Result<usize, RollbackError> {
    match record.phase_label.boundary() {
        Some(boundary) => Ok(boundary),
        None => Ok(WorkflowState::from_json(record.snapshot.clone())?.settled_prefix()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
