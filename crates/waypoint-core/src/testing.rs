//! Scripted fakes shared by the orchestrator, checkpoint, and rollback tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;
use waypoint_types::checkpoint::{CheckpointRecord, SessionFilter, SessionRecord};
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{StageDefinition, WorkflowDefinition};

use crate::repository::{CheckpointRepository, InMemoryCheckpointRepository};
use crate::vcs::{DiffSummary, VcsError, VersionControlCheckpointer};
use crate::workflow::stage::{Stage, StageError, StageOutcome};
use crate::workflow::state::WorkflowState;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

pub fn stage(id: &str, depends_on: &[&str]) -> StageDefinition {
    StageDefinition {
        id: id.to_string(),
        handler: id.to_string(),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        retryable: true,
        max_retries: 0,
        optional: false,
        timeout_secs: None,
        allow_skipped_deps: false,
        params: None,
    }
}

pub fn definition(id: &str, stages: Vec<StageDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        timeout_secs: None,
        stages,
        metadata: Default::default(),
    }
}

// ---------------------------------------------------------------------------
// ScriptedStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(&'static str),
    Sleep(Duration),
}

/// Plays back a script of attempt outcomes, then succeeds forever.
///
/// On success it records its stage ID under `context.visited` and reports
/// one changed file with ten added lines.
#[derive(Clone, Default)]
pub struct ScriptedStage {
    script: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<AtomicU32>,
    reject_inputs: bool,
}

impl ScriptedStage {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            ..Self::default()
        }
    }

    pub fn failing(times: usize) -> Self {
        Self::with_script(std::iter::repeat_n(Step::Fail("boom"), times))
    }

    pub fn rejecting_inputs() -> Self {
        Self {
            reject_inputs: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Stage for ScriptedStage {
    async fn execute(
        &self,
        definition: &StageDefinition,
        state: &WorkflowState,
    ) -> Result<StageOutcome, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .map(|mut s| s.pop_front())
            .unwrap_or(None)
            .unwrap_or(Step::Succeed);

        match step {
            Step::Fail(msg) => return Err(StageError::Execution(msg.to_string())),
            Step::Sleep(d) => tokio::time::sleep(d).await,
            Step::Succeed => {}
        }

        let mut context = state.context.clone();
        if !context.is_object() {
            context = json!({});
        }
        let visited = context
            .get("visited")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut visited = visited;
        visited.push(json!(definition.id));
        context["visited"] = json!(visited);

        Ok(StageOutcome {
            context,
            output: Some(json!({"files_changed": 1, "lines_added": 10})),
        })
    }

    fn validate_inputs(&self, _definition: &StageDefinition, _state: &WorkflowState) -> bool {
        !self.reject_inputs
    }
}

// ---------------------------------------------------------------------------
// FakeVcs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct VcsState {
    dirty: bool,
    staged: Vec<String>,
    snapshots: u32,
    fail_snapshots: bool,
    snapshot_delay: Option<Duration>,
    failing_reset: Option<String>,
    resets: Vec<String>,
    diff: DiffSummary,
}

/// In-memory version-control collaborator. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeVcs {
    state: Arc<Mutex<VcsState>>,
}

impl FakeVcs {
    fn with<T>(&self, f: impl FnOnce(&mut VcsState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn set_dirty(&self, dirty: bool, staged: Vec<String>) {
        self.with(|s| {
            s.dirty = dirty;
            s.staged = staged;
        });
    }

    pub fn set_fail_snapshots(&self, fail: bool) {
        self.with(|s| s.fail_snapshots = fail);
    }

    pub fn set_snapshot_delay(&self, delay: Option<Duration>) {
        self.with(|s| s.snapshot_delay = delay);
    }

    /// Make `reset_to(reference)` fail for this one reference.
    pub fn fail_reset_to(&self, reference: &str) {
        self.with(|s| s.failing_reset = Some(reference.to_string()));
    }

    pub fn set_diff(&self, diff: DiffSummary) {
        self.with(|s| s.diff = diff);
    }

    pub fn snapshot_count(&self) -> u32 {
        self.with(|s| s.snapshots)
    }

    /// References passed to successful `reset_to` calls, oldest first.
    pub fn resets(&self) -> Vec<String> {
        self.with(|s| s.resets.clone())
    }
}

impl VersionControlCheckpointer for FakeVcs {
    fn name(&self) -> &str {
        "fake"
    }

    async fn has_uncommitted_changes(&self) -> Result<bool, VcsError> {
        Ok(self.with(|s| s.dirty))
    }

    async fn create_snapshot(&self, _message: &str) -> Result<Option<String>, VcsError> {
        if let Some(delay) = self.with(|s| s.snapshot_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.fail_snapshots {
                return Err(VcsError::Unavailable("snapshots disabled".to_string()));
            }
            s.snapshots += 1;
            Ok(Some(format!("ref-{}", s.snapshots)))
        })
    }

    async fn reset_to(&self, reference: &str) -> Result<(), VcsError> {
        self.with(|s| {
            if s.failing_reset.as_deref() == Some(reference) {
                return Err(VcsError::Command {
                    command: format!("reset {reference}"),
                    message: "simulated failure".to_string(),
                });
            }
            s.resets.push(reference.to_string());
            Ok(())
        })
    }

    async fn list_staged_files(&self) -> Result<Vec<String>, VcsError> {
        Ok(self.with(|s| s.staged.clone()))
    }

    async fn diff_summary(&self, _reference: &str) -> Result<DiffSummary, VcsError> {
        Ok(self.with(|s| s.diff.clone()))
    }
}

// ---------------------------------------------------------------------------
// FlakyRepository
// ---------------------------------------------------------------------------

/// In-memory repository whose appends start failing once armed.
#[derive(Clone, Default)]
pub struct FlakyRepository {
    inner: InMemoryCheckpointRepository,
    /// Appends still allowed before failing; `None` never fails.
    appends_left: Arc<Mutex<Option<u32>>>,
}

impl FlakyRepository {
    /// Let `n` more appends through, then fail every append.
    pub fn fail_appends_after(&self, n: u32) {
        *self.appends_left.lock().unwrap_or_else(|e| e.into_inner()) = Some(n);
    }
}

impl CheckpointRepository for FlakyRepository {
    async fn append_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let allowed = {
            let mut left = self.appends_left.lock().unwrap_or_else(|e| e.into_inner());
            match left.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            }
        };
        if !allowed {
            return Err(RepositoryError::Query("disk full".to_string()));
        }
        self.inner.append_checkpoint(record).await
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<CheckpointRecord>, RepositoryError> {
        self.inner.list_checkpoints(session_id).await
    }

    async fn get_checkpoint(&self, id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
        self.inner.get_checkpoint(id).await
    }

    async fn latest_checkpoint(&self, session_id: &str) -> Result<Option<CheckpointRecord>, RepositoryError> {
        self.inner.latest_checkpoint(session_id).await
    }

    async fn list_checkpoint_sessions(&self) -> Result<Vec<String>, RepositoryError> {
        self.inner.list_checkpoint_sessions().await
    }

    async fn delete_checkpoints(&self, ids: &[Uuid]) -> Result<u64, RepositoryError> {
        self.inner.delete_checkpoints(ids).await
    }

    async fn upsert_session(&self, session: &SessionRecord) -> Result<(), RepositoryError> {
        self.inner.upsert_session(session).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, RepositoryError> {
        self.inner.get_session(session_id).await
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, RepositoryError> {
        self.inner.list_sessions(filter).await
    }
}
