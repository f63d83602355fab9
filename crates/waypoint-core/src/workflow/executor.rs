//! Workflow orchestrator: sequential DAG execution with durable checkpointing.
//!
//! The `WorkflowOrchestrator` walks stages in their deterministic topological
//! order. Each stage runs under its timeout with exponential-backoff retries;
//! every boundary (success or skip) is checkpointed so that an interrupted
//! session resumes at the first unsettled stage.
//!
//! # Execution flow
//!
//! 1. Validate the definition, compute the order, resolve every handler.
//! 2. Create the session state and write the `pre-work` checkpoint.
//! 3. For each stage: check cancellation and the workflow deadline, gate on
//!    dependencies, run `validate_inputs`, then attempt with retries.
//! 4. Success or optional failure: checkpoint `phase-<k>` and continue.
//! 5. Required failure: restore the last boundary, mark the session
//!    `Aborted`, and raise `WorkflowFailure`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_types::checkpoint::{CheckpointMetrics, PhaseLabel};
use waypoint_types::config::EngineConfig;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    StageAttempt, StageDefinition, StageStatus, WorkflowDefinition, WorkflowStatus,
};

use crate::repository::CheckpointRepository;

use super::checkpoint::{CheckpointError, CheckpointStore, ConsentPurpose};
use super::dag::{self, DagError};
use super::definition::{self, DefinitionError};
use super::retry::RetryHandler;
use super::rollback::{RollbackCoordinator, RollbackError};
use super::stage::{BoxStage, StageError, StageRegistry};
use super::state::{StateError, WorkflowState};

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Start a new session. A fresh session ID is generated when none is given.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        session_id: Option<String>,
        context: Value,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Continue a session from its latest checkpoint.
    fn resume(
        &self,
        definition: &WorkflowDefinition,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Ask a running session to stop before its next stage.
    fn cancel(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<(), ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Result of a completed (or paused) session run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub session_id: String,
    pub status: WorkflowStatus,
    pub state: WorkflowState,
    /// Stage IDs that succeeded, in execution order.
    pub completed_stages: Vec<String>,
    pub skipped_stages: Vec<String>,
}

impl ExecutionResult {
    fn from_state(state: WorkflowState) -> Self {
        let with_status = |status: StageStatus| -> Vec<String> {
            state
                .order
                .iter()
                .filter(|id| state.stage_status(id) == Some(status))
                .cloned()
                .collect()
        };
        let completed_stages = with_status(StageStatus::Succeeded);
        let skipped_stages = with_status(StageStatus::Skipped);
        Self {
            session_id: state.session_id.clone(),
            status: state.status,
            completed_stages,
            skipped_stages,
            state,
        }
    }
}

/// How a pass over the stages ended without an error.
enum RunEnd {
    Completed,
    Paused(String),
}

// ---------------------------------------------------------------------------
// WorkflowOrchestrator
// ---------------------------------------------------------------------------

/// Sequential orchestrator with durable checkpointing.
///
/// Generic over `R: CheckpointRepository` for storage flexibility.
pub struct WorkflowOrchestrator<R: CheckpointRepository> {
    store: Arc<CheckpointStore<R>>,
    rollback: RollbackCoordinator<R>,
    registry: Arc<StageRegistry>,
    config: EngineConfig,
    /// Cancellation tokens keyed by session ID.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl<R: CheckpointRepository> WorkflowOrchestrator<R> {
    pub fn new(
        store: Arc<CheckpointStore<R>>,
        registry: Arc<StageRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            rollback: RollbackCoordinator::new(store.clone()),
            store,
            registry,
            config,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn store(&self) -> &CheckpointStore<R> {
        &self.store
    }

    pub fn rollback(&self) -> &RollbackCoordinator<R> {
        &self.rollback
    }

    /// Validate, order, and resolve handlers. Nothing runs if this fails.
    fn prepare(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(Vec<String>, HashMap<String, Arc<BoxStage>>), ExecutorError> {
        definition::validate_definition(definition)?;
        let order = dag::compute_execution_order(&definition.stages)?;
        let handlers = self.registry.resolve_all(definition)?;
        Ok((order, handlers))
    }

    fn publish(&self, event: WorkflowEvent) {
        self.store.events().publish(event);
    }

    /// Run the session to completion, pause, or abort.
    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        mut state: WorkflowState,
        handlers: &HashMap<String, Arc<BoxStage>>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let session_id = state.session_id.clone();
        let token = CancellationToken::new();
        self.cancellation_tokens
            .insert(session_id.clone(), token.clone());

        let deadline = definition
            .timeout_secs
            .or(self.config.workflow_timeout_secs)
            .map(|secs| Instant::now() + Duration::from_secs(secs));

        let run_start = std::time::Instant::now();
        let result = self
            .run_stages(definition, &mut state, handlers, &token, deadline)
            .await;

        self.cancellation_tokens.remove(&session_id);

        match result? {
            RunEnd::Completed => {
                state.status = WorkflowStatus::Completed;
                state.current_stage = None;
                self.store.save_state(&state).await?;

                let stages_succeeded = state.count_with_status(StageStatus::Succeeded);
                let stages_skipped = state.count_with_status(StageStatus::Skipped);
                tracing::info!(
                    session_id = %session_id,
                    stages_succeeded,
                    stages_skipped,
                    "workflow completed"
                );
                self.publish(WorkflowEvent::RunCompleted {
                    session_id,
                    duration_ms: run_start.elapsed().as_millis() as u64,
                    stages_succeeded,
                    stages_skipped,
                });
            }
            RunEnd::Paused(reason) => {
                state.status = WorkflowStatus::WaitingForResume;
                self.store.save_state(&state).await?;
                tracing::info!(session_id = %session_id, reason = reason.as_str(), "workflow paused");
                self.publish(WorkflowEvent::RunPaused { session_id, reason });
            }
        }

        Ok(ExecutionResult::from_state(state))
    }

    async fn run_stages(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        handlers: &HashMap<String, Arc<BoxStage>>,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<RunEnd, ExecutorError> {
        let order = state.order.clone();
        for (index, stage_id) in order.iter().enumerate() {
            let phase = index + 1;
            if state.stage_status(stage_id).is_some_and(StageStatus::is_settled) {
                continue;
            }

            if token.is_cancelled() {
                return Ok(RunEnd::Paused("cancelled".to_string()));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return self.pause_on_timeout(state).await;
            }

            let stage = definition
                .stage(stage_id)
                .ok_or_else(|| ExecutorError::DefinitionMismatch {
                    session_id: state.session_id.clone(),
                    reason: format!("stage '{stage_id}' is not declared"),
                })?;
            let handler = handlers
                .get(stage_id)
                .ok_or_else(|| StageError::UnknownHandler {
                    stage_id: stage_id.clone(),
                    handler: stage.handler.clone(),
                })?;

            if let Some(dependency) = unsatisfied_dependency(stage, state) {
                if stage.optional {
                    let reason = format!("dependency '{dependency}' not satisfied");
                    self.skip_stage(state, stage, phase, &reason).await?;
                    continue;
                }
                return self.abort_on_dependency(state, stage, &dependency).await;
            }

            self.run_stage(state, stage, handler, phase, deadline).await?;
        }
        Ok(RunEnd::Completed)
    }

    /// One stage: input validation, then attempts until success or exhaustion.
    async fn run_stage(
        &self,
        state: &mut WorkflowState,
        stage: &StageDefinition,
        handler: &BoxStage,
        phase: usize,
        deadline: Option<Instant>,
    ) -> Result<(), ExecutorError> {
        let session_id = state.session_id.clone();
        state.begin_stage(&stage.id, Utc::now())?;
        self.store.save_state(state).await?;

        if !handler.validate_inputs(stage, state) {
            tracing::warn!(session_id = %session_id, stage_id = %stage.id, "stage input validation failed");
            return self
                .handle_exhausted(state, stage, phase, "input validation failed".to_string())
                .await;
        }

        let stage_timeout = stage.timeout(self.config.default_stage_timeout_secs);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.publish(WorkflowEvent::StageStarted {
                session_id: session_id.clone(),
                stage_id: stage.id.clone(),
                phase,
                attempt,
            });
            tracing::debug!(session_id = %session_id, stage_id = %stage.id, attempt, "stage attempt started");

            let attempt_timeout = match deadline {
                Some(d) => stage_timeout.min(d.saturating_duration_since(Instant::now())),
                None => stage_timeout,
            };
            let started_at = Utc::now();
            let result = match tokio::time::timeout(attempt_timeout, handler.execute(stage, state)).await {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout(attempt_timeout)),
            };
            let ended_at = Utc::now();

            let error = match result {
                Ok(outcome) => match state.replace_context(outcome.context) {
                    Ok(()) => {
                        state.record_attempt(
                            &stage.id,
                            StageAttempt {
                                attempt,
                                started_at,
                                ended_at,
                                error: None,
                            },
                        )?;
                        return self.finish_stage(state, stage, phase, outcome.output).await;
                    }
                    Err(e) => e.to_string(),
                },
                Err(e) => e.to_string(),
            };

            state.record_attempt(
                &stage.id,
                StageAttempt {
                    attempt,
                    started_at,
                    ended_at,
                    error: Some(error.clone()),
                },
            )?;

            let out_of_time = deadline.is_some_and(|d| Instant::now() >= d);
            let will_retry = RetryHandler::should_retry(stage, attempt) && !out_of_time;
            tracing::warn!(
                session_id = %session_id,
                stage_id = %stage.id,
                attempt,
                will_retry,
                error = error.as_str(),
                "stage attempt failed"
            );
            self.publish(WorkflowEvent::StageFailed {
                session_id: session_id.clone(),
                stage_id: stage.id.clone(),
                attempt,
                error: error.clone(),
                will_retry,
            });

            if !will_retry {
                return self.handle_exhausted(state, stage, phase, error).await;
            }

            self.store.save_state(state).await?;
            let delay = RetryHandler::backoff_delay(
                attempt,
                self.config.backoff_base(),
                self.config.backoff_ceiling(),
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn finish_stage(
        &self,
        state: &mut WorkflowState,
        stage: &StageDefinition,
        phase: usize,
        output: Option<Value>,
    ) -> Result<(), ExecutorError> {
        state.complete_stage(&stage.id, output, Utc::now())?;

        let result = state.stage(&stage.id);
        let duration = result
            .and_then(|r| r.duration())
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default();
        let metrics = metrics_from(result.and_then(|r| r.output.as_ref()), duration);

        self.checkpoint_phase(state, phase, metrics).await?;

        tracing::info!(
            session_id = %state.session_id,
            stage_id = %stage.id,
            phase,
            duration_ms = duration.as_millis() as u64,
            "stage succeeded"
        );
        self.publish(WorkflowEvent::StageCompleted {
            session_id: state.session_id.clone(),
            stage_id: stage.id.clone(),
            phase,
            duration_ms: duration.as_millis() as u64,
        });
        Ok(())
    }

    async fn skip_stage(
        &self,
        state: &mut WorkflowState,
        stage: &StageDefinition,
        phase: usize,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        state.skip_stage(&stage.id, reason, Utc::now())?;
        self.checkpoint_phase(state, phase, CheckpointMetrics::default())
            .await?;

        tracing::warn!(session_id = %state.session_id, stage_id = %stage.id, reason, "optional stage skipped");
        self.publish(WorkflowEvent::StageSkipped {
            session_id: state.session_id.clone(),
            stage_id: stage.id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Boundary checkpoint after phase `phase`, then persist the session row.
    async fn checkpoint_phase(
        &self,
        state: &WorkflowState,
        phase: usize,
        metrics: CheckpointMetrics,
    ) -> Result<(), ExecutorError> {
        let label = self
            .store
            .next_phase_label(&state.session_id, phase)
            .await?;
        self.store
            .create(&state.session_id, label, state.to_json()?, metrics)
            .await?;
        self.store.save_state(state).await?;
        Ok(())
    }

    /// Attempts are exhausted (or inputs were rejected).
    async fn handle_exhausted(
        &self,
        state: &mut WorkflowState,
        stage: &StageDefinition,
        phase: usize,
        error: String,
    ) -> Result<(), ExecutorError> {
        if stage.optional {
            let reason = format!("optional stage failed: {error}");
            return self.skip_stage(state, stage, phase, &reason).await;
        }

        let session_id = state.session_id.clone();
        state.fail_stage(&stage.id, error.clone(), Utc::now())?;
        self.store.save_state(state).await?;

        let attempts = state
            .stage(&stage.id)
            .map(|r| r.attempts.clone())
            .unwrap_or_default();
        let attempt_count = attempts.len() as u32;

        let (mut restored, record) = self.rollback.restore_last_checkpoint(&session_id).await?;
        restored.mark_rolled_back(&stage.id, attempts, Some(error.clone()))?;
        restored.status = WorkflowStatus::Aborted;

        let label = self.store.next_aborted_label(&session_id).await?;
        self.store
            .create(&session_id, label, restored.to_json()?, CheckpointMetrics::default())
            .await?;
        self.store.save_state(&restored).await?;
        *state = restored;

        tracing::error!(
            session_id = %session_id,
            stage_id = %stage.id,
            attempts = attempt_count,
            restored_checkpoint = %record.phase_label,
            "required stage failed, workflow aborted"
        );
        self.publish(WorkflowEvent::RunAborted {
            session_id,
            stage_id: stage.id.clone(),
            attempts: attempt_count,
            restored_checkpoint_id: Some(record.id),
        });

        Err(ExecutorError::WorkflowFailure {
            stage_id: stage.id.clone(),
            attempts: attempt_count,
            restored_checkpoint_id: Some(record.id),
            error,
        })
    }

    /// A required stage cannot run because a dependency did not succeed.
    async fn abort_on_dependency(
        &self,
        state: &mut WorkflowState,
        stage: &StageDefinition,
        dependency: &str,
    ) -> Result<RunEnd, ExecutorError> {
        let session_id = state.session_id.clone();
        state.status = WorkflowStatus::Aborted;
        let label = self.store.next_aborted_label(&session_id).await?;
        self.store
            .create(&session_id, label, state.to_json()?, CheckpointMetrics::default())
            .await?;
        self.store.save_state(state).await?;

        tracing::error!(
            session_id = %session_id,
            stage_id = %stage.id,
            dependency,
            "required stage has an unsatisfied dependency, workflow aborted"
        );
        self.publish(WorkflowEvent::RunAborted {
            session_id,
            stage_id: stage.id.clone(),
            attempts: 0,
            restored_checkpoint_id: None,
        });

        Err(ExecutorError::DependencyNotSatisfied {
            stage_id: stage.id.clone(),
            dependency: dependency.to_string(),
        })
    }

    async fn pause_on_timeout(&self, state: &mut WorkflowState) -> Result<RunEnd, ExecutorError> {
        state.status = WorkflowStatus::WaitingForResume;
        self.store.save_state(state).await?;
        tracing::warn!(session_id = %state.session_id, "workflow timeout reached, session paused");
        self.publish(WorkflowEvent::RunPaused {
            session_id: state.session_id.clone(),
            reason: "workflow timeout".to_string(),
        });
        Err(ExecutorError::WorkflowTimeout {
            session_id: state.session_id.clone(),
        })
    }
}

impl<R: CheckpointRepository + 'static> WorkflowExecutor for WorkflowOrchestrator<R> {
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        session_id: Option<String>,
        context: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        let (order, handlers) = self.prepare(definition)?;
        let session_id = session_id.unwrap_or_else(|| Uuid::now_v7().to_string());

        if self.store.load_session(&session_id).await?.is_some()
            || self.store.latest(&session_id).await?.is_some()
        {
            return Err(ExecutorError::SessionExists(session_id));
        }

        self.store
            .ensure_consent(&session_id, ConsentPurpose::RunStart)
            .await?;

        let mut state = WorkflowState::new(&definition.id, &session_id, order, context);
        state.status = WorkflowStatus::Running;
        self.store
            .create(
                &session_id,
                PhaseLabel::PreWork,
                state.to_json()?,
                CheckpointMetrics::default(),
            )
            .await?;
        self.store.save_state(&state).await?;

        tracing::info!(
            session_id = %session_id,
            workflow = definition.id.as_str(),
            stages = state.order.len(),
            "starting workflow execution"
        );
        self.publish(WorkflowEvent::RunStarted {
            session_id,
            workflow_id: definition.id.clone(),
            resumed: false,
        });

        self.drive(definition, state, &handlers).await
    }

    async fn resume(
        &self,
        definition: &WorkflowDefinition,
        session_id: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        let (order, handlers) = self.prepare(definition)?;

        let record = self
            .store
            .latest(session_id)
            .await?
            .ok_or_else(|| ExecutorError::SessionNotFound(session_id.to_string()))?;
        let mut state = WorkflowState::from_json(record.snapshot)?;

        if state.workflow_id != definition.id {
            return Err(ExecutorError::DefinitionMismatch {
                session_id: session_id.to_string(),
                reason: format!(
                    "session belongs to workflow '{}', not '{}'",
                    state.workflow_id, definition.id
                ),
            });
        }
        if state.order != order {
            return Err(ExecutorError::DefinitionMismatch {
                session_id: session_id.to_string(),
                reason: "stage order differs from the recorded session".to_string(),
            });
        }

        // The final status lives on the session row, not on a checkpoint.
        if let Some(session) = self.store.load_session(session_id).await? {
            if session.status == WorkflowStatus::Completed {
                tracing::info!(session_id, "session already completed, nothing to resume");
                return Ok(ExecutionResult::from_state(WorkflowState::from_json(session.state)?));
            }
        }

        self.store
            .ensure_consent(session_id, ConsentPurpose::RunStart)
            .await?;

        state.status = WorkflowStatus::Running;
        state.current_stage = None;
        self.store.save_state(&state).await?;

        tracing::info!(
            session_id,
            workflow = definition.id.as_str(),
            from_checkpoint = %record.phase_label,
            next_stage = state.next_unsettled().unwrap_or("-"),
            "resuming workflow execution"
        );
        self.publish(WorkflowEvent::RunStarted {
            session_id: session_id.to_string(),
            workflow_id: definition.id.clone(),
            resumed: true,
        });

        self.drive(definition, state, &handlers).await
    }

    async fn cancel(&self, session_id: &str) -> Result<(), ExecutorError> {
        match self.cancellation_tokens.get(session_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(session_id, "cancellation requested");
                Ok(())
            }
            None => Err(ExecutorError::SessionNotFound(session_id.to_string())),
        }
    }
}

/// First dependency of `stage` that does not let it run.
fn unsatisfied_dependency(stage: &StageDefinition, state: &WorkflowState) -> Option<String> {
    stage
        .depends_on
        .iter()
        .find(|dep| match state.stage_status(dep) {
            Some(StageStatus::Succeeded) => false,
            Some(StageStatus::Skipped) => !stage.allow_skipped_deps,
            _ => true,
        })
        .cloned()
}

/// Checkpoint metrics from a stage's duration and numeric output keys.
fn metrics_from(output: Option<&Value>, duration: Duration) -> CheckpointMetrics {
    let count = |key: &str| output.and_then(|o| o.get(key)).and_then(Value::as_u64).unwrap_or(0);
    CheckpointMetrics {
        duration_seconds: duration.as_secs_f64(),
        files_changed: count("files_changed"),
        lines_added: count("lines_added"),
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{session_id}' does not match the definition: {reason}")]
    DefinitionMismatch { session_id: String, reason: String },

    /// A required stage exhausted its attempts; the session was restored.
    #[error("stage '{stage_id}' failed after {attempts} attempt(s): {error}")]
    WorkflowFailure {
        stage_id: String,
        attempts: u32,
        restored_checkpoint_id: Option<Uuid>,
        error: String,
    },

    #[error("stage '{stage_id}' cannot run: dependency '{dependency}' not satisfied")]
    DependencyNotSatisfied { stage_id: String, dependency: String },

    #[error("workflow timed out in session '{session_id}'")]
    WorkflowTimeout { session_id: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("restore error: {0}")]
    Rollback(#[from] RollbackError),

    #[error(transparent)]
    State(#[from] StateError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryCheckpointRepository;
    use crate::testing::{definition, stage, FakeVcs, ScriptedStage, Step};
    use crate::vcs::BoxVcs;
    use serde_json::json;

    type Orchestrator = WorkflowOrchestrator<InMemoryCheckpointRepository>;

    struct Harness {
        repo: InMemoryCheckpointRepository,
        vcs: FakeVcs,
        stages: HashMap<String, ScriptedStage>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                repo: InMemoryCheckpointRepository::new(),
                vcs: FakeVcs::default(),
                stages: HashMap::new(),
            }
        }

        /// Script the handler registered under `id` (stage IDs double as
        /// handler IDs in these tests).
        fn script(mut self, id: &str, stage: ScriptedStage) -> Self {
            self.stages.insert(id.to_string(), stage);
            self
        }

        fn orchestrator(&self, def: &WorkflowDefinition) -> Orchestrator {
            let mut registry = StageRegistry::new();
            for s in &def.stages {
                let handler = self.stages.get(&s.id).cloned().unwrap_or_default();
                registry.register(s.handler.clone(), handler);
            }
            let store = CheckpointStore::new(self.repo.clone())
                .with_vcs(Arc::new(BoxVcs::new(self.vcs.clone())));
            let config = EngineConfig {
                backoff_base_ms: 10,
                backoff_ceiling_ms: 40,
                ..EngineConfig::default()
            };
            WorkflowOrchestrator::new(Arc::new(store), Arc::new(registry), config)
        }
    }

    fn labels(records: &[waypoint_types::checkpoint::CheckpointRecord]) -> Vec<String> {
        records.iter().map(|r| r.phase_label.to_string()).collect()
    }

    #[tokio::test]
    async fn test_happy_path_checkpoints_every_boundary() {
        let def = definition(
            "wf",
            vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["a"])],
        );
        let h = Harness::new();
        let orch = h.orchestrator(&def);

        let result = orch
            .execute(&def, Some("s".into()), json!({"ticket": 1}))
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.completed_stages, vec!["a", "b", "c"]);
        assert_eq!(result.state.context["visited"], json!(["a", "b", "c"]));
        assert_eq!(result.state.context["ticket"], 1);

        let records = orch.store().list("s").await.unwrap();
        assert_eq!(labels(&records), vec!["pre-work", "phase-1", "phase-2", "phase-3"]);
        for pair in records.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
        }
        assert_eq!(records[1].metrics.files_changed, 1);
        assert_eq!(records[1].metrics.lines_added, 10);
        assert!(records.iter().all(|r| r.vcs_reference.is_some()));

        let session = orch.store().load_session("s").await.unwrap().unwrap();
        assert_eq!(session.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_empty_workflow_completes_immediately() {
        let def = definition("empty", vec![]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        let result = orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(labels(&orch.store().list("s").await.unwrap()), vec!["pre-work"]);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_on_first_error() {
        let def = definition("wf", vec![stage("only", &[])]);
        let only = ScriptedStage::failing(5);
        let h = Harness::new().script("only", only.clone());
        let orch = h.orchestrator(&def);

        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        match err {
            ExecutorError::WorkflowFailure { stage_id, attempts, restored_checkpoint_id, .. } => {
                assert_eq!(stage_id, "only");
                assert_eq!(attempts, 1);
                let pre_work = orch.store().get("s", &PhaseLabel::PreWork).await.unwrap();
                assert_eq!(restored_checkpoint_id, Some(pre_work.id));
            }
            other => panic!("expected WorkflowFailure, got {other:?}"),
        }
        assert_eq!(only.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_required_failure_restores_last_boundary() {
        let mut b = stage("b", &["a"]);
        b.max_retries = 2;
        let def = definition("wf", vec![stage("a", &[]), b, stage("c", &["a"])]);
        let failing = ScriptedStage::failing(3);
        let h = Harness::new().script("b", failing.clone());
        let orch = h.orchestrator(&def);
        let mut events = orch.store().events().subscribe();

        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        let phase_one = orch
            .store()
            .get("s", &PhaseLabel::Phase { index: 1, revision: 0 })
            .await
            .unwrap();
        match err {
            ExecutorError::WorkflowFailure { stage_id, attempts, restored_checkpoint_id, error } => {
                assert_eq!(stage_id, "b");
                assert_eq!(attempts, 3);
                assert_eq!(restored_checkpoint_id, Some(phase_one.id));
                assert!(error.contains("boom"));
            }
            other => panic!("expected WorkflowFailure, got {other:?}"),
        }
        assert_eq!(failing.calls(), 3);

        let session = orch.store().load_session("s").await.unwrap().unwrap();
        assert_eq!(session.status, WorkflowStatus::Aborted);
        let state = WorkflowState::from_json(session.state).unwrap();
        assert_eq!(state.stage_status("a"), Some(StageStatus::Succeeded));
        assert_eq!(state.stage_status("b"), Some(StageStatus::RolledBack));
        assert_eq!(state.stage("b").unwrap().attempts.len(), 3);
        assert_eq!(state.stage_status("c"), Some(StageStatus::Pending));
        assert_eq!(state.context, json!({"visited": ["a"]}));

        let records = orch.store().list("s").await.unwrap();
        assert_eq!(labels(&records), vec!["pre-work", "phase-1", "aborted-2"]);

        // Two retries were announced, the last failure was final.
        let mut retries = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::StageFailed { will_retry, .. } = event {
                retries.push(will_retry);
            }
        }
        assert_eq!(retries, vec![true, true, false]);

        // The working tree went back to phase-1's reference.
        assert_eq!(h.vcs.resets(), vec![phase_one.vcs_reference.unwrap()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let mut a = stage("a", &[]);
        a.max_retries = 3;
        let def = definition("wf", vec![a]);
        let flaky = ScriptedStage::failing(2);
        let h = Harness::new().script("a", flaky.clone());
        let orch = h.orchestrator(&def);

        let result = orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        let a = result.state.stage("a").unwrap();
        assert_eq!(a.attempt_count, 3);
        assert_eq!(a.attempts.len(), 3);
        assert!(a.attempts[0].error.is_some());
        assert!(a.attempts[2].error.is_none());
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_ignores_max_retries() {
        let mut a = stage("a", &[]);
        a.retryable = false;
        a.max_retries = 4;
        let def = definition("wf", vec![a]);
        let failing = ScriptedStage::failing(5);
        let h = Harness::new().script("a", failing.clone());
        let orch = h.orchestrator(&def);

        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::WorkflowFailure { attempts: 1, .. }));
        assert_eq!(failing.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consumes_an_attempt() {
        let mut a = stage("a", &[]);
        a.timeout_secs = Some(1);
        a.max_retries = 1;
        let def = definition("wf", vec![a]);
        let slow = ScriptedStage::with_script([Step::Sleep(Duration::from_secs(30))]);
        let h = Harness::new().script("a", slow.clone());
        let orch = h.orchestrator(&def);

        let result = orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        let a = result.state.stage("a").unwrap();
        assert_eq!(a.attempt_count, 2);
        assert!(a.attempts[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_failure_is_skipped() {
        let mut docs = stage("docs", &["a"]);
        docs.optional = true;
        let def = definition("wf", vec![stage("a", &[]), docs, stage("c", &["a"])]);
        let h = Harness::new().script("docs", ScriptedStage::failing(1));
        let orch = h.orchestrator(&def);

        let result = orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.skipped_stages, vec!["docs"]);
        assert_eq!(result.completed_stages, vec!["a", "c"]);
        let docs = result.state.stage("docs").unwrap();
        assert!(docs.error.as_deref().unwrap().contains("optional stage failed"));
        assert_eq!(
            labels(&orch.store().list("s").await.unwrap()),
            vec!["pre-work", "phase-1", "phase-2", "phase-3"]
        );
    }

    #[tokio::test]
    async fn test_skipped_dependency_gating() {
        let mut docs = stage("docs", &[]);
        docs.optional = true;
        let mut publish = stage("publish", &["docs"]);
        publish.optional = true;
        let mut index = stage("index", &["docs"]);
        index.allow_skipped_deps = true;
        let def = definition("wf", vec![docs, publish, index]);
        let h = Harness::new().script("docs", ScriptedStage::rejecting_inputs());
        let orch = h.orchestrator(&def);

        let result = orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        assert_eq!(result.skipped_stages, vec!["docs", "publish"]);
        assert_eq!(result.completed_stages, vec!["index"]);
        let publish = result.state.stage("publish").unwrap();
        assert_eq!(publish.error.as_deref(), Some("dependency 'docs' not satisfied"));
        // Input rejection consumed no attempt.
        assert_eq!(result.state.stage("docs").unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn test_required_stage_with_skipped_dependency_aborts() {
        let mut docs = stage("docs", &[]);
        docs.optional = true;
        let def = definition("wf", vec![docs, stage("publish", &["docs"])]);
        let h = Harness::new().script("docs", ScriptedStage::failing(1));
        let orch = h.orchestrator(&def);

        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::DependencyNotSatisfied { ref stage_id, ref dependency }
                if stage_id == "publish" && dependency == "docs"
        ));
        let session = orch.store().load_session("s").await.unwrap().unwrap();
        assert_eq!(session.status, WorkflowStatus::Aborted);
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_before_anything_runs() {
        let def = definition("wf", vec![stage("a", &[]), stage("b", &["a"])]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        let mut other = def.clone();
        other.stages[1].handler = "ghost".into();

        let err = orch.execute(&other, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Stage(StageError::UnknownHandler { .. })));
        assert!(orch.store().list("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_never_starts() {
        let def = definition("wf", vec![stage("a", &["b"]), stage("b", &["a"])]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Definition(DefinitionError::Dag(DagError::Cycle { .. }))));
        assert!(orch.store().load_session("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_session_is_rejected() {
        let def = definition("wf", vec![stage("a", &[])]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::SessionExists(_)));
    }

    #[tokio::test]
    async fn test_dirty_tree_without_consent_aborts_run_start() {
        let def = definition("wf", vec![stage("a", &[])]);
        let h = Harness::new();
        h.vcs.set_dirty(true, vec!["notes.md".into()]);
        let mut registry = StageRegistry::new();
        registry.register("a", ScriptedStage::ok());
        let store = CheckpointStore::new(h.repo.clone())
            .with_vcs(Arc::new(BoxVcs::new(h.vcs.clone())))
            .with_consent(Arc::new(|_| false));
        let orch = WorkflowOrchestrator::new(Arc::new(store), Arc::new(registry), EngineConfig::default());

        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Checkpoint(CheckpointError::DirtyStateRejected { .. })
        ));
        assert!(orch.store().list("s").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_interruption() {
        let def = definition(
            "wf",
            vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["b"]), stage("d", &["c"])],
        );
        let hang = ScriptedStage::with_script([Step::Sleep(Duration::from_secs(3600))]);
        let h = Harness::new().script("c", hang);
        let orch = h.orchestrator(&def);

        // The process "dies" while phase 3 runs.
        let interrupted = tokio::time::timeout(
            Duration::from_secs(5),
            orch.execute(&def, Some("s".into()), json!({})),
        )
        .await;
        assert!(interrupted.is_err());
        drop(orch);

        let records = h.repo.list_checkpoints("s").await.unwrap();
        assert_eq!(labels(&records), vec!["pre-work", "phase-1", "phase-2"]);
        let crashed = h.repo.get_session("s").await.unwrap().unwrap();
        assert_eq!(crashed.status, WorkflowStatus::Running);

        // A fresh orchestrator over the same storage picks up at phase 3.
        let restarted = Harness {
            repo: h.repo.clone(),
            vcs: h.vcs.clone(),
            stages: HashMap::new(),
        };
        let orch = restarted.orchestrator(&def);
        let resumable = orch
            .store()
            .list_resumable(&Default::default())
            .await
            .unwrap();
        assert_eq!(resumable[0].session_id, "s");
        assert_eq!(resumable[0].last_phase.as_ref().unwrap().to_string(), "phase-2");

        let mut events = orch.store().events().subscribe();
        let result = orch.resume(&def, "s").await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.state.context["visited"], json!(["a", "b", "c", "d"]));

        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::StageStarted { stage_id, .. } = event {
                started.push(stage_id);
            }
        }
        assert_eq!(started, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_resume_completed_session_is_a_no_op() {
        let def = definition("wf", vec![stage("a", &[])]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        orch.execute(&def, Some("s".into()), json!({})).await.unwrap();
        let before = orch.store().list("s").await.unwrap().len();

        let result = orch.resume(&def, "s").await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(orch.store().list("s").await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_resume_rejects_other_definition() {
        let def = definition("wf", vec![stage("a", &[])]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        orch.execute(&def, Some("s".into()), json!({})).await.unwrap();

        let other = definition("other", vec![stage("a", &[])]);
        let err = orch.resume(&other, "s").await.unwrap_err();
        assert!(matches!(err, ExecutorError::DefinitionMismatch { .. }));

        let err = orch.resume(&def, "missing").await.unwrap_err();
        assert!(matches!(err, ExecutorError::SessionNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_aborted_session_reruns_failed_stage() {
        let def = definition("wf", vec![stage("a", &[]), stage("b", &["a"])]);
        let h = Harness::new().script("b", ScriptedStage::failing(1));
        let orch = h.orchestrator(&def);
        orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();

        // The scripted failure is used up; the retry succeeds.
        let result = orch.resume(&def, "s").await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.state.stage("b").unwrap().attempt_count, 1);
        let labels = labels(&orch.store().list("s").await.unwrap());
        assert_eq!(labels, vec!["pre-work", "phase-1", "aborted-2", "phase-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pauses_between_stages() {
        let def = definition("wf", vec![stage("a", &[]), stage("b", &["a"])]);
        let slow = ScriptedStage::with_script([Step::Sleep(Duration::from_secs(10))]);
        let h = Harness::new().script("a", slow);
        let orch = Arc::new(h.orchestrator(&def));

        let runner = orch.clone();
        let run_def = def.clone();
        let task = tokio::spawn(async move {
            runner.execute(&run_def, Some("s".into()), json!({})).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        orch.cancel("s").await.unwrap();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::WaitingForResume);
        assert_eq!(result.completed_stages, vec!["a"]);
        assert!(matches!(orch.cancel("s").await, Err(ExecutorError::SessionNotFound(_))));

        let result = orch.resume(&def, "s").await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_mid_stage_aborts() {
        let mut def = definition("wf", vec![stage("a", &[]), stage("b", &["a"])]);
        def.timeout_secs = Some(5);
        let slow = ScriptedStage::with_script([Step::Sleep(Duration::from_secs(4))]);
        let late = ScriptedStage::with_script([Step::Sleep(Duration::from_secs(4))]);
        let h = Harness::new().script("a", slow).script("b", late);
        let orch = h.orchestrator(&def);

        // b starts with one second left and is cut off; a required stage with
        // no time left for retries aborts the run.
        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::WorkflowFailure { ref stage_id, .. } if stage_id == "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reached_between_stages() {
        let mut def = definition("wf", vec![stage("a", &[]), stage("b", &["a"])]);
        def.timeout_secs = Some(5);
        let slow = ScriptedStage::with_script([Step::Sleep(Duration::from_secs(4))]);
        let b = ScriptedStage::ok();
        let h = Harness::new().script("a", slow).script("b", b.clone());
        h.vcs.set_snapshot_delay(Some(Duration::from_secs(2)));
        let orch = h.orchestrator(&def);

        let err = orch.execute(&def, Some("s".into()), json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutorError::WorkflowTimeout { ref session_id } if session_id == "s"));
        assert_eq!(b.calls(), 0);

        let session = orch.store().load_session("s").await.unwrap().unwrap();
        assert_eq!(session.status, WorkflowStatus::WaitingForResume);
    }

    #[tokio::test]
    async fn test_phase_labels_get_revisions_after_rollback() {
        let def = definition("wf", vec![stage("a", &[]), stage("b", &["a"])]);
        let h = Harness::new();
        let orch = h.orchestrator(&def);
        orch.execute(&def, Some("s".into()), json!({})).await.unwrap();

        let record = orch.rollback().resolve_text("s", "complete").await.unwrap();
        orch.rollback().execute(&record, true).await.unwrap();
        let result = orch.resume(&def, "s").await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);

        let labels = labels(&orch.store().list("s").await.unwrap());
        assert_eq!(
            labels,
            vec![
                "pre-work",
                "phase-1",
                "phase-2",
                "safety-3",
                "restored-4-at-0",
                "phase-1.r1",
                "phase-2.r1"
            ]
        );
        assert_eq!(
            orch.rollback().available_targets("s").await.unwrap(),
            vec!["complete", "phase-1", "phase-2"]
        );
    }

    #[test]
    fn test_metrics_from_output() {
        let m = metrics_from(
            Some(&json!({"files_changed": 3, "lines_added": 120, "other": "x"})),
            Duration::from_millis(1500),
        );
        assert_eq!(m.files_changed, 3);
        assert_eq!(m.lines_added, 120);
        assert!((m.duration_seconds - 1.5).abs() < f64::EPSILON);
        assert_eq!(metrics_from(Some(&json!({"files_changed": "lots"})), Duration::ZERO).files_changed, 0);
    }

    #[test]
    fn test_executor_error_display() {
        let err = ExecutorError::WorkflowFailure {
            stage_id: "b".into(),
            attempts: 3,
            restored_checkpoint_id: None,
            error: "boom".into(),
        };
        assert_eq!(err.to_string(), "stage 'b' failed after 3 attempt(s): boom");
    }
}
