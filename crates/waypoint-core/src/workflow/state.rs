//! Run-scoped workflow state.
//!
//! `WorkflowState` is the mutable value the orchestrator owns for the duration
//! of a run. It tracks the context payload handed between stages, one
//! `StageResult` per stage, and the workflow status. It is serialized into
//! every checkpoint, so it deliberately holds no wall-clock fields of its own:
//! restoring the same snapshot twice yields equal states.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use waypoint_types::workflow::{StageAttempt, StageResult, StageStatus, WorkflowStatus};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single stage output (1 MB).
pub const MAX_STAGE_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum size of the context payload (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{stage_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        stage_id: String,
        from: StageStatus,
        to: StageStatus,
    },

    #[error("context size ({size} bytes) exceeds maximum ({max} bytes)")]
    ContextTooLarge { size: usize, max: usize },

    #[error("state serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Mutable state of one workflow session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub session_id: String,
    /// Payload injected at run start and replaced by each stage's outcome.
    pub context: Value,
    /// Per-stage results keyed by stage ID.
    pub stages: BTreeMap<String, StageResult>,
    /// Stage IDs in execution order; position + 1 is the phase number.
    pub order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    pub status: WorkflowStatus,
}

impl WorkflowState {
    /// Create a fresh state with every stage `Pending`.
    pub fn new(
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
        order: Vec<String>,
        context: Value,
    ) -> Self {
        let stages = order
            .iter()
            .map(|id| (id.clone(), StageResult::pending(id.clone())))
            .collect();
        Self {
            workflow_id: workflow_id.into(),
            session_id: session_id.into(),
            context,
            stages,
            order,
            current_stage: None,
            status: WorkflowStatus::NotStarted,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn stage(&self, stage_id: &str) -> Option<&StageResult> {
        self.stages.get(stage_id)
    }

    pub fn stage_status(&self, stage_id: &str) -> Option<StageStatus> {
        self.stages.get(stage_id).map(|s| s.status)
    }

    /// 1-based phase number of a stage.
    pub fn phase_of(&self, stage_id: &str) -> Option<usize> {
        self.order.iter().position(|id| id == stage_id).map(|i| i + 1)
    }

    /// Stage ID at a 1-based phase number.
    pub fn stage_at_phase(&self, phase: usize) -> Option<&str> {
        phase
            .checked_sub(1)
            .and_then(|i| self.order.get(i))
            .map(String::as_str)
    }

    /// Number of leading phases (in order) that are settled.
    pub fn settled_prefix(&self) -> usize {
        self.order
            .iter()
            .take_while(|id| self.stage_status(id).is_some_and(StageStatus::is_settled))
            .count()
    }

    /// First stage in order that is neither `Succeeded` nor `Skipped`.
    pub fn next_unsettled(&self) -> Option<&str> {
        self.order
            .iter()
            .find(|id| !self.stage_status(id).is_some_and(StageStatus::is_settled))
            .map(String::as_str)
    }

    pub fn count_with_status(&self, status: StageStatus) -> usize {
        self.stages.values().filter(|s| s.status == status).count()
    }

    /// Stage IDs at phases after `boundary`, in order.
    pub fn stages_after(&self, boundary: usize) -> Vec<String> {
        self.order.iter().skip(boundary).cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn result_mut(&mut self, stage_id: &str) -> Result<&mut StageResult, StateError> {
        self.stages
            .get_mut(stage_id)
            .ok_or_else(|| StateError::UnknownStage(stage_id.to_string()))
    }

    fn transition(&mut self, stage_id: &str, next: StageStatus) -> Result<&mut StageResult, StateError> {
        let result = self.result_mut(stage_id)?;
        if !result.status.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                stage_id: stage_id.to_string(),
                from: result.status,
                to: next,
            });
        }
        result.status = next;
        Ok(result)
    }

    /// Start a new pass of a stage: clears the previous pass's attempts.
    pub fn begin_stage(&mut self, stage_id: &str, now: DateTime<Utc>) -> Result<(), StateError> {
        let result = self.transition(stage_id, StageStatus::Running)?;
        result.started_at = Some(now);
        result.ended_at = None;
        result.attempt_count = 0;
        result.attempts.clear();
        result.error = None;
        result.output = None;
        self.current_stage = Some(stage_id.to_string());
        Ok(())
    }

    /// Append an attempt to the stage's log.
    pub fn record_attempt(&mut self, stage_id: &str, attempt: StageAttempt) -> Result<(), StateError> {
        let result = self.result_mut(stage_id)?;
        result.attempt_count = attempt.attempt;
        result.error = attempt.error.clone();
        result.attempts.push(attempt);
        Ok(())
    }

    pub fn complete_stage(
        &mut self,
        stage_id: &str,
        output: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let output = output.map(|o| truncate_output(stage_id, o));
        let result = self.transition(stage_id, StageStatus::Succeeded)?;
        result.ended_at = Some(now);
        result.error = None;
        result.output = output;
        self.current_stage = None;
        Ok(())
    }

    pub fn fail_stage(
        &mut self,
        stage_id: &str,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let result = self.transition(stage_id, StageStatus::Failed)?;
        result.ended_at = Some(now);
        result.error = Some(error.into());
        Ok(())
    }

    /// Skip a stage that is pending, running, or was rolled back.
    pub fn skip_stage(
        &mut self,
        stage_id: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let result = self.transition(stage_id, StageStatus::Skipped)?;
        result.ended_at = Some(now);
        result.error = Some(reason.into());
        if self.current_stage.as_deref() == Some(stage_id) {
            self.current_stage = None;
        }
        Ok(())
    }

    /// Mark a failed stage as undone by an automatic restore.
    ///
    /// Keeps its error and attempt log so the failure remains inspectable.
    pub fn mark_rolled_back(
        &mut self,
        stage_id: &str,
        attempts: Vec<StageAttempt>,
        error: Option<String>,
    ) -> Result<(), StateError> {
        let result = self.result_mut(stage_id)?;
        result.status = StageStatus::RolledBack;
        result.attempt_count = attempts.last().map(|a| a.attempt).unwrap_or(0);
        result.attempts = attempts;
        result.error = error;
        self.current_stage = None;
        Ok(())
    }

    /// Reset every stage after `boundary` to a fresh `Pending` result.
    ///
    /// Bypasses the forward-transition check. Returns the reset stage IDs.
    pub fn reset_after(&mut self, boundary: usize) -> Vec<String> {
        let reset = self.stages_after(boundary);
        for id in &reset {
            self.stages.insert(id.clone(), StageResult::pending(id.clone()));
        }
        self.current_stage = None;
        reset
    }

    /// Replace the context payload, enforcing `MAX_CONTEXT_SIZE`.
    pub fn replace_context(&mut self, context: Value) -> Result<(), StateError> {
        let size = serde_json::to_vec(&context)
            .map_err(|e| StateError::Serialization(e.to_string()))?
            .len();
        if size > MAX_CONTEXT_SIZE {
            return Err(StateError::ContextTooLarge {
                size,
                max: MAX_CONTEXT_SIZE,
            });
        }
        self.context = context;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    pub fn to_json(&self) -> Result<Value, StateError> {
        serde_json::to_value(self).map_err(|e| StateError::Serialization(e.to_string()))
    }

    pub fn from_json(value: Value) -> Result<Self, StateError> {
        serde_json::from_value(value).map_err(|e| StateError::Serialization(e.to_string()))
    }
}

/// Replace oversized outputs with a marker object.
fn truncate_output(stage_id: &str, output: Value) -> Value {
    let size = serde_json::to_vec(&output).map(|v| v.len()).unwrap_or(0);
    if size <= MAX_STAGE_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(
        stage_id,
        size,
        max = MAX_STAGE_OUTPUT_SIZE,
        "stage output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState::new(
            "feature-build",
            "s-1",
            vec!["a".into(), "b".into(), "c".into()],
            json!({"ticket": "WP-7"}),
        )
    }

    fn attempt(n: u32, error: Option<&str>) -> StageAttempt {
        let now = Utc::now();
        StageAttempt {
            attempt: n,
            started_at: now,
            ended_at: now,
            error: error.map(String::from),
        }
    }

    #[test]
    fn test_new_state_is_all_pending() {
        let s = state();
        assert_eq!(s.status, WorkflowStatus::NotStarted);
        assert_eq!(s.count_with_status(StageStatus::Pending), 3);
        assert_eq!(s.phase_of("b"), Some(2));
        assert_eq!(s.stage_at_phase(3), Some("c"));
        assert_eq!(s.stage_at_phase(0), None);
        assert_eq!(s.next_unsettled(), Some("a"));
    }

    #[test]
    fn test_stage_lifecycle() {
        let mut s = state();
        let now = Utc::now();
        s.begin_stage("a", now).unwrap();
        assert_eq!(s.current_stage.as_deref(), Some("a"));
        s.record_attempt("a", attempt(1, None)).unwrap();
        s.complete_stage("a", Some(json!({"files_changed": 2})), now).unwrap();
        assert_eq!(s.stage_status("a"), Some(StageStatus::Succeeded));
        assert_eq!(s.stage("a").unwrap().attempt_count, 1);
        assert!(s.current_stage.is_none());
        assert_eq!(s.settled_prefix(), 1);
        assert_eq!(s.next_unsettled(), Some("b"));
    }

    #[test]
    fn test_succeeded_stage_cannot_restart() {
        let mut s = state();
        let now = Utc::now();
        s.begin_stage("a", now).unwrap();
        s.complete_stage("a", None, now).unwrap();
        let err = s.begin_stage("a", now).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert!(err.to_string().contains("succeeded to running"));
        assert!(matches!(s.begin_stage("zzz", now), Err(StateError::UnknownStage(_))));
    }

    #[test]
    fn test_skipped_stage_counts_as_settled() {
        let mut s = state();
        let now = Utc::now();
        s.skip_stage("a", "dependency not satisfied", now).unwrap();
        assert_eq!(s.settled_prefix(), 1);
        assert_eq!(s.stage("a").unwrap().error.as_deref(), Some("dependency not satisfied"));
    }

    #[test]
    fn test_reset_after_boundary() {
        let mut s = state();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            s.begin_stage(id, now).unwrap();
            s.complete_stage(id, None, now).unwrap();
        }
        let reset = s.reset_after(1);
        assert_eq!(reset, vec!["b", "c"]);
        assert_eq!(s.stage_status("a"), Some(StageStatus::Succeeded));
        assert_eq!(s.stage("b").unwrap(), &StageResult::pending("b"));
        assert_eq!(s.settled_prefix(), 1);
        assert!(s.reset_after(3).is_empty());
    }

    #[test]
    fn test_mark_rolled_back_keeps_attempts() {
        let mut s = state();
        let attempts = vec![attempt(1, Some("boom")), attempt(2, Some("boom"))];
        s.mark_rolled_back("b", attempts, Some("boom".into())).unwrap();
        let b = s.stage("b").unwrap();
        assert_eq!(b.status, StageStatus::RolledBack);
        assert_eq!(b.attempt_count, 2);
        // A rolled-back stage may run again.
        s.begin_stage("b", Utc::now()).unwrap();
        assert!(s.stage("b").unwrap().attempts.is_empty());
    }

    #[test]
    fn test_oversized_output_is_truncated() {
        let mut s = state();
        let now = Utc::now();
        s.begin_stage("a", now).unwrap();
        let big = Value::String("x".repeat(MAX_STAGE_OUTPUT_SIZE + 10));
        s.complete_stage("a", Some(big), now).unwrap();
        assert_eq!(s.stage("a").unwrap().output.as_ref().unwrap()["_truncated"], true);
    }

    #[test]
    fn test_context_size_limit() {
        let mut s = state();
        let huge = Value::String("y".repeat(MAX_CONTEXT_SIZE + 1));
        assert!(matches!(
            s.replace_context(huge),
            Err(StateError::ContextTooLarge { .. })
        ));
        assert_eq!(s.context["ticket"], "WP-7");
    }

    #[test]
    fn test_json_roundtrip_reproduces_state() {
        let mut s = state();
        let now = Utc::now();
        s.status = WorkflowStatus::Running;
        s.begin_stage("a", now).unwrap();
        s.record_attempt("a", attempt(1, None)).unwrap();
        s.complete_stage("a", Some(json!({"lines_added": 40})), now).unwrap();
        s.begin_stage("b", now).unwrap();
        s.record_attempt("b", attempt(1, Some("flaky"))).unwrap();

        let json = s.to_json().unwrap();
        let restored = WorkflowState::from_json(json).unwrap();
        assert_eq!(restored, s);
        assert_eq!(restored.stage_status("b"), Some(StageStatus::Running));
        assert_eq!(restored.context, s.context);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            WorkflowState::from_json(json!({"nope": true})),
            Err(StateError::Serialization(_))
        ));
    }
}
