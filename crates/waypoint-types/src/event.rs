//! Event types for the Waypoint workflow event bus.
//!
//! `WorkflowEvent` is broadcast while a session runs or is rolled back.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution and rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run (fresh or resumed) has started.
    RunStarted {
        session_id: String,
        workflow_id: String,
        resumed: bool,
    },

    /// A stage attempt has started.
    StageStarted {
        session_id: String,
        stage_id: String,
        phase: usize,
        attempt: u32,
    },

    /// A stage completed successfully.
    StageCompleted {
        session_id: String,
        stage_id: String,
        phase: usize,
        duration_ms: u64,
    },

    /// A stage attempt failed.
    StageFailed {
        session_id: String,
        stage_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },

    /// A stage was skipped (optional failure or unsatisfied dependency).
    StageSkipped {
        session_id: String,
        stage_id: String,
        reason: String,
    },

    /// A checkpoint record was written.
    CheckpointCreated {
        session_id: String,
        checkpoint_id: Uuid,
        phase_label: String,
        has_vcs_reference: bool,
    },

    /// All stages settled.
    RunCompleted {
        session_id: String,
        duration_ms: u64,
        stages_succeeded: usize,
        stages_skipped: usize,
    },

    /// The run paused (cancelled between stages) and can be resumed.
    RunPaused { session_id: String, reason: String },

    /// A required stage failed and the session was restored.
    RunAborted {
        session_id: String,
        stage_id: String,
        attempts: u32,
        restored_checkpoint_id: Option<Uuid>,
    },

    /// A rollback was applied.
    RollbackApplied {
        session_id: String,
        target_checkpoint_id: Uuid,
        safety_checkpoint_id: Uuid,
        stages_reset: usize,
    },
}

impl WorkflowEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            WorkflowEvent::RunStarted { session_id, .. }
            | WorkflowEvent::StageStarted { session_id, .. }
            | WorkflowEvent::StageCompleted { session_id, .. }
            | WorkflowEvent::StageFailed { session_id, .. }
            | WorkflowEvent::StageSkipped { session_id, .. }
            | WorkflowEvent::CheckpointCreated { session_id, .. }
            | WorkflowEvent::RunCompleted { session_id, .. }
            | WorkflowEvent::RunPaused { session_id, .. }
            | WorkflowEvent::RunAborted { session_id, .. }
            | WorkflowEvent::RollbackApplied { session_id, .. } => session_id,
        }
    }
}
