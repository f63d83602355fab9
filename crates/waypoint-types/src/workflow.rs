//! Workflow domain types for Waypoint.
//!
//! Defines the declarative workflow document (`WorkflowDefinition` and its
//! `StageDefinition`s) and the execution-tracking types (`StageResult`,
//! `StageStatus`, `WorkflowStatus`) that are persisted inside checkpoints.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declared workflow: an ordered list of stages forming a DAG.
///
/// Declaration order matters: it breaks ties when computing the execution
/// order, which keeps phase numbering stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (e.g. "feature-build").
    pub id: String,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whole-run timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Ordered stage declarations.
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
    /// Free-form metadata carried along with the definition.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a stage declaration by ID.
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Stage Definition
// ---------------------------------------------------------------------------

/// A single stage in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage ID, unique within a workflow.
    pub id: String,
    /// ID of the registered handler that performs this stage's work.
    pub handler: String,
    /// Stage IDs this stage depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Whether failed attempts may be retried at all.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    /// Extra attempts after the first one (0 = single attempt).
    #[serde(default)]
    pub max_retries: u32,
    /// Optional stages degrade to `Skipped` instead of aborting the run.
    #[serde(default)]
    pub optional: bool,
    /// Per-attempt timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Treat `Skipped` dependencies as satisfied.
    #[serde(default)]
    pub allow_skipped_deps: bool,
    /// Handler-specific configuration, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

fn default_retryable() -> bool {
    true
}

impl StageDefinition {
    /// Total number of attempts allowed (first run plus retries).
    pub fn max_attempts(&self) -> u32 {
        if self.retryable {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Whether the stage must succeed for the workflow to continue.
    pub fn is_required(&self) -> bool {
        !self.optional
    }

    /// Effective per-attempt timeout.
    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Status of a single stage within a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    RolledBack,
}

impl StageStatus {
    /// Whether the stage has reached a boundary that a later stage can build on.
    pub fn is_settled(self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Skipped)
    }

    /// Forward transitions allowed within a single pass.
    ///
    /// Moving a settled stage back to `Pending` is only done by rollback,
    /// which bypasses this check.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
                | (Failed, RolledBack)
                | (RolledBack, Running)
                | (RolledBack, Skipped)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    NotStarted,
    Running,
    Completed,
    Aborted,
    WaitingForResume,
}

impl WorkflowStatus {
    /// Completed and Aborted runs are archived; everything else can resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Aborted)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::NotStarted => "not_started",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Aborted => "aborted",
            WorkflowStatus::WaitingForResume => "waiting_for_resume",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(WorkflowStatus::NotStarted),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "aborted" => Ok(WorkflowStatus::Aborted),
            "waiting_for_resume" => Ok(WorkflowStatus::WaitingForResume),
            other => Err(format!("unknown workflow status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

/// One execution attempt of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Error message if the attempt failed or timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Execution record for a single stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub status: StageStatus,
    /// Number of attempts consumed in the latest pass.
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Every attempt made in the latest pass, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StageAttempt>,
}

impl StageResult {
    /// A fresh, never-run result.
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            attempt_count: 0,
            started_at: None,
            ended_at: None,
            error: None,
            output: None,
            attempts: Vec::new(),
        }
    }

    /// Wall-clock duration of the stage, when both endpoints are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str) -> StageDefinition {
        StageDefinition {
            id: id.to_string(),
            handler: "noop".to_string(),
            depends_on: vec![],
            retryable: true,
            max_retries: 2,
            optional: false,
            timeout_secs: None,
            allow_skipped_deps: false,
            params: None,
        }
    }

    #[test]
    fn max_attempts_counts_first_run() {
        let mut s = stage("build");
        assert_eq!(s.max_attempts(), 3);
        s.retryable = false;
        assert_eq!(s.max_attempts(), 1);
        s.retryable = true;
        s.max_retries = 0;
        assert_eq!(s.max_attempts(), 1);
    }

    #[test]
    fn stage_defaults_from_yaml() {
        let yaml = "id: test\nhandler: shell\n";
        let s: StageDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(s.retryable);
        assert_eq!(s.max_retries, 0);
        assert!(!s.optional);
        assert!(s.depends_on.is_empty());
        assert_eq!(s.timeout(300), Duration::from_secs(300));
    }

    #[test]
    fn stage_status_transitions() {
        assert!(StageStatus::Pending.can_transition_to(StageStatus::Running));
        assert!(StageStatus::Running.can_transition_to(StageStatus::Succeeded));
        assert!(StageStatus::Failed.can_transition_to(StageStatus::RolledBack));
        assert!(!StageStatus::Succeeded.can_transition_to(StageStatus::Pending));
        assert!(!StageStatus::Succeeded.can_transition_to(StageStatus::Running));
        assert!(!StageStatus::Skipped.can_transition_to(StageStatus::Running));
    }

    #[test]
    fn workflow_status_roundtrip_str() {
        for status in [
            WorkflowStatus::NotStarted,
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Aborted,
            WorkflowStatus::WaitingForResume,
        ] {
            let parsed: WorkflowStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, serde_json::Value::String(status.to_string()));
        }
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn stage_result_duration() {
        let mut r = StageResult::pending("a");
        assert!(r.duration().is_none());
        let start = Utc::now();
        r.started_at = Some(start);
        r.ended_at = Some(start + chrono::Duration::seconds(3));
        assert_eq!(r.duration().unwrap().num_seconds(), 3);
    }
}
