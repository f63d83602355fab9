//! Shell stage handler.
//!
//! Runs `params.command` through `sh -c`. The serialized workflow context is
//! written to the child's stdin, and the session and stage IDs are exported as
//! `WAYPOINT_SESSION_ID` / `WAYPOINT_STAGE_ID`. Stdout becomes the stage
//! output: parsed as JSON when it is valid JSON (so a command can report
//! `files_changed` / `lines_added`), otherwise kept as a string.
//!
//! The child is killed when the attempt future is dropped, which is how the
//! orchestrator's timeout cancels it.

use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use waypoint_core::workflow::stage::{Stage, StageError, StageOutcome};
use waypoint_core::workflow::state::WorkflowState;
use waypoint_types::workflow::StageDefinition;

/// Longest stderr excerpt carried into an error message.
const MAX_STDERR_CHARS: usize = 2_000;

#[derive(Debug, Clone, Default)]
pub struct ShellStage {
    working_dir: Option<PathBuf>,
}

impl ShellStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands from `dir` instead of the process working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(definition: &StageDefinition) -> Option<&str> {
        definition
            .params
            .as_ref()
            .and_then(|p| p.get("command"))
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
    }
}

impl Stage for ShellStage {
    async fn execute(
        &self,
        definition: &StageDefinition,
        state: &WorkflowState,
    ) -> Result<StageOutcome, StageError> {
        let command = Self::command(definition).ok_or_else(|| {
            StageError::InvalidParams(format!(
                "stage '{}' needs a non-empty string `params.command`",
                definition.id
            ))
        })?;
        let input = serde_json::to_vec(&state.context)
            .map_err(|e| StageError::Execution(format!("serialize context: {e}")))?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("WAYPOINT_SESSION_ID", &state.session_id)
            .env("WAYPOINT_STAGE_ID", &definition.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(stage_id = %definition.id, command, "spawning shell stage");
        let mut child = cmd
            .spawn()
            .map_err(|e| StageError::Execution(format!("failed to spawn `sh -c {command}`: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin closes the pipe early; that is fine.
            let _ = stdin.write_all(&input).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::Execution(format!("failed to wait for command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            return Err(StageError::Execution(format!(
                "command exited with {}: {excerpt}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim_end();
        let value = serde_json::from_str::<Value>(stdout)
            .unwrap_or_else(|_| Value::String(stdout.to_string()));

        Ok(StageOutcome::unchanged(state).with_output(value))
    }

    fn validate_inputs(&self, definition: &StageDefinition, _state: &WorkflowState) -> bool {
        Self::command(definition).is_some()
    }
}
