//! CLI command definitions for the `wpt` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod definition;
pub mod rollback;
pub mod run;
pub mod session;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;

use waypoint_core::workflow::definition::{discover_definitions, load_definition_file};
use waypoint_types::workflow::WorkflowDefinition;

/// Run declared workflows with durable checkpoints, resume, and rollback.
#[derive(Parser)]
#[command(name = "wpt", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "WAYPOINT_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow definition file.
    Validate {
        /// Path to a YAML or JSON definition.
        file: PathBuf,
    },

    /// Show the execution order (phases) of a workflow.
    Plan {
        /// Definition path, or a workflow ID under the data directory.
        workflow: String,
    },

    /// Start a new session.
    Run {
        /// Definition path, or a workflow ID under the data directory.
        workflow: String,

        /// Session ID to use (generated when omitted).
        #[arg(long)]
        session: Option<String>,

        /// Initial context as a JSON object.
        #[arg(long)]
        context: Option<String>,

        /// Approve uncommitted changes without asking.
        #[arg(short, long)]
        yes: bool,
    },

    /// Resume a paused, interrupted, or aborted session.
    Resume {
        /// Session ID.
        session: String,

        /// Definition path, or a workflow ID under the data directory.
        workflow: String,

        /// Approve uncommitted changes without asking.
        #[arg(short, long)]
        yes: bool,
    },

    /// List sessions that can be resumed, newest first.
    #[command(alias = "ls")]
    Sessions {
        /// Only sessions of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Only sessions whose ID starts with this prefix.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// List the checkpoints of a session.
    Checkpoints {
        /// Session ID.
        session: String,
    },

    /// Roll a session back: `complete`, `phase-<n>`, or `phases-<n>-<m>`.
    Rollback {
        /// Session ID.
        session: String,

        /// Target, e.g. `phase-2` or `rollback phases 2 4`.
        #[arg(required = true, num_args = 1..)]
        target: Vec<String>,

        /// Show what would change and exit.
        #[arg(long)]
        preview: bool,

        /// Apply without asking for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete old checkpoints (the first and newest records of every session are kept).
    Prune {
        /// Newest records to keep per session (config `retention.keep_last_n` by default).
        #[arg(long)]
        keep: Option<usize>,

        /// Only delete records older than this many days (config `retention.max_age_days` by default).
        #[arg(long)]
        older_than_days: Option<u64>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse `--context`; absent means an empty object.
pub fn parse_context(raw: Option<&str>) -> Result<serde_json::Value> {
    let Some(raw) = raw else {
        return Ok(serde_json::json!({}));
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("--context must be valid JSON")?;
    if !value.is_object() {
        bail!("--context must be a JSON object");
    }
    Ok(value)
}

/// Load a definition from a path, or by ID from `workflows_dir`.
pub fn resolve_workflow(workflow: &str, workflows_dir: Option<&Path>) -> Result<WorkflowDefinition> {
    let path = Path::new(workflow);
    if path.is_file() {
        return load_definition_file(path)
            .with_context(|| format!("failed to load workflow '{}'", path.display()));
    }

    if let Some(dir) = workflows_dir {
        let found = discover_definitions(dir)
            .with_context(|| format!("failed to scan {}", dir.display()))?
            .into_iter()
            .find(|(_, def)| def.id == workflow);
        if let Some((path, def)) = found {
            tracing::debug!(workflow, path = %path.display(), "resolved workflow by ID");
            return Ok(def);
        }
    }

    bail!("workflow '{workflow}' is neither a file nor a known workflow ID")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const DEF: &str = "id: build\nstages:\n  - id: compile\n    handler: noop\n";

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rollback_target_words_are_collected() {
        let cli = Cli::parse_from(["wpt", "rollback", "s1", "phases", "2", "4", "--preview"]);
        match cli.command {
            Commands::Rollback { session, target, preview, yes } => {
                assert_eq!(session, "s1");
                assert_eq!(target.join(" "), "phases 2 4");
                assert!(preview);
                assert!(!yes);
            }
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn parse_context_defaults_and_rejects_non_objects() {
        assert_eq!(parse_context(None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_context(Some(r#"{"ticket": 7}"#)).unwrap()["ticket"],
            7
        );
        assert!(parse_context(Some("[1, 2]")).is_err());
        assert!(parse_context(Some("{oops")).is_err());
    }

    #[test]
    fn resolve_workflow_by_path_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("build.yaml");
        std::fs::write(&file, DEF).unwrap();

        let by_path = resolve_workflow(file.to_str().unwrap(), None).unwrap();
        assert_eq!(by_path.id, "build");

        let by_id = resolve_workflow("build", Some(dir.path())).unwrap();
        assert_eq!(by_id.stages.len(), 1);

        assert!(resolve_workflow("missing", Some(dir.path())).is_err());
    }
}
