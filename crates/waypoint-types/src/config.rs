//! Engine configuration types for Waypoint.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls stage
//! timeouts, retry backoff, checkpoint retention, and the version-control
//! collaborator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.waypoint/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt stage timeout when a stage declares none.
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,

    /// Whole-run timeout when the definition declares none (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_timeout_secs: Option<u64>,

    /// Delay before the first retry; doubles on every further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay.
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,

    /// Bound on external snapshot creation.
    #[serde(default = "default_vcs_snapshot_timeout_secs")]
    pub vcs_snapshot_timeout_secs: u64,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub vcs: VcsConfig,
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_ceiling_ms() -> u64 {
    30_000
}

fn default_vcs_snapshot_timeout_secs() -> u64 {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_stage_timeout_secs: default_stage_timeout_secs(),
            workflow_timeout_secs: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            vcs_snapshot_timeout_secs: default_vcs_snapshot_timeout_secs(),
            retention: RetentionConfig::default(),
            vcs: VcsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    pub fn vcs_snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.vcs_snapshot_timeout_secs)
    }
}

/// Checkpoint retention policy applied by `prune`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep at least this many of the newest records per session.
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,
    /// Records older than this are eligible for pruning.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

fn default_keep_last_n() -> usize {
    20
}

fn default_max_age_days() -> u64 {
    30
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_last_n: default_keep_last_n(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// Which version-control collaborator to attach to checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcsKind {
    #[default]
    None,
    Git,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VcsConfig {
    #[serde(default)]
    pub kind: VcsKind,
    /// Repository root (current directory when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<PathBuf>,
}
