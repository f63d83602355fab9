//! Checkpoint, phase label, rollback target, and session types.
//!
//! A `CheckpointRecord` is an immutable, point-in-time snapshot of a workflow
//! session. Records are keyed by `(session_id, phase_label)` and only ever
//! appended; later records supersede earlier ones.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::WorkflowStatus;

// ---------------------------------------------------------------------------
// CheckpointRecord
// ---------------------------------------------------------------------------

/// Metrics captured alongside a checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub duration_seconds: f64,
    pub files_changed: u64,
    pub lines_added: u64,
}

/// A durable snapshot of workflow state at a stage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// UUIDv7 record ID (time-sortable).
    pub id: Uuid,
    pub session_id: String,
    pub phase_label: PhaseLabel,
    pub created_at: DateTime<Utc>,
    /// Reference returned by the version-control collaborator, if any.
    pub vcs_reference: Option<String>,
    pub metrics: CheckpointMetrics,
    /// Serialized workflow state at this boundary.
    pub snapshot: serde_json::Value,
}

// ---------------------------------------------------------------------------
// PhaseLabel
// ---------------------------------------------------------------------------

/// Label identifying what boundary a checkpoint represents.
///
/// Text forms:
/// - `pre-work`
/// - `phase-<k>` / `phase-<k>.r<rev>` (boundary after phase k; rev > 0 for re-runs)
/// - `safety-<seq>` (taken right before a rollback is applied)
/// - `aborted-<seq>` (state after a required stage exhausted its retries)
/// - `restored-<seq>-at-<k>` (state after a rollback to boundary k)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhaseLabel {
    PreWork,
    Phase { index: usize, revision: u32 },
    Safety { seq: usize },
    Aborted { seq: usize },
    Restored { seq: usize, boundary: usize },
}

impl PhaseLabel {
    /// Boundary phase index this label stands for, if it is a phase boundary.
    ///
    /// `pre-work` is boundary 0; safety and abort records have no fixed boundary.
    pub fn boundary(&self) -> Option<usize> {
        match self {
            PhaseLabel::PreWork => Some(0),
            PhaseLabel::Phase { index, .. } => Some(*index),
            PhaseLabel::Restored { boundary, .. } => Some(*boundary),
            PhaseLabel::Safety { .. } | PhaseLabel::Aborted { .. } => None,
        }
    }

    pub fn is_pre_work(&self) -> bool {
        matches!(self, PhaseLabel::PreWork)
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseLabel::PreWork => f.write_str("pre-work"),
            PhaseLabel::Phase { index, revision: 0 } => write!(f, "phase-{index}"),
            PhaseLabel::Phase { index, revision } => write!(f, "phase-{index}.r{revision}"),
            PhaseLabel::Safety { seq } => write!(f, "safety-{seq}"),
            PhaseLabel::Aborted { seq } => write!(f, "aborted-{seq}"),
            PhaseLabel::Restored { seq, boundary } => write!(f, "restored-{seq}-at-{boundary}"),
        }
    }
}

impl FromStr for PhaseLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid phase label '{s}'");
        let num = |v: &str| v.parse::<usize>().map_err(|_| invalid());

        if s == "pre-work" {
            return Ok(PhaseLabel::PreWork);
        }
        if let Some(rest) = s.strip_prefix("phase-") {
            return match rest.split_once(".r") {
                Some((index, rev)) => {
                    let revision = rev.parse::<u32>().map_err(|_| invalid())?;
                    if revision == 0 {
                        return Err(invalid());
                    }
                    Ok(PhaseLabel::Phase { index: num(index)?, revision })
                }
                None => Ok(PhaseLabel::Phase { index: num(rest)?, revision: 0 }),
            };
        }
        if let Some(rest) = s.strip_prefix("safety-") {
            return Ok(PhaseLabel::Safety { seq: num(rest)? });
        }
        if let Some(rest) = s.strip_prefix("aborted-") {
            return Ok(PhaseLabel::Aborted { seq: num(rest)? });
        }
        if let Some(rest) = s.strip_prefix("restored-") {
            let (seq, boundary) = rest.split_once("-at-").ok_or_else(invalid)?;
            return Ok(PhaseLabel::Restored { seq: num(seq)?, boundary: num(boundary)? });
        }
        Err(invalid())
    }
}

impl Serialize for PhaseLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PhaseLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// RollbackTarget
// ---------------------------------------------------------------------------

/// What a caller asked to roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollbackTarget {
    /// Undo everything back to the pre-work checkpoint.
    Complete,
    /// Undo phase n (and everything after it).
    SinglePhase(usize),
    /// Undo phases n through m (and everything after n).
    PhaseRange(usize, usize),
}

impl RollbackTarget {
    /// First phase that will be undone (0 for a complete rollback).
    pub fn first_phase(&self) -> usize {
        match self {
            RollbackTarget::Complete => 0,
            RollbackTarget::SinglePhase(n) | RollbackTarget::PhaseRange(n, _) => *n,
        }
    }
}

impl fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTarget::Complete => f.write_str("complete"),
            RollbackTarget::SinglePhase(n) => write!(f, "phase-{n}"),
            RollbackTarget::PhaseRange(n, m) => write!(f, "phases-{n}-{m}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Latest persisted state of a workflow session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Serialized workflow state.
    pub state: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A session that can be offered to the user for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumableSession {
    pub session_id: String,
    pub workflow_id: String,
    /// Label of the most recent checkpoint.
    pub last_phase: Option<PhaseLabel>,
    /// When the session was last updated.
    pub timestamp: DateTime<Utc>,
    pub status: WorkflowStatus,
}

/// Filter for session listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Only sessions of this workflow.
    pub workflow_id: Option<String>,
    /// Only sessions whose ID starts with this prefix.
    pub session_prefix: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, session: &SessionRecord) -> bool {
        let workflow_ok = self
            .workflow_id
            .as_deref()
            .is_none_or(|w| session.workflow_id == w);
        let prefix_ok = self
            .session_prefix
            .as_deref()
            .is_none_or(|p| session.session_id.starts_with(p));
        workflow_ok && prefix_ok
    }
}
