//! Session and checkpoint inspection: `wpt sessions`, `wpt checkpoints`,
//! and `wpt prune`.

use anyhow::{bail, Result};
use chrono::Utc;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use waypoint_types::checkpoint::{CheckpointRecord, PhaseLabel, SessionFilter};
use waypoint_types::workflow::WorkflowStatus;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn list_sessions(
    state: &AppState,
    workflow: Option<String>,
    prefix: Option<String>,
    json: bool,
) -> Result<()> {
    let filter = SessionFilter {
        workflow_id: workflow,
        session_prefix: prefix,
    };
    let sessions = state.store.list_resumable(&filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!();
        println!("  No resumable sessions.");
        println!(
            "  Start one with: {}",
            style("wpt run <workflow>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Session").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Last Checkpoint"),
            Cell::new("Updated"),
        ]);

    for session in &sessions {
        let status_color = match session.status {
            WorkflowStatus::Aborted => Color::Red,
            WorkflowStatus::WaitingForResume => Color::Yellow,
            WorkflowStatus::Running => Color::Blue,
            _ => Color::White,
        };
        let last_phase = session
            .last_phase
            .as_ref()
            .map(PhaseLabel::to_string)
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&session.session_id).fg(Color::Cyan),
            Cell::new(&session.workflow_id),
            Cell::new(session.status).fg(status_color),
            Cell::new(last_phase),
            Cell::new(session.timestamp.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

pub async fn list_checkpoints(state: &AppState, session_id: &str, json: bool) -> Result<()> {
    let records = state.store.list(session_id).await?;
    if records.is_empty() {
        bail!("session '{session_id}' has no checkpoints");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!();
    println!(
        "  Checkpoints for session '{}' ({} records)",
        style(session_id).cyan(),
        records.len()
    );
    println!();
    println!("{}", checkpoint_table(&records));

    let targets = state.rollback().available_targets(session_id).await?;
    println!();
    println!("  Rollback targets: {}", style(targets.join(", ")).dim());
    println!();
    Ok(())
}

fn checkpoint_table(records: &[CheckpointRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Label").fg(Color::Cyan),
            Cell::new("Created"),
            Cell::new("Snapshot"),
            Cell::new("Duration"),
            Cell::new("Files"),
            Cell::new("Lines +"),
            Cell::new("ID"),
        ]);

    for record in records {
        let label_color = match record.phase_label {
            PhaseLabel::Safety { .. } => Color::Yellow,
            PhaseLabel::Aborted { .. } => Color::Red,
            PhaseLabel::Restored { .. } => Color::Magenta,
            _ => Color::Cyan,
        };
        let snapshot = record
            .vcs_reference
            .as_deref()
            .map(short_reference)
            .unwrap_or("-");
        table.add_row(vec![
            Cell::new(&record.phase_label).fg(label_color),
            Cell::new(record.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(snapshot).fg(Color::DarkGrey),
            Cell::new(format!("{:.1}s", record.metrics.duration_seconds)),
            Cell::new(record.metrics.files_changed),
            Cell::new(record.metrics.lines_added),
            Cell::new(record.id).fg(Color::DarkGrey),
        ]);
    }
    table
}

fn short_reference(reference: &str) -> &str {
    reference.get(..10).unwrap_or(reference)
}

// ---------------------------------------------------------------------------
// Prune
// ---------------------------------------------------------------------------

pub async fn prune(
    state: &AppState,
    keep: Option<usize>,
    older_than_days: Option<u64>,
    json: bool,
) -> Result<()> {
    let keep_last_n = keep.unwrap_or(state.config.retention.keep_last_n);
    let days = older_than_days.unwrap_or(state.config.retention.max_age_days);
    let Some(max_age) = i64::try_from(days).ok().and_then(chrono::Duration::try_days) else {
        bail!("--older-than-days is out of range");
    };
    let older_than = Utc::now() - max_age;

    let report = state.store.prune(older_than, keep_last_n).await?;

    if json {
        let out = serde_json::json!({
            "sessions_scanned": report.sessions_scanned,
            "deleted": report.deleted,
            "keep_last_n": keep_last_n,
            "older_than": older_than.to_rfc3339(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Pruned {} checkpoint(s) across {} session(s)",
            style("*").green().bold(),
            report.deleted,
            report.sessions_scanned
        );
        println!(
            "  Kept the newest {keep_last_n} per session and everything from the last {days} day(s)"
        );
        println!();
    }
    Ok(())
}
