//! `wpt run` and `wpt resume`.
//!
//! Progress is driven by the event bus: a background task follows the
//! session's events and advances an indicatif bar. Ctrl+C asks the
//! orchestrator to pause before the next stage.

use std::sync::Arc;

use anyhow::Result;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use waypoint_core::workflow::executor::{ExecutionResult, ExecutorError, WorkflowExecutor};
use waypoint_core::workflow::state::WorkflowState;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{StageStatus, WorkflowDefinition, WorkflowStatus};

use crate::state::{AppState, ConcreteOrchestrator};

use super::{parse_context, resolve_workflow};

const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub async fn run(
    state: &AppState,
    workflow: &str,
    session: Option<String>,
    context: Option<&str>,
    json: bool,
) -> Result<()> {
    let def = resolve_workflow(workflow, Some(&state.workflows_dir()))?;
    let context = parse_context(context)?;
    // Generated here so Ctrl+C can name the session before it exists.
    let session_id = session.unwrap_or_else(|| Uuid::now_v7().to_string());

    let orchestrator = Arc::new(state.orchestrator());
    let monitor = RunMonitor::start(&orchestrator, &session_id, def.stages.len(), 0, json);

    let outcome = orchestrator
        .execute(&def, Some(session_id.clone()), context)
        .await;
    monitor.finish().await;

    report(&def, &session_id, outcome, json)
}

pub async fn resume(state: &AppState, workflow: &str, session_id: &str, json: bool) -> Result<()> {
    let def = resolve_workflow(workflow, Some(&state.workflows_dir()))?;

    let orchestrator = Arc::new(state.orchestrator());
    let already_settled = orchestrator
        .rollback()
        .current_state(session_id)
        .await
        .map(|s| s.settled_prefix())
        .unwrap_or(0);
    let monitor = RunMonitor::start(
        &orchestrator,
        session_id,
        def.stages.len(),
        already_settled,
        json,
    );

    let outcome = orchestrator.resume(&def, session_id).await;
    monitor.finish().await;

    report(&def, session_id, outcome, json)
}

// ---------------------------------------------------------------------------
// Progress and interrupt handling
// ---------------------------------------------------------------------------

struct RunMonitor {
    bar: ProgressBar,
    progress: JoinHandle<()>,
    interrupt: JoinHandle<()>,
}

impl RunMonitor {
    fn start(
        orchestrator: &Arc<ConcreteOrchestrator>,
        session_id: &str,
        total: usize,
        position: usize,
        json: bool,
    ) -> Self {
        // Hidden until the run starts so a consent prompt is not drawn over.
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::hidden());
        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(bar_style.progress_chars("=> "));
        }
        bar.set_position(position as u64);

        let events = orchestrator.store().events().subscribe();
        let progress = tokio::spawn(follow_events(
            events,
            session_id.to_string(),
            bar.clone(),
            !json,
        ));

        let canceller = orchestrator.clone();
        let session = session_id.to_string();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(session_id = %session, "interrupt received, pausing after the current stage");
                if let Err(error) = canceller.cancel(&session).await {
                    tracing::debug!(%error, "nothing to cancel");
                }
            }
        });

        Self {
            bar,
            progress,
            interrupt,
        }
    }

    /// Let the progress task drain what the run already published, then
    /// clear the bar.
    async fn finish(self) {
        self.interrupt.abort();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.progress).await.is_err() {
            tracing::debug!("progress display did not see the end of the run");
        }
        self.bar.finish_and_clear();
    }
}

async fn follow_events(
    mut events: tokio::sync::broadcast::Receiver<WorkflowEvent>,
    session_id: String,
    bar: ProgressBar,
    visible: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "progress display lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.session_id() != session_id {
            continue;
        }

        match event {
            WorkflowEvent::RunStarted { .. } if visible => {
                bar.set_draw_target(ProgressDrawTarget::stderr());
                bar.enable_steady_tick(std::time::Duration::from_millis(80));
            }
            WorkflowEvent::StageStarted {
                stage_id,
                phase,
                attempt,
                ..
            } => {
                let retry = if attempt > 1 {
                    format!(" (attempt {attempt})")
                } else {
                    String::new()
                };
                bar.set_message(format!("phase {phase}: {stage_id}{retry}"));
            }
            WorkflowEvent::StageCompleted {
                stage_id,
                duration_ms,
                ..
            } => {
                bar.inc(1);
                bar.println(format!(
                    "  {} {} {}",
                    style("*").green().bold(),
                    stage_id,
                    style(format!("({:.1}s)", duration_ms as f64 / 1000.0)).dim()
                ));
            }
            WorkflowEvent::StageFailed {
                stage_id,
                attempt,
                error,
                will_retry,
                ..
            } => {
                let next = if will_retry { "retrying" } else { "giving up" };
                bar.println(format!(
                    "  {} {} attempt {} failed: {} ({next})",
                    style("!").yellow().bold(),
                    stage_id,
                    attempt,
                    error
                ));
            }
            WorkflowEvent::StageSkipped {
                stage_id, reason, ..
            } => {
                bar.inc(1);
                bar.println(format!(
                    "  {} {} skipped: {}",
                    style("-").dim(),
                    stage_id,
                    style(reason).dim()
                ));
            }
            WorkflowEvent::RunCompleted { .. }
            | WorkflowEvent::RunPaused { .. }
            | WorkflowEvent::RunAborted { .. } => break,
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn report(
    def: &WorkflowDefinition,
    session_id: &str,
    outcome: Result<ExecutionResult, ExecutorError>,
    json: bool,
) -> Result<()> {
    let result = match outcome {
        Ok(result) => result,
        Err(error) => return report_error(def, session_id, error, json),
    };

    if json {
        let out = serde_json::json!({
            "session_id": result.session_id,
            "workflow": def.id,
            "status": result.status,
            "completed_stages": result.completed_stages,
            "skipped_stages": result.skipped_stages,
            "stages": stage_rows_json(&result.state),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    match result.status {
        WorkflowStatus::Completed => println!(
            "  {} Workflow '{}' completed",
            style("*").green().bold(),
            style(&def.id).cyan()
        ),
        status => println!(
            "  {} Workflow '{}' {}",
            style("!").yellow().bold(),
            style(&def.id).cyan(),
            status
        ),
    }
    println!("  Session: {}", result.session_id);
    println!(
        "  Stages: {} succeeded, {} skipped",
        result.completed_stages.len(),
        result.skipped_stages.len()
    );
    println!();
    println!("{}", stage_table(&result.state));

    if result.status == WorkflowStatus::WaitingForResume {
        println!();
        println!(
            "  Continue with: {}",
            style(format!("wpt resume {} {}", result.session_id, def.id)).dim()
        );
    }
    println!();
    Ok(())
}

fn report_error(
    def: &WorkflowDefinition,
    session_id: &str,
    error: ExecutorError,
    json: bool,
) -> Result<()> {
    let resumable = matches!(
        error,
        ExecutorError::WorkflowFailure { .. } | ExecutorError::WorkflowTimeout { .. }
    );

    if json {
        let mut out = serde_json::json!({
            "session_id": session_id,
            "workflow": def.id,
            "error": error.to_string(),
            "resumable": resumable,
        });
        if let ExecutorError::WorkflowFailure {
            stage_id,
            attempts,
            restored_checkpoint_id,
            ..
        } = &error
        {
            out["failed_stage"] = serde_json::json!(stage_id);
            out["attempts"] = serde_json::json!(attempts);
            out["restored_checkpoint_id"] = serde_json::json!(restored_checkpoint_id);
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if resumable {
        println!();
        println!("  {} {}", style("x").red().bold(), error);
        if let ExecutorError::WorkflowFailure {
            restored_checkpoint_id: Some(id),
            ..
        } = &error
        {
            println!("  Restored to checkpoint {}", style(id).dim());
        }
        println!(
            "  Fix the cause, then: {}",
            style(format!("wpt resume {session_id} {}", def.id)).dim()
        );
        println!();
    }

    Err(error.into())
}

fn stage_table(state: &WorkflowState) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Phase"),
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
        ]);

    for (i, id) in state.order.iter().enumerate() {
        let Some(stage) = state.stage(id) else {
            continue;
        };
        let status_color = match stage.status {
            StageStatus::Succeeded => Color::Green,
            StageStatus::Skipped => Color::Yellow,
            StageStatus::Failed | StageStatus::RolledBack => Color::Red,
            StageStatus::Running => Color::Blue,
            StageStatus::Pending => Color::DarkGrey,
        };
        let duration = stage
            .duration()
            .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(id).fg(Color::Cyan),
            Cell::new(stage.status).fg(status_color),
            Cell::new(stage.attempt_count),
            Cell::new(duration),
        ]);
    }
    table
}

fn stage_rows_json(state: &WorkflowState) -> Vec<serde_json::Value> {
    state
        .order
        .iter()
        .filter_map(|id| state.stage(id))
        .map(|stage| {
            serde_json::json!({
                "stage": stage.stage_id,
                "status": stage.status,
                "attempts": stage.attempt_count,
                "error": stage.error,
            })
        })
        .collect()
}
