//! `wpt rollback`: resolve a target, preview its impact, confirm, apply.

use anyhow::{bail, Result};
use console::style;
use dialoguer::Confirm;

use waypoint_core::workflow::rollback::{RollbackOutcome, RollbackPreview, RollbackReport};

use crate::state::AppState;

pub async fn rollback(
    state: &AppState,
    session_id: &str,
    target: &str,
    preview_only: bool,
    yes: bool,
    json: bool,
) -> Result<()> {
    let coordinator = state.rollback();
    let record = coordinator.resolve_text(session_id, target).await?;
    let preview = coordinator.preview(&record).await?;

    if preview_only {
        return print_preview(&preview, json);
    }

    let confirmed = if yes {
        true
    } else if json {
        bail!("rollback with --json needs --yes (or use --preview)");
    } else {
        print_preview(&preview, false)?;
        Confirm::new()
            .with_prompt(format!(
                "Roll session '{}' back to '{}'?",
                session_id, preview.target_label
            ))
            .default(false)
            .interact()?
    };

    match coordinator.execute(&record, confirmed).await? {
        RollbackOutcome::NotConfirmed => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "applied": false }))?
                );
            } else {
                println!("  Rollback cancelled, nothing changed.");
                println!();
            }
        }
        RollbackOutcome::Applied(report) => print_report(&preview, &report, json)?,
    }
    Ok(())
}

fn print_preview(preview: &RollbackPreview, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "session_id": preview.session_id,
            "target": preview.target_label,
            "target_checkpoint_id": preview.target_checkpoint_id,
            "boundary": preview.boundary,
            "stages_to_reset": preview.stages_to_reset,
            "diff": preview.diff,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  Rollback of '{}' to {} (phases after {} are reset)",
        style(&preview.session_id).cyan(),
        style(&preview.target_label).cyan().bold(),
        preview.boundary
    );

    if preview.stages_to_reset.is_empty() {
        println!("  No stages to reset.");
    } else {
        println!("  Stages to reset:");
        for stage in &preview.stages_to_reset {
            println!("    {}", style(stage).yellow());
        }
    }

    match &preview.diff {
        Some(diff) if diff.is_empty() => println!("  Working tree already matches the target."),
        Some(diff) => {
            println!("  Files that will change ({}):", diff.total());
            for path in &diff.added {
                println!("    {} {}", style("-").red(), path);
            }
            for path in &diff.removed {
                println!("    {} {}", style("+").green(), path);
            }
            for path in &diff.modified {
                println!("    {} {}", style("~").yellow(), path);
            }
        }
        None => println!("  {}", style("Target has no snapshot; files are left as is.").dim()),
    }
    println!();
    Ok(())
}

fn print_report(preview: &RollbackPreview, report: &RollbackReport, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "applied": true,
            "session_id": preview.session_id,
            "target": preview.target_label,
            "target_checkpoint_id": report.target_checkpoint_id,
            "safety_checkpoint_id": report.safety_checkpoint_id,
            "restored_checkpoint_id": report.restored_checkpoint_id,
            "stages_reset": report.stages_reset,
            "status": report.state.status,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "  {} Rolled back to {} ({} stage(s) reset)",
        style("*").green().bold(),
        style(&preview.target_label).cyan(),
        report.stages_reset.len()
    );
    println!("  Safety checkpoint: {}", style(report.safety_checkpoint_id).dim());
    println!(
        "  Continue with: {}",
        style(format!("wpt resume {} {}", preview.session_id, report.state.workflow_id)).dim()
    );
    println!();
    Ok(())
}
