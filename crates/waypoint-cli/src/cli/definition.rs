//! `wpt validate` and `wpt plan`.

use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use waypoint_core::workflow::dag::{compute_execution_order, independent_branches};
use waypoint_core::workflow::definition::load_definition_file;
use waypoint_types::workflow::WorkflowDefinition;

use crate::state::AppState;

use super::resolve_workflow;

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_definition_file(file)
        .with_context(|| format!("{} is not a valid workflow", file.display()))?;

    if json {
        let out = serde_json::json!({
            "valid": true,
            "id": def.id,
            "version": def.version,
            "stages": def.stages.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' v{} is valid ({} stages)",
            style("*").green().bold(),
            style(&def.id).cyan(),
            def.version,
            def.stages.len()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn plan(state: &AppState, workflow: &str, json: bool) -> Result<()> {
    let def = resolve_workflow(workflow, Some(&state.workflows_dir()))?;
    let order = compute_execution_order(&def.stages)?;
    let branches = independent_branches(&def.stages)?;

    if json {
        let phases: Vec<_> = order
            .iter()
            .enumerate()
            .filter_map(|(i, id)| def.stage(id).map(|stage| (i + 1, stage)))
            .map(|(phase, stage)| {
                serde_json::json!({
                    "phase": phase,
                    "stage": stage.id,
                    "handler": stage.handler,
                    "depends_on": stage.depends_on,
                    "optional": stage.optional,
                    "max_attempts": stage.max_attempts(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "workflow": def.id,
            "phases": phases,
            "independent_branches": branches,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_plan(&def, &order, &branches);
    Ok(())
}

fn print_plan(def: &WorkflowDefinition, order: &[String], branches: &[Vec<String>]) {
    println!();
    println!(
        "  Plan for '{}' ({} phases)",
        style(&def.id).cyan(),
        order.len()
    );
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }
    println!();

    if order.is_empty() {
        println!("  No stages.");
        println!();
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Phase"),
            Cell::new("Stage").fg(Color::Cyan),
            Cell::new("Handler"),
            Cell::new("Depends On"),
            Cell::new("Attempts"),
            Cell::new("Kind"),
        ]);

    for (i, id) in order.iter().enumerate() {
        let Some(stage) = def.stage(id) else {
            continue;
        };
        let deps = if stage.depends_on.is_empty() {
            "-".to_string()
        } else {
            stage.depends_on.join(", ")
        };
        let (kind, kind_color) = if stage.optional {
            ("optional", Color::Yellow)
        } else {
            ("required", Color::Green)
        };
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&stage.id).fg(Color::Cyan),
            Cell::new(&stage.handler),
            Cell::new(deps),
            Cell::new(stage.max_attempts()),
            Cell::new(kind).fg(kind_color),
        ]);
    }
    println!("{table}");

    if branches.len() > 1 {
        println!();
        println!("  {} independent branches:", branches.len());
        for branch in branches {
            println!("    {}", style(branch.join(" -> ")).dim());
        }
    }
    println!();
}
