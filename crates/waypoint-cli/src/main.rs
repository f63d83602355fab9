//! Waypoint CLI entry point.
//!
//! Binary name: `wpt`
//!
//! Parses CLI arguments, initializes tracing and application state, then
//! dispatches to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::{AppState, ConsentMode};
use waypoint_observe::TracingOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tracing_options = TracingOptions {
        enable_otel: cli.otel,
        ..TracingOptions::from_verbosity(cli.verbose, cli.quiet)
    };
    waypoint_observe::init_tracing(&tracing_options)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    waypoint_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;

    // Commands that never touch storage
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "wpt", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::definition::validate(file, json),
        _ => {}
    }

    let consent = consent_mode(&cli.command, json);
    let state = AppState::init(consent).await?;

    match cli.command {
        Commands::Plan { workflow } => {
            cli::definition::plan(&state, &workflow, json)?;
        }
        Commands::Run {
            workflow,
            session,
            context,
            ..
        } => {
            cli::run::run(&state, &workflow, session, context.as_deref(), json).await?;
        }
        Commands::Resume {
            session, workflow, ..
        } => {
            cli::run::resume(&state, &workflow, &session, json).await?;
        }
        Commands::Sessions { workflow, prefix } => {
            cli::session::list_sessions(&state, workflow, prefix, json).await?;
        }
        Commands::Checkpoints { session } => {
            cli::session::list_checkpoints(&state, &session, json).await?;
        }
        Commands::Rollback {
            session,
            target,
            preview,
            yes,
        } => {
            cli::rollback::rollback(&state, &session, &target.join(" "), preview, yes, json)
                .await?;
        }
        Commands::Prune {
            keep,
            older_than_days,
        } => {
            cli::session::prune(&state, keep, older_than_days, json).await?;
        }
        Commands::Completions { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

/// `--yes` approves a dirty working tree; `--json` without it refuses
/// rather than prompting.
fn consent_mode(command: &Commands, json: bool) -> ConsentMode {
    let yes = match command {
        Commands::Run { yes, .. }
        | Commands::Resume { yes, .. }
        | Commands::Rollback { yes, .. } => *yes,
        _ => false,
    };
    if yes {
        ConsentMode::Approve
    } else if json {
        ConsentMode::Deny
    } else {
        ConsentMode::Prompt
    }
}
