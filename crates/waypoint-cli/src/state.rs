//! Application state wiring storage, version control, and stage handlers.
//!
//! `AppState` pins the generic core types to the concrete infra
//! implementations used by the `wpt` binary.

use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use dialoguer::Confirm;

use waypoint_core::vcs::BoxVcs;
use waypoint_core::workflow::checkpoint::{
    CheckpointStore, ConsentCallback, ConsentPurpose, ConsentRequest,
};
use waypoint_core::workflow::executor::WorkflowOrchestrator;
use waypoint_core::workflow::rollback::RollbackCoordinator;
use waypoint_core::workflow::stage::{NoopStage, StageRegistry};
use waypoint_infra::config::load_engine_config;
use waypoint_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use waypoint_infra::sqlite::pool::database_url;
use waypoint_infra::sqlite::{DatabasePool, SqliteCheckpointRepository};
use waypoint_infra::stage::ShellStage;
use waypoint_infra::vcs::build_vcs;
use waypoint_types::config::EngineConfig;

pub type ConcreteStore = CheckpointStore<SqliteCheckpointRepository>;
pub type ConcreteOrchestrator = WorkflowOrchestrator<SqliteCheckpointRepository>;
pub type ConcreteRollback = RollbackCoordinator<SqliteCheckpointRepository>;

/// How dirty-tree consent is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentMode {
    /// Approve without asking (`--yes`).
    Approve,
    /// Ask on the terminal.
    Prompt,
    /// Refuse (non-interactive output such as `--json`).
    Deny,
}

/// Shared application state for all commands that touch storage.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub store: Arc<ConcreteStore>,
    pub registry: Arc<StageRegistry>,
}

impl AppState {
    /// Resolve the data directory, load config, open the database, and wire
    /// the checkpoint store.
    pub async fn init(consent: ConsentMode) -> anyhow::Result<Self> {
        let data_dir = ensure_data_dir(resolve_data_dir()).await?;
        let config = load_engine_config(&data_dir).await;

        let db_url = format!("{}?mode=rwc", database_url(&data_dir));
        let db_pool = DatabasePool::new(&db_url).await?;

        let vcs: BoxVcs = build_vcs(&config.vcs);
        tracing::debug!(vcs = vcs.name(), data_dir = %data_dir.display(), "app state ready");

        let store = CheckpointStore::new(SqliteCheckpointRepository::new(db_pool))
            .with_vcs(Arc::new(vcs))
            .with_snapshot_timeout(config.vcs_snapshot_timeout())
            .with_consent(consent_callback(consent));

        let mut registry = StageRegistry::new();
        registry.register("noop", NoopStage);
        let shell = match &config.vcs.repository {
            Some(repo) => ShellStage::new().with_working_dir(repo),
            None => ShellStage::new(),
        };
        registry.register("shell", shell);

        Ok(Self {
            data_dir,
            config,
            store: Arc::new(store),
            registry: Arc::new(registry),
        })
    }

    pub fn orchestrator(&self) -> ConcreteOrchestrator {
        WorkflowOrchestrator::new(self.store.clone(), self.registry.clone(), self.config.clone())
    }

    pub fn rollback(&self) -> ConcreteRollback {
        RollbackCoordinator::new(self.store.clone())
    }

    /// Directory searched when `run`/`resume` get a workflow ID instead of a path.
    pub fn workflows_dir(&self) -> PathBuf {
        self.data_dir.join("workflows")
    }
}

fn consent_callback(mode: ConsentMode) -> ConsentCallback {
    Arc::new(move |request: &ConsentRequest| match mode {
        ConsentMode::Approve => true,
        ConsentMode::Deny => false,
        ConsentMode::Prompt => prompt_consent(request),
    })
}

fn prompt_consent(request: &ConsentRequest) -> bool {
    let action = match request.purpose {
        ConsentPurpose::RunStart => "start checkpointing",
        ConsentPurpose::Rollback => "take a safety checkpoint and roll back",
    };

    eprintln!();
    eprintln!(
        "  {} The working tree has uncommitted changes.",
        style("!").yellow().bold()
    );
    for file in request.staged_files.iter().take(10) {
        eprintln!("    {}", style(file).dim());
    }
    if request.staged_files.len() > 10 {
        eprintln!("    ... and {} more", request.staged_files.len() - 10);
    }

    Confirm::new()
        .with_prompt(format!(
            "Include them and {action} for session '{}'?",
            style(&request.session_id).cyan()
        ))
        .default(false)
        .interact()
        .unwrap_or(false)
}
