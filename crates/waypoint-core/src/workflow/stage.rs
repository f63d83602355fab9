//! Stage contract, type-erased stage handlers, and the handler registry.
//!
//! A `Stage` performs one unit of work. It receives the stage declaration and
//! a shared borrow of the workflow state, and returns a new context value that
//! the orchestrator merges back. Stages never hold write access to the state.
//!
//! `Stage` uses RPITIT, so it cannot be a trait object directly. Same
//! blanket-impl pattern as the other boxed ports in this crate:
//! 1. `StageDyn` is object-safe and returns boxed futures
//! 2. `StageDyn` is blanket-implemented for every `T: Stage`
//! 3. `BoxStage` wraps `Box<dyn StageDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use waypoint_types::workflow::{StageDefinition, WorkflowDefinition};

use super::state::WorkflowState;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// What a successful stage hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    /// Replacement context payload for subsequent stages.
    pub context: Value,
    /// Stage-specific output. Numeric `files_changed` / `lines_added` keys
    /// feed checkpoint metrics.
    pub output: Option<Value>,
}

impl StageOutcome {
    /// Pass the current context through unchanged.
    pub fn unchanged(state: &WorkflowState) -> Self {
        Self {
            context: state.context.clone(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("stage execution failed: {0}")]
    Execution(String),

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid stage parameters: {0}")]
    InvalidParams(String),

    #[error("unknown handler '{handler}' for stage '{stage_id}'")]
    UnknownHandler { stage_id: String, handler: String },
}

/// A pluggable unit of work.
pub trait Stage: Send + Sync {
    /// Perform the work. Called once per attempt, under the stage timeout.
    fn execute(
        &self,
        definition: &StageDefinition,
        state: &WorkflowState,
    ) -> impl Future<Output = Result<StageOutcome, StageError>> + Send;

    /// Pre-flight check. A `false` result fails the stage without consuming
    /// an attempt.
    fn validate_inputs(&self, _definition: &StageDefinition, _state: &WorkflowState) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

/// Object-safe version of [`Stage`] with boxed futures.
pub trait StageDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        definition: &'a StageDefinition,
        state: &'a WorkflowState,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutcome, StageError>> + Send + 'a>>;

    fn validate_inputs_dyn(&self, definition: &StageDefinition, state: &WorkflowState) -> bool;
}

impl<T: Stage> StageDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        definition: &'a StageDefinition,
        state: &'a WorkflowState,
    ) -> Pin<Box<dyn Future<Output = Result<StageOutcome, StageError>> + Send + 'a>> {
        Box::pin(self.execute(definition, state))
    }

    fn validate_inputs_dyn(&self, definition: &StageDefinition, state: &WorkflowState) -> bool {
        self.validate_inputs(definition, state)
    }
}

/// Type-erased stage handler for runtime lookup by handler ID.
pub struct BoxStage {
    inner: Box<dyn StageDyn>,
}

impl BoxStage {
    pub fn new<T: Stage + 'static>(stage: T) -> Self {
        Self {
            inner: Box::new(stage),
        }
    }

    pub async fn execute(
        &self,
        definition: &StageDefinition,
        state: &WorkflowState,
    ) -> Result<StageOutcome, StageError> {
        self.inner.execute_boxed(definition, state).await
    }

    pub fn validate_inputs(&self, definition: &StageDefinition, state: &WorkflowState) -> bool {
        self.inner.validate_inputs_dyn(definition, state)
    }
}

impl std::fmt::Debug for BoxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStage").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handlers keyed by handler ID.
#[derive(Default, Debug)]
pub struct StageRegistry {
    handlers: HashMap<String, Arc<BoxStage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same ID.
    pub fn register<T: Stage + 'static>(&mut self, handler_id: impl Into<String>, stage: T) {
        self.handlers
            .insert(handler_id.into(), Arc::new(BoxStage::new(stage)));
    }

    pub fn contains(&self, handler_id: &str) -> bool {
        self.handlers.contains_key(handler_id)
    }

    /// Sorted handler IDs.
    pub fn handler_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn lookup(&self, stage: &StageDefinition) -> Result<Arc<BoxStage>, StageError> {
        self.handlers
            .get(&stage.handler)
            .cloned()
            .ok_or_else(|| StageError::UnknownHandler {
                stage_id: stage.id.clone(),
                handler: stage.handler.clone(),
            })
    }

    /// Resolve the handler of every stage up front, keyed by stage ID.
    ///
    /// Fails on the first stage (in declaration order) with no handler.
    pub fn resolve_all(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<HashMap<String, Arc<BoxStage>>, StageError> {
        definition
            .stages
            .iter()
            .map(|s| Ok((s.id.clone(), self.lookup(s)?)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Built-in stages
// ---------------------------------------------------------------------------

/// Does nothing and passes the context through.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStage;

impl Stage for NoopStage {
    async fn execute(
        &self,
        _definition: &StageDefinition,
        state: &WorkflowState,
    ) -> Result<StageOutcome, StageError> {
        Ok(StageOutcome::unchanged(state))
    }
}
