use std::sync::Arc;

use tracing::info;

use thinkflow_core::config::EngineConfig;
use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::event::EventBus;
use thinkflow_core::traits::{DefinitionStore, StateStore};
use thinkflow_core::types::{ExecutionSnapshot, RunRequest};

use crate::executor::ExecutorRegistry;
use crate::graph::ExecutionGraph;
use crate::orchestrator::Orchestrator;

/// Turns a [`RunRequest`] into a finished (or stopped) run.
///
/// Shared by the RPC worker and the local `run` command.
pub struct RunService {
    definitions: Arc<dyn DefinitionStore>,
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    engine: EngineConfig,
}

impl RunService {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        registry: Arc<ExecutorRegistry>,
        store: Arc<dyn StateStore>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            definitions,
            registry,
            store,
            events: Arc::new(EventBus::default()),
            engine,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Load the requested definition, apply per-request overrides, and run it.
    pub async fn handle(&self, request: RunRequest) -> Result<ExecutionSnapshot> {
        let RunRequest {
            thinking_id,
            inputs,
            config,
        } = request;

        let definition = self
            .definitions
            .load(thinking_id.clone())
            .await?
            .ok_or_else(|| ThinkflowError::DefinitionNotFound(thinking_id.clone()))?;
        let graph = ExecutionGraph::from_definition(definition)?;

        let overrides = config.unwrap_or_default();
        let max_iterations = overrides
            .max_iterations
            .unwrap_or(self.engine.max_iterations);
        let policy = overrides.on_node_error.unwrap_or(self.engine.on_node_error);

        let orchestrator = Orchestrator::new(self.registry.clone(), self.store.clone())
            .with_events(self.events.clone())
            .with_max_iterations(max_iterations)
            .with_error_policy(policy);

        info!(
            thinking_id = %thinking_id,
            nodes = graph.node_count(),
            max_iterations = orchestrator.max_iterations(),
            on_node_error = ?orchestrator.error_policy(),
            "Handling run request"
        );
        orchestrator.execute(&graph, inputs).await
    }
}
