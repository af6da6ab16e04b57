use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::{Completion, ExecutionSnapshot, ExecutionStatus, InstanceId};
use crate::workflow::WorkflowDefinition;

/// Generative-model client used by `llmCall` nodes.
///
/// A fallible remote call; implementations do not retry.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a single prompt and return the model's response.
    fn generate(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>>;
}

/// Keyed storage for run state.
///
/// Calls are synchronous: the tracker persists after every mutation from
/// inside the run loop.
pub trait StateStore: Send + Sync + 'static {
    /// Insert or replace the snapshot of a run.
    fn save(&self, state: &ExecutionSnapshot) -> Result<()>;

    /// Load a snapshot, `None` when the id is unknown.
    fn get(&self, id: &InstanceId) -> Result<Option<ExecutionSnapshot>>;

    /// Remove a snapshot. Returns whether it existed.
    fn delete(&self, id: &InstanceId) -> Result<bool>;

    /// All snapshots currently in the given status.
    fn list_by_status(&self, status: ExecutionStatus) -> Result<Vec<ExecutionSnapshot>>;
}

/// Read-only source of workflow definitions.
pub trait DefinitionStore: Send + Sync + 'static {
    /// Load a definition by id, `None` when it does not exist.
    fn load(&self, id: String) -> BoxFuture<'_, Result<Option<WorkflowDefinition>>>;
}
