//! Node executors and the type-tag registry that dispatches to them.

pub mod branch;
pub mod llm;
pub mod markers;
pub mod script;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use thinkflow_core::config::ModelConfig;
use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::LlmClient;
use thinkflow_core::workflow::{node_types, Node};

use crate::graph::ExecutionGraph;
use crate::sandbox::ScriptSandbox;
use crate::state::ExecutionTracker;

pub use branch::BranchExecutor;
pub use llm::LlmCallExecutor;
pub use markers::MarkerExecutor;
pub use script::ScriptExecutor;

/// Which outgoing edges the traversal engine should follow after a node ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// Every outgoing edge.
    All,
    /// Only these edge ids. Empty means none.
    Only(Vec<String>),
    /// Outgoing edges whose [`branch_key`](thinkflow_core::workflow::Edge::branch_key)
    /// equals `key`; when none does, those matching `fallback`.
    Branch {
        key: String,
        fallback: Option<String>,
    },
}

impl Routing {
    /// The edge ids to follow out of `node`, in outgoing order.
    ///
    /// Edge ids that do not resolve in the graph are kept so the traversal
    /// engine can report them.
    pub fn select<'n>(&self, node: &'n Node, graph: &ExecutionGraph) -> Vec<&'n str> {
        let outgoing = node.outgoing_edges().iter().map(String::as_str);
        match self {
            Routing::All => outgoing.collect(),
            Routing::Only(ids) => outgoing.filter(|id| ids.iter().any(|i| i == id)).collect(),
            Routing::Branch { key, fallback } => {
                let matching = |wanted: &str| -> Vec<&'n str> {
                    node.outgoing_edges()
                        .iter()
                        .map(String::as_str)
                        .filter(|id| graph.edge(id).is_some_and(|e| e.branch_key() == wanted))
                        .collect()
                };
                let selected = matching(key);
                match fallback {
                    Some(fallback) if selected.is_empty() => matching(fallback),
                    _ => selected,
                }
            }
        }
    }
}

/// Runs one node type against the run's state.
///
/// Executors read their inputs from the tracker, write outputs back with
/// `set_variable`, and report which outgoing edges to follow. They never
/// touch the token set.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        tracker: &'a mut ExecutionTracker,
    ) -> BoxFuture<'a, Result<Routing>>;
}

/// The variables a node may read: its declared inputs, or everything when
/// it declares none.
pub fn node_inputs(node: &Node, tracker: &ExecutionTracker) -> HashMap<String, Value> {
    if node.inputs.is_empty() {
        tracker.get_variables(None)
    } else {
        tracker.get_variables(Some(&node.input_names()))
    }
}

/// Maps node type tags to executors.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor for a type tag, replacing any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, executor: impl NodeExecutor) {
        self.executors.insert(node_type.into(), Arc::new(executor));
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Registered type tags, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    /// Execute `node` with the executor registered for its type.
    pub async fn execute(&self, node: &Node, tracker: &mut ExecutionTracker) -> Result<Routing> {
        let executor = self
            .get(node.node_type())
            .ok_or_else(|| ThinkflowError::UnknownNodeType(node.node_type().to_string()))?;
        executor.execute(node, tracker).await
    }

    /// Registry with every built-in node type.
    ///
    /// Without an `llm` client, `llmCall` nodes configured as live fail with
    /// `LlmNotConfigured`; dry-run nodes still work.
    pub fn with_defaults(
        llm: Option<Arc<dyn LlmClient>>,
        model: Option<ModelConfig>,
        sandbox: ScriptSandbox,
    ) -> Self {
        let mut registry = Self::new();

        registry.register(node_types::START_EVENT, MarkerExecutor);
        registry.register(node_types::END_EVENT, MarkerExecutor);
        registry.register(node_types::PARALLEL_GATEWAY, MarkerExecutor);

        registry.register(node_types::LLM_CALL, LlmCallExecutor::new(llm, model));
        registry.register(node_types::SCRIPT, ScriptExecutor::new(sandbox.clone()));
        registry.register(node_types::CONDITION, BranchExecutor::new(sandbox.clone()));
        registry.register(node_types::SWITCH, BranchExecutor::new(sandbox));

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
