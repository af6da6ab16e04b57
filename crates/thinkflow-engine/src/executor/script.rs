use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::workflow::{Node, NodeConfig};

use super::{node_inputs, NodeExecutor, Routing};
use crate::sandbox::ScriptSandbox;
use crate::state::ExecutionTracker;

/// Executes `script` nodes in the Lua sandbox.
///
/// The node's inputs seed the script scope. Afterwards the declared
/// outputs are copied back from scope; a node that declares no outputs
/// writes back every serializable scope entry.
pub struct ScriptExecutor {
    sandbox: ScriptSandbox,
}

impl ScriptExecutor {
    pub fn new(sandbox: ScriptSandbox) -> Self {
        Self { sandbox }
    }
}

impl NodeExecutor for ScriptExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        tracker: &'a mut ExecutionTracker,
    ) -> BoxFuture<'a, Result<Routing>> {
        Box::pin(async move {
            let NodeConfig::Script(config) = &node.config else {
                return Err(ThinkflowError::InvalidDefinition(format!(
                    "node '{}' is not a script node",
                    node.id
                )));
            };

            let scope = node_inputs(node, tracker);
            let timeout = config.timeout_ms.map(Duration::from_millis);
            let mut output = self
                .sandbox
                .run(&node.id, &config.source, scope, timeout)
                .await?;

            if node.outputs.is_empty() {
                for (name, value) in output.scope {
                    tracker.set_variable(name, value);
                }
            } else {
                for declared in &node.outputs {
                    if let Some(value) = output.scope.remove(&declared.name) {
                        tracker.set_variable(declared.name.clone(), value);
                    } else {
                        debug!(
                            node_id = %node.id,
                            output = %declared.name,
                            "Declared output not set by script"
                        );
                    }
                }
            }
            Ok(Routing::All)
        })
    }
}
