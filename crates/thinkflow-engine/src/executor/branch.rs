use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::workflow::{BranchConfig, Node, NodeConfig};

use super::{node_inputs, NodeExecutor, Routing};
use crate::sandbox::ScriptSandbox;
use crate::state::ExecutionTracker;
use crate::template;

/// Executes `condition` and `switch` nodes.
///
/// The discriminator is the return value of `config.script`, or the value
/// of `config.variable`. A `switch` follows the edges whose branch key
/// equals the discriminator's display form. A `condition` reduces it to
/// `"true"` or `"false"` first.
pub struct BranchExecutor {
    sandbox: ScriptSandbox,
}

impl BranchExecutor {
    pub fn new(sandbox: ScriptSandbox) -> Self {
        Self { sandbox }
    }

    async fn discriminator(
        &self,
        node: &Node,
        config: &BranchConfig,
        tracker: &ExecutionTracker,
    ) -> Result<Value> {
        if let Some(script) = &config.script {
            let scope = node_inputs(node, tracker);
            let timeout = config.timeout_ms.map(Duration::from_millis);
            let output = self.sandbox.run(&node.id, script, scope, timeout).await?;
            return Ok(output.returned.unwrap_or(Value::Null));
        }
        if let Some(variable) = &config.variable {
            return Ok(tracker.get_variable(variable).cloned().unwrap_or(Value::Null));
        }
        Err(ThinkflowError::InvalidDefinition(format!(
            "branch node '{}' has neither a script nor a variable",
            node.id
        )))
    }
}

/// Truthiness used by `condition` nodes: `null`, `false`, `0`, `""` and
/// `"false"` are false.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl NodeExecutor for BranchExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        tracker: &'a mut ExecutionTracker,
    ) -> BoxFuture<'a, Result<Routing>> {
        Box::pin(async move {
            let (config, is_condition) = match &node.config {
                NodeConfig::Condition(c) => (c, true),
                NodeConfig::Switch(c) => (c, false),
                _ => {
                    return Err(ThinkflowError::InvalidDefinition(format!(
                        "node '{}' is not a branch node",
                        node.id
                    )))
                }
            };

            let value = self.discriminator(node, config, tracker).await?;
            let key = if is_condition {
                truthy(&value).to_string()
            } else {
                template::discriminator(&value)
            };

            debug!(
                instance_id = %tracker.instance_id(),
                node_id = %node.id,
                key = %key,
                "Branch selected"
            );
            Ok(Routing::Branch {
                key,
                fallback: config.default.clone(),
            })
        })
    }
}
