use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info};

use thinkflow_core::config::ModelConfig;
use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::LlmClient;
use thinkflow_core::workflow::{LlmCallConfig, Node, NodeConfig};

use super::{node_inputs, NodeExecutor, Routing};
use crate::state::ExecutionTracker;
use crate::template;

/// Variable written when a node names neither `config.output` nor any output.
pub const DEFAULT_OUTPUT: &str = "llmOutput";

/// Executes `llmCall` nodes.
///
/// The prompt template is rendered from the node's inputs. Live nodes send
/// it to the model; dry-run nodes pass the rendered prompt through as the
/// output.
pub struct LlmCallExecutor {
    client: Option<Arc<dyn LlmClient>>,
    model: Option<ModelConfig>,
}

impl LlmCallExecutor {
    pub fn new(client: Option<Arc<dyn LlmClient>>, model: Option<ModelConfig>) -> Self {
        Self { client, model }
    }

    fn model_for(&self, config: &LlmCallConfig) -> Result<ModelConfig> {
        let base = self.model.as_ref().ok_or_else(|| {
            ThinkflowError::LlmNotConfigured("no [model] section in config".into())
        })?;
        Ok(match &config.model {
            Some(model_id) => base.with_model(model_id),
            None => base.clone(),
        })
    }
}

fn output_name(node: &Node, config: &LlmCallConfig) -> String {
    config
        .output
        .clone()
        .or_else(|| node.outputs.first().map(|v| v.name.clone()))
        .unwrap_or_else(|| DEFAULT_OUTPUT.to_string())
}

impl NodeExecutor for LlmCallExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        tracker: &'a mut ExecutionTracker,
    ) -> BoxFuture<'a, Result<Routing>> {
        Box::pin(async move {
            let NodeConfig::LlmCall(config) = &node.config else {
                return Err(ThinkflowError::InvalidDefinition(format!(
                    "node '{}' is not an llmCall node",
                    node.id
                )));
            };

            let inputs = node_inputs(node, tracker);
            let prompt = template::render(&config.prompt, &inputs);

            let text = if config.live {
                let client = self.client.as_ref().ok_or_else(|| {
                    ThinkflowError::LlmNotConfigured(format!(
                        "node '{}' is live but no model client is available",
                        node.id
                    ))
                })?;
                let model = self.model_for(config)?;
                let completion = client.generate(&model, prompt).await?;
                info!(
                    instance_id = %tracker.instance_id(),
                    node_id = %node.id,
                    model = %model.model_id,
                    input_tokens = completion.input_tokens,
                    output_tokens = completion.output_tokens,
                    "Model call completed"
                );
                completion.text
            } else {
                debug!(node_id = %node.id, "Dry-run llmCall, passing prompt through");
                prompt
            };

            tracker.set_variable(output_name(node, config), Value::String(text));
            Ok(Routing::All)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ExecutionGraph;
    use crate::state::InMemoryStateStore;
    use serde_json::json;
    use std::collections::HashMap;
    use thinkflow_test_utils::fixtures::{definition, llm_node};
    use thinkflow_test_utils::MockLlmClient;

    fn tracker(vars: &[(&str, Value)]) -> ExecutionTracker {
        let graph = ExecutionGraph::from_definition(definition(
            "t",
            vec![Node::start("s")],
            vec![],
        ))
        .unwrap();
        let inputs: HashMap<String, Value> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        ExecutionTracker::create_new_instance(&graph, inputs, Arc::new(InMemoryStateStore::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_dry_run_renders_template() {
        let executor = LlmCallExecutor::new(None, None);
        let node = llm_node("n", "Echo: {x}", false).with_inputs(&["x"]);
        let mut tracker = tracker(&[("x", json!("hi"))]);

        let routing = executor.execute(&node, &mut tracker).await.unwrap();
        assert_eq!(routing, Routing::All);
        assert_eq!(tracker.get_variable(DEFAULT_OUTPUT), Some(&json!("Echo: hi")));
    }

    #[tokio::test]
    async fn test_undeclared_inputs_are_not_rendered() {
        let executor = LlmCallExecutor::new(None, None);
        let node = llm_node("n", "{x} and {secret}", false).with_inputs(&["x"]);
        let mut tracker = tracker(&[("x", json!("a")), ("secret", json!("s3"))]);

        executor.execute(&node, &mut tracker).await.unwrap();
        assert_eq!(tracker.get_variable(DEFAULT_OUTPUT), Some(&json!("a and {secret}")));
    }

    #[tokio::test]
    async fn test_live_call_uses_model_override_and_declared_output() {
        let mock = Arc::new(MockLlmClient::with_responses(&["42"]));
        let executor = LlmCallExecutor::new(
            Some(mock.clone()),
            Some(ModelConfig::new("openai", "gpt-4o-mini")),
        );
        let mut node = llm_node("n", "What is {q}?", true).with_outputs(&["answer"]);
        if let NodeConfig::LlmCall(c) = &mut node.config {
            c.model = Some("gpt-4o".into());
        }
        let mut tracker = tracker(&[("q", json!("6*7"))]);

        executor.execute(&node, &mut tracker).await.unwrap();
        assert_eq!(tracker.get_variable("answer"), Some(&json!("42")));
        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model_id, "gpt-4o");
        assert_eq!(calls[0].prompt, "What is 6*7?");
    }

    #[tokio::test]
    async fn test_config_output_wins() {
        let executor = LlmCallExecutor::new(None, None);
        let mut node = llm_node("n", "x", false).with_outputs(&["declared"]);
        if let NodeConfig::LlmCall(c) = &mut node.config {
            c.output = Some("chosen".into());
        }
        let mut tracker = tracker(&[]);
        executor.execute(&node, &mut tracker).await.unwrap();
        assert!(tracker.get_variable("chosen").is_some());
        assert!(tracker.get_variable("declared").is_none());
    }

    #[tokio::test]
    async fn test_live_without_client_fails() {
        let executor = LlmCallExecutor::new(None, Some(ModelConfig::new("openai", "m")));
        let node = llm_node("n", "hi", true);
        let mut tracker = tracker(&[]);
        let err = executor.execute(&node, &mut tracker).await.unwrap_err();
        assert!(matches!(err, ThinkflowError::LlmNotConfigured(_)));
    }

    #[tokio::test]
    async fn test_client_error_propagates() {
        let mock = Arc::new(MockLlmClient::failing("rate limited"));
        let executor = LlmCallExecutor::new(Some(mock), Some(ModelConfig::new("openai", "m")));
        let node = llm_node("n", "hi", true);
        let mut tracker = tracker(&[]);
        let err = executor.execute(&node, &mut tracker).await.unwrap_err();
        assert!(matches!(err, ThinkflowError::LlmRequest(m) if m == "rate limited"));
        assert!(tracker.get_variable(DEFAULT_OUTPUT).is_none());
    }
}
