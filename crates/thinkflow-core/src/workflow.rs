//! Stored workflow definitions: variables, nodes, and edges.
//!
//! These are the wire/storage shapes (camelCase JSON). A node's `type` and
//! `config` are decoded together into [`NodeConfig`], so executors work with
//! typed configuration while unknown node types survive a round trip through
//! [`NodeConfig::Custom`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node type tags understood by the built-in executors.
pub mod node_types {
    pub const START_EVENT: &str = "startEvent";
    pub const END_EVENT: &str = "endEvent";
    pub const LLM_CALL: &str = "llmCall";
    pub const SCRIPT: &str = "script";
    pub const CONDITION: &str = "condition";
    pub const SWITCH: &str = "switch";
    pub const PARALLEL_GATEWAY: &str = "parallelGateway";
}

/// A named, typed slot for node or graph input/output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type", default = "default_variable_type")]
    pub var_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_ref: Option<String>,
}

fn default_variable_type() -> String {
    "string".to_string()
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: default_variable_type(),
            description: None,
            required: None,
            default_value: None,
            system_ref: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = Some(true);
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }
}

/// Configuration of an `llmCall` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmCallConfig {
    /// Prompt template with `{VAR_NAME}` placeholders.
    pub prompt: String,
    /// Overrides the configured model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Call the model. When false the rendered prompt is passed through.
    #[serde(default)]
    pub live: bool,
    /// Variable receiving the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Configuration of a `script` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Configuration shared by `condition` and `switch` nodes.
///
/// The discriminator comes from `script` (its return value) when present,
/// otherwise from the value of `variable`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Branch key taken when the discriminator matches no edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// How a converging gateway decides to fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPolicy {
    /// Fire once every incoming edge has delivered a token.
    #[default]
    All,
    /// Fire on the first delivery; later deliveries of the same wave are absorbed.
    First,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub policy: JoinPolicy,
}

/// Typed node configuration, selected by the node's `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    StartEvent,
    EndEvent,
    LlmCall(LlmCallConfig),
    Script(ScriptConfig),
    Condition(BranchConfig),
    Switch(BranchConfig),
    ParallelGateway(GatewayConfig),
    /// Any other node type, kept verbatim.
    Custom {
        node_type: String,
        config: Option<Value>,
    },
}

impl NodeConfig {
    /// Decode a `{type, config}` pair.
    pub fn from_parts(node_type: &str, config: Option<Value>) -> Result<Self, serde_json::Error> {
        use node_types::*;

        fn typed<T: serde::de::DeserializeOwned>(
            config: Option<Value>,
        ) -> Result<T, serde_json::Error> {
            serde_json::from_value(config.unwrap_or_else(|| Value::Object(Default::default())))
        }

        Ok(match node_type {
            START_EVENT => NodeConfig::StartEvent,
            END_EVENT => NodeConfig::EndEvent,
            LLM_CALL => NodeConfig::LlmCall(typed(config)?),
            SCRIPT => NodeConfig::Script(typed(config)?),
            CONDITION => NodeConfig::Condition(typed(config)?),
            SWITCH => NodeConfig::Switch(typed(config)?),
            PARALLEL_GATEWAY => NodeConfig::ParallelGateway(typed(config)?),
            other => NodeConfig::Custom {
                node_type: other.to_string(),
                config,
            },
        })
    }

    /// The `type` tag this configuration serializes under.
    pub fn type_tag(&self) -> &str {
        use node_types::*;
        match self {
            NodeConfig::StartEvent => START_EVENT,
            NodeConfig::EndEvent => END_EVENT,
            NodeConfig::LlmCall(_) => LLM_CALL,
            NodeConfig::Script(_) => SCRIPT,
            NodeConfig::Condition(_) => CONDITION,
            NodeConfig::Switch(_) => SWITCH,
            NodeConfig::ParallelGateway(_) => PARALLEL_GATEWAY,
            NodeConfig::Custom { node_type, .. } => node_type,
        }
    }

    fn to_value(&self) -> Option<Value> {
        match self {
            NodeConfig::StartEvent | NodeConfig::EndEvent => None,
            NodeConfig::LlmCall(c) => serde_json::to_value(c).ok(),
            NodeConfig::Script(c) => serde_json::to_value(c).ok(),
            NodeConfig::Condition(c) | NodeConfig::Switch(c) => serde_json::to_value(c).ok(),
            NodeConfig::ParallelGateway(c) => serde_json::to_value(c).ok(),
            NodeConfig::Custom { config, .. } => config.clone(),
        }
    }
}

/// A node in a workflow definition.
///
/// `incoming`/`outgoing` hold edge ids. When a stored definition omits them,
/// the execution graph derives them from the edge list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub label: Option<String>,
    pub config: NodeConfig,
    pub inputs: Vec<Variable>,
    pub outputs: Vec<Variable>,
    pub incoming: Option<Vec<String>>,
    pub outgoing: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inputs: Vec<Variable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    incoming: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outgoing: Option<Vec<String>>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let config = NodeConfig::from_parts(&raw.node_type, raw.config)
            .map_err(|e| format!("node '{}' ({}): {}", raw.id, raw.node_type, e))?;
        Ok(Self {
            id: raw.id,
            label: raw.label,
            config,
            inputs: raw.inputs,
            outputs: raw.outputs,
            incoming: raw.incoming,
            outgoing: raw.outgoing,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        Self {
            node_type: node.config.type_tag().to_string(),
            config: node.config.to_value(),
            id: node.id,
            label: node.label,
            inputs: node.inputs,
            outputs: node.outputs,
            incoming: node.incoming,
            outgoing: node.outgoing,
        }
    }
}

impl Node {
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: None,
            config,
            inputs: vec![],
            outputs: vec![],
            incoming: None,
            outgoing: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeConfig::StartEvent)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeConfig::EndEvent)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_inputs(mut self, names: &[&str]) -> Self {
        self.inputs = names.iter().map(|n| Variable::new(*n)).collect();
        self
    }

    pub fn with_outputs(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|n| Variable::new(*n)).collect();
        self
    }

    pub fn node_type(&self) -> &str {
        self.config.type_tag()
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|v| v.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|v| v.name.clone()).collect()
    }

    pub fn incoming_edges(&self) -> &[String] {
        self.incoming.as_deref().unwrap_or(&[])
    }

    pub fn outgoing_edges(&self) -> &[String] {
        self.outgoing.as_deref().unwrap_or(&[])
    }

    /// Join policy of a `parallelGateway`; `None` for every other node.
    pub fn join_policy(&self) -> Option<JoinPolicy> {
        match &self.config {
            NodeConfig::ParallelGateway(gateway) => Some(gateway.policy),
            _ => None,
        }
    }
}

/// A directed connection from a node's output handle to another node's input handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            edge_type: None,
            label: None,
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Key a branching node matches its discriminator against:
    /// `sourceHandle`, then `label`, then the edge id.
    pub fn branch_key(&self) -> &str {
        self.source_handle
            .as_deref()
            .or(self.label.as_deref())
            .unwrap_or(&self.id)
    }
}

/// A workflow as held by the definition store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub inputs: Vec<Variable>,
    #[serde(default)]
    pub outputs: Vec<Variable>,
}
