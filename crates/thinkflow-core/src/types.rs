use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique run identifier. Also the RPC correlation key of the run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// What to do when a node executor returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeErrorPolicy {
    /// Log, record the failure, and keep traversing.
    #[default]
    Continue,
    /// Fail the run with the node's error.
    Fail,
}

/// A node error absorbed under [`NodeErrorPolicy::Continue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    pub node_id: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Serialized run state.
///
/// Sets and maps are flattened to arrays of entries so the snapshot travels
/// unchanged over the broker and into any keyed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub instance_id: InstanceId,
    pub graph_id: String,
    pub current_node_ids: Vec<String>,
    pub completed_incoming_edge_ids: Vec<(String, Vec<String>)>,
    pub variables: Vec<(String, Value)>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_errors: Vec<NodeFailure>,
}

impl ExecutionSnapshot {
    /// Look up a variable by name.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

/// Per-request overrides of engine settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_node_error: Option<NodeErrorPolicy>,
}

/// Run-initiation payload carried in an RPC request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Id of the workflow definition to load.
    pub thinking_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RunOverrides>,
}

impl RunRequest {
    pub fn new(thinking_id: impl Into<String>) -> Self {
        Self {
            thinking_id: thinking_id.into(),
            inputs: HashMap::new(),
            config: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }
}

/// Response from a generative-model call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Progress events published while a run executes.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        instance_id: InstanceId,
        graph_id: String,
    },
    NodeStarted {
        instance_id: InstanceId,
        node_id: String,
        node_type: String,
    },
    NodeCompleted {
        instance_id: InstanceId,
        node_id: String,
        activated: Vec<String>,
    },
    NodeFailed {
        instance_id: InstanceId,
        node_id: String,
        error: String,
    },
    RunFinished {
        instance_id: InstanceId,
        status: ExecutionStatus,
        rounds: usize,
    },
}
