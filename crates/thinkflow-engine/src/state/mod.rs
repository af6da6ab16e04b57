//! Mutable run state.
//!
//! [`ExecutionTracker`] owns the token set, join bookkeeping, variables and
//! status of one run. It is the single writer for its instance: the run
//! loop drives it from one task, and other parties only ever see the deep
//! copies returned by [`ExecutionTracker::current_state`].

pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStateStore;
pub use store::InMemoryStateStore;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::StateStore;
use thinkflow_core::types::{ExecutionSnapshot, ExecutionStatus, InstanceId, NodeFailure};

use crate::graph::ExecutionGraph;

pub struct ExecutionTracker {
    instance_id: InstanceId,
    graph_id: String,
    current_node_ids: BTreeSet<String>,
    completed_incoming: BTreeMap<String, BTreeSet<String>>,
    variables: HashMap<String, Value>,
    status: ExecutionStatus,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    error: Option<String>,
    node_errors: Vec<NodeFailure>,
    store: Arc<dyn StateStore>,
}

impl ExecutionTracker {
    /// Start a new run of `graph`.
    ///
    /// Seeds variables from `inputs`; declared graph inputs the caller did
    /// not supply take their default value. The unique start node becomes
    /// the only active token, and the fresh state is persisted.
    pub fn create_new_instance(
        graph: &ExecutionGraph,
        inputs: HashMap<String, Value>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let start = graph.start_node()?;

        let mut variables = inputs;
        for declared in &graph.inputs {
            if variables.contains_key(&declared.name) {
                continue;
            }
            match &declared.default_value {
                Some(default) => {
                    variables.insert(declared.name.clone(), default.clone());
                }
                None if declared.is_required() => {
                    return Err(ThinkflowError::MissingRequiredInput(declared.name.clone()));
                }
                None => {}
            }
        }

        let mut tracker = Self {
            instance_id: InstanceId::new(),
            graph_id: graph.id.clone(),
            current_node_ids: BTreeSet::new(),
            completed_incoming: BTreeMap::new(),
            variables,
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            node_errors: Vec::new(),
            store,
        };
        tracker.activate_node(&start.id);
        tracker.persist_state()?;

        debug!(
            instance_id = %tracker.instance_id,
            graph_id = %tracker.graph_id,
            start = %start.id,
            "Created run instance"
        );
        Ok(tracker)
    }

    /// Rebuild a tracker from its persisted state. `None` when the id is unknown.
    pub fn load(id: &InstanceId, store: Arc<dyn StateStore>) -> Result<Option<Self>> {
        Ok(store
            .get(id)?
            .map(|snapshot| Self::from_snapshot(snapshot, store.clone())))
    }

    pub fn from_snapshot(snapshot: ExecutionSnapshot, store: Arc<dyn StateStore>) -> Self {
        Self {
            instance_id: snapshot.instance_id,
            graph_id: snapshot.graph_id,
            current_node_ids: snapshot.current_node_ids.into_iter().collect(),
            completed_incoming: snapshot
                .completed_incoming_edge_ids
                .into_iter()
                .map(|(node, edges)| (node, edges.into_iter().collect()))
                .collect(),
            variables: snapshot.variables.into_iter().collect(),
            status: snapshot.status,
            start_time: snapshot.start_time,
            end_time: snapshot.end_time,
            error: snapshot.error,
            node_errors: snapshot.node_errors,
            store,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    // ── Tokens ──────────────────────────────────────────────────

    /// Add a token. Returns false if the node was already active.
    pub fn activate_node(&mut self, id: &str) -> bool {
        self.current_node_ids.insert(id.to_string())
    }

    /// Remove a token. Returns false if the node was not active.
    pub fn complete_node(&mut self, id: &str) -> bool {
        self.current_node_ids.remove(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.current_node_ids.contains(id)
    }

    pub fn active_nodes(&self) -> Vec<String> {
        self.current_node_ids.iter().cloned().collect()
    }

    pub fn has_active_nodes(&self) -> bool {
        !self.current_node_ids.is_empty()
    }

    // ── Variables ───────────────────────────────────────────────

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Copy of the variable store, restricted to `filter` when given.
    /// Names in the filter that are unset are omitted.
    pub fn get_variables(&self, filter: Option<&[String]>) -> HashMap<String, Value> {
        match filter {
            Some(names) => names
                .iter()
                .filter_map(|n| self.variables.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
            None => self.variables.clone(),
        }
    }

    // ── Join bookkeeping ────────────────────────────────────────

    /// Mark `edge_id` as having delivered its token into `node_id`.
    /// Returns false if it already had.
    pub fn record_completed_incoming_flow(&mut self, node_id: &str, edge_id: &str) -> bool {
        self.completed_incoming
            .entry(node_id.to_string())
            .or_default()
            .insert(edge_id.to_string())
    }

    pub fn has_completed_incoming_flow(&self, node_id: &str, edge_id: &str) -> bool {
        self.completed_incoming
            .get(node_id)
            .is_some_and(|edges| edges.contains(edge_id))
    }

    pub fn completed_incoming_flows(&self, node_id: &str) -> usize {
        self.completed_incoming.get(node_id).map_or(0, |e| e.len())
    }

    pub fn clear_completed_incoming_flows(&mut self, node_id: &str) {
        self.completed_incoming.remove(node_id);
    }

    /// Nodes holding at least one delivered-but-unconsumed incoming edge.
    pub fn nodes_with_partial_flows(&self) -> Vec<String> {
        self.completed_incoming
            .iter()
            .filter(|(_, edges)| !edges.is_empty())
            .map(|(node, _)| node.clone())
            .collect()
    }

    // ── Status ──────────────────────────────────────────────────

    /// Move the run to `status`. Terminal statuses stamp the end time.
    /// Leaving a terminal status is refused (returns false).
    pub fn set_status(&mut self, status: ExecutionStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            if self.status != status {
                warn!(
                    instance_id = %self.instance_id,
                    from = %self.status,
                    to = %status,
                    "Ignoring status change out of terminal state"
                );
            }
            return false;
        }

        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        if status.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    /// Record an executor error that did not stop the run.
    pub fn record_node_failure(&mut self, node_id: &str, message: impl Into<String>) {
        self.node_errors.push(NodeFailure {
            node_id: node_id.to_string(),
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn node_failures(&self) -> &[NodeFailure] {
        &self.node_errors
    }

    // ── Persistence ─────────────────────────────────────────────

    pub fn persist_state(&self) -> Result<()> {
        self.store.save(&self.current_state())
    }

    /// Deep copy of the full state, collections flattened for transport.
    /// Variables are sorted by name.
    pub fn current_state(&self) -> ExecutionSnapshot {
        let mut variables: Vec<(String, Value)> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));

        ExecutionSnapshot {
            instance_id: self.instance_id.clone(),
            graph_id: self.graph_id.clone(),
            current_node_ids: self.current_node_ids.iter().cloned().collect(),
            completed_incoming_edge_ids: self
                .completed_incoming
                .iter()
                .map(|(node, edges)| (node.clone(), edges.iter().cloned().collect()))
                .collect(),
            variables,
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            error: self.error.clone(),
            node_errors: self.node_errors.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use thinkflow_core::workflow::{Node, Variable};
    use thinkflow_test_utils::fixtures::{definition, echo_definition};

    fn tracker() -> (ExecutionTracker, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        let graph = ExecutionGraph::from_definition(echo_definition()).unwrap();
        let tracker =
            ExecutionTracker::create_new_instance(&graph, HashMap::new(), store.clone()).unwrap();
        (tracker, store)
    }

    #[test]
    fn test_new_instance_seeds_start_and_defaults() {
        let (tracker, store) = tracker();
        assert_eq!(tracker.active_nodes(), vec!["start"]);
        assert_eq!(tracker.get_variable("x"), Some(&json!("default")));
        assert_eq!(tracker.status(), ExecutionStatus::Running);
        assert!(store.get(tracker.instance_id()).unwrap().is_some());
    }

    #[test]
    fn test_caller_inputs_override_defaults() {
        let store = Arc::new(InMemoryStateStore::new());
        let graph = ExecutionGraph::from_definition(echo_definition()).unwrap();
        let inputs = HashMap::from([
            ("x".to_string(), json!("hi")),
            ("extra".to_string(), json!(3)),
        ]);
        let tracker = ExecutionTracker::create_new_instance(&graph, inputs, store).unwrap();
        assert_eq!(tracker.get_variable("x"), Some(&json!("hi")));
        assert_eq!(tracker.get_variable("extra"), Some(&json!(3)));
    }

    #[test]
    fn test_missing_required_input() {
        let mut def = definition("req", vec![Node::start("s")], vec![]);
        def.inputs = vec![Variable::new("topic").required()];
        let graph = ExecutionGraph::from_definition(def).unwrap();
        let result = ExecutionTracker::create_new_instance(
            &graph,
            HashMap::new(),
            Arc::new(InMemoryStateStore::new()),
        );
        assert!(matches!(result, Err(ThinkflowError::MissingRequiredInput(name)) if name == "topic"));
    }

    #[test]
    fn test_no_start_node_fails_creation() {
        let def = definition("empty", vec![Node::end("e")], vec![]);
        let graph = ExecutionGraph::from_definition(def).unwrap();
        let result = ExecutionTracker::create_new_instance(
            &graph,
            HashMap::new(),
            Arc::new(InMemoryStateStore::new()),
        );
        assert!(matches!(result, Err(ThinkflowError::NoStartNode(_))));
    }

    #[test]
    fn test_activation_is_idempotent() {
        let (mut tracker, _) = tracker();
        assert!(tracker.activate_node("llm"));
        assert!(!tracker.activate_node("llm"));
        assert_eq!(tracker.active_nodes(), vec!["llm", "start"]);
    }

    #[test]
    fn test_completion_is_idempotent() {
        let (mut tracker, _) = tracker();
        assert!(tracker.complete_node("start"));
        assert!(!tracker.is_active("start"));
        assert!(!tracker.complete_node("start"));
        assert!(!tracker.is_active("start"));
        assert!(!tracker.has_active_nodes());
    }

    #[test]
    fn test_variable_filter() {
        let (mut tracker, _) = tracker();
        tracker.set_variable("a", json!(1));
        tracker.set_variable("b", json!(2));
        tracker.set_variable("a", json!(10));

        let filtered = tracker.get_variables(Some(&["a".to_string(), "missing".to_string()]));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered["a"], json!(10));

        let all = tracker.get_variables(None);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_join_bookkeeping() {
        let (mut tracker, _) = tracker();
        assert!(tracker.record_completed_incoming_flow("j", "e1"));
        assert!(!tracker.record_completed_incoming_flow("j", "e1"));
        tracker.record_completed_incoming_flow("j", "e2");
        assert!(tracker.has_completed_incoming_flow("j", "e1"));
        assert!(!tracker.has_completed_incoming_flow("j", "e3"));
        assert_eq!(tracker.completed_incoming_flows("j"), 2);
        assert_eq!(tracker.nodes_with_partial_flows(), vec!["j"]);

        tracker.clear_completed_incoming_flows("j");
        assert!(!tracker.has_completed_incoming_flow("j", "e1"));
        assert!(tracker.nodes_with_partial_flows().is_empty());
    }

    #[test]
    fn test_status_moves_forward_only() {
        let (mut tracker, _) = tracker();
        assert!(tracker.set_status(ExecutionStatus::Failed, Some("boom".into())));
        let snap = tracker.current_state();
        assert!(snap.end_time.is_some());
        assert_eq!(snap.error.as_deref(), Some("boom"));

        assert!(!tracker.set_status(ExecutionStatus::Running, None));
        assert!(!tracker.set_status(ExecutionStatus::Completed, None));
        assert_eq!(tracker.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let (mut tracker, _) = tracker();
        let mut snap = tracker.current_state();
        snap.current_node_ids.push("ghost".into());
        snap.variables.clear();
        assert!(!tracker.is_active("ghost"));
        assert!(tracker.get_variable("x").is_some());

        tracker.set_variable("y", json!(true));
        assert!(snap.variable("y").is_none());
    }

    #[test]
    fn test_persist_and_load_roundtrip() {
        let (mut tracker, store) = tracker();
        tracker.record_completed_incoming_flow("j", "e1");
        tracker.set_variable("answer", json!({ "n": 42 }));
        tracker.record_node_failure("llm", "provider down");
        tracker.persist_state().unwrap();

        let loaded = ExecutionTracker::load(tracker.instance_id(), store.clone())
            .unwrap()
            .unwrap();
        assert_eq!(loaded.current_state(), tracker.current_state());
        assert_eq!(loaded.node_failures().len(), 1);
    }

    #[test]
    fn test_load_unknown_id() {
        let store = Arc::new(InMemoryStateStore::new());
        let loaded = ExecutionTracker::load(&InstanceId::from("nope"), store).unwrap();
        assert!(loaded.is_none());
    }
}
