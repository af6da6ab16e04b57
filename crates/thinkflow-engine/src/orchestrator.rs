use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::event::EventBus;
use thinkflow_core::traits::StateStore;
use thinkflow_core::types::{
    ExecutionSnapshot, ExecutionStatus, InstanceId, NodeErrorPolicy, RunEvent,
};
use thinkflow_core::workflow::NodeConfig;

use crate::executor::{ExecutorRegistry, Routing};
use crate::graph::ExecutionGraph;
use crate::state::ExecutionTracker;
use crate::traversal::Traversal;

/// Round ceiling used when none is configured.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

/// What one round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Nodes executed this round, in execution order.
    pub processed: Vec<String>,
    /// Nodes that became active during this round.
    pub activated: Vec<String>,
}

/// Drives runs to completion in rounds.
///
/// Each round executes every node in a snapshot of the token set taken when
/// the round starts; nodes activated during the round wait for the next
/// one. The loop stops when the run reaches a terminal status, no token is
/// left, or the round ceiling is hit (which fails the run).
pub struct Orchestrator {
    registry: Arc<ExecutorRegistry>,
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    max_iterations: usize,
    on_node_error: NodeErrorPolicy,
}

impl Orchestrator {
    pub fn new(registry: Arc<ExecutorRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            events: Arc::new(EventBus::default()),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            on_node_error: NodeErrorPolicy::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_error_policy(mut self, policy: NodeErrorPolicy) -> Self {
        self.on_node_error = policy;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn error_policy(&self) -> NodeErrorPolicy {
        self.on_node_error
    }

    /// Start a new run of `graph` and drive it until it stops.
    ///
    /// Initialization errors (no start node, missing required input) are
    /// returned before any round runs. Otherwise the final snapshot is
    /// returned, whatever its status.
    pub async fn execute(
        &self,
        graph: &ExecutionGraph,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionSnapshot> {
        let mut tracker = ExecutionTracker::create_new_instance(graph, inputs, self.store.clone())?;
        self.run(graph, &mut tracker).await?;
        Ok(tracker.current_state())
    }

    /// Continue a persisted run, for example one left waiting or
    /// interrupted by a worker restart.
    pub async fn resume(
        &self,
        graph: &ExecutionGraph,
        instance_id: &InstanceId,
    ) -> Result<ExecutionSnapshot> {
        let mut tracker = ExecutionTracker::load(instance_id, self.store.clone())?
            .ok_or_else(|| ThinkflowError::RunNotFound(instance_id.to_string()))?;
        if tracker.graph_id() != graph.id {
            return Err(ThinkflowError::InvalidDefinition(format!(
                "run {} belongs to workflow '{}', not '{}'",
                instance_id,
                tracker.graph_id(),
                graph.id
            )));
        }
        self.run(graph, &mut tracker).await?;
        Ok(tracker.current_state())
    }

    /// Run rounds until the loop stops. Returns the number of rounds run.
    pub async fn run(&self, graph: &ExecutionGraph, tracker: &mut ExecutionTracker) -> Result<usize> {
        let instance_id = tracker.instance_id().clone();
        info!(%instance_id, graph_id = %graph.id, "Run started");
        self.events.publish(RunEvent::RunStarted {
            instance_id: instance_id.clone(),
            graph_id: graph.id.clone(),
        });

        let mut rounds = 0;
        while tracker.status() == ExecutionStatus::Running
            && tracker.has_active_nodes()
            && rounds < self.max_iterations
        {
            let report = self.step(graph, tracker).await?;
            rounds += 1;
            if report.processed.is_empty() {
                debug!(%instance_id, "Round processed nothing, run is waiting");
                break;
            }
        }

        if tracker.status() == ExecutionStatus::Running
            && tracker.has_active_nodes()
            && rounds >= self.max_iterations
        {
            let message = format!("exceeded maximum iterations ({})", self.max_iterations);
            warn!(%instance_id, active = ?tracker.active_nodes(), "{}", message);
            tracker.set_status(ExecutionStatus::Failed, Some(message));
            tracker.persist_state()?;
        }

        if tracker.status() == ExecutionStatus::Running {
            info!(
                %instance_id,
                joins = ?Traversal::new(graph).stalled_joins(tracker),
                rounds,
                "Run waiting"
            );
        } else {
            info!(%instance_id, status = %tracker.status(), rounds, "Run finished");
        }
        self.events.publish(RunEvent::RunFinished {
            instance_id,
            status: tracker.status(),
            rounds,
        });
        Ok(rounds)
    }

    /// Execute one round over the nodes active right now.
    ///
    /// Ids that went inactive earlier in the round are skipped. With
    /// [`NodeErrorPolicy::Fail`] the round stops at the first executor
    /// error. Store errors are returned.
    pub async fn step(
        &self,
        graph: &ExecutionGraph,
        tracker: &mut ExecutionTracker,
    ) -> Result<RoundReport> {
        let traversal = Traversal::new(graph);
        let mut report = RoundReport::default();

        for node_id in tracker.active_nodes() {
            if tracker.status() != ExecutionStatus::Running {
                break;
            }
            if !tracker.is_active(&node_id) {
                continue;
            }
            let Some(node) = graph.node(&node_id) else {
                warn!(
                    instance_id = %tracker.instance_id(),
                    node_id = %node_id,
                    "Active node not in graph, dropping token"
                );
                tracker.complete_node(&node_id);
                continue;
            };

            debug!(
                instance_id = %tracker.instance_id(),
                node_id = %node_id,
                node_type = node.node_type(),
                "Executing node"
            );
            self.events.publish(RunEvent::NodeStarted {
                instance_id: tracker.instance_id().clone(),
                node_id: node_id.clone(),
                node_type: node.node_type().to_string(),
            });

            let routing = match self.registry.execute(node, tracker).await {
                Ok(routing) => routing,
                Err(e) => {
                    let message = e.to_string();
                    self.events.publish(RunEvent::NodeFailed {
                        instance_id: tracker.instance_id().clone(),
                        node_id: node_id.clone(),
                        error: message.clone(),
                    });

                    match self.on_node_error {
                        NodeErrorPolicy::Fail => {
                            error!(
                                instance_id = %tracker.instance_id(),
                                node_id = %node_id,
                                error = %message,
                                "Node failed, failing run"
                            );
                            tracker.set_status(ExecutionStatus::Failed, Some(message));
                            tracker.persist_state()?;
                            report.processed.push(node_id);
                            break;
                        }
                        NodeErrorPolicy::Continue => {
                            warn!(
                                instance_id = %tracker.instance_id(),
                                node_id = %node_id,
                                error = %message,
                                "Node failed, continuing"
                            );
                            tracker.record_node_failure(&node_id, message);
                            match node.config {
                                NodeConfig::Condition(_) | NodeConfig::Switch(_) => {
                                    Routing::Only(Vec::new())
                                }
                                _ => Routing::All,
                            }
                        }
                    }
                }
            };

            let activated = traversal.advance(tracker, &node_id, &routing);
            self.events.publish(RunEvent::NodeCompleted {
                instance_id: tracker.instance_id().clone(),
                node_id: node_id.clone(),
                activated: activated.clone(),
            });
            tracker.persist_state()?;

            report.processed.push(node_id);
            report.activated.extend(activated);
        }

        Ok(report)
    }
}
