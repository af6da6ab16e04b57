use tracing::{debug, info, warn};

use thinkflow_core::types::ExecutionStatus;
use thinkflow_core::workflow::{JoinPolicy, Node};

use crate::executor::Routing;
use crate::graph::ExecutionGraph;
use crate::state::ExecutionTracker;

/// Moves tokens along edges after a node has executed.
///
/// Plain targets are activated as soon as a token reaches them.
/// `parallelGateway` targets apply their join policy: `all` waits until
/// every incoming edge has delivered, `first` fires on the first delivery
/// and absorbs the rest of the wave.
pub struct Traversal<'g> {
    graph: &'g ExecutionGraph,
}

impl<'g> Traversal<'g> {
    pub fn new(graph: &'g ExecutionGraph) -> Self {
        Self { graph }
    }

    /// Consume `node_id`'s token and deliver along the edges `routing`
    /// selects. Returns the ids that became active.
    ///
    /// Marks the run completed when nothing was activated, no token is left
    /// and no `all` join is waiting on further deliveries.
    pub fn advance(
        &self,
        tracker: &mut ExecutionTracker,
        node_id: &str,
        routing: &Routing,
    ) -> Vec<String> {
        tracker.complete_node(node_id);

        let mut activated = Vec::new();
        match self.graph.node(node_id) {
            Some(node) => {
                for edge_id in routing.select(node, self.graph) {
                    let Some(edge) = self.graph.edge(edge_id) else {
                        warn!(node_id, edge_id, "Outgoing edge not found, skipping");
                        continue;
                    };
                    let Some(target) = self.graph.node(&edge.target) else {
                        warn!(
                            node_id,
                            edge_id,
                            target = %edge.target,
                            "Edge target not found, skipping"
                        );
                        continue;
                    };

                    let fire = match target.join_policy() {
                        Some(policy) => self.deliver_to_join(tracker, target, edge_id, policy),
                        None => true,
                    };
                    if fire && tracker.activate_node(&target.id) {
                        activated.push(target.id.clone());
                    }
                }
            }
            None => warn!(node_id, "Advanced node not in graph"),
        }

        if activated.is_empty() && !tracker.has_active_nodes() {
            let waiting = self.stalled_joins(tracker);
            if waiting.is_empty() {
                if tracker.set_status(ExecutionStatus::Completed, None) {
                    info!(instance_id = %tracker.instance_id(), "Run completed");
                }
            } else {
                debug!(
                    instance_id = %tracker.instance_id(),
                    joins = ?waiting,
                    "No active tokens, waiting on joins"
                );
            }
        }

        activated
    }

    /// `all` joins holding some but not all of their incoming deliveries.
    pub fn stalled_joins(&self, tracker: &ExecutionTracker) -> Vec<String> {
        tracker
            .nodes_with_partial_flows()
            .into_iter()
            .filter(|id| {
                self.graph
                    .node(id)
                    .is_some_and(|n| n.join_policy() == Some(JoinPolicy::All))
            })
            .collect()
    }

    /// Record a delivery into a join and decide whether it fires now.
    ///
    /// For `first` joins, a repeat delivery on an edge already recorded in
    /// the current wave starts a new wave. Exclusive branches merged into a
    /// `first` join inside a loop never complete a wave otherwise.
    fn deliver_to_join(
        &self,
        tracker: &mut ExecutionTracker,
        join: &Node,
        edge_id: &str,
        policy: JoinPolicy,
    ) -> bool {
        let mut first_of_wave = tracker.completed_incoming_flows(&join.id) == 0;
        if !tracker.record_completed_incoming_flow(&join.id, edge_id)
            && policy == JoinPolicy::First
        {
            debug!(join = %join.id, edge_id, "Repeat delivery, starting new wave");
            tracker.clear_completed_incoming_flows(&join.id);
            tracker.record_completed_incoming_flow(&join.id, edge_id);
            first_of_wave = true;
        }

        let complete = join
            .incoming_edges()
            .iter()
            .all(|e| tracker.has_completed_incoming_flow(&join.id, e));
        if complete {
            tracker.clear_completed_incoming_flows(&join.id);
        }

        let fire = match policy {
            JoinPolicy::All => complete,
            JoinPolicy::First => first_of_wave,
        };
        debug!(
            join = %join.id,
            edge_id,
            delivered = tracker.completed_incoming_flows(&join.id),
            expected = join.incoming_edges().len(),
            fire,
            "Join delivery"
        );
        fire
    }
}
