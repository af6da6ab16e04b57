use futures::future::BoxFuture;
use tracing::debug;

use thinkflow_core::error::Result;
use thinkflow_core::workflow::Node;

use super::{NodeExecutor, Routing};
use crate::state::ExecutionTracker;

/// No-op executor for `startEvent`, `endEvent` and `parallelGateway`.
///
/// Join semantics for gateways live in the traversal engine; by the time a
/// gateway runs it has already fired.
pub struct MarkerExecutor;

impl NodeExecutor for MarkerExecutor {
    fn execute<'a>(
        &'a self,
        node: &'a Node,
        tracker: &'a mut ExecutionTracker,
    ) -> BoxFuture<'a, Result<Routing>> {
        Box::pin(async move {
            debug!(
                instance_id = %tracker.instance_id(),
                node_id = %node.id,
                node_type = node.node_type(),
                "Marker node"
            );
            Ok(Routing::All)
        })
    }
}
