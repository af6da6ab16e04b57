use std::collections::HashMap;

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::workflow::{Edge, Node, NodeConfig, Variable, WorkflowDefinition};

/// ID-indexed view of a workflow definition, built once per run.
///
/// Never mutated after construction. Nodes whose stored definition omits
/// `incoming`/`outgoing` get those lists derived from the edge list, in
/// edge order.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub id: String,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    pub inputs: Vec<Variable>,
    pub outputs: Vec<Variable>,
}

impl ExecutionGraph {
    /// Build the graph. Duplicate node or edge ids are rejected; dangling
    /// edge endpoints are kept and left for traversal to skip.
    pub fn from_definition(definition: WorkflowDefinition) -> Result<Self> {
        let WorkflowDefinition {
            id,
            nodes,
            edges,
            inputs,
            outputs,
            ..
        } = definition;

        let mut derived_in: HashMap<&str, Vec<String>> = HashMap::new();
        let mut derived_out: HashMap<&str, Vec<String>> = HashMap::new();
        for edge in &edges {
            derived_out
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.id.clone());
            derived_in
                .entry(edge.target.as_str())
                .or_default()
                .push(edge.id.clone());
        }

        let mut node_map = HashMap::with_capacity(nodes.len());
        for mut node in nodes {
            if node.incoming.is_none() {
                node.incoming = Some(derived_in.get(node.id.as_str()).cloned().unwrap_or_default());
            }
            if node.outgoing.is_none() {
                node.outgoing = Some(derived_out.get(node.id.as_str()).cloned().unwrap_or_default());
            }
            if let Some(dup) = node_map.insert(node.id.clone(), node) {
                return Err(ThinkflowError::InvalidDefinition(format!(
                    "duplicate node id '{}' in workflow '{}'",
                    dup.id, id
                )));
            }
        }

        let mut edge_map = HashMap::with_capacity(edges.len());
        for edge in edges {
            if let Some(dup) = edge_map.insert(edge.id.clone(), edge) {
                return Err(ThinkflowError::InvalidDefinition(format!(
                    "duplicate edge id '{}' in workflow '{}'",
                    dup.id, id
                )));
            }
        }

        Ok(Self {
            id,
            nodes: node_map,
            edges: edge_map,
            inputs,
            outputs,
        })
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// The unique `startEvent` node.
    pub fn start_node(&self) -> Result<&Node> {
        let mut starts = self
            .nodes
            .values()
            .filter(|n| matches!(n.config, NodeConfig::StartEvent));

        let first = starts
            .next()
            .ok_or_else(|| ThinkflowError::NoStartNode(self.id.clone()))?;
        if starts.next().is_some() {
            return Err(ThinkflowError::MultipleStartNodes(self.id.clone()));
        }
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thinkflow_test_utils::fixtures::{definition, echo_definition};

    #[test]
    fn test_build_indexes_nodes_and_edges() {
        let graph = ExecutionGraph::from_definition(echo_definition()).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.node("llm").is_some());
        assert_eq!(graph.edge("e1").unwrap().target, "llm");
    }

    #[test]
    fn test_edge_lists_are_derived() {
        let graph = ExecutionGraph::from_definition(echo_definition()).unwrap();
        let llm = graph.node("llm").unwrap();
        assert_eq!(llm.incoming_edges(), ["e1".to_string()]);
        assert_eq!(llm.outgoing_edges(), ["e2".to_string()]);
        assert!(graph.node("start").unwrap().incoming_edges().is_empty());
        assert!(graph.node("end").unwrap().outgoing_edges().is_empty());
    }

    #[test]
    fn test_explicit_outgoing_is_kept() {
        let mut def = echo_definition();
        for node in &mut def.nodes {
            if node.id == "start" {
                node.outgoing = Some(vec![]);
            }
        }
        let graph = ExecutionGraph::from_definition(def).unwrap();
        assert!(graph.node("start").unwrap().outgoing_edges().is_empty());
    }

    #[test]
    fn test_start_node_lookup() {
        let graph = ExecutionGraph::from_definition(echo_definition()).unwrap();
        assert_eq!(graph.start_node().unwrap().id, "start");
    }

    #[test]
    fn test_missing_start_node() {
        let def = definition(
            "no-start",
            vec![Node::end("end")],
            vec![],
        );
        let graph = ExecutionGraph::from_definition(def).unwrap();
        assert!(matches!(graph.start_node(), Err(ThinkflowError::NoStartNode(_))));
    }

    #[test]
    fn test_multiple_start_nodes() {
        let def = definition(
            "two-starts",
            vec![Node::start("a"), Node::start("b")],
            vec![],
        );
        let graph = ExecutionGraph::from_definition(def).unwrap();
        assert!(matches!(
            graph.start_node(),
            Err(ThinkflowError::MultipleStartNodes(_))
        ));
    }

    #[test]
    fn test_duplicate_node_id_rejected() {
        let def = definition(
            "dup",
            vec![Node::start("a"), Node::end("a")],
            vec![],
        );
        assert!(matches!(
            ExecutionGraph::from_definition(def),
            Err(ThinkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_duplicate_edge_id_rejected() {
        let def = definition(
            "dup-edge",
            vec![Node::start("a"), Node::end("b")],
            vec![Edge::new("e", "a", "b"), Edge::new("e", "a", "b")],
        );
        assert!(ExecutionGraph::from_definition(def).is_err());
    }
}
