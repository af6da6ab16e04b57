//! Small workflow definitions used across the test suites.

use serde_json::json;

use thinkflow_core::workflow::{
    BranchConfig, Edge, GatewayConfig, JoinPolicy, LlmCallConfig, Node, NodeConfig, ScriptConfig,
    Variable, WorkflowDefinition,
};

pub fn definition(id: &str, nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        name: None,
        nodes,
        edges,
        inputs: vec![],
        outputs: vec![],
    }
}

pub fn llm_node(id: &str, prompt: &str, live: bool) -> Node {
    Node::new(
        id,
        NodeConfig::LlmCall(LlmCallConfig {
            prompt: prompt.to_string(),
            model: None,
            live,
            output: None,
        }),
    )
}

pub fn script_node(id: &str, source: &str) -> Node {
    Node::new(
        id,
        NodeConfig::Script(ScriptConfig {
            source: source.to_string(),
            timeout_ms: None,
        }),
    )
}

pub fn switch_node(id: &str, script: &str) -> Node {
    Node::new(
        id,
        NodeConfig::Switch(BranchConfig {
            script: Some(script.to_string()),
            ..Default::default()
        }),
    )
}

pub fn condition_on_variable(id: &str, variable: &str) -> Node {
    Node::new(
        id,
        NodeConfig::Condition(BranchConfig {
            variable: Some(variable.to_string()),
            ..Default::default()
        }),
    )
}

pub fn gateway_node(id: &str, policy: JoinPolicy) -> Node {
    Node::new(id, NodeConfig::ParallelGateway(GatewayConfig { policy }))
}

/// `start → llm(dry-run "Echo: {x}") → end`, declaring input `x`.
pub fn echo_definition() -> WorkflowDefinition {
    let mut def = definition(
        "echo",
        vec![
            Node::start("start"),
            llm_node("llm", "Echo: {x}", false).with_inputs(&["x"]),
            Node::end("end"),
        ],
        vec![Edge::new("e1", "start", "llm"), Edge::new("e2", "llm", "end")],
    );
    def.inputs = vec![Variable::new("x").with_default(json!("default"))];
    def
}

/// `start → sw` where `sw` runs `script` and branches to end nodes `a`, `b`, `c`
/// over edges whose source handles are `"a"`, `"b"`, `"c"`.
pub fn switch_definition(script: &str) -> WorkflowDefinition {
    definition(
        "switch",
        vec![
            Node::start("start"),
            switch_node("sw", script),
            Node::end("a"),
            Node::end("b"),
            Node::end("c"),
        ],
        vec![
            Edge::new("e0", "start", "sw"),
            Edge::new("ea", "sw", "a").with_source_handle("a"),
            Edge::new("eb", "sw", "b").with_source_handle("b"),
            Edge::new("ec", "sw", "c").with_source_handle("c"),
        ],
    )
}

/// `start → check(condition on "flag")`, `"true"` to `yes`, `"false"` to `no`.
pub fn condition_definition() -> WorkflowDefinition {
    definition(
        "condition",
        vec![
            Node::start("start"),
            condition_on_variable("check", "flag").with_inputs(&["flag"]),
            Node::end("yes"),
            Node::end("no"),
        ],
        vec![
            Edge::new("e0", "start", "check"),
            Edge::new("e-yes", "check", "yes").with_source_handle("true"),
            Edge::new("e-no", "check", "no").with_source_handle("false"),
        ],
    )
}

/// `start → a → b → a ...` with no exit.
pub fn cycle_definition() -> WorkflowDefinition {
    definition(
        "cycle",
        vec![
            Node::start("start"),
            script_node("a", "counter = (counter or 0) + 1"),
            script_node("b", "last = counter"),
        ],
        vec![
            Edge::new("e0", "start", "a"),
            Edge::new("e1", "a", "b"),
            Edge::new("e2", "b", "a"),
        ],
    )
}

/// `start` forks to `left` and `right`, which converge on gateway `join`, then `end`.
pub fn join_definition(policy: JoinPolicy) -> WorkflowDefinition {
    definition(
        "join",
        vec![
            Node::start("start"),
            script_node("left", "left = 1"),
            script_node("right", "right = 2"),
            gateway_node("join", policy),
            script_node("after", "visits = (visits or 0) + 1").with_inputs(&["visits"]),
            Node::end("end"),
        ],
        vec![
            Edge::new("s-l", "start", "left"),
            Edge::new("s-r", "start", "right"),
            Edge::new("l-j", "left", "join"),
            Edge::new("r-j", "right", "join"),
            Edge::new("j-a", "join", "after"),
            Edge::new("a-e", "after", "end"),
        ],
    )
}
