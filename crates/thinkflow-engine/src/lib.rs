//! Execution core: graph model, run state, node executors, traversal, and
//! the round-based run loop.
//!
//! A run is driven by [`Orchestrator`]: each round executes every node in
//! the current token set, then [`Traversal`] moves tokens along the
//! (possibly narrowed) outgoing edges. All mutation for one run happens on
//! a single task through [`ExecutionTracker`].

pub mod definitions;
pub mod executor;
pub mod graph;
pub mod orchestrator;
pub mod sandbox;
pub mod service;
pub mod state;
pub mod template;
pub mod traversal;

pub use definitions::{FileDefinitionStore, InMemoryDefinitionStore};
pub use executor::{ExecutorRegistry, NodeExecutor, Routing};
pub use graph::ExecutionGraph;
pub use orchestrator::{Orchestrator, RoundReport, DEFAULT_MAX_ITERATIONS};
pub use sandbox::ScriptSandbox;
pub use service::RunService;
pub use state::{ExecutionTracker, InMemoryStateStore, SqliteStateStore};
pub use traversal::Traversal;
