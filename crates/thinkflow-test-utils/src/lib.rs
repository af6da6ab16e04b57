//! Test doubles and workflow fixtures shared by the thinkflow crates.

pub mod fixtures;
pub mod mock_llm;

pub use mock_llm::MockLlmClient;
