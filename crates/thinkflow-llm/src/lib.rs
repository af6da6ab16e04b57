pub mod providers;

use thinkflow_core::config::ModelConfig;
use thinkflow_core::traits::LlmClient;

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}
