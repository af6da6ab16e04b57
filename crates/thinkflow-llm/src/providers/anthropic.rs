use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use thinkflow_core::config::ModelConfig;
use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::LlmClient;
use thinkflow_core::types::Completion;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: Client,
}

impl AnthropicClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

// Anthropic API request types
#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

// Anthropic API response types
#[derive(Deserialize, Debug)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub(crate) fn parse_response(body: &str) -> Result<Completion> {
    let parsed: MessageResponse =
        serde_json::from_str(body).map_err(|e| ThinkflowError::LlmParse(e.to_string()))?;

    let text: String = parsed
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Other => None,
        })
        .collect();

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}

impl LlmClient for AnthropicClient {
    fn generate(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let api_key = config
                .api_key
                .as_deref()
                .ok_or_else(|| ThinkflowError::Config("Anthropic API key not set".into()))?;

            let base_url = config.base_url.as_deref().unwrap_or(ANTHROPIC_API_URL);

            let body = AnthropicRequest {
                model: config.model_id.clone(),
                max_tokens: config.max_tokens,
                temperature: if config.temperature > 0.0 {
                    Some(config.temperature)
                } else {
                    None
                },
                messages: vec![ApiMessage {
                    role: "user".to_string(),
                    content: prompt,
                }],
            };

            let response = self
                .http
                .post(base_url)
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| ThinkflowError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());

            if !status.is_success() {
                return Err(ThinkflowError::LlmRequest(format!("HTTP {}: {}", status, text)));
            }

            let completion = parse_response(&text)?;
            debug!(
                model = %config.model_id,
                input_tokens = completion.input_tokens,
                output_tokens = completion.output_tokens,
                "Anthropic completion received"
            );
            Ok(completion)
        })
    }
}
