use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use thinkflow_core::config::ModelConfig;
use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::LlmClient;
use thinkflow_core::types::Completion;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Debug)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn build_request(config: &ModelConfig, prompt: String) -> ChatRequest {
    // o-series models reject temperature
    let is_o_series = config.model_id.starts_with("o1")
        || config.model_id.starts_with("o3")
        || config.model_id.starts_with("o4");

    ChatRequest {
        model: config.model_id.clone(),
        messages: vec![OaiMessage {
            role: "user".to_string(),
            content: prompt,
        }],
        max_tokens: config.max_tokens,
        temperature: if is_o_series || config.temperature <= 0.0 {
            None
        } else {
            Some(config.temperature)
        },
        stream: false,
    }
}

pub(crate) fn parse_response(body: &str) -> Result<Completion> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| ThinkflowError::LlmParse(e.to_string()))?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ThinkflowError::LlmParse("response has no choices".into()))?;

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(Completion {
        text,
        input_tokens,
        output_tokens,
    })
}

impl LlmClient for OpenAiClient {
    fn generate(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        let config = config.clone();

        Box::pin(async move {
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = build_request(&config, prompt);

            let mut req = self.http.post(base_url).json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| ThinkflowError::LlmRequest(e.to_string()))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| ThinkflowError::LlmRequest(e.to_string()))?;

            if !status.is_success() {
                return Err(ThinkflowError::LlmRequest(format!("HTTP {}: {}", status, text)));
            }

            let completion = parse_response(&text)?;
            debug!(
                model = %config.model_id,
                input_tokens = completion.input_tokens,
                output_tokens = completion.output_tokens,
                "OpenAI-compatible completion received"
            );
            Ok(completion)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "hello" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6 }
        }"#;
        let completion = parse_response(body).unwrap();
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.input_tokens, 5);
        assert_eq!(completion.output_tokens, 1);
    }

    #[test]
    fn test_parse_response_without_choices() {
        let err = parse_response(r#"{ "choices": [] }"#).unwrap_err();
        assert!(matches!(err, ThinkflowError::LlmParse(_)));
    }

    #[test]
    fn test_parse_response_garbage() {
        assert!(parse_response("not json").is_err());
    }

    #[test]
    fn test_o_series_drops_temperature() {
        let mut config = ModelConfig::new("openai", "o3-mini");
        config.temperature = 0.7;
        let req = build_request(&config, "hi".into());
        assert!(req.temperature.is_none());

        let mut config = ModelConfig::new("openai", "gpt-4o");
        config.temperature = 0.7;
        let req = build_request(&config, "hi".into());
        assert_eq!(req.temperature, Some(0.7));
        assert!(!req.stream);
    }
}
