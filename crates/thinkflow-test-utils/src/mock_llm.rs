use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use thinkflow_core::config::ModelConfig;
use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::traits::LlmClient;
use thinkflow_core::types::Completion;

/// Scripted [`LlmClient`].
///
/// Queued responses are returned in order; once the queue is empty the
/// client echoes the prompt back. Every call is recorded.
pub struct MockLlmClient {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<MockCall>>,
}

/// One recorded `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub model_id: String,
    pub prompt: String,
}

impl MockLlmClient {
    /// A client that always echoes the prompt.
    pub fn echo() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A client returning the given texts in order, then echoing.
    pub fn with_responses(texts: &[&str]) -> Self {
        let client = Self::echo();
        {
            let mut queue = client.responses.lock().unwrap();
            queue.extend(texts.iter().map(|t| Ok(t.to_string())));
        }
        client
    }

    /// A client whose next call fails with `message`.
    pub fn failing(message: &str) -> Self {
        let client = Self::echo();
        client
            .responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        client
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, config: &ModelConfig, prompt: String) -> BoxFuture<'_, Result<Completion>> {
        self.calls.lock().unwrap().push(MockCall {
            model_id: config.model_id.clone(),
            prompt: prompt.clone(),
        });
        let next = self.responses.lock().unwrap().pop_front();

        Box::pin(async move {
            match next {
                Some(Ok(text)) => Ok(Completion::text(text)),
                Some(Err(message)) => Err(ThinkflowError::LlmRequest(message)),
                None => Ok(Completion::text(prompt)),
            }
        })
    }
}
