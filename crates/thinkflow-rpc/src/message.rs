use serde::{Deserialize, Serialize};
use serde_json::Value;

use thinkflow_core::error::Result;

/// A broker message: routing headers plus a raw JSON body.
///
/// The body stays text until a consumer parses it, so a worker can still
/// answer a request whose body is not valid JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub body: String,
}

impl Message {
    pub fn new(correlation_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            reply_to: None,
            body: body.into(),
        }
    }

    /// Message whose body is `value` serialized as JSON.
    pub fn json<T: Serialize>(correlation_id: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(correlation_id, serde_json::to_string(value)?))
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Body of an error reply: `{"error": message}`.
    pub fn error_body(message: &str) -> String {
        serde_json::json!({ "error": message }).to_string()
    }
}

/// The message of an error reply, if `value` is one.
///
/// Only an object whose sole key is a string `error` counts; a failed run
/// snapshot also carries `error` but is a normal reply.
pub fn remote_error(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get("error")?.as_str()
}
