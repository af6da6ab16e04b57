use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ThinkflowError};
use crate::types::NodeErrorPolicy;

/// Top-level thinkflow configuration.
///
/// Read once at process start and treated as immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Model used by live `llmCall` nodes. Without it only dry-run nodes can execute.
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub definitions: DefinitionsConfig,
}

/// Message broker and RPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `memory://` for the in-process broker, `redis://...` for Redis.
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Queue the producer publishes run requests to.
    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    /// Queue a worker consumes run requests from.
    #[serde(default = "default_request_queue")]
    pub worker_queue: String,
    /// How long a producer waits for a reply.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Expiry of idle reply queues on brokers that support it.
    #[serde(default = "default_reply_ttl_secs")]
    pub reply_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            request_queue: default_request_queue(),
            worker_queue: default_request_queue(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            reply_ttl_secs: default_reply_ttl_secs(),
        }
    }
}

fn default_broker_url() -> String { "memory://".to_string() }
fn default_request_queue() -> String { "thinking-requests".to_string() }
fn default_rpc_timeout_ms() -> u64 { 5000 }
fn default_reply_ttl_secs() -> u64 { 300 }

/// Run loop and executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on orchestrator rounds per run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Wall-clock limit for sandboxed scripts without their own `timeoutMs`.
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
    #[serde(default)]
    pub on_node_error: NodeErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            script_timeout_ms: default_script_timeout_ms(),
            on_node_error: NodeErrorPolicy::default(),
        }
    }
}

fn default_max_iterations() -> usize { 100 }
fn default_script_timeout_ms() -> u64 { 1000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    /// Same settings with a different model id.
    pub fn with_model(&self, model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

/// Where run state is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// Database file for the SQLite store.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "thinkflow-state.db".to_string() }

/// Where workflow definitions are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionsConfig {
    #[serde(default = "default_definitions_dir")]
    pub dir: String,
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        Self {
            dir: default_definitions_dir(),
        }
    }
}

fn default_definitions_dir() -> String { "workflows".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ThinkflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ThinkflowError::Config(e.to_string()))
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Resolve the definitions directory (expand ~).
    pub fn definitions_dir(&self) -> PathBuf {
        expand_home(&self.definitions.dir)
    }

    /// Resolve the SQLite store path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_THINKFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_THINKFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_THINKFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_THINKFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_THINKFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.broker.url, "memory://");
        assert_eq!(config.broker.request_queue, "thinking-requests");
        assert_eq!(config.broker.worker_queue, "thinking-requests");
        assert_eq!(config.broker.rpc_timeout_ms, 5000);
        assert_eq!(config.engine.max_iterations, 100);
        assert_eq!(config.engine.script_timeout_ms, 1000);
        assert_eq!(config.engine.on_node_error, NodeErrorPolicy::Continue);
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert!(config.model.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[broker]
url = "redis://127.0.0.1:6379"
rpc_timeout_ms = 250

[engine]
on_node_error = "fail"

[model]
model_id = "gpt-4o-mini"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.url, "redis://127.0.0.1:6379");
        assert_eq!(config.broker.rpc_timeout_ms, 250);
        assert_eq!(config.broker.request_queue, "thinking-requests");
        assert_eq!(config.engine.on_node_error, NodeErrorPolicy::Fail);
        assert_eq!(config.engine.max_iterations, 100);
        let model = config.model.unwrap();
        assert_eq!(model.provider, "openai");
        assert_eq!(model.max_tokens, 1024);
    }

    #[test]
    fn test_with_model_keeps_credentials() {
        let mut base = ModelConfig::new("anthropic", "claude-sonnet-4-20250514");
        base.api_key = Some("sk-test".into());
        let other = base.with_model("claude-haiku");
        assert_eq!(other.model_id, "claude-haiku");
        assert_eq!(other.api_key.as_deref(), Some("sk-test"));
        assert_eq!(other.provider, "anthropic");
    }

    #[test]
    fn test_load_or_default_reads_existing_file() {
        use std::io::Write;

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"[engine]\nmax_iterations = 7\n").unwrap();

        let config = AppConfig::load_or_default(tmp.path()).unwrap();
        assert_eq!(config.engine.max_iterations, 7);
        assert_eq!(config.broker.url, "memory://");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/thinkflow.toml")).unwrap_err();
        assert!(matches!(err, ThinkflowError::ConfigNotFound(_)));
    }
}
