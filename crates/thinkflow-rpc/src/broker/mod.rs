//! Queue-based message brokers.
//!
//! Queues are named, durable for the broker's lifetime, and shared by
//! competing consumers: each message goes to exactly one `receive` call.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use thinkflow_core::config::BrokerConfig;
use thinkflow_core::error::{Result, ThinkflowError};

use crate::message::Message;

/// A point-to-point queue broker.
pub trait Broker: Send + Sync + 'static {
    /// Create a private queue for replies and return its name.
    fn declare_reply_queue(&self) -> BoxFuture<'_, Result<String>>;

    /// Remove a queue and anything still in it.
    fn delete_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Append a message to a queue.
    fn publish<'a>(&'a self, queue: &'a str, message: Message) -> BoxFuture<'a, Result<()>>;

    /// Take the oldest message from a queue, waiting up to `wait` for one.
    fn receive<'a>(
        &'a self,
        queue: &'a str,
        wait: Duration,
    ) -> BoxFuture<'a, Result<Option<Message>>>;
}

/// Connect to the broker named by `config.url`.
///
/// `memory://` gives an in-process broker, only useful when producer and
/// consumer share the process. `redis://` and `rediss://` connect to Redis.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    let url = config.url.as_str();
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        let ttl = Duration::from_secs(config.reply_ttl_secs);
        return Ok(Arc::new(RedisBroker::connect(url, ttl).await?));
    }
    warn!(url, "Unsupported broker URL");
    Err(ThinkflowError::Config(format!(
        "unsupported broker url '{}' (expected memory:// or redis://)",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let config = BrokerConfig::default();
        let broker = connect(&config).await.unwrap();
        broker.publish("q", Message::new("c1", "{}")).await.unwrap();
        let got = broker.receive("q", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.unwrap().correlation_id, "c1");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let config = BrokerConfig {
            url: "amqp://localhost".into(),
            ..Default::default()
        };
        assert!(matches!(
            connect(&config).await,
            Err(ThinkflowError::Config(_))
        ));
    }
}
