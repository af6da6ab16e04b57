use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use thinkflow_core::error::{Result, ThinkflowError};
use thinkflow_core::types::{ExecutionSnapshot, RunRequest};

use crate::broker::Broker;
use crate::message::{remote_error, Message};

/// Default wait for a reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long one listener poll waits before checking for shutdown.
const LISTEN_WAIT: Duration = Duration::from_millis(250);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Request/reply producer.
///
/// Owns one reply queue, declared on the first call and reused for every
/// call after it. A background listener hands each reply to the waiter
/// registered under its correlation id. Replies nobody waits for (late
/// or duplicate) are dropped.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    timeout: Duration,
    reply_queue: OnceCell<String>,
    pending: PendingMap,
    shutdown: CancellationToken,
}

impl RpcClient {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            timeout: DEFAULT_RPC_TIMEOUT,
            reply_queue: OnceCell::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls currently waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// The reply queue, once the first call has declared it.
    pub fn reply_queue_name(&self) -> Option<&str> {
        self.reply_queue.get().map(String::as_str)
    }

    async fn reply_queue(&self) -> Result<&str> {
        let name = self
            .reply_queue
            .get_or_try_init(|| async {
                let name = self.broker.declare_reply_queue().await?;
                self.spawn_listener(name.clone());
                debug!(queue = %name, "Declared reply queue");
                Ok::<_, ThinkflowError>(name)
            })
            .await?;
        Ok(name.as_str())
    }

    fn spawn_listener(&self, queue: String) {
        let broker = self.broker.clone();
        let pending = self.pending.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    received = broker.receive(&queue, LISTEN_WAIT) => received,
                };
                match received {
                    Ok(Some(reply)) => {
                        let waiter = pending.lock().await.remove(&reply.correlation_id);
                        match waiter {
                            // The caller may have timed out between lookup and send.
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => debug!(
                                correlation_id = %reply.correlation_id,
                                "Dropping reply with no waiting caller"
                            ),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Reply listener receive failed");
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(LISTEN_WAIT) => {}
                        }
                    }
                }
            }
            debug!(queue = %queue, "Reply listener stopped");
        });
    }

    /// Publish `body` to `queue` and wait for the matching reply.
    ///
    /// Fails with `RpcTimeout` when no reply arrives in time and with
    /// `Remote` when the reply is an `{"error": ...}` body. The waiter is
    /// deregistered on every outcome.
    pub async fn call<T: Serialize>(&self, queue: &str, body: &T) -> Result<Value> {
        let reply_to = self.reply_queue().await?.to_string();
        let correlation_id = Uuid::new_v4().to_string();
        let message = Message::json(correlation_id.clone(), body)?.with_reply_to(reply_to);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id.clone(), tx);

        if let Err(e) = self.broker.publish(queue, message).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e);
        }
        debug!(queue, correlation_id = %correlation_id, "Request published");

        let outcome = tokio::time::timeout(self.timeout, rx).await;
        self.pending.lock().await.remove(&correlation_id);

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(ThinkflowError::Broker("reply listener stopped".into()));
            }
            Err(_) => {
                warn!(queue, correlation_id = %correlation_id, "RPC timed out");
                return Err(ThinkflowError::RpcTimeout {
                    correlation_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        let value: Value = serde_json::from_str(&reply.body)?;
        if let Some(message) = remote_error(&value) {
            return Err(ThinkflowError::Remote(message.to_string()));
        }
        Ok(value)
    }

    /// Submit a run request and decode the resulting snapshot.
    pub async fn run(&self, queue: &str, request: &RunRequest) -> Result<ExecutionSnapshot> {
        let value = self.call(queue, request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Stop the listener and delete the reply queue.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(queue) = self.reply_queue.get() {
            self.broker.delete_queue(queue).await?;
        }
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use std::time::Instant;

    const QUEUE: &str = "requests";

    /// Take `n` requests, then answer them in reverse order, echoing each body.
    fn spawn_reverse_responder(broker: Arc<MemoryBroker>, n: usize) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut requests = Vec::new();
            while requests.len() < n {
                if let Some(msg) = broker.receive(QUEUE, Duration::from_secs(2)).await.unwrap() {
                    requests.push(msg);
                }
            }
            for request in requests.into_iter().rev() {
                let reply_to = request.reply_to.clone().unwrap();
                let reply = Message::new(request.correlation_id, request.body);
                broker.publish(&reply_to, reply).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn test_replies_match_callers_out_of_order() {
        let broker = Arc::new(MemoryBroker::new());
        let responder = spawn_reverse_responder(broker.clone(), 3);
        let client = RpcClient::new(broker.clone()).with_timeout(Duration::from_secs(5));

        let (p1, p2, p3) = (json!({ "n": 1 }), json!({ "n": 2 }), json!({ "n": 3 }));
        let (a, b, c) = tokio::join!(
            client.call(QUEUE, &p1),
            client.call(QUEUE, &p2),
            client.call(QUEUE, &p3),
        );
        assert_eq!(a.unwrap(), json!({ "n": 1 }));
        assert_eq!(b.unwrap(), json!({ "n": 2 }));
        assert_eq!(c.unwrap(), json!({ "n": 3 }));
        assert_eq!(client.pending_count().await, 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_waiter() {
        let broker = Arc::new(MemoryBroker::new());
        let client = RpcClient::new(broker).with_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let err = client.call(QUEUE, &json!({})).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(err, ThinkflowError::RpcTimeout { timeout_ms: 50, .. }));
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let client = RpcClient::new(broker.clone()).with_timeout(Duration::from_millis(30));

        assert!(client.call(QUEUE, &json!({})).await.is_err());
        let request = broker.receive(QUEUE, Duration::from_millis(10)).await.unwrap().unwrap();
        broker
            .publish(
                request.reply_to.as_deref().unwrap(),
                Message::new(request.correlation_id, "{}"),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_error_reply_is_remote_error() {
        let broker = Arc::new(MemoryBroker::new());
        let responder = {
            let broker = broker.clone();
            tokio::spawn(async move {
                let msg = broker.receive(QUEUE, Duration::from_secs(2)).await.unwrap().unwrap();
                let reply = Message::new(msg.correlation_id, Message::error_body("no such thinking"));
                broker.publish(&msg.reply_to.unwrap(), reply).await.unwrap();
            })
        };
        let client = RpcClient::new(broker);

        let err = client.call(QUEUE, &json!({})).await.unwrap_err();
        assert!(matches!(err, ThinkflowError::Remote(m) if m == "no such thinking"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_queue_declared_once_and_closed() {
        let broker = Arc::new(MemoryBroker::new());
        let client = RpcClient::new(broker.clone()).with_timeout(Duration::from_millis(20));
        assert!(client.reply_queue_name().is_none());

        let _ = client.call(QUEUE, &json!({})).await;
        let first = client.reply_queue_name().unwrap().to_string();
        let _ = client.call(QUEUE, &json!({})).await;
        assert_eq!(client.reply_queue_name(), Some(first.as_str()));

        let requests = [
            broker.receive(QUEUE, Duration::from_millis(10)).await.unwrap().unwrap(),
            broker.receive(QUEUE, Duration::from_millis(10)).await.unwrap().unwrap(),
        ];
        assert!(requests.iter().all(|r| r.reply_to.as_deref() == Some(first.as_str())));
        assert_ne!(requests[0].correlation_id, requests[1].correlation_id);

        client.close().await.unwrap();
        assert!(!broker.has_queue(&first));
    }
}
