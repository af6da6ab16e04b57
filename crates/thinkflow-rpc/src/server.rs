use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use thinkflow_core::error::Result;
use thinkflow_core::types::{ExecutionSnapshot, RunRequest};
use thinkflow_engine::RunService;

use crate::broker::Broker;
use crate::message::Message;

/// How long one poll of the worker queue waits before checking for shutdown.
const RECEIVE_WAIT: Duration = Duration::from_millis(500);
/// Pause after a failed receive.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Executes run requests taken off the worker queue.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: RunRequest) -> BoxFuture<'_, Result<ExecutionSnapshot>>;
}

impl RequestHandler for RunService {
    fn handle(&self, request: RunRequest) -> BoxFuture<'_, Result<ExecutionSnapshot>> {
        Box::pin(RunService::handle(self, request))
    }
}

/// Request/reply consumer.
///
/// Takes one message at a time from the worker queue and always answers
/// a request that names a reply queue: with the run snapshot, or with an
/// `{"error": ...}` body when the request is malformed, the run could not
/// start, or the handler panicked. Messages are consumed on receipt, so a
/// worker crash mid-run loses that request.
pub struct RpcServer {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn RequestHandler>,
    queue: String,
}

impl RpcServer {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn RequestHandler>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            handler,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until `shutdown` is cancelled. A request in progress is
    /// finished and answered first.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(queue = %self.queue, "Worker listening");
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.broker.receive(&self.queue, RECEIVE_WAIT) => received,
            };
            match received {
                Ok(Some(message)) => self.process(message).await,
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Worker receive failed");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
        info!(queue = %self.queue, "Worker stopped");
        Ok(())
    }

    /// Handle one message and send its reply.
    pub async fn process(&self, message: Message) {
        let Message {
            correlation_id,
            reply_to,
            body,
        } = message;

        let reply_body = match serde_json::from_str::<RunRequest>(&body) {
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Malformed run request");
                Message::error_body(&format!("malformed request: {}", e))
            }
            Ok(request) => {
                info!(
                    correlation_id = %correlation_id,
                    thinking_id = %request.thinking_id,
                    "Run request received"
                );
                let outcome = AssertUnwindSafe(self.handler.handle(request))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(snapshot)) => {
                        info!(
                            correlation_id = %correlation_id,
                            instance_id = %snapshot.instance_id,
                            status = %snapshot.status,
                            "Run request handled"
                        );
                        serde_json::to_string(&snapshot)
                            .unwrap_or_else(|e| Message::error_body(&e.to_string()))
                    }
                    Ok(Err(e)) => {
                        warn!(correlation_id = %correlation_id, error = %e, "Run request failed");
                        Message::error_body(&e.to_string())
                    }
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        error!(correlation_id = %correlation_id, panic = %reason, "Handler panicked");
                        Message::error_body(&format!("worker panicked: {}", reason))
                    }
                }
            }
        };

        let Some(reply_to) = reply_to else {
            info!(
                correlation_id = %correlation_id,
                result = %reply_body,
                "Request had no reply queue, result not delivered"
            );
            return;
        };
        let reply = Message::new(correlation_id.clone(), reply_body);
        if let Err(e) = self.broker.publish(&reply_to, reply).await {
            error!(
                correlation_id = %correlation_id,
                reply_to = %reply_to,
                error = %e,
                "Failed to publish reply"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use chrono::Utc;
    use serde_json::Value;
    use thinkflow_core::error::ThinkflowError;
    use thinkflow_core::types::{ExecutionStatus, InstanceId};

    const QUEUE: &str = "work";
    const REPLIES: &str = "replies";
    const WAIT: Duration = Duration::from_millis(50);

    /// Completes `thinkingId` as a run of that graph; `fail` and `panic` misbehave.
    struct StubHandler;

    impl RequestHandler for StubHandler {
        fn handle(&self, request: RunRequest) -> BoxFuture<'_, Result<ExecutionSnapshot>> {
            Box::pin(async move {
                match request.thinking_id.as_str() {
                    "fail" => Err(ThinkflowError::DefinitionNotFound("fail".into())),
                    "panic" => panic!("handler exploded"),
                    id => Ok(ExecutionSnapshot {
                        instance_id: InstanceId::from("i-1"),
                        graph_id: id.to_string(),
                        current_node_ids: vec![],
                        completed_incoming_edge_ids: vec![],
                        variables: request.inputs.into_iter().collect(),
                        status: ExecutionStatus::Completed,
                        start_time: Utc::now(),
                        end_time: Some(Utc::now()),
                        error: None,
                        node_errors: vec![],
                    }),
                }
            })
        }
    }

    fn server() -> (RpcServer, Arc<MemoryBroker>) {
        let broker = Arc::new(MemoryBroker::new());
        let server = RpcServer::new(broker.clone(), Arc::new(StubHandler), QUEUE);
        (server, broker)
    }

    async fn reply(broker: &MemoryBroker) -> (String, Value) {
        let msg = broker.receive(REPLIES, WAIT).await.unwrap().unwrap();
        (msg.correlation_id, serde_json::from_str(&msg.body).unwrap())
    }

    #[tokio::test]
    async fn test_successful_request_replies_with_snapshot() {
        let (server, broker) = server();
        let body = r#"{"thinkingId":"echo","inputs":{"x":"hi"}}"#;
        server
            .process(Message::new("c1", body).with_reply_to(REPLIES))
            .await;

        let (correlation_id, value) = reply(&broker).await;
        assert_eq!(correlation_id, "c1");
        let snapshot: ExecutionSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(snapshot.graph_id, "echo");
        assert_eq!(snapshot.variable("x"), Some(&Value::String("hi".into())));
    }

    #[tokio::test]
    async fn test_malformed_body_gets_error_reply() {
        let (server, broker) = server();
        server
            .process(Message::new("c2", "{ not json").with_reply_to(REPLIES))
            .await;

        let (correlation_id, value) = reply(&broker).await;
        assert_eq!(correlation_id, "c2");
        assert!(value["error"].as_str().unwrap().starts_with("malformed request"));
    }

    #[tokio::test]
    async fn test_handler_error_gets_error_reply() {
        let (server, broker) = server();
        server
            .process(Message::new("c3", r#"{"thinkingId":"fail"}"#).with_reply_to(REPLIES))
            .await;
        let (_, value) = reply(&broker).await;
        assert_eq!(value["error"], "Workflow definition not found: fail");
    }

    #[tokio::test]
    async fn test_panic_becomes_error_reply() {
        let (server, broker) = server();
        server
            .process(Message::new("c4", r#"{"thinkingId":"panic"}"#).with_reply_to(REPLIES))
            .await;
        let (correlation_id, value) = reply(&broker).await;
        assert_eq!(correlation_id, "c4");
        assert_eq!(value["error"], "worker panicked: handler exploded");
    }

    #[tokio::test]
    async fn test_request_without_reply_queue_is_still_handled() {
        let (server, broker) = server();
        server
            .process(Message::new("c5", r#"{"thinkingId":"echo"}"#))
            .await;
        assert!(broker.receive(REPLIES, WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_consumes_until_cancelled() {
        let (server, broker) = server();
        let shutdown = CancellationToken::new();
        let server = Arc::new(server);
        let worker = {
            let server = server.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.run(shutdown).await })
        };

        for i in 0..3 {
            broker
                .publish(
                    QUEUE,
                    Message::new(format!("c{}", i), r#"{"thinkingId":"echo"}"#)
                        .with_reply_to(REPLIES),
                )
                .await
                .unwrap();
        }
        for _ in 0..3 {
            let msg = broker
                .receive(REPLIES, Duration::from_secs(2))
                .await
                .unwrap()
                .unwrap();
            assert!(msg.correlation_id.starts_with('c'));
        }

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }
}
