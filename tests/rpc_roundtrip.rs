use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use thinkflow_core::config::EngineConfig;
use thinkflow_core::error::ThinkflowError;
use thinkflow_core::traits::StateStore;
use thinkflow_core::types::{ExecutionStatus, RunRequest};
use thinkflow_engine::{
    ExecutorRegistry, FileDefinitionStore, InMemoryDefinitionStore, InMemoryStateStore,
    RunService, ScriptSandbox,
};
use thinkflow_rpc::{Broker, MemoryBroker, RpcClient, RpcServer};
use thinkflow_test_utils::fixtures::{condition_definition, echo_definition};

const QUEUE: &str = "thinking-requests";

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<InMemoryStateStore>,
    shutdown: CancellationToken,
    worker: tokio::task::JoinHandle<thinkflow_core::error::Result<()>>,
}

impl Harness {
    fn start(service_store: Arc<InMemoryStateStore>, definitions: InMemoryDefinitionStore) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let service = RunService::new(
            Arc::new(definitions),
            Arc::new(ExecutorRegistry::with_defaults(None, None, ScriptSandbox::default())),
            service_store.clone(),
            EngineConfig::default(),
        );
        let server = RpcServer::new(broker.clone(), Arc::new(service), QUEUE);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let worker = tokio::spawn(async move { server.run(token).await });
        Self {
            broker,
            store: service_store,
            shutdown,
            worker,
        }
    }

    fn client(&self) -> RpcClient {
        RpcClient::new(self.broker.clone()).with_timeout(Duration::from_secs(5))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.worker.await.unwrap().unwrap();
    }
}

fn harness() -> Harness {
    Harness::start(
        Arc::new(InMemoryStateStore::new()),
        InMemoryDefinitionStore::with_definitions([echo_definition(), condition_definition()]),
    )
}

#[tokio::test]
async fn test_submit_runs_workflow_on_worker() {
    let h = harness();
    let client = h.client();

    let snapshot = client
        .run(QUEUE, &RunRequest::new("echo").with_input("x", json!("hi")))
        .await
        .unwrap();

    assert_eq!(snapshot.graph_id, "echo");
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.variable("llmOutput"), Some(&json!("Echo: hi")));
    assert!(snapshot.current_node_ids.is_empty());
    assert!(snapshot.end_time.is_some());

    let stored = h.store.get(&snapshot.instance_id).unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);

    client.close().await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn test_unknown_definition_is_remote_error() {
    let h = harness();
    let client = h.client();

    let err = client.run(QUEUE, &RunRequest::new("missing")).await.unwrap_err();
    assert!(
        matches!(&err, ThinkflowError::Remote(m) if m.contains("missing")),
        "unexpected error: {err}"
    );
    assert_eq!(client.pending_count().await, 0);

    client.close().await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_snapshots() {
    let h = harness();
    let client = h.client();

    let yes_req = RunRequest::new("condition").with_input("flag", json!(true));
    let no_req = RunRequest::new("condition").with_input("flag", json!(false));
    let echo_req = RunRequest::new("echo").with_input("x", json!("abc"));
    let (yes, no, echo) = tokio::join!(
        client.run(QUEUE, &yes_req),
        client.run(QUEUE, &no_req),
        client.run(QUEUE, &echo_req),
    );
    let (yes, no, echo) = (yes.unwrap(), no.unwrap(), echo.unwrap());

    assert_eq!(yes.variable("flag"), Some(&json!(true)));
    assert_eq!(no.variable("flag"), Some(&json!(false)));
    assert_eq!(echo.variable("llmOutput"), Some(&json!("Echo: abc")));
    assert_ne!(yes.instance_id, no.instance_id);
    assert_eq!(h.store.len(), 3);

    client.close().await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn test_two_clients_share_worker() {
    let h = harness();
    let first = h.client();
    let second = h.client();

    let a_req = RunRequest::new("echo").with_input("x", json!("one"));
    let b_req = RunRequest::new("echo").with_input("x", json!("two"));
    let (a, b) = tokio::join!(
        first.run(QUEUE, &a_req),
        second.run(QUEUE, &b_req),
    );
    assert_eq!(a.unwrap().variable("llmOutput"), Some(&json!("Echo: one")));
    assert_eq!(b.unwrap().variable("llmOutput"), Some(&json!("Echo: two")));
    assert_ne!(first.reply_queue_name(), second.reply_queue_name());

    first.close().await.unwrap();
    second.close().await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn test_malformed_request_body_gets_error_reply() {
    let h = harness();
    let reply_queue = h.broker.declare_reply_queue().await.unwrap();

    h.broker
        .publish(
            QUEUE,
            thinkflow_rpc::Message::new("bad-1", "{\"inputs\": 3}").with_reply_to(reply_queue.clone()),
        )
        .await
        .unwrap();

    let reply = h
        .broker
        .receive(&reply_queue, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("error reply");
    assert_eq!(reply.correlation_id, "bad-1");
    let body: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("malformed request"));

    h.stop().await;
}

#[tokio::test]
async fn test_worker_reads_definitions_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("echo.json"),
        serde_json::to_string(&echo_definition()).unwrap(),
    )
    .unwrap();

    let service = RunService::new(
        Arc::new(FileDefinitionStore::new(dir.path())),
        Arc::new(ExecutorRegistry::with_defaults(None, None, ScriptSandbox::default())),
        Arc::new(InMemoryStateStore::new()),
        EngineConfig::default(),
    );
    let snapshot = service.handle(RunRequest::new("echo")).await.unwrap();

    // Falls back to the declared default for `x`.
    assert_eq!(snapshot.variable("llmOutput"), Some(&json!("Echo: default")));
}
