use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use thinkflow_core::config::{AppConfig, StoreKind};
use thinkflow_core::event::EventBus;
use thinkflow_core::traits::{LlmClient, StateStore};
use thinkflow_core::types::{NodeErrorPolicy, RunEvent, RunOverrides, RunRequest};

use thinkflow_engine::{
    ExecutorRegistry, FileDefinitionStore, InMemoryStateStore, RunService, ScriptSandbox,
    SqliteStateStore,
};
use thinkflow_rpc::{RpcClient, RpcServer};

#[derive(Parser)]
#[command(name = "thinkflow", version, about = "Workflow engine for LLM thinking graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "thinkflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume run requests from the worker queue until Ctrl-C
    Worker,
    /// Execute a workflow in this process and print the final snapshot
    Run {
        #[command(flatten)]
        request: RequestArgs,
        /// Log node events as they happen
        #[arg(long)]
        trace: bool,
    },
    /// Send a run request through the broker and print the reply
    Submit {
        #[command(flatten)]
        request: RequestArgs,
        /// Reply timeout in milliseconds (defaults to broker.rpc_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(clap::Args)]
struct RequestArgs {
    /// Workflow definition id
    thinking_id: String,
    /// Input variable as NAME=VALUE; VALUE is parsed as JSON when it can be
    #[arg(short, long = "input", value_name = "NAME=VALUE")]
    inputs: Vec<String>,
    /// Override the round ceiling for this run
    #[arg(long)]
    max_iterations: Option<usize>,
    /// Override the node error policy for this run
    #[arg(long, value_parser = parse_policy)]
    on_node_error: Option<NodeErrorPolicy>,
}

impl RequestArgs {
    fn into_request(self) -> anyhow::Result<RunRequest> {
        let mut request = RunRequest::new(self.thinking_id);
        for raw in &self.inputs {
            let (name, value) = parse_input(raw)?;
            request = request.with_input(name, value);
        }
        if self.max_iterations.is_some() || self.on_node_error.is_some() {
            request.config = Some(RunOverrides {
                max_iterations: self.max_iterations,
                on_node_error: self.on_node_error,
            });
        }
        Ok(request)
    }
}

fn parse_input(raw: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("input '{}' is not NAME=VALUE", raw))?;
    if name.is_empty() {
        anyhow::bail!("input '{}' has an empty name", raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn parse_policy(raw: &str) -> Result<NodeErrorPolicy, String> {
    match raw {
        "continue" => Ok(NodeErrorPolicy::Continue),
        "fail" => Ok(NodeErrorPolicy::Fail),
        other => Err(format!("unknown policy '{}', expected continue or fail", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("thinkflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "thinkflow", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Worker => {
            let service = Arc::new(build_service(&config, Arc::new(EventBus::default()))?);
            let broker = thinkflow_rpc::connect(&config.broker).await?;
            let server = RpcServer::new(broker, service, config.broker.worker_queue.clone());

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    signal.cancel();
                }
            });
            server.run(shutdown).await?;
        }
        Commands::Run { request, trace } => {
            let events = Arc::new(EventBus::default());
            if trace {
                spawn_event_logger(&events);
            }
            let service = build_service(&config, events)?;
            let snapshot = service.handle(request.into_request()?).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Submit {
            request,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.broker.rpc_timeout_ms));
            let broker = thinkflow_rpc::connect(&config.broker).await?;
            let client = RpcClient::new(broker).with_timeout(timeout);

            let outcome = client
                .run(&config.broker.request_queue, &request.into_request()?)
                .await;
            client.close().await?;
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Wire store, executors and definitions from config.
fn build_service(config: &AppConfig, events: Arc<EventBus>) -> anyhow::Result<RunService> {
    let store: Arc<dyn StateStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(InMemoryStateStore::new()),
        StoreKind::Sqlite => {
            let path = config.store_path();
            info!(path = %path.display(), "Opening run state database");
            Arc::new(SqliteStateStore::open(&path)?)
        }
    };

    let llm: Option<Arc<dyn LlmClient>> = config.model.as_ref().map(|model| {
        info!(provider = %model.provider, model = %model.model_id, "LLM client configured");
        Arc::from(thinkflow_llm::create_client(model))
    });
    let sandbox = ScriptSandbox::new(Duration::from_millis(config.engine.script_timeout_ms));
    let registry = ExecutorRegistry::with_defaults(llm, config.model.clone(), sandbox);

    let definitions = FileDefinitionStore::new(config.definitions_dir());
    debug!(dir = %definitions.dir().display(), "Reading workflow definitions");

    Ok(RunService::new(
        Arc::new(definitions),
        Arc::new(registry),
        store,
        config.engine.clone(),
    )
    .with_events(events))
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                RunEvent::RunStarted {
                    instance_id,
                    graph_id,
                } => info!(%instance_id, %graph_id, "run started"),
                RunEvent::NodeStarted {
                    node_id, node_type, ..
                } => info!(%node_id, %node_type, "node started"),
                RunEvent::NodeCompleted {
                    node_id, activated, ..
                } => info!(%node_id, next = ?activated, "node completed"),
                RunEvent::NodeFailed { node_id, error, .. } => {
                    info!(%node_id, %error, "node failed")
                }
                RunEvent::RunFinished { status, rounds, .. } => {
                    info!(%status, rounds, "run finished")
                }
            }
        }
    });
}
