// huntwright server - runs the Trigger Surface HTTP API plus a pool of
// workers draining the `workflows` queue (§4, §5).
//
// Run with: cargo run --bin server

use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use huntwright::api::{build_router, ApiConfig};
use huntwright::engine::{InMemoryCatalogStore, InMemoryWorkQueue, WorkflowEngine};
use huntwright::llm::LlmGateway;
use huntwright::models::{AgentModelConfig, Thresholds, WorkflowConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Agents named in §3 "WorkflowConfig" / §4.3's sub-agent list, each
/// needing a model assignment and a prompt before the engine can run a
/// stage against it.
const AGENTS: [&str; 9] = [
    "os_detect",
    "junk_filter",
    "rank",
    "cmdline_extract",
    "proctree_extract",
    "hunt_queries_extract",
    "qa",
    "sigma_gen",
    "embedding",
];

/// Seeds a version-1 `WorkflowConfig` for a bare in-memory deployment
/// (dev/test). A production deployment instead reads the latest row the
/// UI's config editor already wrote (§2.4 "Prompt/Config Registry").
fn dev_workflow_config() -> WorkflowConfig {
    let mut agent_models = HashMap::new();
    let mut agent_prompts = HashMap::new();
    for agent in AGENTS {
        agent_models.insert(
            agent.to_string(),
            AgentModelConfig {
                provider: huntwright::llm::LLMProviderType::Anthropic,
                model: "claude-3-haiku".to_string(),
                temperature: 0.0,
                top_p: 1.0,
                max_tokens: 1024,
            },
        );
        agent_prompts.insert(agent.to_string(), format!("SYSTEM PROMPT FOR {agent}"));
    }

    WorkflowConfig {
        version: 1,
        agent_models,
        agent_prompts,
        thresholds: Thresholds::default(),
        qa_enabled: HashMap::new(),
        enabled_subagents: HashSet::from([
            "cmdline_extract".to_string(),
            "proctree_extract".to_string(),
            "hunt_queries_extract".to_string(),
        ]),
        sigma_fallback_enabled: false,
        similarity_k: 10,
        os_detect_proceed_on_unknown: true,
        auto_trigger_threshold: 5.0,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenv() {
        warn!("no .env file loaded: {e}");
    }
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    info!("starting huntwright server");

    let storage_backend = env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());
    let store: Arc<dyn huntwright::engine::storage::CatalogStore> = match storage_backend.as_str() {
        "postgres" => {
            let database_url = env::var("DATABASE_URL")?;
            info!("connecting to postgres catalog store");
            let pool = sqlx::postgres::PgPoolOptions::new().max_connections(10).connect(&database_url).await?;
            let pg = huntwright::engine::storage::PgCatalogStore::new(pool);
            pg.migrate().await?;
            Arc::new(pg)
        }
        _ => {
            info!("using in-memory catalog store (not persisted across restarts)");
            let store = InMemoryCatalogStore::new();
            store.set_workflow_config(dev_workflow_config()).await;
            Arc::new(store)
        }
    };

    let queue_backend = env::var("QUEUE_BACKEND").unwrap_or_else(|_| "memory".to_string());
    let queue: Arc<dyn huntwright::engine::queue::WorkQueue> = match queue_backend.as_str() {
        "nats" => {
            let nats_url = env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
            info!(nats_url, "connecting to NATS work queue");
            Arc::new(huntwright::engine::queue::NatsWorkQueue::connect(&nats_url, "workflows").await?)
        }
        _ => {
            info!("using in-process work queue");
            Arc::new(InMemoryWorkQueue::new())
        }
    };

    for provider in ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GOOGLE_API_KEY"] {
        if env::var(provider).is_ok() {
            info!("{provider} configured");
        }
    }

    let gateway = Arc::new(LlmGateway::new());
    let engine = Arc::new(WorkflowEngine::new(store, queue.clone(), gateway, None));

    let sweep_interval_s: u64 = env::var("SWEEP_INTERVAL_S").ok().and_then(|v| v.parse().ok()).unwrap_or(300);
    tokio::spawn(huntwright::engine::run_sweeper(
        engine.clone(),
        std::time::Duration::from_secs(sweep_interval_s),
    ));

    // Worker shutdown signal (§5 "the worker's shutdown signal"): flipped
    // once on ctrl-c/SIGTERM, observed between dequeue iterations so
    // in-flight `engine.run()` calls finish their current stage before
    // the process exits rather than being cut off mid-attempt.
    let shutdown = CancellationToken::new();

    let worker_count: usize = env::var("WORKER_COUNT").ok().and_then(|v| v.parse().ok()).unwrap_or(4);
    let mut workers = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let engine = engine.clone();
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            info!(worker_id, "worker started");
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    dequeued = queue.dequeue() => dequeued,
                };
                match message {
                    Ok(Some(message)) => {
                        let execution_id = message.execution_id;
                        if let Err(err) = engine.run(message).await {
                            error!(worker_id, %execution_id, %err, "execution run failed");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        error!(worker_id, %err, "queue dequeue failed");
                    }
                }
            }
            info!(worker_id, "worker exiting");
        }));
    }

    let config = ApiConfig {
        host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        port: env::var("SERVER_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080),
        cors_enabled: true,
    };
    let router = build_router(engine, &config);
    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, "trigger surface listening");

    let shutdown_for_server = shutdown.clone();
    axum::Server::bind(&addr.parse()?)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining workers");
            shutdown_for_server.cancel();
        })
        .await?;

    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
