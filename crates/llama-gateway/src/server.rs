//! Composition root.
//!
//! Ownership is linear: the gateways depend on the supervisor, and both are
//! constructed here together with the config handle and metadata provider.
//! Two listeners are bound (each can be disabled in the config) and share
//! one state; shutdown stops the listeners first, then every worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api;
use crate::config::{metadata_cache_dir, ConfigHandle, OLLAMA_GATEWAY_PORT, OPENAI_GATEWAY_PORT};
use crate::log_status::{LogTracker, StatusSnapshot};
use crate::metadata::MetadataProvider;
use crate::metrics;
use crate::supervisor::{Supervisor, WorkerEvent};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct GatewayState {
    pub config: ConfigHandle,
    pub supervisor: Supervisor,
    pub metadata: Arc<MetadataProvider>,
    pub http: reqwest::Client,
}

impl GatewayState {
    pub fn new(config: ConfigHandle) -> Self {
        let supervisor = Supervisor::new(config.clone());
        let metadata = Arc::new(MetadataProvider::new(metadata_cache_dir()));
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            supervisor,
            metadata,
            http,
        }
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

pub fn openai_router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/models", get(api::openai::list_models))
        .route("/v1/chat/completions", post(api::openai::chat_completions))
        .route("/v1/completions", post(api::openai::completions))
        .route("/v1/embeddings", post(api::openai::embeddings))
        .route("/api/v0/models", get(api::openai::list_models_v0))
        .route("/api/v0/models/:model_id", get(api::openai::get_model_v0))
        .route("/api/v0/chat/completions", post(api::openai::chat_completions))
        .route("/api/v0/completions", post(api::openai::completions))
        .route("/api/v0/embeddings", post(api::openai::embeddings))
        .route("/metrics", get(metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::openai::require_bearer,
        ))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

pub fn ollama_router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/generate", post(api::ollama::generate))
        .route("/api/chat", post(api::ollama::chat))
        .route("/api/embeddings", post(api::ollama::embeddings))
        .route("/api/tags", get(api::ollama::tags))
        .route("/api/show", post(api::ollama::show))
        .route("/healthz", get(|| async { "OK" }))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

pub async fn run_gateway(config_path: PathBuf) -> Result<()> {
    metrics::init_metrics();

    let config = ConfigHandle::load(config_path)?;
    let state = GatewayState::new(config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    tokio::spawn(watch_config(state.clone()));
    tokio::spawn(watch_worker_status(state.supervisor.clone()));

    let snapshot = config.current();
    info!(
        "loaded {} model(s), {} runtime(s), concurrency limit {}",
        snapshot.models.len(),
        snapshot.runtimes.len(),
        snapshot.concurrent_runners
    );

    let mut servers = Vec::new();

    if snapshot.openai_enabled {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", OPENAI_GATEWAY_PORT))
            .await
            .with_context(|| format!("failed to bind port {}", OPENAI_GATEWAY_PORT))?;
        info!(
            "OpenAI-compatible gateway listening on http://127.0.0.1:{}",
            OPENAI_GATEWAY_PORT
        );
        let app = openai_router(state.clone());
        let mut shutdown = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }));
    }

    if snapshot.ollama_enabled {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", OLLAMA_GATEWAY_PORT))
            .await
            .with_context(|| format!("failed to bind port {}", OLLAMA_GATEWAY_PORT))?;
        info!(
            "Ollama-compatible gateway listening on http://127.0.0.1:{}",
            OLLAMA_GATEWAY_PORT
        );
        let app = ollama_router(state.clone());
        let mut shutdown = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }));
    }

    if servers.is_empty() {
        warn!("both gateways are disabled in the config; nothing to serve");
        let mut shutdown = shutdown_rx.clone();
        let _ = shutdown.changed().await;
    }

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("gateway listener error: {}", err),
            Err(err) => warn!("gateway task failed: {}", err),
        }
    }

    info!("gateways stopped, shutting down workers");
    state.supervisor.stop_all().await;
    Ok(())
}

/// Polls the config file's mtime; a change swaps the snapshot atomically and
/// stops workers whose spec changed so the next request restarts them.
async fn watch_config(state: GatewayState) {
    let path = state.config.path().to_path_buf();
    let mut last_modified = modified_time(&path);
    let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let current = modified_time(&path);
        if current.is_some() && current != last_modified {
            last_modified = current;
            match state.config.reload() {
                Ok(changed) => {
                    for model in changed {
                        info!("spec for '{}' changed, stopping its worker", model);
                        state.supervisor.stop_worker(&model).await;
                    }
                }
                Err(err) => warn!("config reload failed, keeping previous snapshot: {}", err),
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Follows supervisor events and, for every worker that becomes ready,
/// mirrors its activity (prompt processing, generation, speeds) into the log
/// until it goes away.
async fn watch_worker_status(supervisor: Supervisor) {
    let mut events = supervisor.subscribe();
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Ready { model, .. }) => {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    report_worker_status(supervisor, model).await;
                });
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn report_worker_status(supervisor: Supervisor, model: String) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<StatusSnapshot> = None;

    loop {
        ticker.tick().await;
        if !supervisor.is_running(&model).await {
            break;
        }
        let lines = supervisor.output_of(&model).await;
        let status = LogTracker::parse_lines(lines.iter().map(String::as_str));
        if last.as_ref() != Some(&status) {
            info!("[{}] {}", model, status.format_text());
            last = Some(status);
        }
    }
}
