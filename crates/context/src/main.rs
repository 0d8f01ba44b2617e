//! Civica Context Service
//!
//! HTTP surface of the answering pipeline.
//! Handles:
//! - Citizen questions (reformulation, search, synthesis)
//! - Tool configuration reads, updates and reloads
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use civica_common::{
    audit::{AuditSink, JsonlAuditSink, TracingAuditSink},
    config::{AppConfig, ObservabilityConfig},
    context::PipelineCoordinator,
    corpus::KnowledgeCorpusCache,
    llm::{LlmProvider, MockProvider, OpenAiProvider},
    metrics::{self, STAGE_BUCKETS},
    tools::{JsonFileBackend, ToolConfigStore},
    VERSION,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub coordinator: Arc<PipelineCoordinator>,
    pub tools: Arc<ToolConfigStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.observability);
    info!("Starting Civica Context Service v{}", VERSION);

    init_metrics(&config.observability)?;

    let config = Arc::new(config);
    let state = build_state(config.clone()).await?;
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_metrics(config: &ObservabilityConfig) -> anyhow::Result<()> {
    if config.metrics_port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), STAGE_BUCKETS)?
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    metrics::register_metrics();
    info!(port = config.metrics_port, "Metrics exporter listening");
    Ok(())
}

/// Wire the provider, stores and pipeline from configuration
async fn build_state(config: Arc<AppConfig>) -> anyhow::Result<AppState> {
    let provider: Arc<dyn LlmProvider> = if config.llm.mock {
        warn!("LLM provider is mocked, answers are placeholders");
        Arc::new(MockProvider::new())
    } else {
        Arc::new(OpenAiProvider::new(&config.llm)?)
    };

    let backend = Arc::new(JsonFileBackend::new(&config.tools.config_path));
    let tools = Arc::new(ToolConfigStore::open(backend).await?);

    let corpus = Arc::new(KnowledgeCorpusCache::from_dir(&config.pipeline.options.rag_context_path));

    let audit: Arc<dyn AuditSink> = match &config.audit.jsonl_path {
        Some(path) => {
            info!(path = %path, "Auditing runs to JSONL");
            Arc::new(JsonlAuditSink::new(path))
        }
        None => Arc::new(TracingAuditSink),
    };

    let coordinator = Arc::new(PipelineCoordinator::new(
        config.pipeline.clone(),
        provider,
        tools.clone(),
        corpus,
        audit,
    ));

    Ok(AppState {
        config,
        coordinator,
        tools,
    })
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let api_routes = Router::new()
        .route("/ask", post(handlers::ask::ask))
        .route("/tools", get(handlers::tools::list_tools))
        .route("/tools/reload", post(handlers::tools::reload_tools))
        .route(
            "/tools/{name}",
            get(handlers::tools::get_tool).patch(handlers::tools::update_tool),
        );

    Router::new()
        .route("/health", get(handlers::health::health))
        .nest("/v1", api_routes)
        .layer(axum::middleware::from_fn(middleware::track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
