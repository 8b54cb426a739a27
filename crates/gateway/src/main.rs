//! Tollgate API Gateway
//!
//! Single entry point in front of every published API.
//! Handles:
//! - API key validation against the key management service
//! - Sliding-window rate limiting per key (minute / day / month)
//! - Streaming proxy to `{owner}-{api}` backends
//! - Asynchronous usage metering
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;
mod proxy;
mod ratelimit;
mod usage;
mod validator;


use axum::{
    middleware::from_fn_with_state,
    routing::{any, get},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use proxy::{ContentTypePolicy, TemplateResolver, UpstreamProxy};
use ratelimit::{MemoryWindowStore, RateLimiter, RedisWindowStore, WindowStore};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{signal, sync::Notify};
use tollgate_common::{
    config::{AppConfig, ObservabilityConfig, RateLimitBackend},
    errors::AppError,
    metrics, SharedClock, SystemClock,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use usage::{HttpUsageSink, UsageLogger, UsageWorker};
use validator::KeyValidator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub validator: Arc<dyn KeyValidator>,
    /// `None` when rate limiting is disabled
    pub limiter: Option<Arc<RateLimiter>>,
    pub proxy: Arc<UpstreamProxy>,
    pub admission: Arc<ContentTypePolicy>,
    pub usage: UsageLogger,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Arc::new(AppConfig::load()?);

    // Initialize tracing
    init_tracing(&config.observability);

    info!("Starting Tollgate API Gateway v{}", tollgate_common::VERSION);

    // Initialize metrics
    metrics::register_metrics();
    install_metrics_exporter(&config.observability)?;

    let (state, usage_worker) = build_state(config.clone()).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize gateway");
        e
    })?;

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let draining = Arc::new(Notify::new());
    let trigger = draining.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            trigger.notify_one();
        })
        .into_future();

    let grace = config.shutdown_timeout();
    tokio::select! {
        result = server => result?,
        _ = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => warn!(timeout_secs = grace.as_secs(), "Open connections did not finish in time"),
    }

    usage_worker.shutdown(config.metering.shutdown_timeout()).await;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.metrics_port == 0 {
        info!("Prometheus exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], config.metrics_port)))
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            metrics::LATENCY_BUCKETS,
        )?
        .install()?;

    info!(port = config.metrics_port, "Prometheus exporter listening");
    Ok(())
}

/// Wire every component from configuration
async fn build_state(config: Arc<AppConfig>) -> Result<(AppState, UsageWorker), AppError> {
    let clock: SharedClock = Arc::new(SystemClock);

    let validator = validator::create_validator(&config.validator, clock.clone())?;

    let limiter = if config.rate_limit.enabled {
        let store: Arc<dyn WindowStore> = match config.rate_limit.backend {
            RateLimitBackend::Redis => Arc::new(RedisWindowStore::connect(&config.redis).await?),
            RateLimitBackend::Memory => {
                warn!("In-memory window store: limits are not shared between replicas");
                Arc::new(MemoryWindowStore::new(clock))
            }
        };
        info!(
            store = store.name(),
            policy = ?config.rate_limit.on_store_failure,
            "Rate limiting enabled"
        );
        Some(Arc::new(RateLimiter::new(store, config.redis.key_prefix.clone())))
    } else {
        warn!("Rate limiting disabled");
        None
    };

    let proxy = UpstreamProxy::new(
        &config.proxy,
        Arc::new(TemplateResolver::new(config.proxy.upstream_template.clone())),
    )?;
    let admission = ContentTypePolicy::new(&config.proxy.allowed_content_types);

    let (usage, usage_worker) = UsageLogger::spawn(Arc::new(HttpUsageSink::new(&config.metering)?), &config.metering);

    let state = AppState {
        config,
        validator,
        limiter,
        proxy: Arc::new(proxy),
        admission: Arc::new(admission),
        usage,
    };

    Ok((state, usage_worker))
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Proxied routes; the last route_layer added runs first
    let api_routes = Router::new()
        .route("/api/{owner}/{api}", any(handlers::proxy::forward))
        .route("/api/{owner}/{api}/{*path}", any(handlers::proxy::forward))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit::enforce))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth::authenticate))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::admission::admit_content_type,
        ));

    // Compose the app
    Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
