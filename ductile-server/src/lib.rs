//! HTTP and MCP surface: the request pipeline over the endpoint registry,
//! the configuration API, and the OpenAPI/MCP projections of the same
//! descriptors.

pub mod config_api;
pub mod handler;
pub mod logging;
pub mod mcp;
pub mod openapi;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use ductile_cache::{CacheManager, Heartbeat};
use ductile_config::{ConfigError, ConfigLoader, ProjectConfig, RegistryHandle};
use ductile_core::ApiError;
use ductile_engine::Engine;
use ductile_security::{AuthService, RateLimiter};
use ductile_template::TemplateDir;

pub use logging::LogHandle;

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub project: Arc<ProjectConfig>,
    pub registry: RegistryHandle,
    pub engine: Arc<Engine>,
    pub templates: Arc<TemplateDir>,
    pub cache: Arc<CacheManager>,
    pub auth: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub loader: Arc<ConfigLoader>,
    pub log: Arc<Option<LogHandle>>,
    /// Allow-listed environment subset bound as `env.*`.
    pub env: BTreeMap<String, String>,
}

/// Build the application state from a parsed project. Endpoint scan errors
/// are returned for the caller to treat as fatal or not.
pub async fn build_state(
    loader: ConfigLoader,
    log: Option<LogHandle>,
) -> Result<(AppState, Vec<ConfigError>), ApiError> {
    let project = Arc::new(loader.project().clone());
    let env = loader.allowlist().environment();

    let engine = Arc::new(Engine::init(&project.duckdb, &project.connections)?);
    let templates = Arc::new(TemplateDir::new(loader.template_root()));
    let outcome = loader.scan();
    let registry = RegistryHandle::new(outcome.registry);

    let cache = Arc::new(CacheManager::new(
        engine.clone(),
        templates.clone(),
        project.clone(),
        env.clone(),
    ));
    cache.attach_catalog().await?;

    let state = AppState {
        project,
        registry,
        engine,
        templates,
        cache,
        auth: Arc::new(AuthService::new()),
        rate_limiter: Arc::new(RateLimiter::new()),
        loader: Arc::new(loader),
        log: Arc::new(log),
        env,
    };
    Ok((state, outcome.errors))
}

/// The full router: configuration API and MCP first, then the dynamic
/// endpoint table as the fallback.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/_config", config_api::router())
        .route("/api/v1/openapi.json", get(config_api::openapi_document))
        .route("/mcp/jsonrpc", post(mcp::jsonrpc_handler))
        .fallback(handler::dynamic_handler)
        .with_state(state)
}

/// Serve until ctrl-c: warm the caches, start the heartbeat when enabled,
/// then accept traffic.
pub async fn run(state: AppState, port: u16) -> Result<(), ApiError> {
    Heartbeat::warm_up(&state.registry, &state.cache).await;

    let heartbeat = state.project.heartbeat.enabled.then(|| {
        Heartbeat::start(
            state.project.heartbeat.worker_interval.max(Duration::from_secs(1)),
            state.registry.clone(),
            state.cache.clone(),
        )
    });

    if state.project.enforce_https.enabled {
        tracing::warn!(
            "enforce-https is configured; TLS termination is expected in front of this process"
        );
    }

    // Janitor for rate-limit windows of one-off principals.
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(600));
        loop {
            ticker.tick().await;
            limiter.evict_idle(Duration::from_secs(600));
        }
    });

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot bind {addr}: {e}")))?;
    tracing::info!(%addr, project = %state.project.project_name, "serving");

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .map_err(|e| ApiError::Internal(format!("server error: {e}")))?;

    if let Some(heartbeat) = heartbeat {
        heartbeat.shutdown().await;
    }
    Ok(())
}
