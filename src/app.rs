use crate::auth::AuthState;
use crate::config::GatewayConfig;
use crate::credentials::CredentialPool;
use crate::dispatcher::Dispatcher;
use crate::error::{AppError, AppResult};
use crate::session::SessionManager;
use crate::upstream::{QwenClient, Upstream};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: Arc<GatewayConfig>,
    pub auth: AuthState,
    pub metrics: PrometheusHandle,
    pub pool: Arc<CredentialPool>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<Dispatcher>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub api_key: Option<String>,
    pub config_file: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            listen: env("QWENIZE_LISTEN").unwrap_or_else(|| "0.0.0.0:8220".to_string()),
            metrics_path: env("QWENIZE_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string()),
            api_key: env("QWENIZE_API_KEY"),
            config_file: env("CONFIG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("qwenize.toml")),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let path = runtime.config_file.clone();
    let config = tokio::task::spawn_blocking(move || GatewayConfig::load(&path))
        .await
        .map_err(|err| startup_error("config_load_failed", err.to_string()))?
        .map_err(|err| startup_error("config_invalid", err.to_string()))?;
    load_state_with_config(runtime, config)
}

pub fn load_state_with_config(runtime: RuntimeConfig, config: GatewayConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| startup_error("http_client_init_failed", err.to_string()))?;
    let upstream: Arc<dyn Upstream> = Arc::new(QwenClient::new(
        http,
        config.base_url.clone(),
        config.retry.request_timeout(),
    ));
    load_state_with_upstream(runtime, config, upstream)
}

/// Wires the core around an arbitrary upstream transport.
pub fn load_state_with_upstream(
    runtime: RuntimeConfig,
    config: GatewayConfig,
    upstream: Arc<dyn Upstream>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    let config = Arc::new(config);
    let pool = Arc::new(CredentialPool::new(
        config.credential_groups.clone(),
        config.retry.rate_limit_cooldown(),
        config.retry.auth_cooldown(),
    ));
    let sessions = Arc::new(SessionManager::new(upstream.clone(), config.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        sessions.clone(),
        upstream,
        config.clone(),
    ));
    let auth = AuthState::new(runtime.api_key.clone());
    if !auth.is_enabled() {
        tracing::warn!("QWENIZE_API_KEY not set, api is open to anyone who can reach it");
    }

    Ok(AppState {
        runtime: Arc::new(runtime),
        config,
        auth,
        metrics,
        pool,
        sessions,
        dispatcher,
    })
}

/// Failures while building state; nothing here is the caller's fault.
pub fn startup_error(code: &str, message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(startup_error("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| startup_error("metrics_init_failed", "metrics recorder not available"))
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router();
    Router::<AppState>::new()
        .route("/", get(crate::handlers::root))
        .route("/health", get(crate::handlers::health))
        .route("/config", get(crate::handlers::config_view))
        .route(&metrics_path, get(crate::handlers::metrics))
        .merge(api_router.clone())
        .nest("/api", api_router)
        .with_state(state)
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
}
