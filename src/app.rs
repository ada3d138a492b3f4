use crate::error::{AppError, AppResult};
use crate::handlers;
use crate::settings::{DEFAULT_MAX_HISTORY_MESSAGES, DEFAULT_MODEL, GptSetting, SettingsStore};
use crate::store::{KvStore, SqliteKvStore};
use crate::upstream::{ChatProvider, OpenAiProvider};
use crate::users::{DEFAULT_UNIT_PRICE, User, UserLedger, UserRepository};
use axum::Router;
use axum::http::header::{CONTENT_TYPE, HeaderName};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub metrics: PrometheusHandle,
    pub users: Arc<dyn UserRepository>,
    pub settings: SettingsStore,
    pub provider: Arc<dyn ChatProvider>,
}

const SEEDED_ADMIN_NICKNAME: &str = "admin";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub upstream_base_url: String,
    pub upstream_timeout_ms: u64,
    pub unit_price: f64,
    pub admin_token: Option<String>,
    pub default_api_key: String,
    pub default_model: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_blank("GPTRELAY_LISTEN").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path =
            env_non_blank("GPTRELAY_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        let upstream_base_url = env_non_blank("GPTRELAY_UPSTREAM_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let upstream_timeout_ms = env_non_blank("GPTRELAY_UPSTREAM_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60_000);
        let unit_price = env_non_blank("GPTRELAY_UNIT_PRICE")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(DEFAULT_UNIT_PRICE);
        Self {
            listen,
            metrics_path,
            database_dsn,
            upstream_base_url,
            upstream_timeout_ms,
            unit_price,
            admin_token: env_non_blank("GPTRELAY_ADMIN_TOKEN"),
            default_api_key: env_non_blank("GPTRELAY_DEFAULT_API_KEY").unwrap_or_default(),
            default_model: env_non_blank("GPTRELAY_DEFAULT_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    fn default_setting(&self) -> GptSetting {
        GptSetting {
            api_key: self.default_api_key.clone(),
            model: self.default_model.clone(),
            max_history_messages: DEFAULT_MAX_HISTORY_MESSAGES,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let kv = SqliteKvStore::new(&runtime.database_dsn)
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let http = reqwest::Client::builder()
        .user_agent("gptrelay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let provider = OpenAiProvider::new(
        http,
        runtime.upstream_base_url.clone(),
        Duration::from_millis(runtime.upstream_timeout_ms),
    );

    load_state_with_parts(runtime, Arc::new(kv), Arc::new(provider)).await
}

/// Builds the state over an explicit store and provider.
pub async fn load_state_with_parts(
    runtime: RuntimeConfig,
    kv: Arc<dyn KvStore>,
    provider: Arc<dyn ChatProvider>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;

    let users = UserLedger::load(kv.clone(), runtime.unit_price)
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "user_store_init_failed",
                err.to_string(),
            )
        })?;
    let settings = SettingsStore::load(kv, runtime.default_setting())
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "settings_store_init_failed",
                err.to_string(),
            )
        })?;

    if let Some(token) = runtime.admin_token.as_deref() {
        ensure_admin_user(&users, token).await?;
    }

    Ok(AppState {
        runtime: Arc::new(runtime),
        metrics,
        users: Arc::new(users),
        settings,
        provider,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

/// Makes sure the configured bootstrap token exists and is an admin, so a
/// fresh store can be managed at all.
async fn ensure_admin_user(users: &UserLedger, token: &str) -> AppResult<()> {
    let token = token.trim();
    if let Some(existing) = users.get(token).await {
        if existing.admin {
            return Ok(());
        }
        tracing::warn!(token = %token, "bootstrap user exists without admin flag, promoting");
        let mut promoted = existing;
        promoted.admin = true;
        promoted.expire_timestamp = 0;
        users.put(promoted).await?;
        return Ok(());
    }
    users
        .put(User {
            token: token.to_string(),
            nickname: SEEDED_ADMIN_NICKNAME.to_string(),
            admin: true,
            ..Default::default()
        })
        .await?;
    tracing::info!(token = %token, "seeded admin user");
    Ok(())
}

fn env_non_blank(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn resolve_database_dsn() -> String {
    env_non_blank("GPTRELAY_DATABASE_DSN")
        .or_else(|| env_non_blank("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/gptrelay.db".to_string())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            CONTENT_TYPE,
            HeaderName::from_static(crate::auth::ACCESS_TOKEN_HEADER),
        ]);
    Router::<AppState>::new()
        .route("/hello", get(handlers::hello))
        .route("/models", get(handlers::list_models))
        .route("/profile", get(handlers::profile))
        .route("/users", get(handlers::list_users))
        .route("/newuser", post(handlers::create_user))
        .route("/edituser", post(handlers::edit_user))
        .route("/setting", get(handlers::get_setting))
        .route("/settingedit", post(handlers::update_setting))
        .route("/chat", post(handlers::chat))
        .route("/chatstream", get(handlers::chat_stream))
        .route(&metrics_path, get(handlers::metrics))
        .with_state(state)
        .layer(cors)
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}
