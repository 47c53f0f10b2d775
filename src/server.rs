// ABOUTME: Server state and HTTP router: WebSocket channel, health, and Prometheus metrics
// ABOUTME: Wires stores, admission control, auth, and the command router into one AppState

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::JwtTokenProvider;
use crate::bus::MessageBus;
use crate::commands::builtin_registry;
use crate::gateway::registry::ChannelRegistry;
use crate::gateway::web::{ws_handler, WebChannel};
use parley_core::admission::AdmissionControl;
use parley_core::config::Config;
use parley_core::conversation::ConversationService;
use parley_core::paths;
use parley_core::pointer::PointerStore;
use parley_core::sqlite_store::SqliteSessionStore;

const BUS_CAPACITY: usize = 256;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub conversations: ConversationService,
    pub admission: Arc<AdmissionControl>,
    pub bus: MessageBus,
    pub web: Arc<WebChannel>,
    pub channels: Arc<ChannelRegistry>,
    /// None when no global recorder was installed (tests, embedded use)
    pub metrics: Option<PrometheusHandle>,
}

impl FromRef<AppState> for Arc<WebChannel> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.web)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"...")
            .field("conversations", &self.conversations)
            .field("admission", &self.admission)
            .field("web", &self.web)
            .field("channels", &self.channels)
            .finish()
    }
}

impl AppState {
    /// Open stores under the configured data directory and build every component.
    pub fn initialize(config: Config, metrics: Option<PrometheusHandle>) -> Result<Self> {
        let data_dir = config.storage.resolved_data_dir();

        let store = Arc::new(
            SqliteSessionStore::open(paths::sessions_db(&data_dir))
                .context("Failed to open session store")?,
        );
        let pointers = Arc::new(
            PointerStore::open(paths::pointer_registry(&data_dir))
                .context("Failed to open pointer registry")?,
        );
        let conversations = ConversationService::new(store, Arc::clone(&pointers));

        let admission = Arc::new(AdmissionControl::new(&config.rate_limit));
        tracing::info!(
            enabled = config.rate_limit.enabled,
            user_per_minute = config.rate_limit.user_requests_per_minute,
            channel_per_second = config.rate_limit.channel_messages_per_second,
            "Admission control initialized"
        );

        let validator = Arc::new(JwtTokenProvider::from_config(&config.auth));
        let bus = MessageBus::new(BUS_CAPACITY);
        let router = Arc::new(builtin_registry(conversations.clone()));

        let web = Arc::new(
            WebChannel::new(validator, Arc::new(bus.clone()))
                .with_router(router)
                .with_pointers(pointers)
                .with_admission(Arc::clone(&admission))
                .with_outbound_buffer(config.websocket.outbound_buffer),
        );

        let mut channels = ChannelRegistry::new();
        channels.register(web.clone());

        Ok(Self {
            config: Arc::new(config),
            conversations,
            admission,
            bus,
            web,
            channels: Arc::new(channels),
            metrics,
        })
    }
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "activeConnections": state.web.active_connections(),
        "boundSessions": state.web.registry().len(),
        "rateLimitEnabled": state.admission.is_enabled(),
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed".to_string()),
    }
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Server listening");
    serve_on(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("Server error")?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> AppState {
        let mut config = Config::default();
        config.storage.data_dir = Some(dir.display().to_string());
        config.auth.jwt_secret = Some("server-test-secret".to_string());
        AppState::initialize(config, None).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ws_without_token_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let request = Request::get("/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_ne!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
}
