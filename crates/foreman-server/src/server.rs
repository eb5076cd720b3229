//! `ForemanServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use foreman_core::{ChatError, ClientInstanceId, IdentityVerifier, SessionId};
use foreman_llm::StreamingResponder;
use foreman_ratelimit::{CounterStore, LimitSettings, MemoryCounterStore, RateLimiter};
use foreman_store::Database;

use crate::auth::credentials_from;
use crate::config::{ChatConfig, ServerConfig};
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::orchestrator::{OrchestratorDeps, SessionOrchestrator};
use crate::routes::{self, ApiError};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{WsParams, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SessionOrchestrator,
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub config: Arc<ServerConfig>,
    /// Absent when no recorder was installed (tests).
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// Collaborators the server is composed from.
pub struct ServerParts {
    pub db: Database,
    pub counters: Arc<MemoryCounterStore>,
    pub limits: LimitSettings,
    pub responder: StreamingResponder,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub chat: ChatConfig,
}

/// The Foreman server.
pub struct ForemanServer {
    state: AppState,
    counters: Arc<MemoryCounterStore>,
}

impl ForemanServer {
    pub fn new(config: ServerConfig, parts: ServerParts) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let counters: Arc<dyn CounterStore> = parts.counters.clone();
        let orchestrator = SessionOrchestrator::new(
            OrchestratorDeps {
                db: parts.db,
                limiter: Arc::new(RateLimiter::new(counters, parts.limits)),
                responder: parts.responder,
                sink: registry.clone(),
            },
            parts.chat,
        );
        Self {
            state: AppState {
                orchestrator,
                registry,
                verifier: parts.verifier,
                config: Arc::new(config),
                metrics: None,
                start_time: Instant::now(),
                shutdown: Arc::new(ShutdownCoordinator::new()),
            },
            counters: parts.counters,
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.state.orchestrator
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Finalize answers a previous process left streaming, then start the
    /// idle and rate-window sweepers.
    pub fn start_background(&self) {
        match self.state.orchestrator.recover_interrupted_turns() {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "recovered interrupted answers"),
            Err(e) => error!(error = %e, "failed to recover interrupted answers"),
        }

        let config = &self.state.config;
        let token = self.state.shutdown.token();
        self.state.shutdown.track(self.state.orchestrator.spawn_idle_sweeper(
            Duration::from_secs(config.idle_sweep_interval_secs.max(1)),
            Duration::from_secs(config.idle_after_secs),
            token.clone(),
        ));
        self.state.shutdown.track(
            self.counters
                .spawn_sweeper(Duration::from_secs(config.counter_sweep_interval_secs.max(1)), token),
        );
    }

    /// Bind the listener, start background tasks, and serve until shutdown.
    pub async fn listen(&self) -> std::io::Result<ServerHandle> {
        let config = &self.state.config;
        let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        self.start_background();

        let router = self.router();
        let token = self.state.shutdown.token();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "foreman server listening");

        Ok(ServerHandle {
            addr,
            shutdown: Arc::clone(&self.state.shutdown),
            registry: Arc::clone(&self.state.registry),
            timeout: Duration::from_secs(config.shutdown_timeout_secs),
            server,
        })
    }
}

/// Handle to a listening server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<ShutdownCoordinator>,
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting, close every transport, and drain tracked tasks.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.shutdown();
        self.registry.close_all();
        self.shutdown.graceful_shutdown(Some(self.timeout)).await;
        if tokio::time::timeout(self.timeout, self.server).await.is_err() {
            warn!("listener did not stop within the shutdown timeout");
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/sessions", get(routes::list_sessions))
        .route("/sessions/{id}", axum::routing::delete(routes::close_session))
        .route("/sessions/{id}/messages", get(routes::list_messages))
        .route("/sessions/{id}/close", post(routes::close_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// WebSocket upgrade query: `/ws?token=…&sessionId=…&clientId=…&projectId=…`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    pub project_id: Option<String>,
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if state.registry.connection_count() >= state.config.max_connections {
        warn!(limit = state.config.max_connections, "rejecting connection: at capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    let identity = match state
        .verifier
        .verify(&credentials_from(&headers, query.token.as_deref()))
        .await
    {
        Ok(identity) => identity,
        Err(e) => return ApiError(ChatError::from(e)).into_response(),
    };

    let params = WsParams {
        identity,
        client_id: query.client_id.filter(|c| !c.is_empty()).map(ClientInstanceId::from_raw),
        session_id: query.session_id.filter(|s| !s.is_empty()).map(SessionId::from_raw),
        project_ref: query.project_id.filter(|p| !p.is_empty()),
    };
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, params, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let active = match state.orchestrator.active_session_count() {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(error = %e, "health check could not count sessions");
            None
        }
    };
    Json(health::health_check(
        state.start_time,
        state.registry.connection_count(),
        active,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
