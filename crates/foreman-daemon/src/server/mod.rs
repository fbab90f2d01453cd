//! HTTP and WebSocket surface.
//!
//! - `GET /health`, `GET /api/snapshot`
//! - `GET|POST /api/features`, `GET /api/features/ready`, `GET /api/features/{id}`
//! - `GET /api/test-runs?feature_id=&limit=`
//! - `POST /api/control/{action}`
//! - `GET /ws`: the observer event stream

pub mod routes;
pub mod ws;

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use foreman_core::config::ServerConfig;

use crate::broadcast::HubConfig;
use crate::orchestration::{Orchestrator, OrchestratorError};
use crate::storage::DatabaseError;

/// Observer connection timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverSettings {
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which an observer is dropped.
    pub client_timeout: Duration,
}

impl Default for ObserverSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ObserverSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            client_timeout: Duration::from_secs(config.client_timeout_secs.max(1)),
        }
    }
}

/// Hub sizing from server settings.
pub fn hub_config(config: &ServerConfig) -> HubConfig {
    HubConfig {
        capacity: config.broadcast_capacity,
        recent_events: config.recent_events,
        ..HubConfig::default()
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub observers: ObserverSettings,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/snapshot", get(routes::snapshot))
        .route(
            "/api/features",
            get(routes::list_features).post(routes::create_features),
        )
        .route("/api/features/ready", get(routes::list_ready))
        .route("/api/features/{id}", get(routes::get_feature))
        .route("/api/test-runs", get(routes::list_test_runs))
        .route("/api/control/{action}", post(routes::control))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

/// Error returned by HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(format!("not found: {what}")),
            other => {
                error!(error = %other, "Feature store error");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Database(db) => db.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}
