//! HTTP handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use foreman_core::{Feature, FeatureId, NewFeature};

use crate::broadcast::Snapshot;
use crate::broadcast::events::{ObserverEvent, Progress};
use crate::orchestration::{ControlAction, LoopState, RunStatus};
use crate::storage::TestRun;

use super::{ApiError, AppState};

const DEFAULT_TEST_RUN_LIMIT: i64 = 100;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub store: bool,
    pub run_status: RunStatus,
    pub loop_state: LoopState,
    pub active_primary: usize,
    pub active_verification: usize,
    pub observers: usize,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Response {
    use foreman_core::WorkerClass;

    let orchestrator = &state.orchestrator;
    let store = orchestrator.store().feature_stats().await.is_ok();
    let supervisor = orchestrator.supervisor();
    let health = Health {
        status: if store { "ok" } else { "degraded" },
        store,
        run_status: orchestrator.status().await,
        loop_state: orchestrator.loop_state().await,
        active_primary: supervisor.active(WorkerClass::Primary),
        active_verification: supervisor.active(WorkerClass::Verification),
        observers: orchestrator.hub().stats().observers,
    };
    let code = if store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health)).into_response()
}

/// `GET /api/snapshot`
pub async fn snapshot(State(state): State<AppState>) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(state.orchestrator.snapshot().await?))
}

/// `GET /api/features`
pub async fn list_features(State(state): State<AppState>) -> Result<Json<Vec<Feature>>, ApiError> {
    Ok(Json(state.orchestrator.store().list_features().await?))
}

/// `GET /api/features/ready`
pub async fn list_ready(State(state): State<AppState>) -> Result<Json<Vec<Feature>>, ApiError> {
    Ok(Json(state.orchestrator.store().list_ready().await?))
}

/// `GET /api/features/{id}`
pub async fn get_feature(
    Path(id): Path<FeatureId>,
    State(state): State<AppState>,
) -> Result<Json<Feature>, ApiError> {
    Ok(Json(state.orchestrator.store().get_feature(id).await?))
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub ids: Vec<FeatureId>,
}

/// `POST /api/features` with a JSON array of new features.
pub async fn create_features(
    State(state): State<AppState>,
    Json(features): Json<Vec<NewFeature>>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    if features.is_empty() {
        return Err(ApiError::BadRequest("no features given".to_string()));
    }
    if let Some(bad) = features.iter().position(|f| f.name.trim().is_empty()) {
        return Err(ApiError::BadRequest(format!("feature {bad} has no name")));
    }

    let orchestrator = &state.orchestrator;
    let ids = orchestrator.store().create_features(&features).await?;
    info!(count = ids.len(), "Features created");

    let stats = orchestrator.store().feature_stats().await?;
    orchestrator
        .hub()
        .publish(ObserverEvent::Progress(Progress::from(stats)));
    orchestrator.wake();
    Ok((StatusCode::CREATED, Json(Created { ids })))
}

#[derive(Debug, Deserialize)]
pub struct TestRunQuery {
    pub feature_id: Option<FeatureId>,
    pub limit: Option<i64>,
}

/// `GET /api/test-runs`
pub async fn list_test_runs(
    State(state): State<AppState>,
    Query(query): Query<TestRunQuery>,
) -> Result<Json<Vec<TestRun>>, ApiError> {
    let runs = state
        .orchestrator
        .store()
        .list_test_runs(
            query.feature_id,
            query.limit.unwrap_or(DEFAULT_TEST_RUN_LIMIT),
        )
        .await?;
    Ok(Json(runs))
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub action: ControlAction,
    pub status: RunStatus,
}

/// `POST /api/control/{action}`
pub async fn control(
    Path(action): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ControlResponse>, ApiError> {
    let action = action
        .parse::<ControlAction>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let status = state.orchestrator.apply(action).await;
    Ok(Json(ControlResponse { action, status }))
}
