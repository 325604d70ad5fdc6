// REST API for submitting builds and reading their status

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::db::BuildStore;
use crate::model::BuildJob;
use crate::orchestrator::{BuildState, Orchestrator};
use crate::types::BuildId;

pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: BuildStore,
    /// Parent of every build's cancellation token.
    pub shutdown: CancellationToken,
    pub claims: Arc<BuildClaims>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<Orchestrator>, store: BuildStore, shutdown: CancellationToken) -> Self {
        Self {
            orchestrator,
            store,
            shutdown,
            claims: Arc::new(BuildClaims::default()),
        }
    }
}

/// Build ids with a run in flight in this process. Claiming is the only way
/// to start a run, so one build id never has two runs at once.
#[derive(Debug, Default)]
pub struct BuildClaims {
    active: Mutex<HashSet<BuildId>>,
}

impl BuildClaims {
    /// `None` if the build id is already claimed.
    pub fn claim(self: &Arc<Self>, build_id: &BuildId) -> Option<BuildClaim> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(build_id.clone()) {
            return None;
        }
        Some(BuildClaim {
            claims: self.clone(),
            build_id: build_id.clone(),
        })
    }

    pub fn is_claimed(&self, build_id: &BuildId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(build_id)
    }
}

/// Releases its build id when dropped.
#[derive(Debug)]
pub struct BuildClaim {
    claims: Arc<BuildClaims>,
    build_id: BuildId,
}

impl Drop for BuildClaim {
    fn drop(&mut self) {
        self.claims
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.build_id);
    }
}

pub type AppState = Arc<ApiState>;

type ApiError = (StatusCode, Json<Value>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/builds", post(submit_build))
        .route("/builds/{id}", get(get_build))
        .route("/builds/{id}/tasks", get(list_tasks))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn already_running(build_id: &BuildId) -> ApiError {
    api_error(StatusCode::CONFLICT, format!("build {} is already running", build_id))
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Accept a build and run it in the background. Progress goes to the
/// request's webhook; status is readable through `GET /builds/{id}`.
async fn submit_build(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = BuildJob::from_value(payload).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let claim = state.claims.claim(&job.build_id).ok_or_else(|| already_running(&job.build_id))?;

    let existing = state.store.get_build(&job.build_id).await.map_err(|e| {
        error!(build_id = %job.build_id, error = %e, "Failed to look up build");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "build store unavailable")
    })?;
    if let Some(record) = existing {
        let terminal = [BuildState::Completed.as_str(), BuildState::Failed.as_str()];
        if !terminal.contains(&record.state.as_str()) {
            return Err(already_running(&job.build_id));
        }
    }

    state.orchestrator.register(&job).await;

    let build_id = job.build_id.clone();
    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        let _claim = claim;
        let result = orchestrator.run_registered(job, cancel).await;
        if !result.success() {
            warn!(build_id = %result.build_id(), "Build finished without success");
        }
    });

    info!(build_id = %build_id, "Build accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "buildId": build_id,
            "status": "accepted",
        })),
    ))
}

async fn get_build(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let build = state
        .store
        .get_build(&BuildId::new(id))
        .await
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(json!({
        "buildId": build.build_id,
        "state": build.state,
        "config": build.config,
        "credentialsFingerprint": build.credentials_fingerprint,
        "startedAt": build.started_at,
        "updatedAt": build.updated_at,
        "result": build.outcome,
    })))
}

async fn list_tasks(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let build_id = BuildId::new(id);
    if state
        .store
        .get_build(&build_id)
        .await
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let tasks = state
        .store
        .list_task_results(&build_id)
        .await
        .map_err(|_e| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(json!({
        "tasks": tasks,
        "count": tasks.len(),
    })))
}
