use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use services::services::environment::{
    EnvironmentOutcome, EnvironmentService, EnvironmentView, LogsResult,
};
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError};

/// GET /api/worktrees/{id}/environment - persisted snapshot plus live tracking state
pub async fn get_environment(
    State(deployment): State<DeploymentImpl>,
    Path(worktree_id): Path<Uuid>,
) -> Result<Json<ApiResponse<EnvironmentView>>, ApiError> {
    let view = deployment.environment().get_environment(worktree_id).await?;
    Ok(Json(ApiResponse::success(view)))
}

pub async fn start_environment(
    State(deployment): State<DeploymentImpl>,
    Path(worktree_id): Path<Uuid>,
) -> Result<Json<ApiResponse<EnvironmentOutcome>>, ApiError> {
    let outcome = deployment.environment().start(worktree_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn stop_environment(
    State(deployment): State<DeploymentImpl>,
    Path(worktree_id): Path<Uuid>,
) -> Result<Json<ApiResponse<EnvironmentOutcome>>, ApiError> {
    let outcome = deployment.environment().stop(worktree_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn restart_environment(
    State(deployment): State<DeploymentImpl>,
    Path(worktree_id): Path<Uuid>,
) -> Result<Json<ApiResponse<EnvironmentOutcome>>, ApiError> {
    let outcome = deployment.environment().restart(worktree_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

/// POST /api/worktrees/{id}/environment/nuke - irreversible
pub async fn nuke_environment(
    State(deployment): State<DeploymentImpl>,
    Path(worktree_id): Path<Uuid>,
) -> Result<Json<ApiResponse<EnvironmentOutcome>>, ApiError> {
    tracing::warn!(worktree_id = %worktree_id, "Nuke requested over HTTP");
    let outcome = deployment.environment().nuke(worktree_id).await?;
    Ok(Json(ApiResponse::success(outcome)))
}

pub async fn get_environment_logs(
    State(deployment): State<DeploymentImpl>,
    Path(worktree_id): Path<Uuid>,
) -> Result<Json<ApiResponse<LogsResult>>, ApiError> {
    let logs = deployment.environment().logs(worktree_id).await?;
    Ok(Json(ApiResponse::success(logs)))
}

pub fn router() -> Router<DeploymentImpl> {
    let inner = Router::new()
        .route("/", get(get_environment))
        .route("/start", post(start_environment))
        .route("/stop", post(stop_environment))
        .route("/restart", post(restart_environment))
        .route("/nuke", post(nuke_environment))
        .route("/logs", get(get_environment_logs));

    Router::new().nest("/worktrees/{worktree_id}/environment", inner)
}
