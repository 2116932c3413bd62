use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use utoipa::IntoParams;
use ws_orchestrator::{
    CreateWorkspaceRequest, OperationResult, StatusReport, Workspace, WorkspaceActionExecution,
    WorkspaceFilters,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/api/v1/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/v1/workspaces/{id}/status", get(workspace_status))
        .route("/api/v1/workspaces/{id}/start", post(start_workspace))
        .route("/api/v1/workspaces/{id}/stop", post(stop_workspace))
        .route("/api/v1/workspaces/{id}/restart", post(restart_workspace))
        .route("/api/v1/workspaces/{id}/executions", get(list_executions))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CreateParams {
    /// Provision within the request instead of leaving it to the
    /// background provisioner.
    #[serde(default)]
    pub wait: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces",
    tag = "workspaces",
    params(CreateParams),
    request_body = CreateWorkspaceRequest,
    responses(
        (status = 201, description = "Provisioned (wait=true)", body = Workspace),
        (status = 202, description = "Accepted, pending provisioning", body = Workspace),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "No port or name available")
    )
)]
pub async fn create_workspace(
    State(state): State<AppState>,
    Query(params): Query<CreateParams>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    if params.wait {
        let result = state.lifecycle.provision(req).await?;
        return Ok((StatusCode::CREATED, Json(result.workspace)));
    }

    let workspace = state.lifecycle.create_workspace(req).await?;
    info!(workspace_id = %workspace.id, "workspace queued for provisioning");
    Ok((StatusCode::ACCEPTED, Json(workspace)))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces",
    tag = "workspaces",
    params(WorkspaceFilters),
    responses((status = 200, body = [Workspace]))
)]
pub async fn list_workspaces(
    State(state): State<AppState>,
    Query(filters): Query<WorkspaceFilters>,
) -> ApiResult<Json<Vec<Workspace>>> {
    let workspaces = state.lifecycle.list_workspaces(&filters).await?;
    Ok(Json(workspaces))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses((status = 200, body = Workspace), (status = 404, description = "Unknown workspace"))
)]
pub async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    let workspace = state.lifecycle.get_workspace(&id).await?;
    Ok(Json(workspace))
}

#[utoipa::path(
    delete,
    path = "/api/v1/workspaces/{id}",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses((status = 200, body = OperationResult), (status = 404, description = "Unknown workspace"))
)]
pub async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let result = state.lifecycle.delete(&id).await?;
    Ok(Json(result))
}

/// Current state as reported by the supervisor; drift is corrected first.
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/status",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses((status = 200, body = StatusReport), (status = 404, description = "Unknown workspace"))
)]
pub async fn workspace_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    let report = state.lifecycle.get_status(&id).await?;
    Ok(Json(report))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/start",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, body = OperationResult),
        (status = 409, description = "Workspace cannot be started in its current state"),
        (status = 503, description = "Supervisor failure")
    )
)]
pub async fn start_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let result = state.lifecycle.start(&id).await?;
    Ok(Json(result))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/stop",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, body = OperationResult),
        (status = 409, description = "Workspace cannot be stopped in its current state"),
        (status = 503, description = "Supervisor failure")
    )
)]
pub async fn stop_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let result = state.lifecycle.stop(&id).await?;
    Ok(Json(result))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/restart",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, body = OperationResult),
        (status = 409, description = "Workspace cannot be restarted in its current state"),
        (status = 503, description = "Supervisor failure")
    )
)]
pub async fn restart_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OperationResult>> {
    let result = state.lifecycle.restart(&id).await?;
    Ok(Json(result))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/executions",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses((status = 200, body = [WorkspaceActionExecution]), (status = 404, description = "Unknown workspace"))
)]
pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WorkspaceActionExecution>>> {
    let executions = state.lifecycle.list_executions(&id).await?;
    Ok(Json(executions))
}
