use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use ws_orchestrator::ResolvedTemplate;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/templates", get(list_templates))
}

/// Resolved templates, inheritance flattened into their step lists.
#[utoipa::path(
    get,
    path = "/api/v1/templates",
    tag = "templates",
    responses((status = 200, body = [ResolvedTemplate]))
)]
pub async fn list_templates(State(state): State<AppState>) -> Json<Vec<ResolvedTemplate>> {
    Json(state.lifecycle.templates().to_vec())
}
