pub mod health;
pub mod templates;
pub mod workspaces;

use crate::{api_docs::ApiDoc, state::AppState};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub fn create_app(state: AppState) -> Router {
    // Allow CORS for local development (frontend on different port)
    let cors = CorsLayer::permissive();

    Router::new()
        // Also serves the document itself at /api-docs/openapi.json
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(health::routes())
        .merge(workspaces::routes())
        .merge(templates::routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
