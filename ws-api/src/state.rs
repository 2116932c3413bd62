use sqlx::SqlitePool;
use std::sync::Arc;
use ws_orchestrator::WorkspaceLifecycle;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<WorkspaceLifecycle>,
    pub pool: SqlitePool,
}

impl AppState {
    pub fn new(lifecycle: Arc<WorkspaceLifecycle>, pool: SqlitePool) -> Self {
        Self { lifecycle, pool }
    }
}
