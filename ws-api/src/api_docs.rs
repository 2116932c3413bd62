use utoipa::OpenApi;
use ws_orchestrator::catalog::{ActionCategory, Backoff};
use ws_orchestrator::units::UnitState;
use ws_orchestrator::{
    CreateWorkspaceRequest, ExecutionStatus, NoOpReason, OperationResult, Outcome, ResolvedStep,
    ResolvedTemplate, StatusReport, Workspace, WorkspaceActionExecution, WorkspaceFilters,
    WorkspaceStatus,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::workspaces::list_workspaces,
        crate::routes::workspaces::create_workspace,
        crate::routes::workspaces::get_workspace,
        crate::routes::workspaces::delete_workspace,
        crate::routes::workspaces::workspace_status,
        crate::routes::workspaces::start_workspace,
        crate::routes::workspaces::stop_workspace,
        crate::routes::workspaces::restart_workspace,
        crate::routes::workspaces::list_executions,
        crate::routes::templates::list_templates,
    ),
    components(
        schemas(
            Workspace,
            WorkspaceStatus,
            CreateWorkspaceRequest,
            WorkspaceFilters,
            OperationResult,
            Outcome,
            NoOpReason,
            StatusReport,
            UnitState,
            WorkspaceActionExecution,
            ExecutionStatus,
            ResolvedTemplate,
            ResolvedStep,
            ActionCategory,
            Backoff
        )
    ),
    tags(
        (name = "ws-api", description = "Workspace provisioning and lifecycle API")
    )
)]
pub struct ApiDoc;
