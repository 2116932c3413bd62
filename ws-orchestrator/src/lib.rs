//! Workspace provisioning and lifecycle engine
//!
//! Turns a provisioning request into a running, reachable workspace: a port,
//! an OS account and home, a supervised service unit and a reverse-proxy
//! route, with template actions applied in between. Consumed by the ws-api
//! HTTP service; usable from any async entry point.

pub mod accounts;
pub mod catalog;
pub mod condition;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod execution;
pub mod executor;
pub mod handlers;
pub mod lifecycle;
pub mod routes;
pub mod units;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use catalog::{ResolvedStep, ResolvedTemplate, TemplateCatalog};
pub use condition::Condition;
pub use config::EngineConfig;
pub use error::{OrchestratorError, Result};
pub use execution::{ExecutionStatus, WorkspaceActionExecution};
pub use executor::{ActionExecutor, ExecutionSummary};
pub use handlers::{ActionHandler, ActionRegistry};
pub use lifecycle::{
    EngineParts, NoOpReason, OperationResult, Outcome, ReconcileReport, StatusReport,
    WorkspaceLifecycle,
};
pub use workspace::{CreateWorkspaceRequest, Workspace, WorkspaceFilters, WorkspaceStatus};
