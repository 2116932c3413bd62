//! Workspace state machine: provisioning, start/stop/restart, deletion and
//! drift correction.
//!
//! Every mutating operation holds the workspace's FIFO lock for its whole
//! duration. Port, account and subdomain selection additionally happen
//! under one host-wide lock so two provisions never pick the same values.

use crate::accounts::{account_candidates, running_as_root, subdomain_candidates, HostAccounts, SystemAccounts};
use crate::catalog::{ResolvedTemplate, TemplateCatalog};
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::execution::{ExecutionStore, WorkspaceActionExecution};
use crate::executor::ActionExecutor;
use crate::handlers::{ActionRegistry, BuiltinOptions};
use crate::routes::{RouteEntry, RouteWriter};
use crate::units::{ServiceUnitManager, Supervisor, SystemctlSupervisor, UnitSpec, UnitState};
use crate::workspace::{
    CreateWorkspaceRequest, ResourceAssignment, RunTransition, Workspace, WorkspaceFilters,
    WorkspaceStatus, WorkspaceStore,
};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use ws_core::is_tool_installed;
use ws_ports::PortAllocator;

/// How many numbered account or subdomain variants are tried.
const MAX_NAME_CANDIDATES: usize = 100;
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    AlreadyRunning,
    AlreadyStopped,
    AlreadyDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    NoOp { reason: NoOpReason },
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OperationResult {
    pub workspace: Workspace,
    pub outcome: Outcome,
}

impl OperationResult {
    fn applied(workspace: Workspace) -> Self {
        Self {
            workspace,
            outcome: Outcome::Applied,
        }
    }

    fn no_op(workspace: Workspace, reason: NoOpReason) -> Self {
        Self {
            workspace,
            outcome: Outcome::NoOp { reason },
        }
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self.outcome, Outcome::NoOp { .. })
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusReport {
    pub workspace_id: String,
    pub status: WorkspaceStatus,
    pub is_running: bool,
    pub port: Option<u16>,
    pub subdomain: Option<String>,
    /// Public host name, when a subdomain is assigned.
    pub domain: Option<String>,
    /// What the supervisor reported, when it was asked.
    pub unit_state: Option<UnitState>,
    /// Whether the stored state was corrected by this call.
    pub corrected: bool,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: usize,
    pub errors: usize,
}

/// Pluggable pieces of the engine.
pub struct EngineParts {
    pub catalog: TemplateCatalog,
    pub registry: ActionRegistry,
    pub accounts: Arc<dyn HostAccounts>,
    pub supervisor: Arc<dyn Supervisor>,
}

/// One FIFO async mutex per workspace id. Entries nobody holds or waits
/// for are pruned on the next lookup.
#[derive(Default)]
struct WorkspaceLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WorkspaceLocks {
    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// What a failed provision managed to build before it failed.
#[derive(Default)]
struct Built {
    account: bool,
    unit: Option<String>,
    route: bool,
    is_running: bool,
}

pub struct WorkspaceLifecycle {
    workspaces: WorkspaceStore,
    executions: ExecutionStore,
    catalog: Arc<TemplateCatalog>,
    executor: ActionExecutor,
    ports: Arc<PortAllocator>,
    accounts: Arc<dyn HostAccounts>,
    units: ServiceUnitManager,
    routes: RouteWriter,
    config: EngineConfig,
    locks: WorkspaceLocks,
    host_lock: Mutex<()>,
}

impl WorkspaceLifecycle {
    pub fn new(pool: SqlitePool, config: EngineConfig, parts: EngineParts) -> Result<Self> {
        config.validate()?;
        let executions = ExecutionStore::new(pool.clone());

        Ok(Self {
            workspaces: WorkspaceStore::new(pool),
            executor: ActionExecutor::new(Arc::new(parts.registry), executions.clone()),
            executions,
            catalog: Arc::new(parts.catalog),
            ports: Arc::new(PortAllocator::new(
                config.port_range,
                config.port_registry_path.clone(),
            )),
            accounts: parts.accounts,
            units: ServiceUnitManager::new(parts.supervisor, &config),
            routes: RouteWriter::new(config.routes_file.clone(), config.base_domain.clone()),
            config,
            locks: WorkspaceLocks::default(),
            host_lock: Mutex::new(()),
        })
    }

    /// Production wiring: `systemctl`, `useradd` and the catalog directory.
    /// Templates are recorded in the database.
    pub async fn from_config(pool: SqlitePool, config: EngineConfig) -> Result<Self> {
        for tool in ["systemctl", "useradd", "userdel"] {
            if !is_tool_installed(tool) {
                warn!(tool, "host tool not found in PATH, lifecycle operations will fail");
            }
        }

        let registry = ActionRegistry::with_builtins(BuiltinOptions {
            source_root: Some(config.catalog_dir.clone()),
            run_as_workspace_user: running_as_root(),
        });

        let catalog = if config.catalog_dir.is_dir() {
            TemplateCatalog::load_dir(&config.catalog_dir, &registry)?
        } else {
            warn!(dir = %config.catalog_dir.display(), "catalog directory missing, no templates available");
            TemplateCatalog::default()
        };
        catalog.register(&pool).await?;

        let parts = EngineParts {
            catalog,
            registry,
            accounts: Arc::new(SystemAccounts::new()),
            supervisor: Arc::new(SystemctlSupervisor::new(config.supervisor_timeout())),
        };
        Self::new(pool, config, parts)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn templates(&self) -> &[ResolvedTemplate] {
        self.catalog.templates()
    }

    pub fn routes(&self) -> Result<Vec<RouteEntry>> {
        self.routes.routes()
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.workspaces.get(id).await
    }

    pub async fn list_workspaces(&self, filters: &WorkspaceFilters) -> Result<Vec<Workspace>> {
        self.workspaces.list(filters).await
    }

    pub async fn pending_workspaces(&self) -> Result<Vec<Workspace>> {
        self.workspaces.by_status(&[WorkspaceStatus::Pending]).await
    }

    pub async fn list_executions(&self, id: &str) -> Result<Vec<WorkspaceActionExecution>> {
        self.workspaces.get(id).await?;
        self.executions.list_for_workspace(id).await
    }

    /// Validates the request and stores a `pending` workspace.
    #[instrument(skip(self, req), fields(tenant = %req.tenant, name = %req.name))]
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        validate_request(&req)?;
        let template = match req.template.as_deref() {
            Some(reference) => Some(self.catalog.resolve(reference.trim())?.id.clone()),
            None => None,
        };
        let workspace = self
            .workspaces
            .insert(&req, template.as_deref(), &self.config.host)
            .await?;
        info!(workspace_id = %workspace.id, template = ?template, "workspace created");
        Ok(workspace)
    }

    /// Creates the workspace and provisions it in one call.
    pub async fn provision(&self, req: CreateWorkspaceRequest) -> Result<OperationResult> {
        let workspace = self.create_workspace(req).await?;
        self.provision_workspace(&workspace.id).await
    }

    /// Brings a `pending` workspace (or an `error` one that holds no
    /// resources) to `active`, or `stopped` when its service did not come up.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn provision_workspace(&self, id: &str) -> Result<OperationResult> {
        let _guard = self.locks.lock(id).await;
        let workspace = self.workspaces.get(id).await?;

        match workspace.status {
            WorkspaceStatus::Pending => {}
            WorkspaceStatus::Error if !workspace.has_resources() => {}
            WorkspaceStatus::Error => {
                return Err(OrchestratorError::InvalidState(format!(
                    "workspace {id} still holds resources from a failed provision; delete it instead"
                )))
            }
            other => {
                return Err(OrchestratorError::InvalidState(format!(
                    "workspace {id} is {other} and cannot be provisioned"
                )))
            }
        }

        let template = match workspace.template.as_deref() {
            Some(reference) => match self.catalog.get(reference) {
                Some(template) => Some(template.clone()),
                None => {
                    let err = OrchestratorError::Template(format!(
                        "template {reference} is no longer in the catalog"
                    ));
                    error!(error = %err, "cannot provision workspace");
                    self.workspaces
                        .update_runtime(id, WorkspaceStatus::Error, false, RunTransition::Unchanged, Some(&err.to_string()))
                        .await?;
                    return Err(err);
                }
            },
            None => None,
        };

        let workspace = match self.allocate_resources(&workspace).await {
            Ok(workspace) => workspace,
            Err(err) => {
                error!(error = %err, "resource allocation failed");
                self.workspaces
                    .update_runtime(id, WorkspaceStatus::Error, false, RunTransition::Unchanged, Some(&err.to_string()))
                    .await?;
                return Err(err);
            }
        };
        let mut built = Built::default();
        match self.build(&workspace, template.as_ref(), &mut built).await {
            Ok(status) => {
                let updated = self.workspaces.get(id).await?;
                info!(%status, is_running = updated.is_running, port = ?updated.port, "workspace provisioned");
                Ok(OperationResult::applied(updated))
            }
            Err(err) => {
                error!(error = %err, "provisioning failed, tearing down");
                self.tear_down(&workspace, built, &err).await;
                Err(err)
            }
        }
    }

    /// Picks port, account, home and subdomain and persists `provisioning`.
    async fn allocate_resources(&self, workspace: &Workspace) -> Result<Workspace> {
        let _host = self.host_lock.lock().await;
        let host = self.config.host.clone();

        let port = {
            let ports = Arc::clone(&self.ports);
            let holder = workspace.id.clone();
            let host = host.clone();
            tokio::task::spawn_blocking(move || ports.allocate(&host, &holder)).await??
        };

        let assignment = match self.pick_names(workspace, port).await {
            Ok(assignment) => assignment,
            Err(err) => {
                self.release_port(&host, port).await;
                return Err(err);
            }
        };

        if let Err(err) = self.workspaces.assign_resources(&workspace.id, &assignment).await {
            if matches!(err, OrchestratorError::ResourceConflict(_)) {
                error!(error = %err, "allocator handed out resources a live workspace holds");
            }
            self.release_port(&host, port).await;
            return Err(err);
        }

        info!(
            workspace_id = %workspace.id,
            port,
            os_user = %assignment.os_user,
            subdomain = %assignment.subdomain,
            "resources assigned"
        );
        self.workspaces.get(&workspace.id).await
    }

    async fn pick_names(&self, workspace: &Workspace, port: u16) -> Result<ResourceAssignment> {
        let mut os_user = None;
        for candidate in account_candidates(&self.config.account_prefix, &workspace.tenant, &workspace.name)
            .take(MAX_NAME_CANDIDATES)
        {
            if self.workspaces.os_user_taken(&candidate).await? {
                continue;
            }
            let accounts = Arc::clone(&self.accounts);
            let name = candidate.clone();
            if tokio::task::spawn_blocking(move || accounts.exists(&name)).await?? {
                continue;
            }
            os_user = Some(candidate);
            break;
        }
        let os_user = os_user.ok_or_else(|| {
            OrchestratorError::ResourceConflict(format!(
                "no free account name for {}/{}",
                workspace.tenant, workspace.name
            ))
        })?;

        let mut subdomain = None;
        for candidate in subdomain_candidates(&workspace.tenant, &workspace.name).take(MAX_NAME_CANDIDATES) {
            if !self.workspaces.subdomain_taken(&candidate).await? {
                subdomain = Some(candidate);
                break;
            }
        }
        let subdomain = subdomain.ok_or_else(|| {
            OrchestratorError::ResourceConflict(format!(
                "no free subdomain for {}/{}",
                workspace.tenant, workspace.name
            ))
        })?;

        Ok(ResourceAssignment {
            home_dir: self.config.home_root.join(&os_user).display().to_string(),
            os_user,
            subdomain,
            port,
        })
    }

    async fn build(
        &self,
        workspace: &Workspace,
        template: Option<&ResolvedTemplate>,
        built: &mut Built,
    ) -> Result<WorkspaceStatus> {
        let ctx = ExecutionContext::for_workspace(workspace, &self.config.base_domain)?;

        {
            let accounts = Arc::clone(&self.accounts);
            let name = ctx.os_user.clone();
            let home = ctx.home_dir.clone();
            tokio::task::spawn_blocking(move || accounts.create(&name, &home)).await??;
            built.account = true;
        }

        if let Some(template) = template {
            self.executor.apply(&ctx, template).await?.into_result()?;
        }

        // Recorded up front: create may fail after the unit was enabled and started
        built.unit = Some(self.units.unit_name(&ctx.os_user));
        let unit = self
            .units
            .create(&UnitSpec {
                workspace_id: &ctx.workspace_id,
                os_user: &ctx.os_user,
                home: &ctx.home_dir,
                port: ctx.port,
            })
            .await?;
        let running = unit.state.is_running();
        built.is_running = running;
        self.workspaces
            .update_runtime(
                &workspace.id,
                WorkspaceStatus::Provisioning,
                running,
                RunTransition::between(false, running),
                None,
            )
            .await?;

        self.routes.upsert_route(&workspace.id, &ctx.subdomain, ctx.port)?;
        built.route = true;

        let status = if running {
            WorkspaceStatus::Active
        } else {
            WorkspaceStatus::Stopped
        };
        self.workspaces
            .update_runtime(&workspace.id, status, running, RunTransition::Unchanged, None)
            .await?;
        Ok(status)
    }

    /// Undoes a failed provision. Resources stay assigned when the unit or
    /// account could not be removed so a later delete can finish the job.
    async fn tear_down(&self, workspace: &Workspace, built: Built, cause: &OrchestratorError) {
        let mut clean = true;
        let mut is_running = built.is_running;

        if built.route {
            if let Err(e) = self.routes.remove_route(&workspace.id) {
                warn!(error = %e, "could not remove route");
            }
        }

        if let Some(unit) = &built.unit {
            match self.units.delete(unit).await {
                Ok(()) => is_running = false,
                Err(e) => {
                    warn!(unit = %unit, error = %e, "could not delete unit");
                    clean = false;
                    match self.units.status(unit).await {
                        Ok(state) => is_running = state.is_running(),
                        Err(e) => warn!(unit = %unit, error = %e, "unit state unknown after failed delete"),
                    }
                }
            }
        }

        if built.account {
            if let (Some(os_user), Some(home)) = (&workspace.os_user, &workspace.home_dir) {
                if let Err(e) = self.remove_account(os_user, Path::new(home)).await {
                    warn!(account = %os_user, error = %e, "could not remove account");
                    clean = false;
                }
            }
        }

        if clean {
            if let Some(port) = workspace.port {
                self.release_port(&workspace.host, port).await;
            }
            if let Err(e) = self.workspaces.clear_resources(&workspace.id).await {
                warn!(error = %e, "could not clear resources");
            }
        }

        let message = cause.to_string();
        if let Err(e) = self
            .workspaces
            .update_runtime(
                &workspace.id,
                WorkspaceStatus::Error,
                is_running,
                RunTransition::between(built.is_running, is_running),
                Some(&message),
            )
            .await
        {
            error!(error = %e, "could not record provisioning failure");
        }
    }

    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn start(&self, id: &str) -> Result<OperationResult> {
        let _guard = self.locks.lock(id).await;
        let workspace = self.workspaces.get(id).await?;
        let unit = self.operable_unit(&workspace)?;

        if workspace.is_running {
            return Ok(OperationResult::no_op(workspace, NoOpReason::AlreadyRunning));
        }

        if let Err(err) = self.units.start(&unit).await {
            return Err(self.record_supervisor_failure(&workspace, &unit, err).await);
        }
        self.workspaces
            .update_runtime(id, WorkspaceStatus::Active, true, RunTransition::Started, None)
            .await?;
        info!("workspace started");
        Ok(OperationResult::applied(self.workspaces.get(id).await?))
    }

    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn stop(&self, id: &str) -> Result<OperationResult> {
        let _guard = self.locks.lock(id).await;
        let workspace = self.workspaces.get(id).await?;
        let unit = self.operable_unit(&workspace)?;

        if !workspace.is_running {
            return Ok(OperationResult::no_op(workspace, NoOpReason::AlreadyStopped));
        }

        if let Err(err) = self.units.stop(&unit).await {
            return Err(self.record_supervisor_failure(&workspace, &unit, err).await);
        }
        self.workspaces
            .update_runtime(id, WorkspaceStatus::Stopped, false, RunTransition::Stopped, None)
            .await?;
        info!("workspace stopped");
        Ok(OperationResult::applied(self.workspaces.get(id).await?))
    }

    /// Stops and starts the service whatever its current state. Also the
    /// way out of `error` for a workspace that still holds its resources.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn restart(&self, id: &str) -> Result<OperationResult> {
        let _guard = self.locks.lock(id).await;
        let workspace = self.workspaces.get(id).await?;
        let unit = self.operable_unit(&workspace)?;

        if let Err(err) = self.units.restart(&unit).await {
            return Err(self.record_supervisor_failure(&workspace, &unit, err).await);
        }
        self.workspaces
            .update_runtime(id, WorkspaceStatus::Active, true, RunTransition::Started, None)
            .await?;
        info!("workspace restarted");
        Ok(OperationResult::applied(self.workspaces.get(id).await?))
    }

    /// Removes unit, route, port and account, then marks the workspace
    /// `deleted`. The record keeps its last resource values for audit.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn delete(&self, id: &str) -> Result<OperationResult> {
        let _guard = self.locks.lock(id).await;
        let workspace = self.workspaces.get(id).await?;

        if workspace.is_deleted() {
            return Ok(OperationResult::no_op(workspace, NoOpReason::AlreadyDeleted));
        }

        if let Some(os_user) = &workspace.os_user {
            let unit = self.units.unit_name(os_user);
            if let Err(err) = self.units.delete(&unit).await {
                return Err(self.record_supervisor_failure(&workspace, &unit, err).await);
            }
        }

        // The unit is gone from here on, so any failure is recorded as not running
        if let Err(err) = self.release_route_and_port(&workspace).await {
            error!(error = %err, "delete failed after the unit was removed");
            self.workspaces
                .update_runtime(
                    id,
                    WorkspaceStatus::Error,
                    false,
                    RunTransition::between(workspace.is_running, false),
                    Some(&err.to_string()),
                )
                .await?;
            return Err(err);
        }

        if let (Some(os_user), Some(home)) = (&workspace.os_user, &workspace.home_dir) {
            if let Err(e) = self.remove_account(os_user, Path::new(home)).await {
                warn!(account = %os_user, error = %e, "could not remove account, continuing with delete");
            }
        }

        self.workspaces
            .update_runtime(
                id,
                WorkspaceStatus::Deleted,
                false,
                RunTransition::between(workspace.is_running, false),
                None,
            )
            .await?;
        info!("workspace deleted");
        Ok(OperationResult::applied(self.workspaces.get(id).await?))
    }

    async fn release_route_and_port(&self, workspace: &Workspace) -> Result<()> {
        self.routes.remove_route(&workspace.id)?;
        if let Some(port) = workspace.port {
            let ports = Arc::clone(&self.ports);
            let host = workspace.host.clone();
            tokio::task::spawn_blocking(move || ports.release(&host, port)).await??;
        }
        Ok(())
    }

    /// Reports the workspace's state, correcting it first when the
    /// supervisor disagrees with what is stored.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn get_status(&self, id: &str) -> Result<StatusReport> {
        let _guard = self.locks.lock(id).await;
        let workspace = self.workspaces.get(id).await?;

        let (unit_state, corrected) = match self.supervised_unit(&workspace) {
            Some(unit) => {
                let state = self.units.status(&unit).await?;
                (Some(state), self.correct_drift(&workspace, state).await?)
            }
            None => (None, false),
        };

        let workspace = if corrected {
            self.workspaces.get(id).await?
        } else {
            workspace
        };
        Ok(StatusReport {
            domain: workspace.subdomain.as_ref().map(|s| self.routes.host_for(s)),
            workspace_id: workspace.id,
            status: workspace.status,
            is_running: workspace.is_running,
            port: workspace.port,
            subdomain: workspace.subdomain,
            unit_state,
            corrected,
        })
    }

    /// Runs drift correction over every active or stopped workspace and
    /// re-records their ports in the allocator registry.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let candidates = self
            .workspaces
            .by_status(&[WorkspaceStatus::Active, WorkspaceStatus::Stopped])
            .await?;
        let mut report = ReconcileReport::default();

        for candidate in candidates {
            match self.reconcile_one(&candidate.id).await {
                Ok(Some(corrected)) => {
                    report.checked += 1;
                    if corrected {
                        report.corrected += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(workspace_id = %candidate.id, error = %e, "reconcile failed");
                    report.errors += 1;
                }
            }
        }

        if report.corrected > 0 || report.errors > 0 {
            info!(
                checked = report.checked,
                corrected = report.corrected,
                errors = report.errors,
                "reconciliation finished"
            );
        }
        Ok(report)
    }

    async fn reconcile_one(&self, id: &str) -> Result<Option<bool>> {
        let _guard = self.locks.lock(id).await;
        // Re-read: the state may have changed while waiting for the lock
        let workspace = self.workspaces.get(id).await?;
        let Some(unit) = self.supervised_unit(&workspace) else {
            return Ok(None);
        };

        if let Some(port) = workspace.port {
            let ports = Arc::clone(&self.ports);
            let host = workspace.host.clone();
            let holder = workspace.id.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || ports.reserve(&host, port, &holder)).await? {
                error!(port, error = %e, "port registry disagrees with workspace record");
            }
        }

        let state = self.units.status(&unit).await?;
        self.correct_drift(&workspace, state).await.map(Some)
    }

    async fn correct_drift(&self, workspace: &Workspace, state: UnitState) -> Result<bool> {
        let running = state.is_running();
        let (status, message) = match state {
            UnitState::Active => (WorkspaceStatus::Active, None),
            UnitState::Inactive => (WorkspaceStatus::Stopped, None),
            UnitState::Failed => (WorkspaceStatus::Error, Some("service unit failed")),
        };
        if running == workspace.is_running && status == workspace.status {
            return Ok(false);
        }

        warn!(
            workspace_id = %workspace.id,
            stored_status = %workspace.status,
            stored_running = workspace.is_running,
            %state,
            "workspace state drifted, correcting"
        );
        self.workspaces
            .update_runtime(
                &workspace.id,
                status,
                running,
                RunTransition::between(workspace.is_running, running),
                message,
            )
            .await?;
        Ok(true)
    }

    /// Persists the re-queried state after a supervisor failure and hands
    /// the original error back.
    async fn record_supervisor_failure(
        &self,
        workspace: &Workspace,
        unit: &str,
        err: OrchestratorError,
    ) -> OrchestratorError {
        let running = match self.units.status(unit).await {
            Ok(state) => state.is_running(),
            Err(e) => {
                warn!(unit, error = %e, "could not re-query unit, keeping stored state");
                workspace.is_running
            }
        };
        error!(unit, error = %err, is_running = running, "supervisor operation failed");

        if let Err(e) = self
            .workspaces
            .update_runtime(
                &workspace.id,
                WorkspaceStatus::Error,
                running,
                RunTransition::between(workspace.is_running, running),
                Some(&err.to_string()),
            )
            .await
        {
            error!(error = %e, "could not record supervisor failure");
        }
        err
    }

    /// The unit of a workspace start/stop/restart may act on.
    fn operable_unit(&self, workspace: &Workspace) -> Result<String> {
        let os_user = match workspace.status {
            WorkspaceStatus::Active | WorkspaceStatus::Stopped | WorkspaceStatus::Error => {
                workspace.os_user.as_deref().filter(|_| workspace.has_resources())
            }
            _ => None,
        };
        os_user.map(|user| self.units.unit_name(user)).ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "workspace {} is {} and has no service to control",
                workspace.id, workspace.status
            ))
        })
    }

    fn supervised_unit(&self, workspace: &Workspace) -> Option<String> {
        match workspace.status {
            WorkspaceStatus::Active | WorkspaceStatus::Stopped if workspace.has_resources() => {
                workspace.os_user.as_deref().map(|user| self.units.unit_name(user))
            }
            _ => None,
        }
    }

    async fn remove_account(&self, os_user: &str, home: &Path) -> Result<()> {
        let accounts = Arc::clone(&self.accounts);
        let name = os_user.to_string();
        let home: PathBuf = home.to_path_buf();
        tokio::task::spawn_blocking(move || accounts.remove(&name, &home)).await?
    }

    async fn release_port(&self, host: &str, port: u16) {
        let ports = Arc::clone(&self.ports);
        let host = host.to_string();
        let released = tokio::task::spawn_blocking(move || ports.release(&host, port)).await;
        match released {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(port, error = %e, "could not release port"),
            Err(e) => warn!(port, error = %e, "port release task failed"),
        }
    }
}

fn validate_request(req: &CreateWorkspaceRequest) -> Result<()> {
    for (field, value) in [("tenant", &req.tenant), ("name", &req.name)] {
        let value = value.trim();
        if value.is_empty() {
            return Err(OrchestratorError::InvalidInput(format!("{field} must not be empty")));
        }
        if value.len() > MAX_NAME_LEN {
            return Err(OrchestratorError::InvalidInput(format!(
                "{field} must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(OrchestratorError::InvalidInput(format!(
                "{field} must not contain control characters"
            )));
        }
    }

    if let Some(key) = &req.ssh_public_key {
        if key.trim().lines().count() > 1 {
            return Err(OrchestratorError::InvalidInput(
                "ssh_public_key must be a single line".to_string(),
            ));
        }
    }

    match &req.metadata {
        None | Some(serde_json::Value::Null) | Some(serde_json::Value::Object(_)) => Ok(()),
        Some(_) => Err(OrchestratorError::InvalidInput(
            "metadata must be a JSON object".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHarness;

    #[test]
    fn test_validate_request() {
        let ok = CreateWorkspaceRequest {
            tenant: "acme".into(),
            name: "api".into(),
            ..Default::default()
        };
        assert!(validate_request(&ok).is_ok());

        let blank = CreateWorkspaceRequest {
            name: "  ".into(),
            ..ok.clone()
        };
        assert!(validate_request(&blank).is_err());

        let bad_metadata = CreateWorkspaceRequest {
            metadata: Some(serde_json::json!(["a"])),
            ..ok.clone()
        };
        assert!(validate_request(&bad_metadata).is_err());

        let two_keys = CreateWorkspaceRequest {
            ssh_public_key: Some("ssh-ed25519 A\nssh-ed25519 B".into()),
            ..ok
        };
        assert!(validate_request(&two_keys).is_err());
    }

    #[tokio::test]
    async fn test_workspace_locks_are_pruned() {
        let locks = WorkspaceLocks::default();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
        }
        let _c = locks.lock("c").await;
        let held = locks.locks.lock().unwrap().len();
        assert_eq!(held, 1);
    }

    #[tokio::test]
    async fn test_unknown_template_is_rejected_at_create() {
        let harness = TestHarness::new().await;
        let err = harness
            .lifecycle
            .create_workspace(CreateWorkspaceRequest {
                tenant: "acme".into(),
                name: "api".into(),
                template: Some("missing".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_template_reference_is_pinned_to_version() {
        let harness = TestHarness::new().await;
        let ws = harness
            .lifecycle
            .create_workspace(harness.request("acme", "api"))
            .await
            .unwrap();
        assert_eq!(ws.template.as_deref(), Some("dev@2"));
        assert_eq!(ws.status, WorkspaceStatus::Pending);
    }
}
