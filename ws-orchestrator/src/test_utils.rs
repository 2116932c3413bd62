//! In-memory database, fake host services and fixtures for tests.

use crate::accounts::HostAccounts;
use crate::catalog::TemplateCatalog;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::handlers::{ActionHandler, ActionOutcome, ActionRegistry, BuiltinOptions, StepInput};
use crate::lifecycle::{EngineParts, WorkspaceLifecycle};
use crate::units::{Supervisor, UnitState};
use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceStore};
use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use ws_ports::{PortAllocator, PortRange};

pub const TEST_SSH_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAATEST test@example";

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // One connection: every connection to sqlite::memory: is its own database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub async fn insert_workspace(pool: &SqlitePool, tenant: &str, name: &str) -> Workspace {
    let req = CreateWorkspaceRequest {
        tenant: tenant.to_string(),
        name: name.to_string(),
        ..Default::default()
    };
    WorkspaceStore::new(pool.clone())
        .insert(&req, None, "local")
        .await
        .expect("Failed to insert workspace")
}

/// A context whose home is `dir/home/ws_test`, created on the spot.
pub fn context_in(dir: &Path) -> ExecutionContext {
    let home_dir = dir.join("home").join("ws_test");
    std::fs::create_dir_all(&home_dir).expect("Failed to create test home");
    ExecutionContext {
        workspace_id: "ws-test".to_string(),
        workspace_name: "api".to_string(),
        tenant: "acme".to_string(),
        os_user: "ws_test".to_string(),
        home_dir,
        port: 20001,
        subdomain: "api-acme".to_string(),
        domain: "api-acme.test.localhost".to_string(),
        host: "local".to_string(),
        template: Some("dev@1".to_string()),
        repo_url: Some("https://example.com/acme/api.git".to_string()),
        ssh_key: Some(TEST_SSH_KEY.to_string()),
        metadata: serde_json::Map::new(),
    }
}

/// Engine configuration rooted in a scratch directory, with a ten-port range.
pub fn test_config(root: &Path) -> EngineConfig {
    EngineConfig {
        host: "local".to_string(),
        port_range: PortRange::new(20000, 20009).expect("valid test range"),
        base_domain: "test.localhost".to_string(),
        port_registry_path: root.join("ports.json"),
        routes_file: root.join("routes").join("workspaces.yml"),
        unit_dir: root.join("units"),
        home_root: root.join("home"),
        catalog_dir: root.join("catalog"),
        restart_sec: 1,
        supervisor_timeout_secs: 1,
        ..EngineConfig::default()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct SupervisorState {
    units: HashMap<String, UnitState>,
    enabled: HashSet<String>,
    calls: Vec<String>,
    failing: HashSet<String>,
    refuse_start: bool,
}

/// Supervisor that keeps unit states in memory and records every call.
#[derive(Default)]
pub struct FakeSupervisor {
    state: Mutex<SupervisorState>,
}

impl FakeSupervisor {
    /// Makes every call of `operation` (`start`, `stop`, `enable`, ...) fail.
    pub fn fail(&self, operation: &str) {
        locked(&self.state).failing.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        locked(&self.state).failing.clear();
    }

    /// Units that are started end up `failed` instead of `active`.
    pub fn refuse_start(&self, refuse: bool) {
        locked(&self.state).refuse_start = refuse;
    }

    /// Changes a unit's state behind the engine's back.
    pub fn set_state(&self, unit: &str, state: UnitState) {
        locked(&self.state).units.insert(unit.to_string(), state);
    }

    pub fn state_of(&self, unit: &str) -> UnitState {
        locked(&self.state)
            .units
            .get(unit)
            .copied()
            .unwrap_or(UnitState::Inactive)
    }

    pub fn is_enabled(&self, unit: &str) -> bool {
        locked(&self.state).enabled.contains(unit)
    }

    /// Calls that change state, as `"operation unit"`. Status queries are
    /// not recorded.
    pub fn calls(&self) -> Vec<String> {
        locked(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        locked(&self.state).calls.clear();
    }

    fn record(&self, operation: &str, unit: &str) -> Result<MutexGuard<'_, SupervisorState>> {
        let mut state = locked(&self.state);
        state.calls.push(format!("{operation} {unit}").trim_end().to_string());
        if state.failing.contains(operation) {
            return Err(OrchestratorError::Supervisor(format!(
                "{operation} {unit}: injected failure"
            )));
        }
        Ok(state)
    }

    fn run(state: &mut SupervisorState, unit: &str) {
        let next = if state.refuse_start {
            UnitState::Failed
        } else {
            UnitState::Active
        };
        state.units.insert(unit.to_string(), next);
    }
}

impl Supervisor for FakeSupervisor {
    fn reload(&self) -> Result<()> {
        self.record("reload", "").map(|_| ())
    }

    fn enable(&self, unit: &str, start_now: bool) -> Result<()> {
        let mut state = self.record("enable", unit)?;
        state.enabled.insert(unit.to_string());
        if start_now {
            Self::run(&mut state, unit);
        }
        Ok(())
    }

    fn disable(&self, unit: &str) -> Result<()> {
        let mut state = self.record("disable", unit)?;
        state.enabled.remove(unit);
        Ok(())
    }

    fn start(&self, unit: &str) -> Result<()> {
        let mut state = self.record("start", unit)?;
        Self::run(&mut state, unit);
        Ok(())
    }

    fn stop(&self, unit: &str) -> Result<()> {
        let mut state = self.record("stop", unit)?;
        state.units.insert(unit.to_string(), UnitState::Inactive);
        Ok(())
    }

    fn active_state(&self, unit: &str) -> Result<UnitState> {
        let state = locked(&self.state);
        if state.failing.contains("status") {
            return Err(OrchestratorError::Supervisor(format!(
                "status {unit}: injected failure"
            )));
        }
        Ok(state.units.get(unit).copied().unwrap_or(UnitState::Inactive))
    }
}

#[derive(Default)]
struct AccountsState {
    accounts: HashSet<String>,
    fail_create: bool,
    fail_remove: bool,
}

/// Accounts that only exist in memory. `create` makes the home directory
/// and `remove` deletes it, like `useradd -m` and `userdel -r`.
#[derive(Default)]
pub struct FakeAccounts {
    state: Mutex<AccountsState>,
}

impl FakeAccounts {
    pub fn fail_create(&self, fail: bool) {
        locked(&self.state).fail_create = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        locked(&self.state).fail_remove = fail;
    }

    /// Registers an account the engine did not create.
    pub fn add_existing(&self, name: &str) {
        locked(&self.state).accounts.insert(name.to_string());
    }

    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = locked(&self.state).accounts.iter().cloned().collect();
        accounts.sort();
        accounts
    }
}

impl HostAccounts for FakeAccounts {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(locked(&self.state).accounts.contains(name))
    }

    fn create(&self, name: &str, home: &Path) -> Result<()> {
        let mut state = locked(&self.state);
        if state.fail_create {
            return Err(OrchestratorError::Account(format!("useradd {name}: injected failure")));
        }
        if state.accounts.contains(name) {
            return Err(OrchestratorError::ResourceConflict(format!(
                "host account '{name}' already exists"
            )));
        }
        std::fs::create_dir_all(home)?;
        state.accounts.insert(name.to_string());
        Ok(())
    }

    fn remove(&self, name: &str, home: &Path) -> Result<()> {
        let mut state = locked(&self.state);
        if state.fail_remove {
            return Err(OrchestratorError::Account(format!("userdel {name}: injected failure")));
        }
        state.accounts.remove(name);
        match std::fs::remove_dir_all(home) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
struct Script {
    /// Remaining failures per action; `None` fails forever.
    failures: HashMap<String, Option<u32>>,
    panics: HashSet<String>,
    hangs: HashSet<String>,
    refused_rollbacks: HashSet<String>,
    calls: Vec<String>,
    rollbacks: Vec<String>,
}

enum Behaviour {
    Succeed,
    Fail,
    Panic,
    Hang,
}

/// Handler for the `scripted` kind whose outcome per action id is set by
/// the test.
#[derive(Default)]
pub struct ScriptedHandler {
    script: Mutex<Script>,
}

impl ScriptedHandler {
    pub fn fail_always(&self, action: &str) {
        locked(&self.script).failures.insert(action.to_string(), None);
    }

    /// Fails the first `times` attempts of `action`.
    pub fn fail_times(&self, action: &str, times: u32) {
        locked(&self.script)
            .failures
            .insert(action.to_string(), Some(times));
    }

    pub fn panic_on(&self, action: &str) {
        locked(&self.script).panics.insert(action.to_string());
    }

    /// `execute` never returns for `action`.
    pub fn hang_on(&self, action: &str) {
        locked(&self.script).hangs.insert(action.to_string());
    }

    /// `rollback` of `action` reports that nothing could be undone.
    pub fn refuse_rollback(&self, action: &str) {
        locked(&self.script)
            .refused_rollbacks
            .insert(action.to_string());
    }

    /// Forgets every scripted failure, panic and hang.
    pub fn reset(&self) {
        let mut script = locked(&self.script);
        script.failures.clear();
        script.panics.clear();
        script.hangs.clear();
        script.refused_rollbacks.clear();
    }

    /// Action ids passed to `execute`, in call order.
    pub fn calls(&self) -> Vec<String> {
        locked(&self.script).calls.clone()
    }

    /// Action ids passed to `rollback`, in call order.
    pub fn rollbacks(&self) -> Vec<String> {
        locked(&self.script).rollbacks.clone()
    }
}

#[async_trait]
impl ActionHandler for ScriptedHandler {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome> {
        // Decide under the lock, act after it is released
        let behaviour = {
            let mut script = locked(&self.script);
            script.calls.push(step.action_id.clone());
            if script.panics.contains(&step.action_id) {
                Behaviour::Panic
            } else if script.hangs.contains(&step.action_id) {
                Behaviour::Hang
            } else {
                match script.failures.get_mut(&step.action_id) {
                    Some(None) => Behaviour::Fail,
                    Some(Some(remaining)) if *remaining > 0 => {
                        *remaining -= 1;
                        Behaviour::Fail
                    }
                    _ => Behaviour::Succeed,
                }
            }
        };

        match behaviour {
            Behaviour::Succeed => Ok(ActionOutcome::new(
                format!("{} done", step.action_id),
                json!({ "workspace_id": ctx.workspace_id, "attempt": step.attempt }),
            )),
            Behaviour::Fail => Err(OrchestratorError::action_failed(
                &step.action_id,
                format!("scripted failure on attempt {}", step.attempt),
            )),
            Behaviour::Panic => panic!("scripted panic in {}", step.action_id),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(ActionOutcome::default())
            }
        }
    }

    async fn rollback(
        &self,
        _ctx: &ExecutionContext,
        step: &StepInput,
        _outcome: &ActionOutcome,
    ) -> Result<bool> {
        let mut script = locked(&self.script);
        script.rollbacks.push(step.action_id.clone());
        Ok(!script.refused_rollbacks.contains(&step.action_id))
    }
}

/// Built-in handlers plus `handler` registered as `scripted`.
pub fn scripted_registry(handler: Arc<ScriptedHandler>) -> ActionRegistry {
    let mut registry = ActionRegistry::with_builtins(BuiltinOptions::default());
    registry
        .register("scripted", handler)
        .expect("scripted kind is not a builtin");
    registry
}

/// Catalog used by [`TestHarness::new`]. `dev@2` creates directories,
/// installs the SSH key, runs `install` then `configure` and writes an env
/// file into the home.
pub const HARNESS_CATALOG: &str = r#"
actions:
  - id: workspace_dirs
    kind: internal
    config: { operation: ensure_directories, directories: [projects, .config] }
  - id: ssh_key
    kind: internal
    category: environment
    condition: "has:ssh_key"
    config: { operation: install_ssh_key }
  - id: install
    kind: scripted
    retry_delay_ms: 1
  - id: configure
    kind: scripted
    category: configuration
    retry_delay_ms: 1
    prerequisites: [install]
  - id: env_file
    kind: template_file
    config:
      path: .workspace.env
      content: "PORT={{ port }}\nDOMAIN={{ domain }}\n"
      mode: "0600"
templates:
  - name: base
    version: 1
    steps:
      - { action: workspace_dirs, sequence_order: 10 }
      - { action: ssh_key, sequence_order: 20 }
  - name: dev
    version: 1
    extends: base
    steps:
      - { action: install, sequence_order: 30 }
  - name: dev
    version: 2
    extends: base
    steps:
      - { action: install, sequence_order: 30 }
      - { action: configure, sequence_order: 40 }
      - { action: env_file, sequence_order: 50 }
"#;

/// A lifecycle wired to fakes, a scratch directory and an in-memory database.
pub struct TestHarness {
    pub lifecycle: Arc<WorkspaceLifecycle>,
    pub supervisor: Arc<FakeSupervisor>,
    pub accounts: Arc<FakeAccounts>,
    pub handler: Arc<ScriptedHandler>,
    pub config: EngineConfig,
    pub pool: SqlitePool,
    pub dir: tempfile::TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_catalog(HARNESS_CATALOG).await
    }

    pub async fn with_catalog(yaml: &str) -> Self {
        Self::build(yaml, |_| {}).await
    }

    /// Like [`TestHarness::new`] with a chance to adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::build(HARNESS_CATALOG, adjust).await
    }

    async fn build(yaml: &str, adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = test_config(dir.path());
        adjust(&mut config);
        let pool = create_test_db().await;

        let supervisor = Arc::new(FakeSupervisor::default());
        let accounts = Arc::new(FakeAccounts::default());
        let handler = Arc::new(ScriptedHandler::default());
        let registry = scripted_registry(Arc::clone(&handler));
        let catalog = TemplateCatalog::from_yaml_str(yaml, &registry).expect("Invalid test catalog");
        catalog.register(&pool).await.expect("Failed to register templates");

        let parts = EngineParts {
            catalog,
            registry,
            accounts: accounts.clone(),
            supervisor: supervisor.clone(),
        };
        let lifecycle = WorkspaceLifecycle::new(pool.clone(), config.clone(), parts)
            .expect("Failed to build lifecycle");

        Self {
            lifecycle: Arc::new(lifecycle),
            supervisor,
            accounts,
            handler,
            config,
            pool,
            dir,
        }
    }

    /// A request for the latest `dev` template with an SSH key.
    pub fn request(&self, tenant: &str, name: &str) -> CreateWorkspaceRequest {
        CreateWorkspaceRequest {
            tenant: tenant.to_string(),
            name: name.to_string(),
            template: Some("dev".to_string()),
            ssh_public_key: Some(TEST_SSH_KEY.to_string()),
            ..Default::default()
        }
    }

    /// Ports currently recorded in the allocator registry.
    pub fn allocated_ports(&self) -> Vec<u16> {
        PortAllocator::new(self.config.port_range, &self.config.port_registry_path)
            .allocations(&self.config.host)
            .expect("Failed to read port registry")
            .into_keys()
            .collect()
    }

    pub fn unit_name(&self, workspace: &Workspace) -> String {
        let os_user = workspace.os_user.as_deref().expect("workspace has no account");
        format!("{}{os_user}.service", self.config.unit_prefix)
    }
}
