//! systemd units that keep each workspace's service running.

use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tera::Tera;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;
use ws_core::command_stream::CommandOptions;
use ws_core::{run_captured, run_checked, write_atomic};

const UNIT_TEMPLATE: &str = r#"[Unit]
Description=Workspace {{ workspace_id }} ({{ os_user }})
After=network.target

[Service]
Type=simple
User={{ os_user }}
Group={{ os_user }}
WorkingDirectory={{ home }}
Environment=WORKSPACE_ID={{ workspace_id }}
Environment=WORKSPACE_PORT={{ port }}
ExecStart={{ command }}
Restart=always
RestartSec={{ restart_sec }}

[Install]
WantedBy=multi-user.target
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Active,
    Inactive,
    Failed,
}

impl UnitState {
    pub fn is_running(self) -> bool {
        self == UnitState::Active
    }

    fn as_str(self) -> &'static str {
        match self {
            UnitState::Active => "active",
            UnitState::Inactive => "inactive",
            UnitState::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The process supervisor. Calls block; the manager runs them on the
/// blocking pool.
pub trait Supervisor: Send + Sync {
    fn reload(&self) -> Result<()>;
    fn enable(&self, unit: &str, start_now: bool) -> Result<()>;
    fn disable(&self, unit: &str) -> Result<()>;
    fn start(&self, unit: &str) -> Result<()>;
    fn stop(&self, unit: &str) -> Result<()>;
    fn active_state(&self, unit: &str) -> Result<UnitState>;
}

pub struct SystemctlSupervisor {
    timeout: Duration,
}

impl SystemctlSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn systemctl(&self, args: &[&str]) -> Result<ws_core::CommandOutput> {
        run_captured("systemctl", args, &CommandOptions::with_timeout(self.timeout))
            .map_err(|e| OrchestratorError::Supervisor(format!("systemctl {}: {e}", args.join(" "))))
    }

    fn checked(&self, args: &[&str]) -> Result<()> {
        run_checked("systemctl", args, &CommandOptions::with_timeout(self.timeout))
            .map(|_| ())
            .map_err(|e| OrchestratorError::Supervisor(format!("systemctl {}: {e}", args.join(" "))))
    }
}

impl Supervisor for SystemctlSupervisor {
    fn reload(&self) -> Result<()> {
        self.checked(&["daemon-reload"])
    }

    fn enable(&self, unit: &str, start_now: bool) -> Result<()> {
        if start_now {
            self.checked(&["enable", "--now", unit])
        } else {
            self.checked(&["enable", unit])
        }
    }

    fn disable(&self, unit: &str) -> Result<()> {
        self.checked(&["disable", unit])
    }

    fn start(&self, unit: &str) -> Result<()> {
        self.checked(&["start", unit])
    }

    fn stop(&self, unit: &str) -> Result<()> {
        self.checked(&["stop", unit])
    }

    fn active_state(&self, unit: &str) -> Result<UnitState> {
        // is-active exits non-zero for anything but active; the word matters
        let output = self.systemctl(&["is-active", unit])?;
        Ok(parse_active_state(&output.output))
    }
}

fn parse_active_state(output: &str) -> UnitState {
    match output.lines().last().map(str::trim) {
        Some("active") | Some("reloading") => UnitState::Active,
        Some("failed") => UnitState::Failed,
        _ => UnitState::Inactive,
    }
}

/// Result of creating a unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub state: UnitState,
}

/// What a unit needs to know about its workspace.
#[derive(Debug, Clone)]
pub struct UnitSpec<'a> {
    pub workspace_id: &'a str,
    pub os_user: &'a str,
    pub home: &'a Path,
    pub port: u16,
}

pub struct ServiceUnitManager {
    supervisor: Arc<dyn Supervisor>,
    unit_dir: PathBuf,
    prefix: String,
    command: String,
    restart_sec: u64,
    auto_start: bool,
    timeout: Duration,
    poll_interval: Duration,
}

impl ServiceUnitManager {
    pub fn new(supervisor: Arc<dyn Supervisor>, config: &EngineConfig) -> Self {
        Self {
            supervisor,
            unit_dir: config.unit_dir.clone(),
            prefix: config.unit_prefix.clone(),
            command: config.workspace_command.clone(),
            restart_sec: config.restart_sec,
            auto_start: config.auto_start,
            timeout: config.supervisor_timeout(),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn unit_name(&self, os_user: &str) -> String {
        format!("{}{os_user}.service", self.prefix)
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.unit_dir.join(unit)
    }

    pub fn render(&self, spec: &UnitSpec<'_>) -> Result<String> {
        let mut vars = tera::Context::new();
        vars.insert("workspace_id", spec.workspace_id);
        vars.insert("os_user", spec.os_user);
        vars.insert("home", &spec.home.display().to_string());
        vars.insert("port", &spec.port);
        vars.insert("restart_sec", &self.restart_sec);

        let command = Tera::one_off(&self.command, &vars, false)?;
        if command.trim().is_empty() {
            return Err(OrchestratorError::Render("workspace command renders empty".to_string()));
        }
        vars.insert("command", command.trim());
        Ok(Tera::one_off(UNIT_TEMPLATE, &vars, false)?)
    }

    /// Writes, reloads and enables the unit, then reports whatever state
    /// it settled in. A unit that does not come up is not an error here.
    #[instrument(skip(self, spec), fields(workspace_id = %spec.workspace_id))]
    pub async fn create(&self, spec: &UnitSpec<'_>) -> Result<UnitDescriptor> {
        let name = self.unit_name(spec.os_user);
        let path = self.unit_path(&name);
        let contents = self.render(spec)?;

        let write_path = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&write_path, contents.as_bytes()))
            .await?
            .map_err(|e| OrchestratorError::Supervisor(format!("writing unit file: {e}")))?;

        self.blocking(|s| s.reload()).await?;
        let auto_start = self.auto_start;
        let unit = name.clone();
        self.blocking(move |s| s.enable(&unit, auto_start)).await?;

        let state = if auto_start {
            match self.wait_for(&name, UnitState::Active).await {
                Ok(state) => state,
                Err(OrchestratorError::SupervisorTimeout { .. }) => {
                    let state = self.status(&name).await?;
                    warn!(unit = %name, %state, "unit did not come up");
                    state
                }
                Err(e) => return Err(e),
            }
        } else {
            self.status(&name).await?
        };

        info!(unit = %name, %state, "created unit");
        Ok(UnitDescriptor { name, path, state })
    }

    pub async fn start(&self, unit: &str) -> Result<UnitState> {
        let name = unit.to_string();
        self.blocking(move |s| s.start(&name)).await?;
        self.wait_for(unit, UnitState::Active).await
    }

    pub async fn stop(&self, unit: &str) -> Result<UnitState> {
        let name = unit.to_string();
        self.blocking(move |s| s.stop(&name)).await?;
        self.wait_for(unit, UnitState::Inactive).await
    }

    pub async fn restart(&self, unit: &str) -> Result<UnitState> {
        self.stop(unit).await?;
        self.start(unit).await
    }

    pub async fn status(&self, unit: &str) -> Result<UnitState> {
        let name = unit.to_string();
        self.blocking(move |s| s.active_state(&name)).await
    }

    /// Stops, disables and removes the unit. A missing unit file is fine.
    /// When the state cannot be read the unit is stopped regardless.
    #[instrument(skip(self))]
    pub async fn delete(&self, unit: &str) -> Result<()> {
        match self.status(unit).await {
            Ok(state) if state.is_running() => {
                self.stop(unit).await?;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(unit, error = %e, "unit state unknown, stopping it anyway");
                let name = unit.to_string();
                self.blocking(move |s| s.stop(&name)).await?;
            }
        }

        let name = unit.to_string();
        let path = self.unit_path(unit);
        let exists = path.exists();
        if exists {
            self.blocking(move |s| s.disable(&name)).await?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(OrchestratorError::Supervisor(format!(
                        "removing {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        self.blocking(|s| s.reload()).await?;
        info!(unit, existed = exists, "deleted unit");
        Ok(())
    }

    async fn wait_for(&self, unit: &str, expected: UnitState) -> Result<UnitState> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let state = self.status(unit).await?;
            // Stopping counts as done once the unit is no longer running
            let reached = match expected {
                UnitState::Inactive => !state.is_running(),
                other => state == other,
            };
            if reached {
                debug!(unit, %state, "unit reached expected state");
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::SupervisorTimeout {
                    unit: unit.to_string(),
                    expected: expected.to_string(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Supervisor) -> Result<T> + Send + 'static,
    {
        let supervisor = Arc::clone(&self.supervisor);
        tokio::task::spawn_blocking(move || f(supervisor.as_ref())).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, FakeSupervisor};

    fn manager(dir: &Path, supervisor: Arc<FakeSupervisor>) -> ServiceUnitManager {
        let config = test_config(dir);
        std::fs::create_dir_all(&config.unit_dir).unwrap();
        ServiceUnitManager::new(supervisor, &config).with_poll_interval(Duration::from_millis(5))
    }

    fn spec(home: &Path) -> UnitSpec<'_> {
        UnitSpec {
            workspace_id: "ws-1",
            os_user: "ws_acme_api",
            home,
            port: 20003,
        }
    }

    #[test]
    fn test_parse_active_state() {
        assert_eq!(parse_active_state("active\n"), UnitState::Active);
        assert_eq!(parse_active_state("failed"), UnitState::Failed);
        assert_eq!(parse_active_state("inactive"), UnitState::Inactive);
        assert_eq!(parse_active_state(""), UnitState::Inactive);
    }

    #[test]
    fn test_render_unit() {
        let dir = tempfile::tempdir().unwrap();
        let units = manager(dir.path(), Arc::new(FakeSupervisor::default()));
        let home = PathBuf::from("/home/ws_acme_api");

        let unit = units.render(&spec(&home)).unwrap();
        assert!(unit.contains("User=ws_acme_api"));
        assert!(unit.contains("WorkingDirectory=/home/ws_acme_api"));
        assert!(unit.contains("127.0.0.1:20003"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("RestartSec=1"));
        assert_eq!(units.unit_name("ws_acme_api"), "ws-ws_acme_api.service");
    }

    #[tokio::test]
    async fn test_create_reports_running_unit() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FakeSupervisor::default());
        let units = manager(dir.path(), Arc::clone(&supervisor));
        let home = dir.path().join("home");

        let unit = units.create(&spec(&home)).await.unwrap();
        assert_eq!(unit.state, UnitState::Active);
        assert!(unit.path.exists());
        assert!(supervisor.is_enabled(&unit.name));
    }

    #[tokio::test]
    async fn test_create_reports_unit_that_did_not_start() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FakeSupervisor::default());
        supervisor.refuse_start(true);
        let units = manager(dir.path(), Arc::clone(&supervisor));
        let home = dir.path().join("home");

        let unit = units.create(&spec(&home)).await.unwrap();
        assert!(!unit.state.is_running());
    }

    #[tokio::test]
    async fn test_start_times_out_when_unit_stays_down() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FakeSupervisor::default());
        let units = manager(dir.path(), Arc::clone(&supervisor));
        let home = dir.path().join("home");
        let unit = units.create(&spec(&home)).await.unwrap();

        assert_eq!(units.stop(&unit.name).await.unwrap(), UnitState::Inactive);
        supervisor.refuse_start(true);
        assert!(matches!(
            units.start(&unit.name).await,
            Err(OrchestratorError::SupervisorTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_unit() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FakeSupervisor::default());
        let units = manager(dir.path(), Arc::clone(&supervisor));
        let home = dir.path().join("home");
        let unit = units.create(&spec(&home)).await.unwrap();

        units.delete(&unit.name).await.unwrap();
        assert!(!unit.path.exists());
        assert!(!supervisor.is_enabled(&unit.name));
        assert_eq!(units.status(&unit.name).await.unwrap(), UnitState::Inactive);

        // Deleting again is harmless
        units.delete(&unit.name).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_stops_unit_whose_state_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(FakeSupervisor::default());
        let units = manager(dir.path(), Arc::clone(&supervisor));
        let home = dir.path().join("home");
        let unit = units.create(&spec(&home)).await.unwrap();

        supervisor.fail("status");
        units.delete(&unit.name).await.unwrap();
        supervisor.clear_failures();

        assert!(supervisor.calls().contains(&format!("stop {}", unit.name)));
        assert_eq!(supervisor.state_of(&unit.name), UnitState::Inactive);
        assert!(!supervisor.is_enabled(&unit.name));
        assert!(!unit.path.exists());
    }
}
