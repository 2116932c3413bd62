//! Deployment configuration for the engine.
//!
//! Loaded from the YAML file named by `WS_ENGINE_CONFIG` when set, otherwise
//! built from defaults; individual `WS_*` variables override either source.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use ws_ports::PortRange;

pub const CONFIG_PATH_VAR: &str = "WS_ENGINE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Host identifier ports are allocated against.
    pub host: String,
    pub port_range: PortRange,
    pub base_domain: String,
    pub port_registry_path: PathBuf,
    /// Reverse-proxy dynamic configuration file.
    pub routes_file: PathBuf,
    pub unit_dir: PathBuf,
    pub unit_prefix: String,
    pub home_root: PathBuf,
    pub account_prefix: String,
    pub catalog_dir: PathBuf,
    /// Tera template for the service command. Receives `port`, `home`,
    /// `os_user` and `workspace_id`.
    pub workspace_command: String,
    pub restart_sec: u64,
    pub supervisor_timeout_secs: u64,
    /// Start the unit as part of provisioning.
    pub auto_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "local".to_string(),
            port_range: PortRange {
                start: 20000,
                end: 20999,
            },
            base_domain: "workspaces.localhost".to_string(),
            port_registry_path: PathBuf::from("/var/lib/ws-engine/ports.json"),
            routes_file: PathBuf::from("/etc/traefik/dynamic/workspaces.yml"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            unit_prefix: "ws-".to_string(),
            home_root: PathBuf::from("/home"),
            account_prefix: "ws_".to_string(),
            catalog_dir: PathBuf::from("/etc/ws-engine/catalog"),
            workspace_command:
                "/usr/bin/code-server --bind-addr 127.0.0.1:{{ port }} --auth none {{ home }}"
                    .to_string(),
            restart_sec: 5,
            supervisor_timeout_secs: 30,
            auto_start: true,
        }
    }
}

impl EngineConfig {
    /// Reads a YAML document. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml_ng::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_PATH_VAR) {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("WS_HOST") {
            self.host = value;
        }
        if let Some(value) = lookup("WS_PORT_RANGE") {
            self.port_range = value
                .parse()
                .map_err(|e| OrchestratorError::InvalidInput(format!("WS_PORT_RANGE: {e}")))?;
        }
        if let Some(value) = lookup("WS_BASE_DOMAIN") {
            self.base_domain = value;
        }
        if let Some(value) = lookup("WS_PORT_REGISTRY") {
            self.port_registry_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("WS_ROUTES_FILE") {
            self.routes_file = PathBuf::from(value);
        }
        if let Some(value) = lookup("WS_UNIT_DIR") {
            self.unit_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("WS_UNIT_PREFIX") {
            self.unit_prefix = value;
        }
        if let Some(value) = lookup("WS_HOME_ROOT") {
            self.home_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("WS_ACCOUNT_PREFIX") {
            self.account_prefix = value;
        }
        if let Some(value) = lookup("WS_CATALOG_DIR") {
            self.catalog_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("WS_WORKSPACE_COMMAND") {
            self.workspace_command = value;
        }
        if let Some(value) = lookup("WS_RESTART_SEC") {
            self.restart_sec = parse_number("WS_RESTART_SEC", &value)?;
        }
        if let Some(value) = lookup("WS_SUPERVISOR_TIMEOUT") {
            self.supervisor_timeout_secs = parse_number("WS_SUPERVISOR_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("WS_AUTO_START") {
            self.auto_start = matches!(value.as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "host must not be empty".to_string(),
            ));
        }
        if self.base_domain.trim().is_empty() || self.base_domain.starts_with('.') {
            return Err(OrchestratorError::InvalidInput(format!(
                "invalid base_domain '{}'",
                self.base_domain
            )));
        }
        if self.supervisor_timeout_secs == 0 {
            return Err(OrchestratorError::InvalidInput(
                "supervisor_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn supervisor_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor_timeout_secs)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::InvalidInput(format!("{key} must be a number, got '{value}'")))
}
