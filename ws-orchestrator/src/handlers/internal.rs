//! `internal` actions: named operations implemented inside the engine.
//!
//! The `operation` config key selects the operation; the rest of the
//! config is passed to it.

use super::{ActionHandler, ActionOutcome, StepInput};
use crate::accounts::hand_over;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use ws_core::file_system::{resolve_within, write_atomic_with_mode};

#[async_trait]
pub trait InternalOperation: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome>;

    async fn rollback(
        &self,
        _ctx: &ExecutionContext,
        _step: &StepInput,
        _outcome: &ActionOutcome,
    ) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Default)]
pub struct InternalHandler {
    operations: HashMap<String, Arc<dyn InternalOperation>>,
}

impl InternalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ensure_directories` and `install_ssh_key`.
    pub fn with_builtins() -> Self {
        let mut handler = Self::new();
        handler
            .operations
            .insert("ensure_directories".to_string(), Arc::new(EnsureDirectories));
        handler
            .operations
            .insert("install_ssh_key".to_string(), Arc::new(InstallSshKey));
        handler
    }

    pub fn register_operation(
        &mut self,
        name: impl Into<String>,
        operation: Arc<dyn InternalOperation>,
    ) -> Result<()> {
        let name = name.into();
        if self.operations.contains_key(&name) {
            return Err(OrchestratorError::DuplicateActionKind(format!("internal:{name}")));
        }
        self.operations.insert(name, operation);
        Ok(())
    }

    fn operation(&self, step: &StepInput) -> Result<&Arc<dyn InternalOperation>> {
        let name = step.required_str("operation")?;
        self.operations.get(name).ok_or_else(|| {
            OrchestratorError::action_failed(&step.action_id, format!("unknown internal operation '{name}'"))
        })
    }
}

#[async_trait]
impl ActionHandler for InternalHandler {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome> {
        self.operation(step)?.execute(ctx, step).await
    }

    async fn rollback(
        &self,
        ctx: &ExecutionContext,
        step: &StepInput,
        outcome: &ActionOutcome,
    ) -> Result<bool> {
        self.operation(step)?.rollback(ctx, step, outcome).await
    }

    fn check_config(&self, action_id: &str, config: &Value) -> Result<()> {
        let name = config.get("operation").and_then(Value::as_str).unwrap_or_default();
        if self.operations.contains_key(name) {
            Ok(())
        } else {
            Err(OrchestratorError::Template(format!(
                "action '{action_id}' names unknown internal operation '{name}'"
            )))
        }
    }
}

fn home_path(ctx: &ExecutionContext, step: &StepInput, rel: &str) -> Result<PathBuf> {
    resolve_within(&ctx.home_dir, rel).ok_or_else(|| {
        OrchestratorError::action_failed(&step.action_id, format!("'{rel}' escapes the workspace home"))
    })
}

fn io_failure(step: &StepInput, path: &Path, err: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::action_failed(&step.action_id, format!("{}: {err}", path.display()))
}

/// Creates directories (`directories: [relative paths]`) in the home.
/// Rollback removes the ones this attempt created.
pub struct EnsureDirectories;

#[async_trait]
impl InternalOperation for EnsureDirectories {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome> {
        let requested = step
            .config
            .get("directories")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                OrchestratorError::action_failed(&step.action_id, "missing 'directories' list")
            })?;

        let mut created = Vec::new();
        for entry in requested {
            let rel = entry.as_str().ok_or_else(|| {
                OrchestratorError::action_failed(&step.action_id, "directory entries must be strings")
            })?;
            let path = home_path(ctx, step, rel)?;
            if path.is_dir() {
                continue;
            }

            // Record every missing ancestor so rollback removes exactly what was made
            let mut missing = Vec::new();
            let mut cursor = Some(path.as_path());
            while let Some(dir) = cursor {
                if dir.exists() || dir == ctx.home_dir {
                    break;
                }
                missing.push(dir.to_path_buf());
                cursor = dir.parent();
            }

            std::fs::create_dir_all(&path).map_err(|e| io_failure(step, &path, e))?;
            for dir in missing.iter().rev() {
                hand_over(dir, &ctx.os_user)?;
                created.push(dir.display().to_string());
            }
        }

        debug!(action = %step.action_id, count = created.len(), "directories ensured");
        Ok(ActionOutcome::new(
            format!("created {} directories", created.len()),
            json!({ "created": created }),
        ))
    }

    async fn rollback(
        &self,
        _ctx: &ExecutionContext,
        _step: &StepInput,
        outcome: &ActionOutcome,
    ) -> Result<bool> {
        let created = outcome.result["created"].as_array().cloned().unwrap_or_default();
        let mut clean = true;
        for dir in created.iter().rev().filter_map(Value::as_str) {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = dir, error = %e, "could not remove directory during rollback");
                    clean = false;
                }
            }
        }
        Ok(clean)
    }
}

/// Adds the workspace SSH key (or `key` from config) to
/// `~/.ssh/authorized_keys`. Rollback restores the previous file.
pub struct InstallSshKey;

#[async_trait]
impl InternalOperation for InstallSshKey {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome> {
        let key = step
            .str_field("key")
            .filter(|k| !k.trim().is_empty())
            .or(ctx.ssh_key.as_deref())
            .map(str::trim)
            .ok_or_else(|| OrchestratorError::action_failed(&step.action_id, "no SSH key to install"))?;

        let ssh_dir = ctx.home_dir.join(".ssh");
        let keys_path = ssh_dir.join("authorized_keys");

        if !ssh_dir.exists() {
            std::fs::create_dir_all(&ssh_dir).map_err(|e| io_failure(step, &ssh_dir, e))?;
            set_mode(&ssh_dir, 0o700).map_err(|e| io_failure(step, &ssh_dir, e))?;
            hand_over(&ssh_dir, &ctx.os_user)?;
        }

        let previous = match std::fs::read_to_string(&keys_path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_failure(step, &keys_path, e)),
        };

        let existing = previous.as_deref().unwrap_or_default();
        if existing.lines().any(|line| line.trim() == key) {
            return Ok(ActionOutcome::new(
                "key already installed",
                json!({ "path": keys_path, "changed": false }),
            ));
        }

        let mut content = existing.to_string();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(key);
        content.push('\n');

        write_atomic_with_mode(&keys_path, content.as_bytes(), Some(0o600))
            .map_err(|e| io_failure(step, &keys_path, e))?;
        hand_over(&keys_path, &ctx.os_user)?;

        Ok(ActionOutcome::new(
            "key installed",
            json!({ "path": keys_path, "changed": true, "previous": previous }),
        ))
    }

    async fn rollback(
        &self,
        _ctx: &ExecutionContext,
        step: &StepInput,
        outcome: &ActionOutcome,
    ) -> Result<bool> {
        if outcome.result["changed"] != Value::Bool(true) {
            return Ok(true);
        }
        let Some(path) = outcome.result["path"].as_str().map(PathBuf::from) else {
            return Ok(false);
        };

        match outcome.result["previous"].as_str() {
            Some(previous) => write_atomic_with_mode(&path, previous.as_bytes(), Some(0o600))
                .map_err(|e| io_failure(step, &path, e))?,
            None => match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_failure(step, &path, e)),
            },
        }
        Ok(true)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
