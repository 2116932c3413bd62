//! Action handlers and the registry mapping action kinds to them.

mod command;
mod internal;
mod template_file;

pub use command::CommandHandler;
pub use internal::{EnsureDirectories, InstallSshKey, InternalHandler, InternalOperation};
pub use template_file::TemplateFileHandler;

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// What a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub action_id: String,
    /// Merged and rendered configuration.
    pub config: serde_json::Value,
    pub timeout: Duration,
    pub attempt: u32,
}

impl StepInput {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn required_str(&self, key: &str) -> Result<&str> {
        self.str_field(key).ok_or_else(|| {
            OrchestratorError::action_failed(&self.action_id, format!("missing '{key}' in config"))
        })
    }
}

/// Result of a successful `execute`, kept for `validate` and `rollback`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionOutcome {
    pub output: String,
    pub result: serde_json::Value,
}

impl ActionOutcome {
    pub fn new(output: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            output: output.into(),
            result,
        }
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome>;

    /// Checks a finished attempt. Returning false fails the attempt.
    async fn validate(
        &self,
        _ctx: &ExecutionContext,
        _step: &StepInput,
        _outcome: &ActionOutcome,
    ) -> bool {
        true
    }

    /// Undoes a completed attempt. `Ok(false)` means it could not be undone.
    async fn rollback(
        &self,
        _ctx: &ExecutionContext,
        _step: &StepInput,
        _outcome: &ActionOutcome,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Rejects configurations that can never work, at catalog load time.
    fn check_config(&self, _action_id: &str, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Options for the handlers every registry starts with.
#[derive(Debug, Clone, Default)]
pub struct BuiltinOptions {
    /// Directory `template_file` sources are read from.
    pub source_root: Option<PathBuf>,
    /// Run `command` actions as the workspace account (requires root).
    pub run_as_workspace_user: bool,
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `command`, `internal` and `template_file` kinds.
    pub fn with_builtins(options: BuiltinOptions) -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, Arc<dyn ActionHandler>); 3] = [
            (
                "command",
                Arc::new(CommandHandler::new(options.run_as_workspace_user)),
            ),
            ("internal", Arc::new(InternalHandler::with_builtins())),
            (
                "template_file",
                Arc::new(TemplateFileHandler::new(options.source_root)),
            ),
        ];
        for (kind, handler) in builtins {
            registry.handlers.insert(kind.to_string(), handler);
        }
        registry
    }

    /// Registers `handler` for `kind`. An existing registration is never replaced.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Result<()> {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(OrchestratorError::DuplicateActionKind(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn ActionHandler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownActionKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl ActionHandler for Noop {
        async fn execute(&self, _ctx: &ExecutionContext, _step: &StepInput) -> Result<ActionOutcome> {
            Ok(ActionOutcome::default())
        }
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = ActionRegistry::with_builtins(BuiltinOptions::default());
        assert_eq!(registry.kinds(), vec!["command", "internal", "template_file"]);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ActionRegistry::with_builtins(BuiltinOptions::default());
        registry.register("noop", Arc::new(Noop)).unwrap();

        let err = registry.register("noop", Arc::new(Noop)).err().unwrap();
        assert!(matches!(err, OrchestratorError::DuplicateActionKind(kind) if kind == "noop"));
        assert!(matches!(
            registry.register("command", Arc::new(Noop)),
            Err(OrchestratorError::DuplicateActionKind(_))
        ));
    }

    #[test]
    fn test_resolve_unknown_kind() {
        let registry = ActionRegistry::new();
        assert!(matches!(
            registry.resolve("ansible"),
            Err(OrchestratorError::UnknownActionKind(kind)) if kind == "ansible"
        ));
    }
}
