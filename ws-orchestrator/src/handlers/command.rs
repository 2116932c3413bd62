//! `command` actions: a shell command run for the workspace.
//!
//! Config keys: `command` (required), `cwd` (relative to the home directory),
//! `env` (map), `expect_output` (substring `validate` looks for) and
//! `rollback_command`.

use super::{ActionHandler, ActionOutcome, StepInput};
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};
use ws_core::command_stream::CommandOptions;
use ws_core::file_system::resolve_within;
use ws_core::{run_captured, CommandOutput, CoreError};

pub struct CommandHandler {
    run_as_workspace_user: bool,
}

impl CommandHandler {
    pub fn new(run_as_workspace_user: bool) -> Self {
        Self {
            run_as_workspace_user,
        }
    }

    fn options(&self, ctx: &ExecutionContext, step: &StepInput, timeout: Duration) -> Result<CommandOptions> {
        let cwd = match step.str_field("cwd") {
            Some(rel) => Some(resolve_within(&ctx.home_dir, rel).ok_or_else(|| {
                OrchestratorError::action_failed(
                    &step.action_id,
                    format!("cwd '{rel}' escapes the workspace home"),
                )
            })?),
            None => ctx.home_dir.is_dir().then(|| ctx.home_dir.clone()),
        };

        let mut env = ctx.command_env();
        if let Some(vars) = step.config.get("env").and_then(|v| v.as_object()) {
            for (key, value) in vars {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.push((key.clone(), value));
            }
        }

        Ok(CommandOptions {
            cwd,
            env,
            timeout: Some(timeout),
        })
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        step: &StepInput,
        script: &str,
    ) -> Result<CommandOutput> {
        let options = self.options(ctx, step, step.timeout)?;
        let (program, args) = if self.run_as_workspace_user {
            (
                "runuser",
                vec![
                    "-u".to_string(),
                    ctx.os_user.clone(),
                    "--".to_string(),
                    "sh".to_string(),
                    "-c".to_string(),
                    script.to_string(),
                ],
            )
        } else {
            ("sh", vec!["-c".to_string(), script.to_string()])
        };

        debug!(action = %step.action_id, attempt = step.attempt, "running command action");
        let action = step.action_id.clone();
        let timeout = step.timeout;
        tokio::task::spawn_blocking(move || run_captured(program, &args[..], &options))
            .await?
            .map_err(|err| match err {
                CoreError::Timeout(_) => OrchestratorError::ActionTimeout { action, timeout },
                other => OrchestratorError::action_failed(&action, other.to_string()),
            })
    }
}

#[async_trait]
impl ActionHandler for CommandHandler {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome> {
        let script = step.required_str("command")?;
        let output = self.run(ctx, step, script).await?;

        if !output.success() {
            return Err(OrchestratorError::action_failed(
                &step.action_id,
                format!("exit code {:?}: {}", output.exit_code, output.tail()),
            ));
        }

        Ok(ActionOutcome::new(
            output.output,
            json!({ "exit_code": output.exit_code }),
        ))
    }

    async fn validate(
        &self,
        _ctx: &ExecutionContext,
        step: &StepInput,
        outcome: &ActionOutcome,
    ) -> bool {
        match step.str_field("expect_output") {
            Some(expected) => outcome.output.contains(expected),
            None => true,
        }
    }

    async fn rollback(
        &self,
        ctx: &ExecutionContext,
        step: &StepInput,
        _outcome: &ActionOutcome,
    ) -> Result<bool> {
        let Some(script) = step.str_field("rollback_command") else {
            return Ok(true);
        };

        let output = self.run(ctx, step, script).await?;
        if !output.success() {
            warn!(
                action = %step.action_id,
                exit_code = ?output.exit_code,
                "rollback command failed: {}",
                output.tail()
            );
        }
        Ok(output.success())
    }

    fn check_config(&self, action_id: &str, config: &serde_json::Value) -> Result<()> {
        match config.get("command").and_then(|v| v.as_str()) {
            Some(command) if !command.trim().is_empty() => Ok(()),
            _ => Err(OrchestratorError::Template(format!(
                "action '{action_id}' of kind 'command' needs a non-empty 'command'"
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::context_in;

    fn step(config: serde_json::Value) -> StepInput {
        StepInput {
            action_id: "run".into(),
            config,
            timeout: Duration::from_secs(10),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_runs_in_home_with_workspace_env() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let handler = CommandHandler::new(false);

        let input = step(json!({
            "command": "pwd; echo \"$WORKSPACE_PORT $GREETING\"",
            "env": { "GREETING": "hello" },
            "expect_output": "hello"
        }));
        let outcome = handler.execute(&ctx, &input).await.unwrap();

        assert!(outcome.output.contains(&ctx.home_dir.display().to_string()));
        assert!(outcome.output.contains(&format!("{} hello", ctx.port)));
        assert_eq!(outcome.result["exit_code"], 0);
        assert!(handler.validate(&ctx, &input, &outcome).await);

        let strict = step(json!({ "command": "true", "expect_output": "never printed" }));
        let outcome = handler.execute(&ctx, &strict).await.unwrap();
        assert!(!handler.validate(&ctx, &strict, &outcome).await);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let handler = CommandHandler::new(false);

        let err = handler
            .execute(&ctx, &step(json!({ "command": "echo broken; exit 3" })))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ActionExecutionFailed { reason, .. } => {
                assert!(reason.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let handler = CommandHandler::new(false);
        let mut input = step(json!({ "command": "exec sleep 5" }));
        input.timeout = Duration::from_millis(200);

        assert!(matches!(
            handler.execute(&ctx, &input).await,
            Err(OrchestratorError::ActionTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let handler = CommandHandler::new(false);

        let input = step(json!({
            "command": "touch marker",
            "rollback_command": "rm marker"
        }));
        let outcome = handler.execute(&ctx, &input).await.unwrap();
        assert!(ctx.home_dir.join("marker").exists());

        assert!(handler.rollback(&ctx, &input, &outcome).await.unwrap());
        assert!(!ctx.home_dir.join("marker").exists());

        let failing = step(json!({ "command": "true", "rollback_command": "exit 1" }));
        assert!(!handler.rollback(&ctx, &failing, &outcome).await.unwrap());
    }

    #[test]
    fn test_check_config() {
        let handler = CommandHandler::new(false);
        assert!(handler.check_config("a", &json!({ "command": "ls" })).is_ok());
        assert!(handler.check_config("a", &json!({ "command": " " })).is_err());
        assert!(handler.check_config("a", &json!({})).is_err());
    }
}
