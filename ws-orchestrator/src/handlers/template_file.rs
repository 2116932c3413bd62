//! `template_file` actions: render a file into the workspace home.
//!
//! Config keys: `path` (relative to the home), `content` (inline, already
//! rendered with the workspace variables) or `source` (file under the
//! source root, rendered here), and an optional octal `mode`.

use super::{ActionHandler, ActionOutcome, StepInput};
use crate::accounts::hand_over;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use ws_core::file_system::{resolve_within, write_atomic_with_mode};

pub struct TemplateFileHandler {
    source_root: Option<PathBuf>,
}

impl TemplateFileHandler {
    pub fn new(source_root: Option<PathBuf>) -> Self {
        Self { source_root }
    }

    fn content(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<String> {
        if let Some(content) = step.str_field("content") {
            return Ok(content.to_string());
        }

        let source = step.required_str("source")?;
        let root = self.source_root.as_ref().ok_or_else(|| {
            OrchestratorError::action_failed(&step.action_id, "no source directory configured")
        })?;
        let path = resolve_within(root, source).ok_or_else(|| {
            OrchestratorError::action_failed(&step.action_id, format!("source '{source}' escapes the catalog"))
        })?;
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            OrchestratorError::action_failed(&step.action_id, format!("{}: {e}", path.display()))
        })?;
        ctx.render_str(&raw)
    }
}

/// Accepts `"0640"`, `"640"` or a YAML integer written as `640`.
fn parse_mode(value: &Value) -> Option<u32> {
    let digits = match value {
        Value::String(s) => s.trim().trim_start_matches("0o").to_string(),
        Value::Number(n) => n.as_u64()?.to_string(),
        _ => return None,
    };
    u32::from_str_radix(&digits, 8).ok().filter(|mode| *mode <= 0o7777)
}

#[async_trait]
impl ActionHandler for TemplateFileHandler {
    async fn execute(&self, ctx: &ExecutionContext, step: &StepInput) -> Result<ActionOutcome> {
        let rel = step.required_str("path")?;
        let target = resolve_within(&ctx.home_dir, rel).ok_or_else(|| {
            OrchestratorError::action_failed(&step.action_id, format!("'{rel}' escapes the workspace home"))
        })?;
        let mode = match step.config.get("mode") {
            Some(raw) => Some(parse_mode(raw).ok_or_else(|| {
                OrchestratorError::action_failed(&step.action_id, format!("invalid mode {raw}"))
            })?),
            None => None,
        };

        let content = self.content(ctx, step)?;
        let previous = match std::fs::read_to_string(&target) {
            Ok(existing) => Some(existing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(OrchestratorError::action_failed(
                    &step.action_id,
                    format!("{}: {e}", target.display()),
                ))
            }
        };

        write_atomic_with_mode(&target, content.as_bytes(), mode)
            .map_err(|e| OrchestratorError::action_failed(&step.action_id, e.to_string()))?;
        hand_over(&target, &ctx.os_user)?;

        Ok(ActionOutcome::new(
            format!("wrote {} bytes to {}", content.len(), target.display()),
            json!({ "path": target, "previous": previous, "mode": mode }),
        ))
    }

    async fn rollback(
        &self,
        _ctx: &ExecutionContext,
        step: &StepInput,
        outcome: &ActionOutcome,
    ) -> Result<bool> {
        let Some(path) = outcome.result["path"].as_str().map(PathBuf::from) else {
            return Ok(false);
        };

        match outcome.result["previous"].as_str() {
            Some(previous) => {
                let mode = outcome.result["mode"].as_u64().and_then(|m| u32::try_from(m).ok());
                write_atomic_with_mode(&path, previous.as_bytes(), mode)
                    .map_err(|e| OrchestratorError::action_failed(&step.action_id, e.to_string()))?;
            }
            None => match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(OrchestratorError::action_failed(
                        &step.action_id,
                        format!("{}: {e}", path.display()),
                    ))
                }
            },
        }
        Ok(true)
    }

    fn check_config(&self, action_id: &str, config: &Value) -> Result<()> {
        let has_path = config.get("path").and_then(Value::as_str).is_some();
        let has_body = config.get("content").is_some() || config.get("source").is_some();
        let mode_ok = config.get("mode").map_or(true, |m| parse_mode(m).is_some());
        if has_path && has_body && mode_ok {
            Ok(())
        } else {
            Err(OrchestratorError::Template(format!(
                "action '{action_id}' of kind 'template_file' needs 'path', 'content' or 'source', and a valid octal 'mode'"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::context_in;
    use std::time::Duration;

    fn step(config: Value) -> StepInput {
        StepInput {
            action_id: "write_env".into(),
            config,
            timeout: Duration::from_secs(5),
            attempt: 1,
        }
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(&json!("0640")), Some(0o640));
        assert_eq!(parse_mode(&json!("600")), Some(0o600));
        assert_eq!(parse_mode(&json!(755)), Some(0o755));
        assert_eq!(parse_mode(&json!("0o700")), Some(0o700));
        assert_eq!(parse_mode(&json!("999")), None);
        assert_eq!(parse_mode(&json!(true)), None);
    }

    #[tokio::test]
    async fn test_writes_and_restores_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let target = ctx.home_dir.join(".env");
        std::fs::write(&target, "OLD=1\n").unwrap();
        let handler = TemplateFileHandler::new(None);

        let input = step(json!({ "path": ".env", "content": "PORT=20001\n", "mode": "0600" }));
        let outcome = handler.execute(&ctx, &input).await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "PORT=20001\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(handler.rollback(&ctx, &input, &outcome).await.unwrap());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "OLD=1\n");
    }

    #[tokio::test]
    async fn test_source_is_rendered_and_rollback_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let sources = dir.path().join("catalog");
        std::fs::create_dir_all(sources.join("files")).unwrap();
        std::fs::write(sources.join("files/motd.tera"), "Welcome {{ os_user }}\n").unwrap();
        let handler = TemplateFileHandler::new(Some(sources));

        let input = step(json!({ "path": "etc/motd", "source": "files/motd.tera" }));
        let outcome = handler.execute(&ctx, &input).await.unwrap();
        let target = ctx.home_dir.join("etc/motd");
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            format!("Welcome {}\n", ctx.os_user)
        );

        assert!(handler.rollback(&ctx, &input, &outcome).await.unwrap());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_home() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_in(dir.path());
        let handler = TemplateFileHandler::new(None);

        let input = step(json!({ "path": "/etc/passwd", "content": "x" }));
        assert!(handler.execute(&ctx, &input).await.is_err());
    }

    #[test]
    fn test_check_config() {
        let handler = TemplateFileHandler::new(None);
        assert!(handler.check_config("a", &json!({ "path": "f", "content": "" })).is_ok());
        assert!(handler.check_config("a", &json!({ "content": "x" })).is_err());
        assert!(handler
            .check_config("a", &json!({ "path": "f", "content": "x", "mode": "abc" }))
            .is_err());
    }
}
