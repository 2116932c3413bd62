//! Per-run view of a workspace shared by conditions, placeholders and handlers.

use crate::condition::ConditionContext;
use crate::error::{OrchestratorError, Result};
use crate::workspace::Workspace;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tera::Tera;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workspace_id: String,
    pub workspace_name: String,
    pub tenant: String,
    pub os_user: String,
    pub home_dir: PathBuf,
    pub port: u16,
    pub subdomain: String,
    /// Fully qualified host name, `{subdomain}.{base_domain}`.
    pub domain: String,
    pub host: String,
    pub template: Option<String>,
    pub repo_url: Option<String>,
    pub ssh_key: Option<String>,
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    /// Builds the context of a workspace that already holds its resources.
    pub fn for_workspace(workspace: &Workspace, base_domain: &str) -> Result<Self> {
        let missing = |what: &str| {
            OrchestratorError::InvalidState(format!(
                "workspace {} has no {what} assigned",
                workspace.id
            ))
        };

        let os_user = workspace.os_user.clone().ok_or_else(|| missing("OS account"))?;
        let home_dir = workspace.home_dir.clone().ok_or_else(|| missing("home directory"))?;
        let port = workspace.port.ok_or_else(|| missing("port"))?;
        let subdomain = workspace.subdomain.clone().ok_or_else(|| missing("subdomain"))?;

        let metadata = match &workspace.metadata {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        Ok(Self {
            workspace_id: workspace.id.clone(),
            workspace_name: workspace.name.clone(),
            tenant: workspace.tenant.clone(),
            os_user,
            home_dir: PathBuf::from(home_dir),
            port,
            domain: format!("{subdomain}.{base_domain}"),
            subdomain,
            host: workspace.host.clone(),
            template: workspace.template.clone(),
            repo_url: non_blank(workspace.repo_url.as_deref()),
            ssh_key: non_blank(workspace.ssh_public_key.as_deref()),
            metadata,
        })
    }

    /// Placeholder variables available to config values and rendered files.
    pub fn variables(&self) -> tera::Context {
        let mut vars = tera::Context::new();
        vars.insert("workspace_id", &self.workspace_id);
        vars.insert("workspace_name", &self.workspace_name);
        vars.insert("tenant", &self.tenant);
        vars.insert("os_user", &self.os_user);
        vars.insert("home", &self.home_dir.display().to_string());
        vars.insert("port", &self.port);
        vars.insert("subdomain", &self.subdomain);
        vars.insert("domain", &self.domain);
        vars.insert("host", &self.host);
        vars.insert("repo_url", &self.repo_url.clone().unwrap_or_default());
        vars.insert("ssh_key", &self.ssh_key.clone().unwrap_or_default());
        vars.insert("metadata", &self.metadata);
        vars
    }

    pub fn render_str(&self, template: &str) -> Result<String> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        Ok(Tera::one_off(template, &self.variables(), false)?)
    }

    /// Renders every string inside `config`, leaving keys and other scalars alone.
    pub fn render_config(&self, config: &Value) -> Result<Value> {
        Ok(match config {
            Value::String(s) => Value::String(self.render_str(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_config(item))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.render_config(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Environment handed to commands run for this workspace.
    pub fn command_env(&self) -> Vec<(String, String)> {
        vec![
            ("WORKSPACE_ID".into(), self.workspace_id.clone()),
            ("WORKSPACE_NAME".into(), self.workspace_name.clone()),
            ("WORKSPACE_TENANT".into(), self.tenant.clone()),
            ("WORKSPACE_USER".into(), self.os_user.clone()),
            ("WORKSPACE_HOME".into(), self.home_dir.display().to_string()),
            ("WORKSPACE_PORT".into(), self.port.to_string()),
            ("WORKSPACE_DOMAIN".into(), self.domain.clone()),
        ]
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl ConditionContext for ExecutionContext {
    fn has_attribute(&self, name: &str) -> bool {
        match name {
            "ssh_key" => self.ssh_key.is_some(),
            "repo_url" => self.repo_url.is_some(),
            "template" => self.template.is_some(),
            other => match self.metadata.get(other) {
                None | Some(Value::Null) => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(_) => true,
            },
        }
    }

    fn home_dir(&self) -> &Path {
        &self.home_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceStatus;
    use chrono::Utc;
    use serde_json::json;

    fn workspace() -> Workspace {
        Workspace {
            id: "ws-1".into(),
            tenant: "acme".into(),
            name: "api".into(),
            os_user: Some("ws_acme_api".into()),
            home_dir: Some("/home/ws_acme_api".into()),
            subdomain: Some("api-acme".into()),
            port: Some(20001),
            host: "local".into(),
            status: WorkspaceStatus::Provisioning,
            is_running: false,
            last_started_at: None,
            last_stopped_at: None,
            template: Some("python@1".into()),
            ssh_public_key: Some("ssh-ed25519 AAAA test".into()),
            repo_url: Some("  ".into()),
            metadata: Some(json!({ "editor": "vim", "empty": "", "gone": null, "gpu": false })),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_requires_assigned_resources() {
        let mut ws = workspace();
        ws.port = None;
        assert!(matches!(
            ExecutionContext::for_workspace(&ws, "dev.test"),
            Err(OrchestratorError::InvalidState(_))
        ));
    }

    #[test]
    fn test_attributes() {
        let ctx = ExecutionContext::for_workspace(&workspace(), "dev.test").unwrap();
        assert!(ctx.has_attribute("ssh_key"));
        assert!(!ctx.has_attribute("repo_url"));
        assert!(ctx.has_attribute("template"));
        assert!(ctx.has_attribute("editor"));
        assert!(ctx.has_attribute("gpu"));
        assert!(!ctx.has_attribute("empty"));
        assert!(!ctx.has_attribute("gone"));
        assert!(!ctx.has_attribute("missing"));
    }

    #[test]
    fn test_render_config() {
        let ctx = ExecutionContext::for_workspace(&workspace(), "dev.test").unwrap();
        let rendered = ctx
            .render_config(&json!({
                "command": "echo {{ workspace_id }} > {{ home }}/id",
                "url": "https://{{ domain }}:{{ port }}",
                "editor": "{{ metadata.editor }}",
                "list": ["{{ os_user }}", 3],
                "plain": "no placeholders",
                "retries": 2
            }))
            .unwrap();

        assert_eq!(rendered["command"], "echo ws-1 > /home/ws_acme_api/id");
        assert_eq!(rendered["url"], "https://api-acme.dev.test:20001");
        assert_eq!(rendered["editor"], "vim");
        assert_eq!(rendered["list"][0], "ws_acme_api");
        assert_eq!(rendered["list"][1], 3);
        assert_eq!(rendered["retries"], 2);
    }

    #[test]
    fn test_render_error_is_reported() {
        let ctx = ExecutionContext::for_workspace(&workspace(), "dev.test").unwrap();
        assert!(matches!(
            ctx.render_str("{{ unknown_variable }}"),
            Err(OrchestratorError::Render(_))
        ));
    }
}
