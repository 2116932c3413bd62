//! Traefik dynamic configuration mapping workspace hosts to local ports.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use utoipa::ToSchema;
use ws_core::write_atomic;

const ROUTER_PREFIX: &str = "ws-";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RouteFile {
    #[serde(default)]
    http: HttpSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HttpSection {
    #[serde(default)]
    routers: BTreeMap<String, Router>,
    #[serde(default)]
    services: BTreeMap<String, Service>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Router {
    rule: String,
    service: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Service {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Server {
    url: String,
}

/// One workspace's entry in the route file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RouteEntry {
    pub workspace_id: String,
    pub host: String,
    pub url: String,
}

pub struct RouteWriter {
    path: PathBuf,
    base_domain: String,
    lock: Mutex<()>,
}

impl RouteWriter {
    pub fn new(path: impl Into<PathBuf>, base_domain: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            base_domain: base_domain.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn host_for(&self, subdomain: &str) -> String {
        format!("{subdomain}.{}", self.base_domain)
    }

    /// Adds or replaces the route of `workspace_id`.
    pub fn upsert_route(&self, workspace_id: &str, subdomain: &str, port: u16) -> Result<()> {
        let host = self.host_for(subdomain);
        self.update(|file| {
            let name = router_name(workspace_id);
            file.http.routers.insert(
                name.clone(),
                Router {
                    rule: format!("Host(`{host}`)"),
                    service: name.clone(),
                },
            );
            file.http.services.insert(
                name,
                Service {
                    load_balancer: LoadBalancer {
                        servers: vec![Server {
                            url: format!("http://127.0.0.1:{port}"),
                        }],
                    },
                },
            );
            true
        })?;
        info!(workspace_id, %host, port, "route written");
        Ok(())
    }

    /// Removes the route of `workspace_id`. Returns whether one existed.
    pub fn remove_route(&self, workspace_id: &str) -> Result<bool> {
        let removed = self.update(|file| {
            let name = router_name(workspace_id);
            let router = file.http.routers.remove(&name).is_some();
            let service = file.http.services.remove(&name).is_some();
            router || service
        })?;
        debug!(workspace_id, removed, "route removed");
        Ok(removed)
    }

    pub fn routes(&self) -> Result<Vec<RouteEntry>> {
        let _guard = self.guard()?;
        let file = self.read()?;
        Ok(file
            .http
            .routers
            .iter()
            .filter_map(|(name, router)| {
                let workspace_id = name.strip_prefix(ROUTER_PREFIX)?;
                let url = file
                    .http
                    .services
                    .get(&router.service)
                    .and_then(|s| s.load_balancer.servers.first())
                    .map(|s| s.url.clone())
                    .unwrap_or_default();
                Some(RouteEntry {
                    workspace_id: workspace_id.to_string(),
                    host: parse_host_rule(&router.rule).unwrap_or_default(),
                    url,
                })
            })
            .collect())
    }

    /// Read-modify-write under the lock. The file is only rewritten when
    /// `change` reports a modification.
    fn update(&self, change: impl FnOnce(&mut RouteFile) -> bool) -> Result<bool> {
        let _guard = self.guard()?;
        let mut file = self.read()?;
        if !change(&mut file) {
            return Ok(false);
        }
        let yaml = serde_yaml_ng::to_string(&file)?;
        write_atomic(&self.path, yaml.as_bytes())
            .map_err(|e| OrchestratorError::Route(format!("{}: {e}", self.path.display())))?;
        Ok(true)
    }

    fn read(&self) -> Result<RouteFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(RouteFile::default()),
            Ok(text) => serde_yaml_ng::from_str(&text)
                .map_err(|e| OrchestratorError::Route(format!("{}: {e}", self.path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RouteFile::default()),
            Err(e) => Err(OrchestratorError::Route(format!("{}: {e}", self.path.display()))),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| OrchestratorError::Route("route file lock poisoned".to_string()))
    }
}

fn router_name(workspace_id: &str) -> String {
    format!("{ROUTER_PREFIX}{workspace_id}")
}

fn parse_host_rule(rule: &str) -> Option<String> {
    rule.strip_prefix("Host(`")?
        .strip_suffix("`)")
        .map(str::to_string)
}
