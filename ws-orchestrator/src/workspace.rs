use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Workspace {
    pub id: String,
    pub tenant: String,
    pub name: String,
    pub os_user: Option<String>,
    pub home_dir: Option<String>,
    pub subdomain: Option<String>,
    pub port: Option<u16>,
    pub host: String,
    pub status: WorkspaceStatus,
    /// Last observed state of the service unit.
    pub is_running: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<DateTime<Utc>>,

    /// Template reference as `name@version`.
    pub template: Option<String>,
    pub ssh_public_key: Option<String>,
    pub repo_url: Option<String>,

    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Whether port, account and subdomain are currently assigned.
    pub fn has_resources(&self) -> bool {
        self.port.is_some() && self.os_user.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.status == WorkspaceStatus::Deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Provisioning,
    Active,
    Stopped,
    Error,
    Deleted,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Provisioning => "provisioning",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Error => "error",
            WorkspaceStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateWorkspaceRequest {
    pub tenant: String,
    pub name: String,
    /// `name` for the latest version or `name@version`.
    pub template: Option<String>,
    pub ssh_public_key: Option<String>,
    pub repo_url: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WorkspaceFilters {
    pub tenant: Option<String>,
    pub status: Option<WorkspaceStatus>,
}

/// Scarce resources handed to a workspace during provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAssignment {
    pub os_user: String,
    pub home_dir: String,
    pub subdomain: String,
    pub port: u16,
}

/// Which run timestamp a runtime update touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    Started,
    Stopped,
    Unchanged,
}

impl RunTransition {
    pub fn between(was_running: bool, is_running: bool) -> Self {
        match (was_running, is_running) {
            (false, true) => RunTransition::Started,
            (true, false) => RunTransition::Stopped,
            _ => RunTransition::Unchanged,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RunTransition::Started => "started",
            RunTransition::Stopped => "stopped",
            RunTransition::Unchanged => "unchanged",
        }
    }
}

/// Persistence for workspace records.
#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a `pending` workspace. `template` must already be resolved to
    /// `name@version`.
    #[instrument(skip(self, req), fields(tenant = %req.tenant, name = %req.name))]
    pub async fn insert(
        &self,
        req: &CreateWorkspaceRequest,
        template: Option<&str>,
        host: &str,
    ) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let metadata = req
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, tenant, name, host, status, is_running, template, ssh_public_key, repo_url, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.tenant)
        .bind(&req.name)
        .bind(host)
        .bind(WorkspaceStatus::Pending)
        .bind(template)
        .bind(&req.ssh_public_key)
        .bind(&req.repo_url)
        .bind(metadata)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&id).await
    }

    /// Get a single workspace by ID
    pub async fn get(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {id}")))?;

        Ok(row.into())
    }

    /// List workspaces with optional filters, newest first
    pub async fn list(&self, filters: &WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.tenant.is_some() {
            query.push_str(" AND tenant = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(tenant) = &filters.tenant {
            q = q.bind(tenant);
        }
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Workspaces in any of `statuses`, oldest first
    pub async fn by_status(&self, statuses: &[WorkspaceStatus]) -> Result<Vec<Workspace>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let query = format!(
            "SELECT * FROM workspaces WHERE status IN ({placeholders}) ORDER BY created_at ASC, rowid ASC"
        );

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);
        for status in statuses {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Record the assigned resources and move to `provisioning`.
    ///
    /// The partial unique indexes reject a port, account or subdomain that a
    /// live workspace already holds; that surfaces as `ResourceConflict`.
    #[instrument(skip(self, assignment), fields(workspace_id = %id, port = assignment.port))]
    pub async fn assign_resources(&self, id: &str, assignment: &ResourceAssignment) -> Result<()> {
        let result = sqlx::query(
            "UPDATE workspaces
             SET os_user = ?, home_dir = ?, subdomain = ?, port = ?, status = ?, error_message = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(&assignment.os_user)
        .bind(&assignment.home_dir)
        .bind(&assignment.subdomain)
        .bind(i64::from(assignment.port))
        .bind(WorkspaceStatus::Provisioning)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                OrchestratorError::ResourceConflict(format!(
                    "workspace {id}: resources already held by another workspace: {}",
                    db.message()
                ))
            }
            other => OrchestratorError::Database(other),
        })?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("workspace {id}")));
        }

        Ok(())
    }

    /// Persist status and running state together.
    #[instrument(skip(self, error_message), fields(workspace_id = %id))]
    pub async fn update_runtime(
        &self,
        id: &str,
        status: WorkspaceStatus,
        is_running: bool,
        transition: RunTransition,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE workspaces
             SET status = ?, is_running = ?, error_message = ?, updated_at = ?,
                 last_started_at = CASE WHEN ? = 'started' THEN ? ELSE last_started_at END,
                 last_stopped_at = CASE WHEN ? = 'stopped' THEN ? ELSE last_stopped_at END
             WHERE id = ?",
        )
        .bind(status)
        .bind(is_running)
        .bind(error_message)
        .bind(now)
        .bind(transition.as_str())
        .bind(now)
        .bind(transition.as_str())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("workspace {id}")));
        }

        Ok(())
    }

    /// Forget the assigned resources after they were handed back.
    pub async fn clear_resources(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE workspaces
             SET os_user = NULL, home_dir = NULL, subdomain = NULL, port = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn os_user_taken(&self, os_user: &str) -> Result<bool> {
        self.live_value_taken("os_user", os_user).await
    }

    pub async fn subdomain_taken(&self, subdomain: &str) -> Result<bool> {
        self.live_value_taken("subdomain", subdomain).await
    }

    async fn live_value_taken(&self, column: &'static str, value: &str) -> Result<bool> {
        let query = format!(
            "SELECT COUNT(*) FROM workspaces WHERE {column} = ? AND status != 'deleted'"
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(value)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    tenant: String,
    name: String,
    os_user: Option<String>,
    home_dir: Option<String>,
    subdomain: Option<String>,
    port: Option<i64>,
    host: String,
    status: WorkspaceStatus,
    is_running: bool,
    last_started_at: Option<i64>,
    last_stopped_at: Option<i64>,
    template: Option<String>,
    ssh_public_key: Option<String>,
    repo_url: Option<String>,
    metadata: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            tenant: row.tenant,
            name: row.name,
            os_user: row.os_user,
            home_dir: row.home_dir,
            subdomain: row.subdomain,
            port: row.port.and_then(|p| u16::try_from(p).ok()),
            host: row.host,
            status: row.status,
            is_running: row.is_running,
            last_started_at: row
                .last_started_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            last_stopped_at: row
                .last_stopped_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            template: row.template,
            ssh_public_key: row.ssh_public_key,
            repo_url: row.repo_url,
            metadata: row.metadata.and_then(|s| serde_json::from_str(&s).ok()),
            error_message: row.error_message,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    fn request(tenant: &str, name: &str) -> CreateWorkspaceRequest {
        CreateWorkspaceRequest {
            tenant: tenant.to_string(),
            name: name.to_string(),
            metadata: Some(serde_json::json!({ "editor": "vim" })),
            ..Default::default()
        }
    }

    fn assignment(os_user: &str, port: u16) -> ResourceAssignment {
        ResourceAssignment {
            os_user: os_user.to_string(),
            home_dir: format!("/home/{os_user}"),
            subdomain: os_user.replace('_', "-"),
            port,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = WorkspaceStore::new(create_test_db().await);
        let ws = store
            .insert(&request("acme", "api"), Some("python@1"), "local")
            .await
            .unwrap();

        assert_eq!(ws.status, WorkspaceStatus::Pending);
        assert!(!ws.is_running);
        assert!(!ws.has_resources());
        assert_eq!(ws.template.as_deref(), Some("python@1"));
        assert_eq!(ws.metadata.unwrap()["editor"], "vim");

        let missing = store.get("nope").await.unwrap_err();
        assert!(matches!(missing, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = WorkspaceStore::new(create_test_db().await);
        store.insert(&request("acme", "a"), None, "local").await.unwrap();
        let b = store.insert(&request("acme", "b"), None, "local").await.unwrap();
        store.insert(&request("globex", "c"), None, "local").await.unwrap();

        store
            .update_runtime(&b.id, WorkspaceStatus::Stopped, false, RunTransition::Unchanged, None)
            .await
            .unwrap();

        let acme = store
            .list(&WorkspaceFilters {
                tenant: Some("acme".into()),
                status: None,
            })
            .await
            .unwrap();
        assert_eq!(acme.len(), 2);

        let stopped = store
            .list(&WorkspaceFilters {
                tenant: None,
                status: Some(WorkspaceStatus::Stopped),
            })
            .await
            .unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].id, b.id);

        let pending = store.by_status(&[WorkspaceStatus::Pending]).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].name, "a");
    }

    #[tokio::test]
    async fn test_port_unique_among_live_workspaces() {
        let store = WorkspaceStore::new(create_test_db().await);
        let a = store.insert(&request("acme", "a"), None, "local").await.unwrap();
        let b = store.insert(&request("acme", "b"), None, "local").await.unwrap();

        store.assign_resources(&a.id, &assignment("ws_a", 20000)).await.unwrap();
        let err = store
            .assign_resources(&b.id, &assignment("ws_b", 20000))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceConflict(_)));

        // A deleted workspace no longer holds its port
        store
            .update_runtime(&a.id, WorkspaceStatus::Deleted, false, RunTransition::Unchanged, None)
            .await
            .unwrap();
        store.assign_resources(&b.id, &assignment("ws_b", 20000)).await.unwrap();
        assert!(store.os_user_taken("ws_b").await.unwrap());
        assert!(!store.os_user_taken("ws_a").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_runtime_touches_timestamps() {
        let store = WorkspaceStore::new(create_test_db().await);
        let ws = store.insert(&request("acme", "a"), None, "local").await.unwrap();

        store
            .update_runtime(&ws.id, WorkspaceStatus::Active, true, RunTransition::Started, None)
            .await
            .unwrap();
        let started = store.get(&ws.id).await.unwrap();
        assert!(started.is_running);
        assert!(started.last_started_at.is_some());
        assert!(started.last_stopped_at.is_none());

        store
            .update_runtime(
                &ws.id,
                WorkspaceStatus::Error,
                false,
                RunTransition::Stopped,
                Some("unit failed"),
            )
            .await
            .unwrap();
        let stopped = store.get(&ws.id).await.unwrap();
        assert!(!stopped.is_running);
        assert!(stopped.last_stopped_at.is_some());
        assert_eq!(stopped.error_message.as_deref(), Some("unit failed"));
    }

    #[test]
    fn test_run_transition() {
        assert_eq!(RunTransition::between(false, true), RunTransition::Started);
        assert_eq!(RunTransition::between(true, false), RunTransition::Stopped);
        assert_eq!(RunTransition::between(true, true), RunTransition::Unchanged);
    }
}
