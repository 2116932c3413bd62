//! Audit records of action attempts.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkspaceActionExecution {
    pub id: String,
    pub workspace_id: String,
    /// Shared by every record written during one `apply`.
    pub run_id: String,
    pub template_id: String,
    pub action_id: String,
    pub sequence_order: i64,
    pub attempt: i64,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

/// Identifies the step an execution record belongs to.
#[derive(Debug, Clone, Copy)]
pub struct StepRef<'a> {
    pub workspace_id: &'a str,
    pub run_id: &'a str,
    pub template_id: &'a str,
    pub action_id: &'a str,
    pub sequence_order: i64,
}

#[derive(Clone)]
pub struct ExecutionStore {
    pool: SqlitePool,
}

impl ExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a `running` record for one attempt.
    pub async fn begin(&self, step: StepRef<'_>, attempt: u32) -> Result<String> {
        self.insert(step, attempt, ExecutionStatus::Running, None).await
    }

    pub async fn record_skipped(&self, step: StepRef<'_>, reason: &str) -> Result<String> {
        self.insert(step, 0, ExecutionStatus::Skipped, Some(reason)).await
    }

    async fn insert(
        &self,
        step: StepRef<'_>,
        attempt: u32,
        status: ExecutionStatus,
        note: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let completed_at = (status == ExecutionStatus::Skipped).then_some(now);

        sqlx::query(
            "INSERT INTO workspace_action_executions
                (id, workspace_id, run_id, template_id, action_id, sequence_order, attempt, status, started_at, completed_at, output)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(step.workspace_id)
        .bind(step.run_id)
        .bind(step.template_id)
        .bind(step.action_id)
        .bind(step.sequence_order)
        .bind(i64::from(attempt))
        .bind(status)
        .bind(now)
        .bind(completed_at)
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Close an open attempt as `completed` or `failed`.
    pub async fn finish(
        &self,
        id: &str,
        status: ExecutionStatus,
        output: &str,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        if !matches!(status, ExecutionStatus::Completed | ExecutionStatus::Failed) {
            return Err(OrchestratorError::InvalidInput(format!(
                "an attempt cannot finish as {status:?}"
            )));
        }
        let result = result.map(serde_json::to_string).transpose()?;

        let updated = sqlx::query(
            "UPDATE workspace_action_executions
             SET status = ?, output = ?, error = ?, result = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status)
        .bind(output)
        .bind(error)
        .bind(result)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "execution {id} is not open"
            )));
        }
        Ok(())
    }

    /// Mark a completed attempt as undone.
    pub async fn mark_rolled_back(&self, id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE workspace_action_executions SET status = ? WHERE id = ? AND status = 'completed'",
        )
        .bind(ExecutionStatus::RolledBack)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(OrchestratorError::InvalidState(format!(
                "execution {id} is not completed"
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<WorkspaceActionExecution> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workspace_action_executions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("execution {id}")))?;

        Ok(row.into())
    }

    /// All records of a workspace in the order they were written.
    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<WorkspaceActionExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workspace_action_executions WHERE workspace_id = ? ORDER BY rowid ASC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<WorkspaceActionExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM workspace_action_executions WHERE run_id = ? ORDER BY rowid ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    workspace_id: String,
    run_id: String,
    template_id: String,
    action_id: String,
    sequence_order: i64,
    attempt: i64,
    status: ExecutionStatus,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    output: Option<String>,
    error: Option<String>,
    result: Option<String>,
}

impl From<ExecutionRow> for WorkspaceActionExecution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            run_id: row.run_id,
            template_id: row.template_id,
            action_id: row.action_id,
            sequence_order: row.sequence_order,
            attempt: row.attempt,
            status: row.status,
            started_at: row.started_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            output: row.output,
            error: row.error,
            result: row.result.and_then(|s| serde_json::from_str(&s).ok()),
        }
    }
}
