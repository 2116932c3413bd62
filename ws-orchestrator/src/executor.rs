//! Runs a template's resolved steps for one workspace.
//!
//! Every attempt gets its own execution record. Step failures never escape
//! as errors: they end up in the [`ExecutionSummary`], and only database or
//! registry problems are returned as `Err`.

use crate::catalog::{ResolvedStep, ResolvedTemplate};
use crate::condition::Condition;
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::execution::{ExecutionStatus, ExecutionStore, StepRef};
use crate::handlers::{ActionHandler, ActionOutcome, ActionRegistry, StepInput};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StepDetail {
    pub action_id: String,
    pub sequence_order: i64,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FailedStep {
    pub action_id: String,
    pub sequence_order: i64,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub template_id: String,
    pub success: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rolled_back: usize,
    /// The step that stopped the run.
    pub failed_step: Option<FailedStep>,
    pub details: Vec<StepDetail>,
}

impl ExecutionSummary {
    /// Turns an unsuccessful run into `TemplateFatalFailure`.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let failed = self.failed_step.clone().unwrap_or_else(|| FailedStep {
            action_id: "unknown".to_string(),
            sequence_order: -1,
            error: "run did not complete".to_string(),
        });
        Err(OrchestratorError::TemplateFatalFailure {
            template: self.template_id,
            action: failed.action_id,
            sequence_order: failed.sequence_order,
            reason: failed.error,
        })
    }
}

struct CompletedStep {
    record_id: String,
    detail_index: usize,
    handler: Arc<dyn ActionHandler>,
    input: StepInput,
    outcome: ActionOutcome,
}

#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
    store: ExecutionStore,
}

impl ActionExecutor {
    pub fn new(registry: Arc<ActionRegistry>, store: ExecutionStore) -> Self {
        Self { registry, store }
    }

    pub async fn apply(
        &self,
        ctx: &ExecutionContext,
        template: &ResolvedTemplate,
    ) -> Result<ExecutionSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "apply_template",
            workspace_id = %ctx.workspace_id,
            template = %template.id,
            run_id = %run_id
        );
        self.run(ctx, template, run_id).instrument(span).await
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        template: &ResolvedTemplate,
        run_id: String,
    ) -> Result<ExecutionSummary> {
        // Unknown kinds abort before anything runs
        let handlers = template
            .steps
            .iter()
            .map(|step| self.registry.resolve(&step.kind))
            .collect::<Result<Vec<_>>>()?;

        info!(steps = template.steps.len(), "applying template");

        let mut details: Vec<StepDetail> = Vec::with_capacity(template.steps.len());
        let mut completed: Vec<CompletedStep> = Vec::new();
        let mut completed_ids: HashSet<&str> = HashSet::new();
        let mut failed_step = None;

        for (step, handler) in template.steps.iter().zip(handlers) {
            let step_ref = StepRef {
                workspace_id: &ctx.workspace_id,
                run_id: &run_id,
                template_id: &template.id,
                action_id: &step.action_id,
                sequence_order: step.sequence_order,
            };

            if let Some(reason) = skip_reason(ctx, step, &completed_ids) {
                debug!(action = %step.action_id, %reason, "skipping step");
                self.store.record_skipped(step_ref, &reason).await?;
                details.push(detail(step, ExecutionStatus::Skipped, 0, None));
                continue;
            }

            let (attempts, result) = self.attempt_step(ctx, step, step_ref, &handler).await?;
            match result {
                Ok((record_id, input, outcome)) => {
                    completed_ids.insert(step.action_id.as_str());
                    details.push(detail(step, ExecutionStatus::Completed, attempts, None));
                    completed.push(CompletedStep {
                        record_id,
                        detail_index: details.len() - 1,
                        handler,
                        input,
                        outcome,
                    });
                }
                Err(err) if step.skip_on_error => {
                    warn!(action = %step.action_id, error = %err, "step failed, continuing");
                    details.push(detail(step, ExecutionStatus::Failed, attempts, Some(err.to_string())));
                }
                Err(err) => {
                    error!(action = %step.action_id, error = %err, "step failed, aborting template");
                    details.push(detail(step, ExecutionStatus::Failed, attempts, Some(err.to_string())));
                    failed_step = Some(FailedStep {
                        action_id: step.action_id.clone(),
                        sequence_order: step.sequence_order,
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }

        if failed_step.is_some() && template.rollback_on_failure {
            self.roll_back(ctx, completed, &mut details).await?;
        }

        let count = |status: ExecutionStatus| details.iter().filter(|d| d.status == status).count();
        let summary = ExecutionSummary {
            run_id,
            template_id: template.id.clone(),
            success: failed_step.is_none(),
            total: template.steps.len(),
            completed: count(ExecutionStatus::Completed),
            failed: count(ExecutionStatus::Failed),
            skipped: count(ExecutionStatus::Skipped),
            rolled_back: count(ExecutionStatus::RolledBack),
            failed_step,
            details,
        };

        info!(
            success = summary.success,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            rolled_back = summary.rolled_back,
            "template applied"
        );
        Ok(summary)
    }

    /// Runs up to `max_retries` attempts. The outer `Result` carries
    /// bookkeeping failures, the inner one the step's fate.
    async fn attempt_step(
        &self,
        ctx: &ExecutionContext,
        step: &ResolvedStep,
        step_ref: StepRef<'_>,
        handler: &Arc<dyn ActionHandler>,
    ) -> Result<(u32, Result<(String, StepInput, ActionOutcome)>)> {
        let config = match ctx.render_config(&step.config) {
            Ok(config) => config,
            Err(err) => {
                let record = self.store.begin(step_ref, 1).await?;
                self.store
                    .finish(&record, ExecutionStatus::Failed, "", Some(&err.to_string()), None)
                    .await?;
                return Ok((1, Err(OrchestratorError::action_failed(&step.action_id, err.to_string()))));
            }
        };

        let mut last_error = None;
        for attempt in 1..=step.max_retries {
            let input = StepInput {
                action_id: step.action_id.clone(),
                config: config.clone(),
                timeout: step.timeout(),
                attempt,
            };
            let record = self.store.begin(step_ref, attempt).await?;

            match run_attempt(handler.as_ref(), ctx, &input).await {
                Ok(outcome) => {
                    self.store
                        .finish(
                            &record,
                            ExecutionStatus::Completed,
                            &outcome.output,
                            None,
                            Some(&outcome.result),
                        )
                        .await?;
                    debug!(action = %step.action_id, attempt, "step completed");
                    return Ok((attempt, Ok((record, input, outcome))));
                }
                Err(err) => {
                    self.store
                        .finish(&record, ExecutionStatus::Failed, "", Some(&err.to_string()), None)
                        .await?;

                    let retry = err.is_retryable() && attempt < step.max_retries;
                    warn!(
                        action = %step.action_id,
                        attempt,
                        max_retries = step.max_retries,
                        error = %err,
                        "attempt failed"
                    );
                    if !retry {
                        return Ok((attempt, Err(err)));
                    }
                    last_error = Some(err);
                    tokio::time::sleep(step.retry_delay(attempt)).await;
                }
            }
        }

        // Only reachable with max_retries == 0, which the catalog rejects
        let err = last_error.unwrap_or_else(|| {
            OrchestratorError::action_failed(&step.action_id, "no attempts were made")
        });
        Ok((step.max_retries, Err(err)))
    }

    /// Undoes completed steps, newest first.
    async fn roll_back(
        &self,
        ctx: &ExecutionContext,
        completed: Vec<CompletedStep>,
        details: &mut [StepDetail],
    ) -> Result<()> {
        for step in completed.into_iter().rev() {
            let rollback = AssertUnwindSafe(step.handler.rollback(ctx, &step.input, &step.outcome))
                .catch_unwind();
            let undone = match tokio::time::timeout(step.input.timeout, rollback).await {
                Ok(Ok(Ok(true))) => true,
                Ok(Ok(Ok(false))) => {
                    warn!(action = %step.input.action_id, "rollback reported failure");
                    false
                }
                Ok(Ok(Err(err))) => {
                    warn!(action = %step.input.action_id, error = %err, "rollback failed");
                    false
                }
                Ok(Err(panic)) => {
                    warn!(
                        action = %step.input.action_id,
                        panic = %panic_message(panic.as_ref()),
                        "rollback panicked"
                    );
                    false
                }
                Err(_) => {
                    warn!(action = %step.input.action_id, "rollback timed out");
                    false
                }
            };

            if undone {
                self.store.mark_rolled_back(&step.record_id).await?;
                details[step.detail_index].status = ExecutionStatus::RolledBack;
                info!(action = %step.input.action_id, "step rolled back");
            }
        }
        Ok(())
    }
}

fn skip_reason(
    ctx: &ExecutionContext,
    step: &ResolvedStep,
    completed_ids: &HashSet<&str>,
) -> Option<String> {
    if let Some(missing) = step
        .prerequisites
        .iter()
        .find(|p| !completed_ids.contains(p.as_str()))
    {
        return Some(format!("prerequisite '{missing}' did not complete"));
    }
    match &step.condition {
        Some(condition) if !condition.evaluate(ctx) => Some(condition_reason(condition)),
        _ => None,
    }
}

fn condition_reason(condition: &Condition) -> String {
    format!("condition '{condition}' not met")
}

fn detail(step: &ResolvedStep, status: ExecutionStatus, attempts: u32, error: Option<String>) -> StepDetail {
    StepDetail {
        action_id: step.action_id.clone(),
        sequence_order: step.sequence_order,
        status,
        attempts,
        error,
    }
}

/// One bounded attempt: execute, then validate. Panics count as failures.
async fn run_attempt(
    handler: &dyn ActionHandler,
    ctx: &ExecutionContext,
    input: &StepInput,
) -> Result<ActionOutcome> {
    let execution = AssertUnwindSafe(handler.execute(ctx, input)).catch_unwind();
    let outcome = match tokio::time::timeout(input.timeout, execution).await {
        Err(_) => {
            return Err(OrchestratorError::ActionTimeout {
                action: input.action_id.clone(),
                timeout: input.timeout,
            })
        }
        Ok(Err(panic)) => {
            return Err(OrchestratorError::action_failed(
                &input.action_id,
                format!("handler panicked: {}", panic_message(panic.as_ref())),
            ))
        }
        Ok(Ok(result)) => result?,
    };

    if handler.validate(ctx, input, &outcome).await {
        Ok(outcome)
    } else {
        Err(OrchestratorError::action_failed(
            &input.action_id,
            "validation rejected the outcome",
        ))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
