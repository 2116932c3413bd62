//! Background loops: provisioning of pending workspaces and periodic drift
//! correction.

use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use ws_orchestrator::{OrchestratorError, WorkspaceLifecycle};

pub async fn start_provisioner_task(lifecycle: Arc<WorkspaceLifecycle>, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Provisioner task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        if let Err(e) = process_pending_workspaces(&lifecycle).await {
            error!("Provisioner error: {}", e);
        }
    }
}

/// Provisions every `pending` workspace in turn. Returns how many reached
/// `active` or `stopped`.
pub async fn process_pending_workspaces(lifecycle: &WorkspaceLifecycle) -> anyhow::Result<usize> {
    let pending = lifecycle.pending_workspaces().await?;
    let mut provisioned = 0;

    for workspace in pending {
        info!(workspace_id = %workspace.id, name = %workspace.name, "provisioning workspace");

        match lifecycle.provision_workspace(&workspace.id).await {
            Ok(result) => {
                provisioned += 1;
                info!(
                    workspace_id = %workspace.id,
                    status = %result.workspace.status,
                    "workspace provisioned"
                );
            }
            // Someone else (a waiting API request) got there first
            Err(OrchestratorError::InvalidState(reason)) => {
                debug!(workspace_id = %workspace.id, %reason, "workspace no longer pending");
            }
            Err(e) => {
                warn!(workspace_id = %workspace.id, error = %e, "provisioning failed");
            }
        }
    }

    Ok(provisioned)
}

pub async fn start_reconciler_task(lifecycle: Arc<WorkspaceLifecycle>, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Reconciler task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        match lifecycle.reconcile_all().await {
            Ok(report) => debug!(
                checked = report.checked,
                corrected = report.corrected,
                errors = report.errors,
                "reconcile pass done"
            ),
            Err(e) => error!("Reconciler error: {}", e),
        }
    }
}
