//! Integration tests for the workspace lifecycle
//!
//! Drives `WorkspaceLifecycle` end to end against an in-memory database, a
//! fake supervisor and fake host accounts: provisioning, rollback on failed
//! templates, idempotent start/stop, deletion and drift correction.

use std::collections::HashSet;
use std::sync::Arc;
use ws_orchestrator::routes::RouteWriter;
use ws_orchestrator::test_utils::{TestHarness, TEST_SSH_KEY};
use ws_orchestrator::units::UnitState;
use ws_orchestrator::{
    CreateWorkspaceRequest, ExecutionStatus, NoOpReason, OrchestratorError, Outcome,
    WorkspaceFilters, WorkspaceStatus,
};

fn routes(harness: &TestHarness) -> RouteWriter {
    RouteWriter::new(&harness.config.routes_file, harness.config.base_domain.clone())
}

#[tokio::test]
async fn test_provision_reaches_active() {
    let harness = TestHarness::new().await;

    let result = harness
        .lifecycle
        .provision(harness.request("acme", "api"))
        .await
        .expect("provision failed");

    assert_eq!(result.outcome, Outcome::Applied);
    let ws = result.workspace;
    assert_eq!(ws.status, WorkspaceStatus::Active);
    assert!(ws.is_running);
    assert!(ws.last_started_at.is_some());
    assert_eq!(ws.port, Some(20000));
    assert_eq!(ws.os_user.as_deref(), Some("ws_acme_api"));
    assert_eq!(ws.subdomain.as_deref(), Some("api-acme"));
    assert_eq!(ws.template.as_deref(), Some("dev@2"));
    assert!(ws.error_message.is_none());

    // Unit, route and account are in place
    let unit = harness.unit_name(&ws);
    assert_eq!(harness.supervisor.state_of(&unit), UnitState::Active);
    assert!(harness.supervisor.is_enabled(&unit));
    assert!(harness.config.unit_dir.join(&unit).exists());
    assert_eq!(harness.accounts.accounts(), vec!["ws_acme_api".to_string()]);

    let entries = routes(&harness).routes().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].host, "api-acme.test.localhost");
    assert_eq!(entries[0].url, "http://127.0.0.1:20000");

    // Template actions ran inside the home
    let home = std::path::PathBuf::from(ws.home_dir.clone().unwrap());
    assert!(home.join("projects").is_dir());
    let env = std::fs::read_to_string(home.join(".workspace.env")).unwrap();
    assert_eq!(env, "PORT=20000\nDOMAIN=api-acme.test.localhost\n");
    let keys = std::fs::read_to_string(home.join(".ssh/authorized_keys")).unwrap();
    assert!(keys.contains(TEST_SSH_KEY));

    let executions = harness.lifecycle.list_executions(&ws.id).await.unwrap();
    let actions: Vec<_> = executions.iter().map(|e| e.action_id.as_str()).collect();
    assert_eq!(actions, vec!["workspace_dirs", "ssh_key", "install", "configure", "env_file"]);
    assert!(executions.iter().all(|e| e.status == ExecutionStatus::Completed));
    assert_eq!(harness.allocated_ports(), vec![20000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_provisions_get_unique_ports() {
    let harness = TestHarness::new().await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let lifecycle = Arc::clone(&harness.lifecycle);
        let req = harness.request("acme", &format!("svc{i}"));
        tasks.push(tokio::spawn(async move { lifecycle.provision(req).await }));
    }

    let mut ports = HashSet::new();
    for task in tasks {
        let result = task.await.unwrap().expect("provision failed");
        assert_eq!(result.workspace.status, WorkspaceStatus::Active);
        assert!(ports.insert(result.workspace.port.unwrap()), "port handed out twice");
    }
    assert_eq!(ports.len(), 8);
    assert_eq!(harness.allocated_ports().len(), 8);
}

#[tokio::test]
async fn test_same_name_gets_distinct_account_and_subdomain() {
    let harness = TestHarness::new().await;

    let first = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap();
    let second = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap();

    assert_eq!(first.workspace.os_user.as_deref(), Some("ws_acme_api"));
    assert_eq!(second.workspace.os_user.as_deref(), Some("ws_acme_api_2"));
    assert_eq!(second.workspace.subdomain.as_deref(), Some("api-acme-2"));
    assert_ne!(first.workspace.port, second.workspace.port);
}

#[tokio::test]
async fn test_existing_host_account_is_skipped() {
    let harness = TestHarness::new().await;
    harness.accounts.add_existing("ws_acme_api");

    let result = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap();
    assert_eq!(result.workspace.os_user.as_deref(), Some("ws_acme_api_2"));
}

#[tokio::test]
async fn test_pool_exhaustion_marks_error() {
    let harness = TestHarness::with_config(|config| {
        config.port_range = "20000-20001".parse().unwrap();
    })
    .await;

    harness.lifecycle.provision(harness.request("acme", "a")).await.unwrap();
    harness.lifecycle.provision(harness.request("acme", "b")).await.unwrap();
    let err = harness
        .lifecycle
        .provision(harness.request("acme", "c"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PoolExhausted { .. }));

    let failed = harness
        .lifecycle
        .list_workspaces(&Default::default())
        .await
        .unwrap()
        .into_iter()
        .find(|w| w.name == "c")
        .unwrap();
    assert_eq!(failed.status, WorkspaceStatus::Error);
    assert!(failed.port.is_none());
    assert!(!failed.is_running);
}

#[tokio::test]
async fn test_stop_and_start_are_idempotent() {
    let harness = TestHarness::new().await;
    let ws = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap().workspace;

    let stopped = harness.lifecycle.stop(&ws.id).await.unwrap();
    assert_eq!(stopped.outcome, Outcome::Applied);
    assert_eq!(stopped.workspace.status, WorkspaceStatus::Stopped);
    assert!(!stopped.workspace.is_running);
    assert!(stopped.workspace.last_stopped_at.is_some());

    harness.supervisor.clear_calls();
    let again = harness.lifecycle.stop(&ws.id).await.unwrap();
    assert_eq!(
        again.outcome,
        Outcome::NoOp {
            reason: NoOpReason::AlreadyStopped
        }
    );
    assert!(harness.supervisor.calls().is_empty());

    let started = harness.lifecycle.start(&ws.id).await.unwrap();
    assert_eq!(started.workspace.status, WorkspaceStatus::Active);
    assert!(started.workspace.is_running);

    harness.supervisor.clear_calls();
    let again = harness.lifecycle.start(&ws.id).await.unwrap();
    assert!(again.is_no_op());
    assert_eq!(
        again.outcome,
        Outcome::NoOp {
            reason: NoOpReason::AlreadyRunning
        }
    );
    assert!(harness.supervisor.calls().is_empty());
}

#[tokio::test]
async fn test_restart_persists_running_state() {
    let harness = TestHarness::new().await;
    let ws = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap().workspace;
    harness.lifecycle.stop(&ws.id).await.unwrap();

    harness.supervisor.clear_calls();
    let restarted = harness.lifecycle.restart(&ws.id).await.unwrap();
    assert_eq!(restarted.workspace.status, WorkspaceStatus::Active);
    assert!(restarted.workspace.is_running);

    let unit = harness.unit_name(&ws);
    assert_eq!(
        harness.supervisor.calls(),
        vec![format!("stop {unit}"), format!("start {unit}")]
    );
    assert_eq!(harness.supervisor.state_of(&unit), UnitState::Active);
}

#[tokio::test]
async fn test_failed_step_rolls_back_and_releases_resources() {
    let harness = TestHarness::new().await;
    harness.handler.fail_always("configure");

    let ws = harness
        .lifecycle
        .create_workspace(harness.request("acme", "api"))
        .await
        .unwrap();
    let err = harness.lifecycle.provision_workspace(&ws.id).await.unwrap_err();
    match &err {
        OrchestratorError::TemplateFatalFailure {
            template,
            action,
            sequence_order,
            ..
        } => {
            assert_eq!(template, "dev@2");
            assert_eq!(action, "configure");
            assert_eq!(*sequence_order, 40);
        }
        other => panic!("unexpected error: {other}"),
    }

    let failed = harness.lifecycle.get_workspace(&ws.id).await.unwrap();
    assert_eq!(failed.status, WorkspaceStatus::Error);
    assert!(!failed.is_running);
    assert!(failed.port.is_none());
    assert!(failed.os_user.is_none());
    assert!(failed.error_message.unwrap().contains("configure"));

    let executions = harness.lifecycle.list_executions(&ws.id).await.unwrap();
    let statuses: Vec<_> = executions
        .iter()
        .map(|e| (e.action_id.as_str(), e.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("workspace_dirs", ExecutionStatus::RolledBack),
            ("ssh_key", ExecutionStatus::RolledBack),
            ("install", ExecutionStatus::RolledBack),
            ("configure", ExecutionStatus::Failed),
        ]
    );
    assert_eq!(harness.handler.rollbacks(), vec!["install"]);

    // Nothing is left behind on the host
    assert!(harness.allocated_ports().is_empty());
    assert!(harness.accounts.accounts().is_empty());
    assert!(harness.supervisor.calls().is_empty());
    assert!(routes(&harness).routes().unwrap().is_empty());

    // A failed workspace without resources can be provisioned again
    harness.handler.reset();
    let retried = harness.lifecycle.provision_workspace(&ws.id).await.unwrap();
    assert_eq!(retried.workspace.status, WorkspaceStatus::Active);
    assert_eq!(retried.workspace.port, Some(20000));
    assert!(retried.workspace.error_message.is_none());
}

#[tokio::test]
async fn test_account_failure_marks_error() {
    let harness = TestHarness::new().await;
    harness.accounts.fail_create(true);

    let err = harness
        .lifecycle
        .provision(harness.request("acme", "api"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Account(_)));
    assert!(harness.handler.calls().is_empty());
    assert!(harness.allocated_ports().is_empty());
}

#[tokio::test]
async fn test_condition_skips_ssh_key_without_key() {
    let harness = TestHarness::new().await;
    let req = CreateWorkspaceRequest {
        ssh_public_key: None,
        ..harness.request("acme", "api")
    };

    let ws = harness.lifecycle.provision(req).await.unwrap().workspace;
    let executions = harness.lifecycle.list_executions(&ws.id).await.unwrap();
    let ssh = executions.iter().find(|e| e.action_id == "ssh_key").unwrap();
    assert_eq!(ssh.status, ExecutionStatus::Skipped);

    let home = std::path::PathBuf::from(ws.home_dir.unwrap());
    assert!(!home.join(".ssh/authorized_keys").exists());
}

#[tokio::test]
async fn test_unit_that_does_not_start_is_persisted_stopped() {
    let harness = TestHarness::new().await;
    harness.supervisor.refuse_start(true);

    let result = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap();
    assert_eq!(result.workspace.status, WorkspaceStatus::Stopped);
    assert!(!result.workspace.is_running);

    // Starting times out; the failure is recorded truthfully
    let err = harness.lifecycle.start(&result.workspace.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::SupervisorTimeout { .. }));
    let ws = harness.lifecycle.get_workspace(&result.workspace.id).await.unwrap();
    assert_eq!(ws.status, WorkspaceStatus::Error);
    assert!(!ws.is_running);
    assert!(ws.error_message.is_some());

    // Restart is allowed from error while resources are held
    harness.supervisor.refuse_start(false);
    let restarted = harness.lifecycle.restart(&ws.id).await.unwrap();
    assert_eq!(restarted.workspace.status, WorkspaceStatus::Active);
    assert!(restarted.workspace.is_running);
}

#[tokio::test]
async fn test_supervisor_failure_keeps_truthful_state() {
    let harness = TestHarness::new().await;
    let ws = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap().workspace;
    harness.supervisor.fail("stop");

    let err = harness.lifecycle.stop(&ws.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Supervisor(_)));

    let after = harness.lifecycle.get_workspace(&ws.id).await.unwrap();
    assert_eq!(after.status, WorkspaceStatus::Error);
    // The unit is still up, so the record says so
    assert!(after.is_running);
}

#[tokio::test]
async fn test_unit_failure_after_enable_is_torn_down() {
    let harness = TestHarness::new().await;
    // Enabling starts the unit, then every state query fails
    harness.supervisor.fail("status");

    let err = harness
        .lifecycle
        .provision(harness.request("acme", "api"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Supervisor(_)));
    harness.supervisor.clear_failures();

    let unit = format!("{}ws_acme_api.service", harness.config.unit_prefix);
    assert_eq!(harness.supervisor.state_of(&unit), UnitState::Inactive);
    assert!(!harness.supervisor.is_enabled(&unit));
    assert!(!harness.config.unit_dir.join(&unit).exists());

    let all = harness
        .lifecycle
        .list_workspaces(&WorkspaceFilters::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    let ws = &all[0];
    assert_eq!(ws.status, WorkspaceStatus::Error);
    assert!(!ws.is_running);
    assert!(ws.port.is_none());
    assert!(harness.allocated_ports().is_empty());
    assert!(harness.accounts.accounts().is_empty());
}

#[tokio::test]
async fn test_delete_failure_after_unit_removal_records_stopped_error() {
    let harness = TestHarness::new().await;
    let ws = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap().workspace;
    let unit = harness.unit_name(&ws);

    // A directory where the route file should be makes route removal fail
    let routes_file = harness.config.routes_file.clone();
    std::fs::remove_file(&routes_file).unwrap();
    std::fs::create_dir(&routes_file).unwrap();

    let err = harness.lifecycle.delete(&ws.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Route(_)));
    assert_eq!(harness.supervisor.state_of(&unit), UnitState::Inactive);

    let after = harness.lifecycle.get_workspace(&ws.id).await.unwrap();
    assert_eq!(after.status, WorkspaceStatus::Error);
    assert!(!after.is_running);
    assert!(after.error_message.is_some());

    // Once the route file is usable again the delete completes
    std::fs::remove_dir(&routes_file).unwrap();
    let deleted = harness.lifecycle.delete(&ws.id).await.unwrap();
    assert_eq!(deleted.workspace.status, WorkspaceStatus::Deleted);
    assert!(harness.allocated_ports().is_empty());
}

#[tokio::test]
async fn test_delete_from_stopped_releases_everything() {
    let harness = TestHarness::new().await;
    let ws = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap().workspace;
    let unit = harness.unit_name(&ws);
    harness.lifecycle.stop(&ws.id).await.unwrap();

    let deleted = harness.lifecycle.delete(&ws.id).await.unwrap();
    assert_eq!(deleted.outcome, Outcome::Applied);
    assert_eq!(deleted.workspace.status, WorkspaceStatus::Deleted);
    assert!(!deleted.workspace.is_running);
    // Kept for audit
    assert_eq!(deleted.workspace.port, Some(20000));

    assert!(harness.allocated_ports().is_empty());
    assert!(routes(&harness).routes().unwrap().is_empty());
    assert!(!harness.config.unit_dir.join(&unit).exists());
    assert!(harness.accounts.accounts().is_empty());

    let again = harness.lifecycle.delete(&ws.id).await.unwrap();
    assert_eq!(
        again.outcome,
        Outcome::NoOp {
            reason: NoOpReason::AlreadyDeleted
        }
    );

    // Port and names are free again
    let next = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap();
    assert_eq!(next.workspace.port, Some(20000));
    assert_eq!(next.workspace.os_user.as_deref(), Some("ws_acme_api"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_during_provision_ends_deleted() {
    let harness = TestHarness::new().await;
    let ws = harness
        .lifecycle
        .create_workspace(harness.request("acme", "api"))
        .await
        .unwrap();

    let lifecycle = Arc::clone(&harness.lifecycle);
    let id = ws.id.clone();
    let provision = tokio::spawn(async move { lifecycle.provision_workspace(&id).await });
    tokio::task::yield_now().await;
    harness.lifecycle.delete(&ws.id).await.unwrap();
    // Provision either finished first or found the workspace deleted
    let _ = provision.await.unwrap();

    let after = harness.lifecycle.get_workspace(&ws.id).await.unwrap();
    assert_eq!(after.status, WorkspaceStatus::Deleted);
    assert!(harness.allocated_ports().is_empty());
    assert!(routes(&harness).routes().unwrap().is_empty());
}

#[tokio::test]
async fn test_operations_on_pending_workspace_are_rejected() {
    let harness = TestHarness::new().await;
    let ws = harness
        .lifecycle
        .create_workspace(harness.request("acme", "api"))
        .await
        .unwrap();

    for result in [
        harness.lifecycle.start(&ws.id).await,
        harness.lifecycle.stop(&ws.id).await,
        harness.lifecycle.restart(&ws.id).await,
    ] {
        assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
    }

    let missing = harness.lifecycle.start("nope").await.unwrap_err();
    assert!(matches!(missing, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_get_status_corrects_drift() {
    let harness = TestHarness::new().await;
    let ws = harness.lifecycle.provision(harness.request("acme", "api")).await.unwrap().workspace;
    let unit = harness.unit_name(&ws);

    let report = harness.lifecycle.get_status(&ws.id).await.unwrap();
    assert!(!report.corrected);
    assert_eq!(report.domain.as_deref(), Some("api-acme.test.localhost"));

    // The service died behind the engine's back
    harness.supervisor.set_state(&unit, UnitState::Inactive);
    let report = harness.lifecycle.get_status(&ws.id).await.unwrap();
    assert!(report.corrected);
    assert_eq!(report.status, WorkspaceStatus::Stopped);
    assert!(!report.is_running);
    assert_eq!(report.unit_state, Some(UnitState::Inactive));

    let stored = harness.lifecycle.get_workspace(&ws.id).await.unwrap();
    assert_eq!(stored.status, WorkspaceStatus::Stopped);
    assert!(!stored.is_running);
}

#[tokio::test]
async fn test_reconcile_all_corrects_every_workspace() {
    let harness = TestHarness::new().await;
    let a = harness.lifecycle.provision(harness.request("acme", "a")).await.unwrap().workspace;
    let b = harness.lifecycle.provision(harness.request("acme", "b")).await.unwrap().workspace;
    harness.lifecycle.stop(&b.id).await.unwrap();

    harness.supervisor.set_state(&harness.unit_name(&a), UnitState::Failed);
    harness.supervisor.set_state(&harness.unit_name(&b), UnitState::Active);

    let report = harness.lifecycle.reconcile_all().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.corrected, 2);
    assert_eq!(report.errors, 0);

    let a = harness.lifecycle.get_workspace(&a.id).await.unwrap();
    assert_eq!(a.status, WorkspaceStatus::Error);
    assert!(!a.is_running);
    let b = harness.lifecycle.get_workspace(&b.id).await.unwrap();
    assert_eq!(b.status, WorkspaceStatus::Active);
    assert!(b.is_running);

    // Nothing left to fix
    let report = harness.lifecycle.reconcile_all().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.corrected, 0);
}
