//! Tests for the background provisioning pass.

use ws_api::provisioner::process_pending_workspaces;
use ws_orchestrator::test_utils::TestHarness;
use ws_orchestrator::WorkspaceStatus;

#[tokio::test]
async fn test_pending_workspaces_are_provisioned() {
    let harness = TestHarness::new().await;
    let first = harness
        .lifecycle
        .create_workspace(harness.request("acme", "api"))
        .await
        .unwrap();
    let second = harness
        .lifecycle
        .create_workspace(harness.request("acme", "web"))
        .await
        .unwrap();

    let provisioned = process_pending_workspaces(&harness.lifecycle).await.unwrap();
    assert_eq!(provisioned, 2);

    for id in [&first.id, &second.id] {
        let workspace = harness.lifecycle.get_workspace(id).await.unwrap();
        assert_eq!(workspace.status, WorkspaceStatus::Active);
        assert!(workspace.port.is_some());
    }

    // Nothing left to do on the next pass
    let provisioned = process_pending_workspaces(&harness.lifecycle).await.unwrap();
    assert_eq!(provisioned, 0);
}

#[tokio::test]
async fn test_failed_provision_does_not_stop_the_pass() {
    let harness = TestHarness::new().await;
    harness.handler.fail_always("configure");
    let failing = harness
        .lifecycle
        .create_workspace(harness.request("acme", "api"))
        .await
        .unwrap();

    let provisioned = process_pending_workspaces(&harness.lifecycle).await.unwrap();
    assert_eq!(provisioned, 0);

    let workspace = harness.lifecycle.get_workspace(&failing.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Error);

    // Error workspaces are not retried automatically
    harness.handler.reset();
    let provisioned = process_pending_workspaces(&harness.lifecycle).await.unwrap();
    assert_eq!(provisioned, 0);
}

#[tokio::test]
async fn test_workspace_with_retired_template_is_marked_error() {
    let harness = TestHarness::new().await;
    let workspace = harness
        .lifecycle
        .create_workspace(harness.request("acme", "api"))
        .await
        .unwrap();
    // The pinned version left the catalog since the workspace was queued
    sqlx::query("UPDATE workspaces SET template = 'dev@0' WHERE id = ?")
        .bind(&workspace.id)
        .execute(&harness.pool)
        .await
        .unwrap();

    let provisioned = process_pending_workspaces(&harness.lifecycle).await.unwrap();
    assert_eq!(provisioned, 0);

    let workspace = harness.lifecycle.get_workspace(&workspace.id).await.unwrap();
    assert_eq!(workspace.status, WorkspaceStatus::Error);
    assert!(workspace
        .error_message
        .as_deref()
        .unwrap()
        .contains("dev@0"));
    assert!(harness.lifecycle.pending_workspaces().await.unwrap().is_empty());
}
