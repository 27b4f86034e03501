//! Integration tests for the state store
//!
//! Covers:
//! - Workflow persistence across reopen
//! - Status filtering
//! - Gate open/close transactions
//! - Audit trail ordering per workflow

use gantry_core::{
    ApprovalMode, ApprovalRequest, AuditLogEntry, PhaseStatus, PhaseTemplate, Workflow,
    WorkflowDefinition, WorkflowStatus,
};
use gantry_store::{StateStore, WorkflowUpdate};
use serde_json::json;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to create a fresh store in a temporary directory
async fn create_test_store() -> (StateStore, TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("gantry.db");

    let store = StateStore::open(&db_path).await.expect("Failed to open store");
    store.init_schema().await.expect("Failed to init schema");

    (store, dir, db_path)
}

/// Commit a workflow state change the way the engine does
async fn save(
    store: &StateStore,
    workflow: &Workflow,
    opened: Option<&ApprovalRequest>,
    closed: &[String],
    audit: &[AuditLogEntry],
) {
    store
        .commit(WorkflowUpdate {
            workflow,
            opened,
            closed,
            audit,
        })
        .await
        .expect("Failed to commit");
}

fn phase(id: &str, deps: &[&str], gated: bool) -> PhaseTemplate {
    PhaseTemplate {
        id: id.to_string(),
        name: format!("Phase {}", id),
        description: String::new(),
        agent_type: "coder".to_string(),
        method: id.to_string(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        approval_required: gated,
        timeout: 30,
        max_retries: 0,
    }
}

fn definition() -> WorkflowDefinition {
    WorkflowDefinition {
        id: "three-step".to_string(),
        name: "Three step".to_string(),
        technology: "rust".to_string(),
        phases: vec![
            phase("a", &[], false),
            phase("b", &["a"], true),
            phase("c", &["b"], false),
        ],
        config: Default::default(),
    }
}

#[tokio::test]
async fn test_workflow_survives_reopen() {
    let (store, _dir, db_path) = create_test_store().await;

    let mut wf = Workflow::new(&definition(), "build a CLI", "/tmp/out", ApprovalMode::Batch);
    {
        let a = wf.phase_mut("a").unwrap();
        a.status = PhaseStatus::Completed;
        a.result = Some(json!({"spec": "done"}));
        a.retry_count = 1;
    }
    wf.current_phase = Some("b".to_string());
    save(&store, &wf, None, &[], &[]).await;
    drop(store);

    let reopened = StateStore::open(&db_path).await.expect("Failed to reopen");
    reopened.init_schema().await.unwrap();
    let loaded = reopened.load_workflow(&wf.id).await.expect("Failed to load");

    assert_eq!(loaded, wf);
    assert_eq!(loaded.phase("a").unwrap().retry_count, 1);
    assert_eq!(loaded.approval_mode, ApprovalMode::Batch);
}

#[tokio::test]
async fn test_list_workflows_by_status() {
    let (store, _dir, _path) = create_test_store().await;

    let running = Workflow::new(&definition(), "one", "/tmp/1", ApprovalMode::Interactive);
    let mut failed = Workflow::new(&definition(), "two", "/tmp/2", ApprovalMode::Interactive);
    failed.status = WorkflowStatus::Failed;
    let mut paused = Workflow::new(&definition(), "three", "/tmp/3", ApprovalMode::Interactive);
    paused.status = WorkflowStatus::Paused;

    for wf in [&running, &failed, &paused] {
        save(&store, wf, None, &[], &[]).await;
    }

    assert_eq!(store.list_workflows(None).await.unwrap().len(), 3);

    let only_failed = store
        .list_workflows(Some(WorkflowStatus::Failed))
        .await
        .unwrap();
    assert_eq!(only_failed.len(), 1);
    assert_eq!(only_failed[0].id, failed.id);

    let active: Vec<_> = store
        .list_active_workflows()
        .await
        .unwrap()
        .into_iter()
        .map(|wf| wf.id)
        .collect();
    assert_eq!(active.len(), 2);
    assert!(active.contains(&running.id));
    assert!(active.contains(&paused.id));
}

#[tokio::test]
async fn test_gate_open_and_close() {
    let (store, _dir, _path) = create_test_store().await;
    let def = definition();

    let mut wf = Workflow::new(&def, "req", "/tmp/out", ApprovalMode::Interactive);
    wf.phase_mut("b").unwrap().status = PhaseStatus::WaitingApproval;
    wf.status = WorkflowStatus::Paused;

    let request = ApprovalRequest::new(
        &wf.id,
        def.phase("b").unwrap(),
        json!({"code": "fn main() {}"}),
        Some("c".to_string()),
        0,
        None,
    )
    .unwrap();
    let opened = AuditLogEntry::system(&wf.id, "approval_requested", Some("b"), json!({}));
    save(&store, &wf, Some(&request), &[], &[opened]).await;

    let fetched = store
        .get_approval(&wf.id, "b")
        .await
        .unwrap()
        .expect("gate should be open");
    assert_eq!(fetched.id, request.id);
    assert_eq!(fetched.next_phase.as_deref(), Some("c"));
    assert_eq!(store.list_approvals(Some(&wf.id)).await.unwrap().len(), 1);

    wf.phase_mut("b").unwrap().status = PhaseStatus::Completed;
    wf.status = WorkflowStatus::Running;
    let decided = AuditLogEntry::new(&wf.id, "approval_approve", Some("b"), "alice", json!({}));
    save(&store, &wf, None, &["b".to_string()], &[decided]).await;

    assert!(store.get_approval(&wf.id, "b").await.unwrap().is_none());
    assert!(store.list_approvals(None).await.unwrap().is_empty());

    let loaded = store.load_workflow(&wf.id).await.unwrap();
    assert_eq!(loaded.phase("b").unwrap().status, PhaseStatus::Completed);

    let actions: Vec<_> = store
        .audit_log(&wf.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.action, e.actor))
        .collect();
    assert_eq!(
        actions,
        vec![
            ("approval_requested".to_string(), "system".to_string()),
            ("approval_approve".to_string(), "alice".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_reopening_gate_replaces_request() {
    let (store, _dir, _path) = create_test_store().await;
    let def = definition();
    let wf = Workflow::new(&def, "req", "/tmp/out", ApprovalMode::Interactive);

    let gated = def.phase("b").unwrap();
    let first = ApprovalRequest::new(&wf.id, gated, json!(1), None, 0, None).unwrap();
    let second = ApprovalRequest::new(&wf.id, gated, json!(2), None, 1, None).unwrap();
    save(&store, &wf, Some(&first), &[], &[]).await;
    save(&store, &wf, Some(&second), &[], &[]).await;

    let open = store.list_approvals(Some(&wf.id)).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, second.id);
    assert_eq!(open[0].retry_count_at_gate, 1);
}

#[tokio::test]
async fn test_audit_log_is_per_workflow() {
    let (store, _dir, _path) = create_test_store().await;
    let one = Workflow::new(&definition(), "one", "/tmp/1", ApprovalMode::Interactive);
    let two = Workflow::new(&definition(), "two", "/tmp/2", ApprovalMode::Interactive);

    let started =
        |wf: &Workflow| AuditLogEntry::system(&wf.id, "workflow_started", None, json!({}));
    save(&store, &one, None, &[], &[started(&one)]).await;
    save(&store, &two, None, &[], &[started(&two)]).await;
    let phase_started = AuditLogEntry::system(&one.id, "phase_started", Some("a"), json!({}));
    save(&store, &one, None, &[], &[phase_started]).await;

    let log = store.audit_log(&one.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].action, "workflow_started");
    assert_eq!(log[1].phase_id.as_deref(), Some("a"));
    assert_eq!(store.audit_log(&two.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_commit_moves_gate_between_phases() {
    let (store, _dir, _path) = create_test_store().await;
    let def = definition();
    let wf = Workflow::new(&def, "req", "/tmp/out", ApprovalMode::Interactive);

    let on_b = ApprovalRequest::new(&wf.id, def.phase("b").unwrap(), json!({}), None, 0, None)
        .unwrap();
    save(&store, &wf, Some(&on_b), &[], &[]).await;

    let on_c = ApprovalRequest::new(&wf.id, def.phase("c").unwrap(), json!({}), None, 0, None)
        .unwrap();
    let closed = vec!["b".to_string()];
    let audit = vec![AuditLogEntry::system(&wf.id, "approval_requested", Some("c"), json!({}))];
    store
        .commit(WorkflowUpdate {
            workflow: &wf,
            opened: Some(&on_c),
            closed: &closed,
            audit: &audit,
        })
        .await
        .unwrap();

    let open: Vec<_> = store
        .list_approvals(None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.phase_id)
        .collect();
    assert_eq!(open, vec!["c".to_string()]);
    assert_eq!(store.audit_log(&wf.id).await.unwrap().len(), 1);
}
