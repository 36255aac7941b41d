// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciler tests: workflow-service reconciliation of stale rows and the
//! stale-run safety net.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::Harness;
use slipstream_engine::reconciler::{Reconciler, ReconcilerConfig};
use slipstream_engine::store::{RunRecord, RunStore, RunTestRecord};
use slipstream_engine::workflow::{WorkflowDescription, WorkflowRunStatus, WorkflowService};

fn reconciler_for(h: &Harness) -> Reconciler {
    Reconciler::new(
        h.engine.clone(),
        h.store.clone() as Arc<dyn RunStore>,
        h.workflows.clone() as Arc<dyn WorkflowService>,
        ReconcilerConfig::default(),
    )
}

/// Seed a run + one run test directly in the store, as if another engine
/// instance crashed mid-run.
async fn seed_orphaned_run(h: &Harness, age_minutes: i64) -> (String, String) {
    let run_id = slipstream_engine::ids::new_id();
    let workflow_id = slipstream_engine::ids::new_id();
    let started = Utc::now() - ChronoDuration::minutes(age_minutes);

    h.store
        .insert_run(&RunRecord {
            run_id: run_id.clone(),
            org_id: h.org_id,
            project_id: None,
            suite_id: None,
            suite_name: "orphaned".to_string(),
            status: "running".to_string(),
            initiator: "tester".to_string(),
            trigger: "manual".to_string(),
            schedule_name: None,
            config_source: "uncommitted".to_string(),
            source: "cli-local".to_string(),
            branch: None,
            commit_sha: None,
            bundle_sha: None,
            total_tests: 1,
            passed_tests: 0,
            failed_tests: 0,
            timeout_tests: 0,
            started_at: started,
            ended_at: None,
            created_at: started,
            updated_at: started,
        })
        .await
        .unwrap();
    h.store
        .insert_run_test(&RunTestRecord {
            workflow_id: workflow_id.clone(),
            run_id: run_id.clone(),
            test_id: None,
            name: "t1".to_string(),
            status: "pending".to_string(),
            started_at: started,
            ended_at: None,
            duration_ms: 0,
            step_count: 1,
            error_message: None,
        })
        .await
        .unwrap();

    (run_id, workflow_id)
}

#[tokio::test]
async fn test_completed_workflow_is_reconciled_to_passed() {
    let h = Harness::manual();
    let (run_id, workflow_id) = seed_orphaned_run(&h, 10).await;

    let close_time = Utc::now() - ChronoDuration::minutes(5);
    h.workflows
        .set_description(
            &workflow_id,
            WorkflowDescription {
                status: WorkflowRunStatus::Completed,
                close_time: Some(close_time),
            },
        )
        .await;

    reconciler_for(&h).tick().await.unwrap();

    let test = h.store.get_run_test(&workflow_id).unwrap();
    assert_eq!(test.status, "passed");
    assert_eq!(test.ended_at, Some(close_time));

    let run = h.store.get_run(None, &run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "passed");
    assert_eq!(run.passed_tests, 1);
    assert_eq!(run.ended_at, Some(close_time));
}

#[tokio::test]
async fn test_terminated_and_canceled_closures_map_to_failed() {
    let h = Harness::manual();
    let (run_id, workflow_id) = seed_orphaned_run(&h, 10).await;

    h.workflows
        .set_description(
            &workflow_id,
            WorkflowDescription {
                status: WorkflowRunStatus::Terminated,
                close_time: Some(Utc::now()),
            },
        )
        .await;

    reconciler_for(&h).tick().await.unwrap();

    assert_eq!(h.store.get_run_test(&workflow_id).unwrap().status, "failed");
    let run = h.store.get_run(None, &run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
}

#[tokio::test]
async fn test_running_workflow_is_left_alone() {
    let h = Harness::manual();
    let (run_id, workflow_id) = seed_orphaned_run(&h, 10).await;

    h.workflows
        .set_description(
            &workflow_id,
            WorkflowDescription {
                status: WorkflowRunStatus::Running,
                close_time: None,
            },
        )
        .await;

    reconciler_for(&h).tick().await.unwrap();

    assert_eq!(h.store.get_run_test(&workflow_id).unwrap().status, "pending");
    let run = h.store.get_run(None, &run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "running");
}

#[tokio::test]
async fn test_unknown_workflow_is_left_to_the_safety_net() {
    let h = Harness::manual();
    let (run_id, workflow_id) = seed_orphaned_run(&h, 10).await;

    // No description registered: describe answers NotFound.
    reconciler_for(&h).tick().await.unwrap();

    assert_eq!(h.store.get_run_test(&workflow_id).unwrap().status, "pending");
    assert_eq!(
        h.store.get_run(None, &run_id).await.unwrap().unwrap().status,
        "running"
    );
}

#[tokio::test]
async fn test_safety_net_force_fails_stale_runs() {
    let h = Harness::manual();
    // Three hours old: past the two-hour stale threshold.
    let (run_id, workflow_id) = seed_orphaned_run(&h, 180).await;

    reconciler_for(&h).tick().await.unwrap();

    let test = h.store.get_run_test(&workflow_id).unwrap();
    assert_eq!(test.status, "failed");
    assert!(test.error_message.unwrap().contains("stale"));

    let run = h.store.get_run(None, &run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.failed_tests, 1);
    assert!(run.ended_at.is_some());
}

#[tokio::test]
async fn test_fresh_rows_are_not_touched() {
    let h = Harness::manual();
    // One minute old: inside the running grace period.
    let (run_id, workflow_id) = seed_orphaned_run(&h, 1).await;

    h.workflows
        .set_description(
            &workflow_id,
            WorkflowDescription {
                status: WorkflowRunStatus::Completed,
                close_time: Some(Utc::now()),
            },
        )
        .await;

    reconciler_for(&h).tick().await.unwrap();

    assert_eq!(h.store.get_run_test(&workflow_id).unwrap().status, "pending");
    assert_eq!(
        h.store.get_run(None, &run_id).await.unwrap().unwrap().status,
        "running"
    );
}

#[tokio::test]
async fn test_memory_and_store_agree_after_reconciliation() {
    // A run created through the engine, whose workflow closes behind the
    // engine's back (monitor still waiting): within one tick the store view
    // becomes terminal without disturbing the in-memory invariants.
    let h = Harness::manual();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(&owner, common::suite_yaml("agree", &["t1"]).as_bytes(), None)
        .await
        .unwrap();
    let started = h.wait_for_starts(1).await;

    h.workflows
        .complete_workflow(&started[0], serde_json::json!({}))
        .await;
    let details = h.wait_for_terminal(&owner, &run_id).await;

    reconciler_for(&h).tick().await.unwrap();

    let record = h.store.get_run(None, &run_id).await.unwrap().unwrap();
    assert_eq!(record.status, details.run.status.as_str());
}

#[tokio::test]
async fn test_reconciler_batch_seed_is_isolated() {
    let h = Harness::manual();
    let (failing_run, failing_wf) = seed_orphaned_run(&h, 10).await;
    let (passing_run, passing_wf) = seed_orphaned_run(&h, 10).await;

    h.workflows
        .set_description(
            &failing_wf,
            WorkflowDescription {
                status: WorkflowRunStatus::Failed,
                close_time: Some(Utc::now()),
            },
        )
        .await;
    h.workflows
        .set_description(
            &passing_wf,
            WorkflowDescription {
                status: WorkflowRunStatus::Completed,
                close_time: Some(Utc::now()),
            },
        )
        .await;

    reconciler_for(&h).tick().await.unwrap();

    assert_eq!(
        h.store.get_run(None, &failing_run).await.unwrap().unwrap().status,
        "failed"
    );
    assert_eq!(
        h.store.get_run(None, &passing_run).await.unwrap().unwrap().status,
        "passed"
    );
}

#[tokio::test]
async fn test_cancelled_runs_are_not_reopened() {
    let h = Harness::manual();
    let (run_id, workflow_id) = seed_orphaned_run(&h, 10).await;

    // Another instance cancelled the run meanwhile.
    h.store
        .update_run(
            &run_id,
            "cancelled",
            Some(Utc::now()),
            &slipstream_engine::store::RunTotals {
                total: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.workflows
        .set_description(
            &workflow_id,
            WorkflowDescription {
                status: WorkflowRunStatus::Completed,
                close_time: Some(Utc::now()),
            },
        )
        .await;

    reconciler_for(&h).tick().await.unwrap();

    // The test row reconciles, the run status stays cancelled.
    assert_eq!(h.store.get_run_test(&workflow_id).unwrap().status, "passed");
    assert_eq!(
        h.store.get_run(None, &run_id).await.unwrap().unwrap().status,
        "cancelled"
    );
}
