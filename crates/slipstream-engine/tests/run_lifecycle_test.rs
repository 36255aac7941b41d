// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end run lifecycle tests over the in-memory store and the mock
//! workflow service.

mod common;

use std::collections::HashMap;

use common::{Harness, suite_yaml, suite_yaml_full};
use slipstream_engine::error::EngineError;
use slipstream_engine::state::{RunStatus, TestStatus};
use slipstream_engine::store::{EnvironmentRecord, RunStore};
use uuid::Uuid;

#[tokio::test]
async fn test_happy_path_two_tests_pass() {
    let h = Harness::manual();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(&owner, suite_yaml("checkout", &["t1", "t2"]).as_bytes(), None)
        .await
        .unwrap();
    assert_eq!(run_id.len(), 26);

    let started = h.wait_for_starts(2).await;
    for workflow_id in &started {
        h.workflows
            .complete_workflow(workflow_id, serde_json::json!({}))
            .await;
    }

    let details = h.wait_for_terminal(&owner, &run_id).await;
    assert_eq!(details.run.status, RunStatus::Passed);
    assert!(details.run.ended_at.is_some());
    assert_eq!(details.tests.len(), 2);
    assert!(
        details
            .tests
            .iter()
            .all(|t| t.status == TestStatus::Passed && t.ended_at.is_some())
    );
    assert_eq!(details.run.totals.total, 2);
    assert_eq!(details.run.totals.passed, 2);

    // Exactly one summary line.
    let messages = h.persisted_log_messages(&run_id).await;
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.as_str() == "All 2 tests passed.")
            .count(),
        1
    );

    // The persisted run agrees with memory.
    let record = h
        .store
        .get_run(Some(h.org_id), &run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, "passed");
    assert_eq!(record.passed_tests, 2);
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn test_mixed_failure_summary_counts() {
    let h = Harness::manual();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(
            &owner,
            suite_yaml("checkout", &["t1", "t2", "t3"]).as_bytes(),
            None,
        )
        .await
        .unwrap();

    let started = h.wait_for_starts(3).await;
    h.workflows
        .complete_workflow(&started[0], serde_json::json!({}))
        .await;
    h.workflows.fail_workflow(&started[1], "assertion failed").await;
    h.workflows
        .complete_workflow(&started[2], serde_json::json!({}))
        .await;

    let details = h.wait_for_terminal(&owner, &run_id).await;
    assert_eq!(details.run.status, RunStatus::Failed);
    assert_eq!(details.run.totals.passed, 2);
    assert_eq!(details.run.totals.failed, 1);

    let messages = h.persisted_log_messages(&run_id).await;
    assert!(
        messages
            .iter()
            .any(|m| m == "2/3 tests passed, 1/3 tests failed."),
        "summary line must carry the literal counts, got: {messages:?}"
    );

    // The failed test carries the cleaned error message.
    let failed = h.store.get_run_test(&started[1]).unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.error_message.as_deref(), Some("assertion failed"));
}

#[tokio::test]
async fn test_suite_init_failure_marks_run_failed_without_tests() {
    let h = Harness::manual();
    let owner = h.owner();
    let engine = h.engine.clone();

    let payload = suite_yaml_full("checkout", &["t1", "t2"]).into_bytes();
    let handle = {
        let owner = owner.clone();
        tokio::spawn(async move { engine.create_run(&owner, &payload, None).await })
    };

    // Fail the suite-init workflow as soon as it starts.
    let started = h.wait_for_starts(1).await;
    assert!(started[0].ends_with("_suite_init"));
    h.workflows
        .fail_workflow(&started[0], "fixtures unavailable")
        .await;

    // CreateRun still returns the run id, not an error.
    let run_id = handle.await.unwrap().unwrap();

    let details = h.wait_for_terminal(&owner, &run_id).await;
    assert_eq!(details.run.status, RunStatus::Failed);
    assert!(details.tests.is_empty());
    assert_eq!(details.run.totals.total, 2);
    assert_eq!(details.run.totals.passed, 0);
    assert_eq!(details.run.totals.failed, 0);

    // No test workflows were started; cleanup launched in failure mode.
    let cleanup_id = format!("{run_id}_suite_cleanup");
    let started = h.wait_for_starts(2).await;
    assert_eq!(started.len(), 2);
    assert_eq!(started[1], cleanup_id);
    let input = h.workflows.input_of(&cleanup_id).await.unwrap();
    assert_eq!(input["treat_as_failure"], serde_json::json!(true));
    assert_eq!(
        h.workflows.type_of(&cleanup_id).await,
        Some(slipstream_engine::workflow::WorkflowType::SuiteCleanup)
    );

    // At most one cleanup, ever.
    assert_eq!(h.workflows.starts_with_suffix("_suite_cleanup").await, 1);
}

#[tokio::test]
async fn test_workflow_start_failure_fails_run_and_errors() {
    let h = Harness::with_workflows(slipstream_engine::workflow::MockWorkflows::failing_starts());
    let owner = h.owner();

    let result = h
        .engine
        .create_run(&owner, suite_yaml("checkout", &["t1"]).as_bytes(), None)
        .await;
    assert!(result.is_err());

    // The persisted view still shows a terminal failed run.
    let runs = h
        .store
        .list_runs(&slipstream_engine::store::RunFilter {
            org_id: Some(h.org_id),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "failed");
    assert!(runs[0].ended_at.is_some());
}

#[tokio::test]
async fn test_zero_test_suite_is_rejected() {
    let h = Harness::manual();
    let owner = h.owner();

    let err = h
        .engine
        .create_run(&owner, b"name: empty\ntests: []\n", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));

    let err = h.engine.create_run(&owner, b"", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Suite(_)));
}

#[tokio::test]
async fn test_unknown_environment_slug_is_rejected() {
    let h = Harness::manual();
    let owner = h.owner();

    let payload = "name: env suite\nenvironment: staging\ntests:\n  - name: t1\n";
    let err = h
        .engine
        .create_run(&owner, payload.as_bytes(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(msg) if msg.contains("staging")));
}

#[tokio::test]
async fn test_environment_secrets_reach_test_workflows() {
    let h = Harness::manual();
    let owner = h.owner();

    h.store.add_environment(EnvironmentRecord {
        id: Uuid::new_v4(),
        org_id: h.org_id,
        slug: "staging".to_string(),
        secrets: HashMap::from([("API_KEY".to_string(), "abc".to_string())]),
    });

    let payload = format!("environment: staging\n{}", suite_yaml("env suite", &["t1"]));
    let run_id = h
        .engine
        .create_run(&owner, payload.as_bytes(), None)
        .await
        .unwrap();

    let started = h.wait_for_starts(1).await;
    let input = h.workflows.input_of(&started[0]).await.unwrap();
    assert_eq!(input["env"]["API_KEY"], serde_json::json!("abc"));
    assert_eq!(input["run_id"], serde_json::json!(run_id));
}

#[tokio::test]
async fn test_get_run_by_prefix() {
    let h = Harness::auto();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(&owner, suite_yaml("prefixed", &["t1"]).as_bytes(), None)
        .await
        .unwrap();

    let details = h.engine.get_run(&owner, &run_id[..8]).await.unwrap();
    assert_eq!(details.run.run_id, run_id);

    let err = h.engine.get_run(&owner, "zzzzzzzz").await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound(_)));
}

#[tokio::test]
async fn test_cross_org_lookup_reads_as_not_found() {
    let h = Harness::auto();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(&owner, suite_yaml("scoped", &["t1"]).as_bytes(), None)
        .await
        .unwrap();

    let err = h
        .engine
        .get_run(&h.foreign_owner(), &run_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound(_)));
}

#[tokio::test]
async fn test_log_stream_delivers_every_line_in_order() {
    let h = Harness::manual();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(&owner, suite_yaml("streamed", &["t1"]).as_bytes(), None)
        .await
        .unwrap();
    let started = h.wait_for_starts(1).await;

    let mut rx = h.engine.stream_logs(&owner, &run_id).await.unwrap();
    let collector = tokio::spawn(async move {
        let mut messages = Vec::new();
        while let Some(line) = rx.recv().await {
            messages.push(line.message);
        }
        messages
    });

    for i in 0..3 {
        h.engine
            .add_log(
                &owner,
                &run_id,
                slipstream_engine::state::LogLine::plain(format!("workflow says {i}")),
            )
            .await;
    }
    h.workflows
        .complete_workflow(&started[0], serde_json::json!({}))
        .await;
    h.wait_for_terminal(&owner, &run_id).await;

    let streamed = collector.await.unwrap();
    let persisted = h.persisted_log_messages(&run_id).await;
    assert_eq!(
        streamed, persisted,
        "stream must deliver every appended line exactly once, in order"
    );
    assert!(streamed.iter().any(|m| m == "workflow says 2"));
    assert!(streamed.iter().any(|m| m == "All 1 tests passed."));
}

#[tokio::test]
async fn test_stream_replays_persisted_logs_for_non_resident_runs() {
    let h = Harness::auto();
    let owner = h.owner();

    let run_id = h
        .engine
        .create_run(&owner, suite_yaml("replayed", &["t1"]).as_bytes(), None)
        .await
        .unwrap();
    h.wait_for_terminal(&owner, &run_id).await;

    // A second engine sharing the store has no memory of the run.
    let fresh = Harness::with_workflows(slipstream_engine::workflow::MockWorkflows::manual());
    let engine = slipstream_engine::engine::Engine::new(
        Some(h.store.clone() as std::sync::Arc<dyn slipstream_engine::store::RunStore>),
        fresh.workflows.clone() as std::sync::Arc<dyn slipstream_engine::workflow::WorkflowService>,
    );

    let mut rx = engine.stream_logs(&owner, &run_id).await.unwrap();
    let mut replayed = Vec::new();
    while let Some(line) = rx.recv().await {
        replayed.push(line.message);
    }
    assert_eq!(replayed, h.persisted_log_messages(&run_id).await);
}

#[tokio::test]
async fn test_add_log_on_unknown_run_is_discarded() {
    let h = Harness::manual();
    let owner = h.owner();

    h.engine
        .add_log(
            &owner,
            "01jzzzzzzzzzzzzzzzzzzzzzzz",
            slipstream_engine::state::LogLine::plain("orphan"),
        )
        .await;

    assert!(
        h.persisted_log_messages("01jzzzzzzzzzzzzzzzzzzzzzzz")
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn test_list_runs_filters_and_orders() {
    let h = Harness::auto();
    let owner = h.owner();

    let first = h
        .engine
        .create_run(&owner, suite_yaml("alpha", &["t1"]).as_bytes(), None)
        .await
        .unwrap();
    let second = h
        .engine
        .create_run(&owner, suite_yaml("beta", &["t1"]).as_bytes(), None)
        .await
        .unwrap();
    h.wait_for_terminal(&owner, &first).await;
    h.wait_for_terminal(&owner, &second).await;

    let runs = h
        .engine
        .list_runs(
            &owner,
            &slipstream_engine::service::ListQuery {
                order_by: "started_at".to_string(),
                descending: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, second);
    assert_eq!(runs[1].run_id, first);

    let err = h
        .engine
        .list_runs(
            &owner,
            &slipstream_engine::service::ListQuery {
                order_by: "suite_name".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_run_ids_are_time_ordered() {
    let h = Harness::auto();
    let owner = h.owner();

    let mut run_ids = Vec::new();
    for _ in 0..5 {
        run_ids.push(
            h.engine
                .create_run(&owner, suite_yaml("ordered", &["t1"]).as_bytes(), None)
                .await
                .unwrap(),
        );
    }

    let mut sorted = run_ids.clone();
    sorted.sort();
    assert_eq!(run_ids, sorted);
}
