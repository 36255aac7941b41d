// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness for engine integration tests.
//!
//! Builds an engine over the in-memory store and the mock workflow service,
//! plus helpers for suites, principals and terminal-state polling.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use slipstream_engine::auth::Principal;
use slipstream_engine::engine::{Engine, EngineOptions};
use slipstream_engine::service::RunDetails;
use slipstream_engine::store::{MemoryRunStore, RunStore};
use slipstream_engine::workflow::{MockWorkflows, WorkflowService};
use uuid::Uuid;

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryRunStore>,
    pub workflows: Arc<MockWorkflows>,
    pub org_id: Uuid,
}

impl Harness {
    /// Engine over a fresh store and the given workflow double, with short
    /// deadlines suitable for tests.
    pub fn with_workflows(workflows: MockWorkflows) -> Self {
        let store = Arc::new(MemoryRunStore::new());
        let workflows = Arc::new(workflows);
        let engine = Engine::with_options(
            Some(store.clone() as Arc<dyn RunStore>),
            workflows.clone() as Arc<dyn WorkflowService>,
            EngineOptions {
                monitor_timeout: Duration::from_secs(5),
                cleanup_timeout: Duration::from_secs(5),
                ..EngineOptions::default()
            },
        );
        Self {
            engine,
            store,
            workflows,
            org_id: Uuid::new_v4(),
        }
    }

    /// Harness whose workflows wait for the test to script their outcome.
    pub fn manual() -> Self {
        Self::with_workflows(MockWorkflows::manual())
    }

    /// Harness whose workflows auto-complete successfully.
    pub fn auto() -> Self {
        Self::with_workflows(MockWorkflows::new())
    }

    /// An owner principal in the harness org.
    pub fn owner(&self) -> Principal {
        Principal {
            subject: "user-1".to_string(),
            email: Some("tester@example.test".to_string()),
            username: Some("tester".to_string()),
            org_id: Some(self.org_id),
            roles: vec!["owner".to_string()],
            scopes: Vec::new(),
        }
    }

    /// An owner principal in a different org.
    pub fn foreign_owner(&self) -> Principal {
        Principal {
            org_id: Some(Uuid::new_v4()),
            ..self.owner()
        }
    }

    /// Poll until the run reaches a terminal status.
    pub async fn wait_for_terminal(&self, principal: &Principal, run_id: &str) -> RunDetails {
        for _ in 0..500 {
            let details = self
                .engine
                .get_run(principal, run_id)
                .await
                .expect("run lookup");
            if details.run.status.is_terminal() {
                return details;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run '{run_id}' did not reach a terminal status");
    }

    /// Poll the started-workflow list until `count` workflows exist, and
    /// return their ids in start order.
    pub async fn wait_for_starts(&self, count: usize) -> Vec<String> {
        for _ in 0..500 {
            let started = self.workflows.started_ids().await;
            if started.len() >= count {
                return started;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} workflow starts");
    }

    /// Messages of the persisted log of a run, in append order.
    pub async fn persisted_log_messages(&self, run_id: &str) -> Vec<String> {
        self.store
            .list_run_logs(run_id)
            .await
            .expect("list run logs")
            .into_iter()
            .map(|l| l.message)
            .collect()
    }
}

/// A suite payload with the given test names.
pub fn suite_yaml(name: &str, tests: &[&str]) -> String {
    let mut yaml = format!("name: {name}\ntests:\n");
    for test in tests {
        yaml.push_str(&format!("  - name: {test}\n    steps:\n      - name: step one\n        plugin: http\n"));
    }
    yaml
}

/// A suite payload with init and cleanup sections.
pub fn suite_yaml_full(name: &str, tests: &[&str]) -> String {
    let mut yaml = format!(
        "name: {name}\ninit:\n  - name: seed\n    plugin: sql\ncleanup:\n  steps:\n    - name: teardown\n      plugin: sql\ntests:\n"
    );
    for test in tests {
        yaml.push_str(&format!("  - name: {test}\n    steps:\n      - name: step one\n        plugin: http\n"));
    }
    yaml
}

/// A suite payload with a cleanup section but no init.
pub fn suite_yaml_with_cleanup(name: &str, tests: &[&str]) -> String {
    let mut yaml = format!(
        "name: {name}\ncleanup:\n  steps:\n    - name: teardown\n      plugin: sql\ntests:\n"
    );
    for test in tests {
        yaml.push_str(&format!("  - name: {test}\n    steps:\n      - name: step one\n        plugin: http\n"));
    }
    yaml
}
