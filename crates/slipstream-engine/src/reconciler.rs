// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciler for stale run state.
//!
//! The engine's in-memory state dies with the process; the store and the
//! workflow service survive. The reconciler walks the gap in two phases:
//!
//! 1. Fast phase: run tests that have been non-terminal past the running
//!    grace period are checked against the workflow service's `describe`;
//!    closed workflows are written back as terminal rows and the affected
//!    runs re-checked via the DB-only finalizer.
//! 2. Safety net: runs stuck in RUNNING past the stale threshold get their
//!    remaining tests force-failed and the run closed as FAILED.
//!
//! The reconciler only ever writes transitions into terminal states, and
//! only when the workflow service or the stale threshold justifies it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::state::{RunStatus, TestStatus};
use crate::store::{RunStore, RunTotals};
use crate::workflow::{WorkflowError, WorkflowRunStatus, WorkflowService};

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to reconcile.
    pub poll_interval: Duration,
    /// Upper bound on one tick.
    pub tick_timeout: Duration,
    /// How long a run test may stay non-terminal before the fast phase
    /// checks the workflow service.
    pub running_grace: Duration,
    /// How long a run may stay RUNNING before the safety net force-fails it.
    pub stale_run_threshold: Duration,
    /// Maximum run tests per fast-phase batch.
    pub batch_size: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            tick_timeout: Duration::from_secs(2 * 60),
            running_grace: Duration::from_secs(3 * 60),
            stale_run_threshold: Duration::from_secs(2 * 60 * 60),
            batch_size: 500,
        }
    }
}

/// Map a workflow closure status to the run-test status to persist.
/// `None` means leave the row alone.
fn db_status_for(status: WorkflowRunStatus) -> Option<TestStatus> {
    match status {
        WorkflowRunStatus::Completed => Some(TestStatus::Passed),
        WorkflowRunStatus::Failed => Some(TestStatus::Failed),
        WorkflowRunStatus::TimedOut => Some(TestStatus::Timeout),
        WorkflowRunStatus::Canceled | WorkflowRunStatus::Terminated => Some(TestStatus::Failed),
        WorkflowRunStatus::Running
        | WorkflowRunStatus::ContinuedAsNew
        | WorkflowRunStatus::Unknown => None,
    }
}

/// Reconciler daemon.
pub struct Reconciler {
    engine: Arc<Engine>,
    store: Arc<dyn RunStore>,
    workflows: Arc<dyn WorkflowService>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler over the engine's store and workflow service.
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<dyn RunStore>,
        workflows: Arc<dyn WorkflowService>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            workflows,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciler loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            running_grace_secs = self.config.running_grace.as_secs(),
            stale_run_threshold_secs = self.config.stale_run_threshold.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match tokio::time::timeout(self.config.tick_timeout, self.tick()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => error!(error = %err, "Reconciler tick failed"),
                        Err(_) => error!("Reconciler tick exceeded its deadline"),
                    }
                }
            }
        }
    }

    /// One reconciliation tick: fast phase then safety net.
    pub async fn tick(&self) -> crate::error::Result<()> {
        self.reconcile_run_tests().await?;
        self.fail_stale_runs().await?;
        Ok(())
    }

    /// Fast phase: ask the workflow service about tests that have been
    /// non-terminal longer than the running grace period.
    async fn reconcile_run_tests(&self) -> crate::error::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.running_grace).unwrap_or_default();
        let stale = self
            .store
            .list_stale_run_tests(cutoff, self.config.batch_size)
            .await?;

        if stale.is_empty() {
            debug!("no stale run tests");
            return Ok(());
        }

        info!(count = stale.len(), "reconciling stale run tests");

        let mut affected_runs: HashSet<String> = HashSet::new();

        for test in stale {
            let description = match self.workflows.describe(&test.workflow_id).await {
                Ok(description) => description,
                Err(WorkflowError::NotFound(_)) => {
                    // Unknown to the service: leave it to the safety net.
                    debug!(workflow_id = %test.workflow_id, "workflow unknown to the service");
                    continue;
                }
                Err(err) => {
                    warn!(workflow_id = %test.workflow_id, error = %err, "describe failed");
                    continue;
                }
            };

            let Some(status) = db_status_for(description.status) else {
                continue;
            };

            let close_time = description.close_time.unwrap_or_else(Utc::now);
            let duration_ms = (close_time - test.started_at).num_milliseconds().max(0);
            let error_message = match status {
                TestStatus::Failed => Some("workflow closed without reporting a result"),
                TestStatus::Timeout => Some("workflow timed out"),
                _ => None,
            };

            info!(
                workflow_id = %test.workflow_id,
                run_id = %test.run_id,
                status = status.as_str(),
                "reconciling run test from workflow service"
            );

            if let Err(err) = self
                .store
                .update_run_test_status(
                    &test.workflow_id,
                    status.as_str(),
                    Some(close_time),
                    duration_ms,
                    error_message,
                )
                .await
            {
                warn!(workflow_id = %test.workflow_id, error = %err, "failed to persist reconciled status");
                continue;
            }
            affected_runs.insert(test.run_id);
        }

        for run_id in affected_runs {
            if let Err(err) = self.engine.check_if_run_finished_from_db(&run_id).await {
                warn!(%run_id, error = %err, "db-side finish check failed");
            }
        }

        Ok(())
    }

    /// Safety net: force-complete runs stuck in RUNNING past the stale
    /// threshold.
    async fn fail_stale_runs(&self) -> crate::error::Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_run_threshold).unwrap_or_default();
        let stale = self.store.list_stale_runs(cutoff).await?;

        if stale.is_empty() {
            return Ok(());
        }

        warn!(count = stale.len(), "force-failing stale runs");

        for run in stale {
            let forced = self
                .store
                .fail_pending_run_tests(&run.run_id, "run exceeded the stale threshold")
                .await?;

            let tests = self.store.list_run_tests(&run.run_id).await?;
            let mut totals = RunTotals {
                total: tests.len() as i32,
                ..RunTotals::default()
            };
            for test in &tests {
                match TestStatus::parse(&test.status) {
                    TestStatus::Passed => totals.passed += 1,
                    TestStatus::Failed => totals.failed += 1,
                    TestStatus::Timeout => totals.timed_out += 1,
                    TestStatus::Pending => totals.failed += 1,
                }
            }

            warn!(
                run_id = %run.run_id,
                forced_failures = forced,
                started_at = %run.started_at,
                "force-failed stale run"
            );

            self.store
                .update_run(
                    &run.run_id,
                    RunStatus::Failed.as_str(),
                    Some(Utc::now()),
                    &totals,
                )
                .await?;
        }

        Ok(())
    }
}
