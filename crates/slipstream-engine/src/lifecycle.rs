// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle: workflow monitors, the run finalizer, and suite cleanup.
//!
//! Each started test workflow gets one monitor task that awaits its terminal
//! result under a deadline. `update_test_status` is the single mutation
//! point for test records and stays correct under concurrent sibling
//! completions: it persists first (so a crash mid-finalization is
//! recoverable), mutates in-memory state under the write lock, then runs the
//! terminal-decision check.
//!
//! Suite cleanup launches at most once per run: the `suite_cleanup_ran` flag
//! flips under the write lock before the cleanup task is spawned, whatever
//! the trigger source (finalizer, init failure, start failure, cancel).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::state::{LogLine, RunStatus, ScheduleRef, TestCounts, TestStatus};
use crate::store::RunTotals;
use crate::suite::CleanupSpec;
use crate::workflow::{WorkflowError, WorkflowOptions, WorkflowType};

/// Synthetic error injected when a monitor's deadline elapses before the
/// workflow reports a result.
pub const MONITOR_TIMEOUT_ERROR: &str = "workflow monitoring timeout";

/// A terminal test failure as observed by a monitor.
#[derive(Debug, Clone)]
pub(crate) struct TestFailure {
    pub message: String,
    pub timed_out: bool,
}

/// Snapshot handed to a detached suite-cleanup task. Values are copies taken
/// under the state lock; the task never holds a reference into [`Engine`]
/// state.
pub(crate) struct CleanupLaunch {
    run_id: String,
    spec: CleanupSpec,
    vars: serde_json::Map<String, Value>,
    globals: HashMap<String, String>,
    openapi: Option<crate::suite::OpenApiConfig>,
    env_secrets: HashMap<String, String>,
    treat_as_failure: bool,
}

/// Strip workflow-runtime wrapper prefixes from a raw error chain, leaving
/// the user-facing text.
pub(crate) fn clean_error_message(raw: &str) -> String {
    let mut message = raw.trim();
    let prefixes = [
        "workflow execution error:",
        "workflow task error:",
        "activity error:",
        "workflow error:",
    ];
    loop {
        let mut stripped = false;
        for prefix in prefixes {
            if let Some(rest) = message.strip_prefix(prefix) {
                message = rest.trim_start();
                stripped = true;
            }
        }
        if !stripped {
            break;
        }
    }
    message.to_string()
}

fn totals_from_counts(counts: &TestCounts) -> RunTotals {
    RunTotals {
        total: counts.total as i32,
        passed: counts.passed as i32,
        failed: counts.failed as i32,
        timed_out: counts.timed_out as i32,
    }
}

fn summary_line(counts: &TestCounts) -> LogLine {
    if counts.failed == 0 && counts.timed_out == 0 {
        LogLine::colored(format!("All {} tests passed.", counts.total), "green").bold()
    } else if counts.timed_out > 0 {
        LogLine::colored(
            format!(
                "{}/{} tests passed, {}/{} tests failed, {}/{} tests timed out.",
                counts.passed,
                counts.total,
                counts.failed,
                counts.total,
                counts.timed_out,
                counts.total
            ),
            "red",
        )
        .bold()
    } else {
        LogLine::colored(
            format!(
                "{}/{} tests passed, {}/{} tests failed.",
                counts.passed, counts.total, counts.failed, counts.total
            ),
            "red",
        )
        .bold()
    }
}

struct TerminalDecision {
    status: RunStatus,
    ended_at: chrono::DateTime<chrono::Utc>,
    counts: TestCounts,
    has_failure: bool,
    transitioned: bool,
    summary: Option<LogLine>,
    suite_id: Option<Uuid>,
    schedule: Option<ScheduleRef>,
}

impl Engine {
    /// Spawn the monitor task for one started test workflow.
    ///
    /// The monitor races the workflow result against the configured
    /// deadline, contains panics from the await, and hands the outcome to
    /// [`update_test_status`](Self::update_test_status). It holds only the
    /// run id and workflow id, never a live reference into engine state.
    pub(crate) fn spawn_test_monitor(&self, run_id: String, workflow_id: String) {
        let Some(engine) = self.shared() else {
            return;
        };
        tokio::spawn(async move {
            let raced = tokio::time::timeout(
                engine.monitor_timeout,
                AssertUnwindSafe(engine.workflows.join(&workflow_id)).catch_unwind(),
            )
            .await;

            let failure = match raced {
                Err(_) => Some(TestFailure {
                    message: MONITOR_TIMEOUT_ERROR.to_string(),
                    timed_out: true,
                }),
                Ok(Err(_panic)) => Some(TestFailure {
                    message: "workflow monitor panicked".to_string(),
                    timed_out: false,
                }),
                Ok(Ok(Ok(_output))) => None,
                Ok(Ok(Err(WorkflowError::TimedOut(message)))) => Some(TestFailure {
                    message,
                    timed_out: true,
                }),
                Ok(Ok(Err(err))) => Some(TestFailure {
                    message: err.to_string(),
                    timed_out: false,
                }),
            };

            engine
                .update_test_status(&run_id, &workflow_id, failure)
                .await;
        });
    }

    /// Record a test workflow's terminal outcome.
    ///
    /// Persist-first ordering: the run-test row is updated before in-memory
    /// state so an engine restart mid-finalization loses nothing; a second
    /// pass writes the real duration once the in-memory record has been
    /// read.
    pub(crate) async fn update_test_status(
        &self,
        run_id: &str,
        workflow_id: &str,
        failure: Option<TestFailure>,
    ) {
        let now = Utc::now();
        let status = match &failure {
            None => TestStatus::Passed,
            Some(f) if f.timed_out => TestStatus::Timeout,
            Some(_) => TestStatus::Failed,
        };
        let error_message = failure.as_ref().map(|f| clean_error_message(&f.message));

        if let Some(store) = &self.store {
            if let Err(err) = store
                .update_run_test_status(
                    workflow_id,
                    status.as_str(),
                    Some(now),
                    0,
                    error_message.as_deref(),
                )
                .await
            {
                warn!(workflow_id, error = %err, "failed to persist test status");
            }
        }

        struct Mutated {
            name: String,
            duration_ms: i64,
            test_id: Option<Uuid>,
        }

        let mutated = self.state.with_run_mut(run_id, |run| {
            let test = run.tests.get_mut(workflow_id)?;
            if test.status.is_terminal() {
                return None;
            }
            test.status = status;
            test.ended_at = Some(now);
            Some(Mutated {
                name: test.name.clone(),
                duration_ms: (now - test.started_at).num_milliseconds(),
                test_id: test.test_id,
            })
        });

        let Some(mutated) = mutated else {
            // The run is not resident (engine restarted since CreateRun);
            // the store still progresses, so finalize from there.
            debug!(run_id, workflow_id, "run not in memory, checking store");
            if let Err(err) = self.check_if_run_finished_from_db(run_id).await {
                warn!(run_id, error = %err, "db-side finish check failed");
            }
            return;
        };
        let Some(mutated) = mutated else {
            warn!(
                run_id,
                workflow_id, "test workflow unknown or already terminal"
            );
            return;
        };

        let line = match (status, &error_message) {
            (TestStatus::Timeout, _) => {
                LogLine::colored(format!("Test \"{}\" timed out", mutated.name), "red")
            }
            (TestStatus::Failed, Some(message)) => LogLine::colored(
                format!("Test \"{}\" failed: {}", mutated.name, message),
                "red",
            ),
            (TestStatus::Failed, None) => {
                LogLine::colored(format!("Test \"{}\" failed", mutated.name), "red")
            }
            _ => LogLine::colored(format!("Test \"{}\" passed", mutated.name), "green"),
        };
        self.append_log(run_id, line).await;

        if let Some(store) = &self.store {
            if let Err(err) = store
                .update_run_test_status(
                    workflow_id,
                    status.as_str(),
                    Some(now),
                    mutated.duration_ms,
                    error_message.as_deref(),
                )
                .await
            {
                warn!(workflow_id, error = %err, "failed to persist test duration");
            }
            if let Some(test_id) = mutated.test_id {
                if let Err(err) = store.update_test_last_run(test_id, workflow_id).await {
                    debug!(%test_id, error = %err, "failed to update test last_run");
                }
            }
        }

        self.check_if_run_finished(run_id).await;
    }

    /// Decide whether the run is terminal and, if so, finalize it.
    pub(crate) async fn check_if_run_finished(&self, run_id: &str) {
        let decision = self.state.with_run_mut(run_id, |run| {
            let counts = run.counts();
            if counts.pending > 0 || counts.total < run.expected_tests {
                return None;
            }
            let has_failure =
                counts.failed > 0 || counts.timed_out > 0 || run.suite_init_failed;
            let status = if counts.failed == 0 && counts.timed_out == 0 {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            };
            let now = Utc::now();
            let transitioned = run.set_terminal(status, now);
            let summary = if transitioned {
                let line = summary_line(&counts);
                // Push under the lock: any snapshot observing the terminal
                // status also observes the summary line.
                run.logs.push(line.clone());
                Some(line)
            } else {
                None
            };
            Some(TerminalDecision {
                status: run.status,
                ended_at: run.ended_at.unwrap_or(now),
                counts,
                has_failure,
                transitioned,
                summary,
                suite_id: run.suite_id,
                schedule: run.schedule,
            })
        });

        let Some(Some(decision)) = decision else {
            return;
        };

        // Cleanup is idempotent; racing trigger sources are resolved by the
        // flag flipped under the lock inside trigger_suite_cleanup.
        self.trigger_suite_cleanup(run_id, decision.has_failure);

        if let Some(line) = &decision.summary {
            self.persist_log(run_id, line).await;
        }

        if !decision.transitioned {
            return;
        }

        info!(
            run_id,
            status = decision.status.as_str(),
            passed = decision.counts.passed,
            failed = decision.counts.failed,
            timed_out = decision.counts.timed_out,
            "run finished"
        );

        let Some(store) = &self.store else {
            return;
        };
        let totals = totals_from_counts(&decision.counts);
        if let Err(err) = store
            .update_run(
                run_id,
                decision.status.as_str(),
                Some(decision.ended_at),
                &totals,
            )
            .await
        {
            warn!(run_id, error = %err, "failed to persist terminal run status");
        }

        if let Some(suite_id) = decision.suite_id {
            if let Err(err) = store.update_suite_last_run(suite_id, run_id).await {
                debug!(%suite_id, error = %err, "failed to update suite last_run");
            }
        }
        if let Some(schedule) = decision.schedule {
            if let Err(err) = store
                .record_schedule_run(
                    schedule.kind,
                    schedule.id,
                    Some(run_id),
                    decision.status.as_str(),
                )
                .await
            {
                debug!(schedule_id = %schedule.id, error = %err, "failed to update schedule last_run");
            }
        }
    }

    /// Terminal-decision twin operating purely on persisted rows. Used after
    /// restarts and by the reconciler, when the in-memory map knows nothing
    /// about the run.
    pub(crate) async fn check_if_run_finished_from_db(&self, run_id: &str) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let Some(run) = store.get_run(None, run_id).await? else {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        };
        if RunStatus::parse(&run.status).is_terminal() {
            return Ok(());
        }

        let tests = store.list_run_tests(run_id).await?;
        if tests.is_empty() || (tests.len() as i32) < run.total_tests {
            return Ok(());
        }

        let mut totals = RunTotals {
            total: tests.len() as i32,
            ..RunTotals::default()
        };
        let mut ended_at = run.started_at;
        for test in &tests {
            match TestStatus::parse(&test.status) {
                TestStatus::Pending => return Ok(()),
                TestStatus::Passed => totals.passed += 1,
                TestStatus::Failed => totals.failed += 1,
                TestStatus::Timeout => totals.timed_out += 1,
            }
            if let Some(test_ended) = test.ended_at {
                ended_at = ended_at.max(test_ended);
            }
        }

        let status = if totals.failed == 0 && totals.timed_out == 0 {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };

        info!(
            run_id,
            status = status.as_str(),
            "finalizing run from persisted state"
        );
        store
            .update_run(run_id, status.as_str(), Some(ended_at), &totals)
            .await?;
        Ok(())
    }

    /// Launch suite cleanup for a run, at most once.
    ///
    /// The `suite_cleanup_ran` flag flips under the write lock before the
    /// task spawns; with no cleanup spec this is a no-op (the flag still
    /// flips, absorbing later triggers). The task is tracked by the cleanup
    /// wait group so `WaitForCleanup` can block shutdown on it.
    pub(crate) fn trigger_suite_cleanup(&self, run_id: &str, treat_as_failure: bool) {
        let launch = self.state.with_run_mut(run_id, |run| {
            if run.suite_cleanup_ran {
                return None;
            }
            run.suite_cleanup_ran = true;
            run.cleanup.clone().map(|spec| CleanupLaunch {
                run_id: run.run_id.clone(),
                spec,
                vars: run.vars.clone(),
                globals: run.saved_globals.clone(),
                openapi: run.openapi.clone(),
                env_secrets: run.env_secrets.clone(),
                treat_as_failure,
            })
        });

        if let Some(Some(launch)) = launch {
            self.spawn_suite_cleanup(launch);
        }
    }

    fn spawn_suite_cleanup(&self, launch: CleanupLaunch) {
        let Some(engine) = self.shared() else {
            return;
        };
        self.cleanups.spawn(async move {
            let workflow_id = format!("{}_suite_cleanup", launch.run_id);
            let options =
                WorkflowOptions::new(&workflow_id).with_timeout(engine.cleanup_timeout);
            let input = serde_json::json!({
                "run_id": launch.run_id,
                "cleanup": launch.spec,
                "vars": launch.vars,
                "globals": launch.globals,
                "openapi": launch.openapi,
                "env": launch.env_secrets,
                "treat_as_failure": launch.treat_as_failure,
            });

            info!(run_id = %launch.run_id, treat_as_failure = launch.treat_as_failure, "starting suite cleanup");

            if let Err(err) = engine
                .workflows
                .execute(options, WorkflowType::SuiteCleanup, input)
                .await
            {
                warn!(run_id = %launch.run_id, error = %err, "failed to start suite cleanup workflow");
                return;
            }

            match tokio::time::timeout(engine.cleanup_timeout, engine.workflows.join(&workflow_id))
                .await
            {
                Ok(Ok(_)) => debug!(run_id = %launch.run_id, "suite cleanup completed"),
                Ok(Err(err)) => {
                    warn!(run_id = %launch.run_id, error = %err, "suite cleanup workflow failed")
                }
                Err(_) => warn!(run_id = %launch.run_id, "suite cleanup timed out"),
            }
        });
    }
}
