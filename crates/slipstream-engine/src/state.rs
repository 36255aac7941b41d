// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory engine state.
//!
//! One reader-writer lock protects the map of active runs and everything it
//! owns. Critical sections are closures so a guard can never outlive its
//! scope, and no await point exists while a guard is held. Mutation goes
//! through the write lock; observation (counts, log snapshots for streaming)
//! through the read lock.
//!
//! The map is never pruned: terminal runs stay resident until the process
//! exits. Crash recovery is the reconciler's job, not this module's.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::runctx::RunContext;
use crate::store::ScheduleKind;
use crate::suite::{CleanupSpec, OpenApiConfig};

/// Run status. Terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    /// Run exists but has not started (persisted form only).
    Pending,
    /// At least one test is not terminal.
    #[default]
    Running,
    /// Every test passed.
    Passed,
    /// At least one test failed, or suite init failed.
    Failed,
    /// The run as a whole timed out (reconciler safety net).
    Timeout,
    /// A client cancelled the run.
    Cancelled,
}

impl RunStatus {
    /// String form persisted to the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted status string. Unknown values read as running.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "timeout" => Self::Timeout,
            "cancelled" => Self::Cancelled,
            _ => Self::Running,
        }
    }

    /// True for absorbing statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Passed | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

/// Per-test workflow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestStatus {
    /// Workflow started, result not yet observed.
    #[default]
    Pending,
    /// Workflow completed successfully.
    Passed,
    /// Workflow failed.
    Failed,
    /// Workflow (or its monitor) timed out.
    Timeout,
}

impl TestStatus {
    /// String form persisted to the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }

    /// Parse a persisted status string. Unknown values read as pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "timeout" => Self::Timeout,
            _ => Self::Pending,
        }
    }

    /// True once the workflow result has been observed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One append-only log entry of a run.
#[derive(Debug, Clone, Default)]
pub struct LogLine {
    /// Log text.
    pub message: String,
    /// Optional color tag (green, red, yellow).
    pub color: Option<String>,
    /// Render bold.
    pub bold: bool,
    /// Test the line belongs to, if any.
    pub test_name: Option<String>,
    /// Step the line belongs to, if any.
    pub step_name: Option<String>,
}

impl LogLine {
    /// Uncolored line.
    pub fn plain(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Colored line.
    pub fn colored(message: impl Into<String>, color: &str) -> Self {
        Self {
            message: message.into(),
            color: Some(color.to_string()),
            ..Self::default()
        }
    }

    /// Set the bold flag.
    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }
}

/// Per-test workflow record owned by its [`RunInfo`].
#[derive(Debug, Clone)]
pub struct TestInfo {
    /// Workflow id on the workflow service.
    pub workflow_id: String,
    /// Human-readable test name.
    pub name: String,
    /// Current status.
    pub status: TestStatus,
    /// When the workflow was started.
    pub started_at: DateTime<Utc>,
    /// Set when the status becomes terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Parent run id.
    pub run_id: String,
    /// Resolved test id in the store, when the suite is registered.
    pub test_id: Option<Uuid>,
}

/// Aggregated test counts of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    /// Total number of tests.
    pub total: usize,
    /// Tests that passed.
    pub passed: usize,
    /// Tests that failed.
    pub failed: usize,
    /// Tests that timed out.
    pub timed_out: usize,
    /// Tests with no observed result yet.
    pub pending: usize,
}

/// Link from a run to the schedule that fired it.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleRef {
    /// Schedule id.
    pub id: Uuid,
    /// Whether the schedule is project- or suite-scoped.
    pub kind: ScheduleKind,
}

/// Canonical in-memory state of one run.
#[derive(Debug, Clone)]
pub struct RunInfo {
    /// Run id (lowercase ULID).
    pub run_id: String,
    /// Owning organization.
    pub org_id: Option<Uuid>,
    /// Resolved project id, when known.
    pub project_id: Option<Uuid>,
    /// Resolved suite id, when the suite is registered.
    pub suite_id: Option<Uuid>,
    /// Suite name from the parsed payload.
    pub suite_name: String,
    /// Who started the run.
    pub initiator: String,
    /// Run status. Only advances `Running -> terminal`.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Set exactly when the status becomes terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of tests the parsed suite carries. The finalizer holds off
    /// until this many TestInfo entries exist, so a fast first test cannot
    /// close the run while later workflows are still being started.
    pub expected_tests: usize,
    /// Test workflows keyed by workflow id.
    pub tests: HashMap<String, TestInfo>,
    /// Append-only log.
    pub logs: Vec<LogLine>,
    /// Suite init workflow completed successfully.
    pub suite_init_completed: bool,
    /// Suite init workflow failed; the run is terminal with zero tests.
    pub suite_init_failed: bool,
    /// Suite cleanup has been launched (at most once per run).
    pub suite_cleanup_ran: bool,
    /// Globals saved by the suite-init workflow.
    pub saved_globals: HashMap<String, String>,
    /// Merged suite variables.
    pub vars: serde_json::Map<String, serde_json::Value>,
    /// Cleanup specification, if the suite carries one.
    pub cleanup: Option<CleanupSpec>,
    /// OpenAPI configuration, if the suite carries one.
    pub openapi: Option<OpenApiConfig>,
    /// Secrets resolved from the suite's environment.
    pub env_secrets: HashMap<String, String>,
    /// Schedule that fired this run, for scheduled runs.
    pub schedule: Option<ScheduleRef>,
    /// Where the run came from.
    pub context: RunContext,
}

impl RunInfo {
    /// Count tests per status.
    pub fn counts(&self) -> TestCounts {
        let mut counts = TestCounts {
            total: self.tests.len(),
            ..TestCounts::default()
        };
        for test in self.tests.values() {
            match test.status {
                TestStatus::Pending => counts.pending += 1,
                TestStatus::Passed => counts.passed += 1,
                TestStatus::Failed => counts.failed += 1,
                TestStatus::Timeout => counts.timed_out += 1,
            }
        }
        counts
    }

    /// Transition to a terminal status. Returns false (and leaves the run
    /// untouched) when the run is already terminal.
    pub fn set_terminal(&mut self, status: RunStatus, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.ended_at = Some(at);
        true
    }
}

/// Result of a prefix lookup over the runs map.
#[derive(Debug, PartialEq, Eq)]
pub enum PrefixMatch {
    /// No resident run matches.
    None,
    /// Exactly one resident run matches.
    One(String),
    /// More than one resident run matches.
    Ambiguous,
}

/// Thread-safe map of active runs.
#[derive(Default)]
pub struct EngineState {
    runs: RwLock<HashMap<String, RunInfo>>,
}

impl EngineState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RunInfo>> {
        match self.runs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RunInfo>> {
        match self.runs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a new run.
    pub fn insert_run(&self, run: RunInfo) {
        self.write_guard().insert(run.run_id.clone(), run);
    }

    /// Observe one run under the read lock.
    pub fn with_run<R>(&self, run_id: &str, f: impl FnOnce(&RunInfo) -> R) -> Option<R> {
        self.read_guard().get(run_id).map(f)
    }

    /// Mutate one run under the write lock.
    pub fn with_run_mut<R>(&self, run_id: &str, f: impl FnOnce(&mut RunInfo) -> R) -> Option<R> {
        self.write_guard().get_mut(run_id).map(f)
    }

    /// Observe the whole map under the read lock (listings).
    pub fn with_runs<R>(&self, f: impl FnOnce(&HashMap<String, RunInfo>) -> R) -> R {
        f(&self.read_guard())
    }

    /// Append a log line to a run. Returns false when the run is unknown.
    pub fn append_log(&self, run_id: &str, line: LogLine) -> bool {
        match self.write_guard().get_mut(run_id) {
            Some(run) => {
                run.logs.push(line);
                true
            }
            None => false,
        }
    }

    /// Snapshot log entries past `from` plus the current status, for the
    /// streaming loop. The copy happens under the read lock; sending happens
    /// outside it.
    pub fn logs_since(&self, run_id: &str, from: usize) -> Option<(Vec<LogLine>, RunStatus)> {
        let guard = self.read_guard();
        let run = guard.get(run_id)?;
        let fresh = if from < run.logs.len() {
            run.logs[from..].to_vec()
        } else {
            Vec::new()
        };
        Some((fresh, run.status))
    }

    /// Resolve a run id prefix against resident runs, scoped to an org.
    pub fn resolve_prefix(&self, prefix: &str, org_id: Option<Uuid>) -> PrefixMatch {
        let guard = self.read_guard();
        let mut matched: Option<String> = None;
        for (run_id, run) in guard.iter() {
            if !run_id.starts_with(prefix) {
                continue;
            }
            if org_id.is_some() && run.org_id != org_id {
                continue;
            }
            if matched.is_some() {
                return PrefixMatch::Ambiguous;
            }
            matched = Some(run_id.clone());
        }
        match matched {
            Some(id) => PrefixMatch::One(id),
            None => PrefixMatch::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(run_id: &str) -> RunInfo {
        RunInfo {
            run_id: run_id.to_string(),
            org_id: None,
            project_id: None,
            suite_id: None,
            suite_name: "suite".to_string(),
            initiator: "tester".to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            expected_tests: 0,
            tests: HashMap::new(),
            logs: Vec::new(),
            suite_init_completed: false,
            suite_init_failed: false,
            suite_cleanup_ran: false,
            saved_globals: HashMap::new(),
            vars: serde_json::Map::new(),
            cleanup: None,
            openapi: None,
            env_secrets: HashMap::new(),
            schedule: None,
            context: RunContext::default(),
        }
    }

    fn test_info(run_id: &str, workflow_id: &str, status: TestStatus) -> TestInfo {
        TestInfo {
            workflow_id: workflow_id.to_string(),
            name: workflow_id.to_string(),
            status,
            started_at: Utc::now(),
            ended_at: None,
            run_id: run_id.to_string(),
            test_id: None,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Passed,
            RunStatus::Failed,
            RunStatus::Timeout,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_terminal_statuses_are_absorbing() {
        let mut info = run("r1");
        assert!(info.set_terminal(RunStatus::Cancelled, Utc::now()));
        assert!(!info.set_terminal(RunStatus::Passed, Utc::now()));
        assert_eq!(info.status, RunStatus::Cancelled);
        assert!(info.ended_at.is_some());
    }

    #[test]
    fn test_counts() {
        let mut info = run("r1");
        info.tests
            .insert("w1".into(), test_info("r1", "w1", TestStatus::Passed));
        info.tests
            .insert("w2".into(), test_info("r1", "w2", TestStatus::Failed));
        info.tests
            .insert("w3".into(), test_info("r1", "w3", TestStatus::Pending));
        info.tests
            .insert("w4".into(), test_info("r1", "w4", TestStatus::Timeout));

        let counts = info.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.passed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.timed_out, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(
            counts.total,
            counts.passed + counts.failed + counts.timed_out + counts.pending
        );
    }

    #[test]
    fn test_append_and_snapshot_logs() {
        let state = EngineState::new();
        state.insert_run(run("r1"));

        assert!(state.append_log("r1", LogLine::plain("one")));
        assert!(state.append_log("r1", LogLine::colored("two", "green")));
        assert!(!state.append_log("missing", LogLine::plain("dropped")));

        let (logs, status) = state.logs_since("r1", 0).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(status, RunStatus::Running);

        let (logs, _) = state.logs_since("r1", 2).unwrap();
        assert!(logs.is_empty());
    }

    #[test]
    fn test_prefix_resolution() {
        let state = EngineState::new();
        state.insert_run(run("01jabcdef00000000000000001"));
        state.insert_run(run("01jabcdef0000000000000z002"));
        state.insert_run(run("01kzzzzzzz000000000000z003"));

        assert_eq!(
            state.resolve_prefix("01k", None),
            PrefixMatch::One("01kzzzzzzz000000000000z003".to_string())
        );
        assert_eq!(state.resolve_prefix("01j", None), PrefixMatch::Ambiguous);
        assert_eq!(state.resolve_prefix("02", None), PrefixMatch::None);
    }

    #[test]
    fn test_prefix_resolution_is_org_scoped() {
        let org_a = Uuid::new_v4();
        let mut scoped = run("01jabcdef00000000000000001");
        scoped.org_id = Some(org_a);
        let state = EngineState::new();
        state.insert_run(scoped);

        assert_eq!(
            state.resolve_prefix("01j", Some(org_a)),
            PrefixMatch::One("01jabcdef00000000000000001".to_string())
        );
        assert_eq!(
            state.resolve_prefix("01j", Some(Uuid::new_v4())),
            PrefixMatch::None
        );
    }
}
