// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for the engine.
//!
//! The engine consumes the abstract [`RunStore`] trait. The production
//! implementation speaks to PostgreSQL; the in-memory implementation backs
//! tests and persistence-disabled deployments.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryRunStore;
pub use self::postgres::PostgresRunStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced row does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Entity kind (run, run test, schedule, ...).
        entity: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Whether a schedule is attached to a project or to a single suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Fires every active suite of a project.
    Project,
    /// Fires one suite.
    Suite,
}

impl ScheduleKind {
    /// String form used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Suite => "suite",
        }
    }
}

/// Persisted mirror of a run, sufficient for historical queries.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Run id (lowercase ULID).
    pub run_id: String,
    /// Owning organization (always set when persistence is enabled).
    pub org_id: Uuid,
    /// Resolved project, when known.
    pub project_id: Option<Uuid>,
    /// Resolved suite, when the suite is registered.
    pub suite_id: Option<Uuid>,
    /// Suite name from the parsed payload.
    pub suite_name: String,
    /// Run status string.
    pub status: String,
    /// Who started the run (username, email or subject).
    pub initiator: String,
    /// manual | ci | schedule
    pub trigger: String,
    /// Schedule name for scheduled runs.
    pub schedule_name: Option<String>,
    /// repo_commit | uncommitted
    pub config_source: String,
    /// Source label (cli-local, ci-branch, scheduler).
    pub source: String,
    /// Git branch, when detected.
    pub branch: Option<String>,
    /// Git commit, when detected.
    pub commit_sha: Option<String>,
    /// SHA-256 of the suite payload.
    pub bundle_sha: Option<String>,
    /// Total number of tests.
    pub total_tests: i32,
    /// Tests that passed.
    pub passed_tests: i32,
    /// Tests that failed.
    pub failed_tests: i32,
    /// Tests that timed out.
    pub timeout_tests: i32,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Set when the run reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last row update time.
    pub updated_at: DateTime<Utc>,
}

/// Terminal totals written with a run status update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    /// Total number of tests.
    pub total: i32,
    /// Tests that passed.
    pub passed: i32,
    /// Tests that failed.
    pub failed: i32,
    /// Tests that timed out.
    pub timed_out: i32,
}

/// Persisted per-test workflow row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunTestRecord {
    /// Workflow id on the workflow service (primary key).
    pub workflow_id: String,
    /// Parent run id.
    pub run_id: String,
    /// Resolved test id, when the suite is registered.
    pub test_id: Option<Uuid>,
    /// Human-readable test name.
    pub name: String,
    /// Test status string.
    pub status: String,
    /// When the workflow was started.
    pub started_at: DateTime<Utc>,
    /// Set when the status becomes terminal.
    pub ended_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds (zero until the in-memory state
    /// has been read back).
    pub duration_ms: i64,
    /// Number of reported steps.
    pub step_count: i32,
    /// Clean error text for failed tests.
    pub error_message: Option<String>,
}

/// Persisted log line.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunLogRecord {
    /// Parent run id.
    pub run_id: String,
    /// Log text.
    pub message: String,
    /// Optional color tag.
    pub color: Option<String>,
    /// Render bold.
    pub bold: bool,
    /// Test the line belongs to, if any.
    pub test_name: Option<String>,
    /// Step the line belongs to, if any.
    pub step_name: Option<String>,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Persisted step report, keyed by `(run_test_id, step_index)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunStepRecord {
    /// Workflow id of the owning test.
    pub run_test_id: String,
    /// Zero-based step position.
    pub step_index: i32,
    /// Step name.
    pub name: String,
    /// Step status string.
    pub status: String,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step finished, if it did.
    pub ended_at: Option<DateTime<Utc>>,
    /// Request payload as JSON text.
    pub request_json: Option<String>,
    /// Response payload as JSON text.
    pub response_json: Option<String>,
    /// Assertion results as JSON text.
    pub assertions_json: Option<String>,
    /// Captured variables as JSON text.
    pub variables_json: Option<String>,
    /// Step configuration as JSON text.
    pub config_json: Option<String>,
}

/// A registered environment providing secrets to suites.
#[derive(Debug, Clone)]
pub struct EnvironmentRecord {
    /// Environment id.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Slug referenced by suites.
    pub slug: String,
    /// Secret material injected into workflows.
    pub secrets: HashMap<String, String>,
}

/// A registered project.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRecord {
    /// Project id.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Project name.
    pub name: String,
    /// Branch scheduled runs execute against.
    pub default_branch: String,
}

/// A registered suite.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SuiteRecord {
    /// Suite id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Suite name.
    pub name: String,
    /// Branch the stored payload was committed on.
    pub branch: String,
    /// The stored suite payload.
    pub yaml: String,
    /// Inactive suites are skipped by the scheduler.
    pub active: bool,
}

/// A project schedule row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRecord {
    /// Schedule id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Schedule name.
    pub name: String,
    /// Firing cadence in seconds.
    pub interval_seconds: i64,
    /// The fire time that was claimed (set by `claim_due_project_schedule`).
    pub due_at: DateTime<Utc>,
    /// Next fire time after the claim.
    pub next_fire_at: DateTime<Utc>,
    /// First run id of the most recent firing.
    pub last_run_id: Option<String>,
    /// Status recorded for the most recent firing.
    pub last_run_status: Option<String>,
}

/// Ordering for run listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOrder {
    /// Order by start time.
    #[default]
    StartedAt,
    /// Order by end time.
    EndedAt,
    /// Order by wall-clock duration.
    Duration,
}

impl RunOrder {
    /// Parse the wire form. Empty input means the default ordering; anything
    /// else unknown is an error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "started_at" => Some(Self::StartedAt),
            "ended_at" => Some(Self::EndedAt),
            "duration" => Some(Self::Duration),
            _ => None,
        }
    }
}

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Owning organization (mandatory when auth is enabled).
    pub org_id: Option<Uuid>,
    /// Restrict to one project.
    pub project_id: Option<Uuid>,
    /// Restrict to one source label.
    pub source: Option<String>,
    /// Restrict to one branch.
    pub branch: Option<String>,
    /// Restrict to one status.
    pub status: Option<String>,
    /// Restrict to one schedule name.
    pub schedule_name: Option<String>,
    /// Ordering column.
    pub order: RunOrder,
    /// Descending order.
    pub descending: bool,
    /// Page size.
    pub limit: i64,
}

/// Persistence contract consumed by the engine.
#[allow(missing_docs)]
#[async_trait]
pub trait RunStore: Send + Sync {
    // Runs
    async fn insert_run(&self, run: &RunRecord) -> Result<()>;
    async fn update_run(
        &self,
        run_id: &str,
        status: &str,
        ended_at: Option<DateTime<Utc>>,
        totals: &RunTotals,
    ) -> Result<()>;
    async fn get_run(&self, org_id: Option<Uuid>, run_id: &str) -> Result<Option<RunRecord>>;
    async fn find_run_by_prefix(
        &self,
        org_id: Option<Uuid>,
        prefix: &str,
    ) -> Result<Option<RunRecord>>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>>;
    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>>;

    // Run tests
    async fn insert_run_test(&self, test: &RunTestRecord) -> Result<()>;
    async fn update_run_test_status(
        &self,
        workflow_id: &str,
        status: &str,
        ended_at: Option<DateTime<Utc>>,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn list_run_tests(&self, run_id: &str) -> Result<Vec<RunTestRecord>>;
    async fn list_stale_run_tests(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunTestRecord>>;
    async fn fail_pending_run_tests(&self, run_id: &str, error_message: &str) -> Result<u64>;

    // Logs and steps
    async fn append_run_log(&self, log: &RunLogRecord) -> Result<()>;
    async fn list_run_logs(&self, run_id: &str) -> Result<Vec<RunLogRecord>>;
    async fn upsert_run_step(&self, step: &RunStepRecord) -> Result<()>;

    // Environments, projects, suites
    async fn get_environment_by_slug(
        &self,
        org_id: Uuid,
        slug: &str,
    ) -> Result<Option<EnvironmentRecord>>;
    async fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectRecord>>;
    async fn list_active_suites(&self, project_id: Uuid, branch: &str)
    -> Result<Vec<SuiteRecord>>;
    async fn update_suite_last_run(&self, suite_id: Uuid, run_id: &str) -> Result<()>;
    async fn update_test_last_run(&self, test_id: Uuid, workflow_id: &str) -> Result<()>;

    // Scheduling
    //
    // Discovery runs under a transaction-scoped advisory lock; `None` means
    // another instance currently leads and this tick should be skipped.
    // Claiming is atomic: verify the schedule is still due, advance its
    // next-fire-at, return the claimed row. Exactly one caller wins.
    async fn discover_due_project_schedules(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<Option<Vec<Uuid>>>;
    async fn claim_due_project_schedule(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>>;
    async fn record_schedule_run(
        &self,
        kind: ScheduleKind,
        schedule_id: Uuid,
        run_id: Option<&str>,
        status: &str,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_order_parse() {
        assert_eq!(RunOrder::parse(""), Some(RunOrder::StartedAt));
        assert_eq!(RunOrder::parse("started_at"), Some(RunOrder::StartedAt));
        assert_eq!(RunOrder::parse("ended_at"), Some(RunOrder::EndedAt));
        assert_eq!(RunOrder::parse("duration"), Some(RunOrder::Duration));
        assert_eq!(RunOrder::parse("name"), None);
    }

    #[test]
    fn test_schedule_kind_strings() {
        assert_eq!(ScheduleKind::Project.as_str(), "project");
        assert_eq!(ScheduleKind::Suite.as_str(), "suite");
    }
}
