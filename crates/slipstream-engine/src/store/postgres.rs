// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed [`RunStore`] implementation.
//!
//! Provides all durable storage access for runs, run tests, logs, steps,
//! environments, suites and schedules. Schema management lives outside this
//! crate; the queries here assume the platform schema is in place.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    EnvironmentRecord, ProjectRecord, Result, RunFilter, RunLogRecord, RunOrder, RunRecord,
    RunStepRecord, RunStore, RunTestRecord, RunTotals, ScheduleKind, ScheduleRecord, StoreError,
    SuiteRecord,
};

/// Advisory lock key for scheduler leadership. The lock is transaction
/// scoped, so connection-pool reuse is safe.
const SCHEDULER_ADVISORY_LOCK_KEY: i64 = 874_551_023_114_701;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a new Postgres-backed store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Run Operations
// ============================================================================

/// Insert a new run record.
pub async fn insert_run(pool: &PgPool, run: &RunRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (
            run_id, org_id, project_id, suite_id, suite_name, status,
            initiator, trigger, schedule_name, config_source, source,
            branch, commit_sha, bundle_sha,
            total_tests, passed_tests, failed_tests, timeout_tests,
            started_at, ended_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, NOW(), NOW())
        "#,
    )
    .bind(&run.run_id)
    .bind(run.org_id)
    .bind(run.project_id)
    .bind(run.suite_id)
    .bind(&run.suite_name)
    .bind(&run.status)
    .bind(&run.initiator)
    .bind(&run.trigger)
    .bind(&run.schedule_name)
    .bind(&run.config_source)
    .bind(&run.source)
    .bind(&run.branch)
    .bind(&run.commit_sha)
    .bind(&run.bundle_sha)
    .bind(run.total_tests)
    .bind(run.passed_tests)
    .bind(run.failed_tests)
    .bind(run.timeout_tests)
    .bind(run.started_at)
    .bind(run.ended_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update a run's status, end time and terminal totals.
pub async fn update_run(
    pool: &PgPool,
    run_id: &str,
    status: &str,
    ended_at: Option<DateTime<Utc>>,
    totals: &RunTotals,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = $2,
            ended_at = $3,
            total_tests = $4,
            passed_tests = $5,
            failed_tests = $6,
            timeout_tests = $7,
            updated_at = NOW()
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(status)
    .bind(ended_at)
    .bind(totals.total)
    .bind(totals.passed)
    .bind(totals.failed)
    .bind(totals.timed_out)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        });
    }

    Ok(())
}

const RUN_COLUMNS: &str = "run_id, org_id, project_id, suite_id, suite_name, status, \
     initiator, trigger, schedule_name, config_source, source, branch, commit_sha, \
     bundle_sha, total_tests, passed_tests, failed_tests, timeout_tests, \
     started_at, ended_at, created_at, updated_at";

/// Get a run by exact id, optionally scoped to an org.
pub async fn get_run(
    pool: &PgPool,
    org_id: Option<Uuid>,
    run_id: &str,
) -> Result<Option<RunRecord>> {
    let record = sqlx::query_as::<_, RunRecord>(&format!(
        r#"
        SELECT {RUN_COLUMNS}
        FROM runs
        WHERE run_id = $1
          AND ($2::UUID IS NULL OR org_id = $2)
        "#
    ))
    .bind(run_id)
    .bind(org_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Find a run by id prefix. Returns None unless exactly one run matches.
pub async fn find_run_by_prefix(
    pool: &PgPool,
    org_id: Option<Uuid>,
    prefix: &str,
) -> Result<Option<RunRecord>> {
    let records = sqlx::query_as::<_, RunRecord>(&format!(
        r#"
        SELECT {RUN_COLUMNS}
        FROM runs
        WHERE run_id LIKE $1 || '%'
          AND ($2::UUID IS NULL OR org_id = $2)
        LIMIT 2
        "#
    ))
    .bind(prefix)
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    match records.as_slice() {
        [only] => Ok(Some(only.clone())),
        _ => Ok(None),
    }
}

fn order_clause(order: RunOrder, descending: bool) -> &'static str {
    match (order, descending) {
        (RunOrder::StartedAt, false) => "started_at ASC",
        (RunOrder::StartedAt, true) => "started_at DESC",
        (RunOrder::EndedAt, false) => "ended_at ASC NULLS FIRST",
        (RunOrder::EndedAt, true) => "ended_at DESC NULLS LAST",
        (RunOrder::Duration, false) => "(ended_at - started_at) ASC NULLS FIRST",
        (RunOrder::Duration, true) => "(ended_at - started_at) DESC NULLS LAST",
    }
}

/// List runs with filtering, ordering and a page limit.
pub async fn list_runs(pool: &PgPool, filter: &RunFilter) -> Result<Vec<RunRecord>> {
    let limit = if filter.limit > 0 { filter.limit } else { 50 };
    let records = sqlx::query_as::<_, RunRecord>(&format!(
        r#"
        SELECT {RUN_COLUMNS}
        FROM runs
        WHERE ($1::UUID IS NULL OR org_id = $1)
          AND ($2::UUID IS NULL OR project_id = $2)
          AND ($3::TEXT IS NULL OR source = $3)
          AND ($4::TEXT IS NULL OR branch = $4)
          AND ($5::TEXT IS NULL OR status = $5)
          AND ($6::TEXT IS NULL OR schedule_name = $6)
        ORDER BY {}
        LIMIT $7
        "#,
        order_clause(filter.order, filter.descending)
    ))
    .bind(filter.org_id)
    .bind(filter.project_id)
    .bind(&filter.source)
    .bind(&filter.branch)
    .bind(&filter.status)
    .bind(&filter.schedule_name)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// List runs stuck in RUNNING since before the cutoff.
pub async fn list_stale_runs(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>> {
    let records = sqlx::query_as::<_, RunRecord>(&format!(
        r#"
        SELECT {RUN_COLUMNS}
        FROM runs
        WHERE status = 'running' AND started_at < $1
        ORDER BY started_at ASC
        "#
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Run Test Operations
// ============================================================================

/// Insert a run test row.
pub async fn insert_run_test(pool: &PgPool, test: &RunTestRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO run_tests (
            workflow_id, run_id, test_id, name, status,
            started_at, ended_at, duration_ms, step_count, error_message
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&test.workflow_id)
    .bind(&test.run_id)
    .bind(test.test_id)
    .bind(&test.name)
    .bind(&test.status)
    .bind(test.started_at)
    .bind(test.ended_at)
    .bind(test.duration_ms)
    .bind(test.step_count)
    .bind(&test.error_message)
    .execute(pool)
    .await?;

    Ok(())
}

/// Update a run test row by workflow id.
pub async fn update_run_test_status(
    pool: &PgPool,
    workflow_id: &str,
    status: &str,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: i64,
    error_message: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE run_tests
        SET status = $2, ended_at = $3, duration_ms = $4, error_message = $5
        WHERE workflow_id = $1
        "#,
    )
    .bind(workflow_id)
    .bind(status)
    .bind(ended_at)
    .bind(duration_ms)
    .bind(error_message)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            entity: "run test",
            id: workflow_id.to_string(),
        });
    }

    Ok(())
}

const RUN_TEST_COLUMNS: &str = "workflow_id, run_id, test_id, name, status, started_at, \
     ended_at, duration_ms, step_count, error_message";

/// List all test rows of a run.
pub async fn list_run_tests(pool: &PgPool, run_id: &str) -> Result<Vec<RunTestRecord>> {
    let records = sqlx::query_as::<_, RunTestRecord>(&format!(
        r#"
        SELECT {RUN_TEST_COLUMNS}
        FROM run_tests
        WHERE run_id = $1
        ORDER BY workflow_id ASC
        "#
    ))
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// List non-terminal test rows older than the cutoff.
pub async fn list_stale_run_tests(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<RunTestRecord>> {
    let records = sqlx::query_as::<_, RunTestRecord>(&format!(
        r#"
        SELECT {RUN_TEST_COLUMNS}
        FROM run_tests
        WHERE status IN ('pending', 'running') AND started_at < $1
        ORDER BY started_at ASC
        LIMIT $2
        "#
    ))
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Force non-terminal test rows of a run to FAILED. Returns how many rows
/// were touched.
pub async fn fail_pending_run_tests(
    pool: &PgPool,
    run_id: &str,
    error_message: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE run_tests
        SET status = 'failed', ended_at = NOW(), error_message = $2
        WHERE run_id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(run_id)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Log and Step Operations
// ============================================================================

/// Append a log line (append-only).
pub async fn append_run_log(pool: &PgPool, log: &RunLogRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO run_logs (run_id, message, color, bold, test_name, step_name, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&log.run_id)
    .bind(&log.message)
    .bind(&log.color)
    .bind(log.bold)
    .bind(&log.test_name)
    .bind(&log.step_name)
    .bind(log.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// List all log lines of a run in append order.
pub async fn list_run_logs(pool: &PgPool, run_id: &str) -> Result<Vec<RunLogRecord>> {
    let records = sqlx::query_as::<_, RunLogRecord>(
        r#"
        SELECT run_id, message, color, bold, test_name, step_name, created_at
        FROM run_logs
        WHERE run_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Upsert a step report keyed by `(run_test_id, step_index)`.
pub async fn upsert_run_step(pool: &PgPool, step: &RunStepRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO run_steps (
            run_test_id, step_index, name, status, started_at, ended_at,
            request_json, response_json, assertions_json, variables_json, config_json
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (run_test_id, step_index) DO UPDATE
        SET name = EXCLUDED.name,
            status = EXCLUDED.status,
            started_at = EXCLUDED.started_at,
            ended_at = EXCLUDED.ended_at,
            request_json = EXCLUDED.request_json,
            response_json = EXCLUDED.response_json,
            assertions_json = EXCLUDED.assertions_json,
            variables_json = EXCLUDED.variables_json,
            config_json = EXCLUDED.config_json
        "#,
    )
    .bind(&step.run_test_id)
    .bind(step.step_index)
    .bind(&step.name)
    .bind(&step.status)
    .bind(step.started_at)
    .bind(step.ended_at)
    .bind(&step.request_json)
    .bind(&step.response_json)
    .bind(&step.assertions_json)
    .bind(&step.variables_json)
    .bind(&step.config_json)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Environment, Project and Suite Operations
// ============================================================================

/// Resolve an environment by org and slug, including its secret material.
pub async fn get_environment_by_slug(
    pool: &PgPool,
    org_id: Uuid,
    slug: &str,
) -> Result<Option<EnvironmentRecord>> {
    let row = sqlx::query_as::<_, (Uuid, Uuid, String, serde_json::Value)>(
        r#"
        SELECT id, org_id, slug, secrets
        FROM environments
        WHERE org_id = $1 AND slug = $2
        "#,
    )
    .bind(org_id)
    .bind(slug)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(id, org_id, slug, secrets)| EnvironmentRecord {
        id,
        org_id,
        slug,
        secrets: json_to_string_map(secrets),
    }))
}

fn json_to_string_map(value: serde_json::Value) -> HashMap<String, String> {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                other => Some((k, other.to_string())),
            })
            .collect(),
        _ => HashMap::new(),
    }
}

/// Get a project by id.
pub async fn get_project(pool: &PgPool, project_id: Uuid) -> Result<Option<ProjectRecord>> {
    let record = sqlx::query_as::<_, ProjectRecord>(
        r#"
        SELECT id, org_id, name, default_branch
        FROM projects
        WHERE id = $1
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List active suites of a project on one branch.
pub async fn list_active_suites(
    pool: &PgPool,
    project_id: Uuid,
    branch: &str,
) -> Result<Vec<SuiteRecord>> {
    let records = sqlx::query_as::<_, SuiteRecord>(
        r#"
        SELECT id, project_id, name, branch, yaml, active
        FROM suites
        WHERE project_id = $1 AND branch = $2 AND active
        ORDER BY name ASC
        "#,
    )
    .bind(project_id)
    .bind(branch)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Point a suite's last_run at the given run.
pub async fn update_suite_last_run(pool: &PgPool, suite_id: Uuid, run_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE suites
        SET last_run_id = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(suite_id)
    .bind(run_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Point a test's last_run at the given run-test workflow.
pub async fn update_test_last_run(pool: &PgPool, test_id: Uuid, workflow_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tests
        SET last_run = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(test_id)
    .bind(workflow_id)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Scheduling Operations
// ============================================================================

/// Discovery phase of the scheduler tick.
///
/// Opens a transaction and attempts the transaction-scoped advisory lock;
/// `None` means another instance currently leads. With the lock held, fetches
/// up to `batch_size` due schedule ids and commits immediately so the lock is
/// held for milliseconds, not for the firing window.
pub async fn discover_due_project_schedules(
    pool: &PgPool,
    now: DateTime<Utc>,
    batch_size: i64,
) -> Result<Option<Vec<Uuid>>> {
    let mut tx = pool.begin().await?;

    let (leader,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
        .bind(SCHEDULER_ADVISORY_LOCK_KEY)
        .fetch_one(&mut *tx)
        .await?;

    if !leader {
        tx.rollback().await?;
        return Ok(None);
    }

    let ids: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM project_schedules
        WHERE next_fire_at <= $1
        ORDER BY next_fire_at ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(batch_size)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(Some(ids.into_iter().map(|(id,)| id).collect()))
}

/// Atomically claim a due schedule: verify it is still due, advance its
/// next-fire-at past `now`, and return the claimed row. Exactly one caller
/// wins; the rest observe `None`.
pub async fn claim_due_project_schedule(
    pool: &PgPool,
    schedule_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<ScheduleRecord>> {
    let record = sqlx::query_as::<_, ScheduleRecord>(
        r#"
        UPDATE project_schedules ps
        SET next_fire_at = $2 + make_interval(secs => ps.interval_seconds::double precision),
            updated_at = NOW()
        FROM (
            SELECT id, next_fire_at
            FROM project_schedules
            WHERE id = $1
            FOR UPDATE
        ) old
        WHERE ps.id = old.id AND old.next_fire_at <= $2
        RETURNING ps.id, ps.project_id, ps.name, ps.interval_seconds,
                  old.next_fire_at AS due_at, ps.next_fire_at,
                  ps.last_run_id, ps.last_run_status
        "#,
    )
    .bind(schedule_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Record the first run id and last status of a firing on the schedule row.
pub async fn record_schedule_run(
    pool: &PgPool,
    kind: ScheduleKind,
    schedule_id: Uuid,
    run_id: Option<&str>,
    status: &str,
) -> Result<()> {
    let table = match kind {
        ScheduleKind::Project => "project_schedules",
        ScheduleKind::Suite => "suite_schedules",
    };

    sqlx::query(&format!(
        r#"
        UPDATE {table}
        SET last_run_id = COALESCE($2, last_run_id),
            last_run_status = $3,
            updated_at = NOW()
        WHERE id = $1
        "#
    ))
    .bind(schedule_id)
    .bind(run_id)
    .bind(status)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Trait Implementation
// ============================================================================

#[async_trait::async_trait]
impl RunStore for PostgresRunStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        insert_run(&self.pool, run).await
    }

    async fn update_run(
        &self,
        run_id: &str,
        status: &str,
        ended_at: Option<DateTime<Utc>>,
        totals: &RunTotals,
    ) -> Result<()> {
        update_run(&self.pool, run_id, status, ended_at, totals).await
    }

    async fn get_run(&self, org_id: Option<Uuid>, run_id: &str) -> Result<Option<RunRecord>> {
        get_run(&self.pool, org_id, run_id).await
    }

    async fn find_run_by_prefix(
        &self,
        org_id: Option<Uuid>,
        prefix: &str,
    ) -> Result<Option<RunRecord>> {
        find_run_by_prefix(&self.pool, org_id, prefix).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        list_runs(&self.pool, filter).await
    }

    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        list_stale_runs(&self.pool, cutoff).await
    }

    async fn insert_run_test(&self, test: &RunTestRecord) -> Result<()> {
        insert_run_test(&self.pool, test).await
    }

    async fn update_run_test_status(
        &self,
        workflow_id: &str,
        status: &str,
        ended_at: Option<DateTime<Utc>>,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        update_run_test_status(
            &self.pool,
            workflow_id,
            status,
            ended_at,
            duration_ms,
            error_message,
        )
        .await
    }

    async fn list_run_tests(&self, run_id: &str) -> Result<Vec<RunTestRecord>> {
        list_run_tests(&self.pool, run_id).await
    }

    async fn list_stale_run_tests(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunTestRecord>> {
        list_stale_run_tests(&self.pool, cutoff, limit).await
    }

    async fn fail_pending_run_tests(&self, run_id: &str, error_message: &str) -> Result<u64> {
        fail_pending_run_tests(&self.pool, run_id, error_message).await
    }

    async fn append_run_log(&self, log: &RunLogRecord) -> Result<()> {
        append_run_log(&self.pool, log).await
    }

    async fn list_run_logs(&self, run_id: &str) -> Result<Vec<RunLogRecord>> {
        list_run_logs(&self.pool, run_id).await
    }

    async fn upsert_run_step(&self, step: &RunStepRecord) -> Result<()> {
        upsert_run_step(&self.pool, step).await
    }

    async fn get_environment_by_slug(
        &self,
        org_id: Uuid,
        slug: &str,
    ) -> Result<Option<EnvironmentRecord>> {
        get_environment_by_slug(&self.pool, org_id, slug).await
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectRecord>> {
        get_project(&self.pool, project_id).await
    }

    async fn list_active_suites(
        &self,
        project_id: Uuid,
        branch: &str,
    ) -> Result<Vec<SuiteRecord>> {
        list_active_suites(&self.pool, project_id, branch).await
    }

    async fn update_suite_last_run(&self, suite_id: Uuid, run_id: &str) -> Result<()> {
        update_suite_last_run(&self.pool, suite_id, run_id).await
    }

    async fn update_test_last_run(&self, test_id: Uuid, workflow_id: &str) -> Result<()> {
        update_test_last_run(&self.pool, test_id, workflow_id).await
    }

    async fn discover_due_project_schedules(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<Option<Vec<Uuid>>> {
        discover_due_project_schedules(&self.pool, now, batch_size).await
    }

    async fn claim_due_project_schedule(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>> {
        claim_due_project_schedule(&self.pool, schedule_id, now).await
    }

    async fn record_schedule_run(
        &self,
        kind: ScheduleKind,
        schedule_id: Uuid,
        run_id: Option<&str>,
        status: &str,
    ) -> Result<()> {
        record_schedule_run(&self.pool, kind, schedule_id, run_id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_clause_variants() {
        assert_eq!(order_clause(RunOrder::StartedAt, false), "started_at ASC");
        assert_eq!(order_clause(RunOrder::StartedAt, true), "started_at DESC");
        assert_eq!(
            order_clause(RunOrder::EndedAt, true),
            "ended_at DESC NULLS LAST"
        );
        assert_eq!(
            order_clause(RunOrder::Duration, false),
            "(ended_at - started_at) ASC NULLS FIRST"
        );
    }

    #[test]
    fn test_json_to_string_map() {
        let map = json_to_string_map(serde_json::json!({
            "API_KEY": "abc",
            "RETRIES": 3
        }));
        assert_eq!(map.get("API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(map.get("RETRIES").map(String::as_str), Some("3"));

        assert!(json_to_string_map(serde_json::json!(null)).is_empty());
        assert!(json_to_string_map(serde_json::json!([1, 2])).is_empty());
    }
}
