// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory [`RunStore`] implementation.
//!
//! Backs tests and persistence-disabled deployments. Mirrors the semantics
//! of the PostgreSQL backend, including the atomic schedule claim and the
//! advisory-lock leadership gate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{
    EnvironmentRecord, ProjectRecord, Result, RunFilter, RunLogRecord, RunOrder, RunRecord,
    RunStepRecord, RunStore, RunTestRecord, RunTotals, ScheduleKind, ScheduleRecord, StoreError,
    SuiteRecord,
};

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory store. All maps are guarded by their own mutex; no guard is
/// ever held across an await point.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunRecord>>,
    run_tests: Mutex<HashMap<String, RunTestRecord>>,
    run_logs: Mutex<Vec<RunLogRecord>>,
    run_steps: Mutex<HashMap<(String, i32), RunStepRecord>>,
    environments: Mutex<Vec<EnvironmentRecord>>,
    projects: Mutex<HashMap<Uuid, ProjectRecord>>,
    suites: Mutex<Vec<SuiteRecord>>,
    schedules: Mutex<HashMap<Uuid, ScheduleRecord>>,
    suite_last_runs: Mutex<HashMap<Uuid, String>>,
    test_last_runs: Mutex<HashMap<Uuid, String>>,
    scheduler_leader: Mutex<()>,
    fail_insert_run: Mutex<bool>,
    fail_update_run: Mutex<bool>,
}

impl MemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment for slug resolution.
    pub fn add_environment(&self, env: EnvironmentRecord) {
        lock(&self.environments).push(env);
    }

    /// Register a project.
    pub fn add_project(&self, project: ProjectRecord) {
        lock(&self.projects).insert(project.id, project);
    }

    /// Register a suite.
    pub fn add_suite(&self, suite: SuiteRecord) {
        lock(&self.suites).push(suite);
    }

    /// Register a project schedule.
    pub fn add_schedule(&self, schedule: ScheduleRecord) {
        lock(&self.schedules).insert(schedule.id, schedule);
    }

    /// Read back a schedule row.
    pub fn get_schedule(&self, schedule_id: Uuid) -> Option<ScheduleRecord> {
        lock(&self.schedules).get(&schedule_id).cloned()
    }

    /// Read back one run test row.
    pub fn get_run_test(&self, workflow_id: &str) -> Option<RunTestRecord> {
        lock(&self.run_tests).get(workflow_id).cloned()
    }

    /// Read back the suite last-run pointer.
    pub fn suite_last_run(&self, suite_id: Uuid) -> Option<String> {
        lock(&self.suite_last_runs).get(&suite_id).cloned()
    }

    /// Read back the test last-run pointer.
    pub fn test_last_run(&self, test_id: Uuid) -> Option<String> {
        lock(&self.test_last_runs).get(&test_id).cloned()
    }

    /// Hold the scheduler leadership gate; while the guard lives, every
    /// discovery attempt observes another leader.
    pub fn hold_scheduler_lease(&self) -> std::sync::MutexGuard<'_, ()> {
        lock(&self.scheduler_leader)
    }

    /// Make the next `insert_run` calls fail.
    pub fn set_fail_insert_run(&self, fail: bool) {
        *lock(&self.fail_insert_run) = fail;
    }

    /// Make the next `update_run` calls fail.
    pub fn set_fail_update_run(&self, fail: bool) {
        *lock(&self.fail_update_run) = fail;
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        if *lock(&self.fail_insert_run) {
            return Err(StoreError::Other("insert_run failure injected".into()));
        }
        lock(&self.runs).insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &str,
        status: &str,
        ended_at: Option<DateTime<Utc>>,
        totals: &RunTotals,
    ) -> Result<()> {
        if *lock(&self.fail_update_run) {
            return Err(StoreError::Other("update_run failure injected".into()));
        }
        let mut runs = lock(&self.runs);
        let run = runs.get_mut(run_id).ok_or(StoreError::NotFound {
            entity: "run",
            id: run_id.to_string(),
        })?;
        run.status = status.to_string();
        run.ended_at = ended_at;
        run.total_tests = totals.total;
        run.passed_tests = totals.passed;
        run.failed_tests = totals.failed;
        run.timeout_tests = totals.timed_out;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn get_run(&self, org_id: Option<Uuid>, run_id: &str) -> Result<Option<RunRecord>> {
        let runs = lock(&self.runs);
        Ok(runs
            .get(run_id)
            .filter(|r| org_id.is_none() || Some(r.org_id) == org_id)
            .cloned())
    }

    async fn find_run_by_prefix(
        &self,
        org_id: Option<Uuid>,
        prefix: &str,
    ) -> Result<Option<RunRecord>> {
        let runs = lock(&self.runs);
        let mut matches = runs
            .values()
            .filter(|r| r.run_id.starts_with(prefix))
            .filter(|r| org_id.is_none() || Some(r.org_id) == org_id);
        let first = matches.next().cloned();
        if matches.next().is_some() {
            return Ok(None);
        }
        Ok(first)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let runs = lock(&self.runs);
        let mut matched: Vec<RunRecord> = runs
            .values()
            .filter(|r| filter.org_id.is_none() || Some(r.org_id) == filter.org_id)
            .filter(|r| filter.project_id.is_none() || r.project_id == filter.project_id)
            .filter(|r| {
                filter
                    .source
                    .as_deref()
                    .is_none_or(|source| r.source == source)
            })
            .filter(|r| {
                filter
                    .branch
                    .as_deref()
                    .is_none_or(|branch| r.branch.as_deref() == Some(branch))
            })
            .filter(|r| {
                filter
                    .status
                    .as_deref()
                    .is_none_or(|status| r.status == status)
            })
            .filter(|r| {
                filter
                    .schedule_name
                    .as_deref()
                    .is_none_or(|name| r.schedule_name.as_deref() == Some(name))
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            let ordering = match filter.order {
                RunOrder::StartedAt => a.started_at.cmp(&b.started_at),
                RunOrder::EndedAt => a.ended_at.cmp(&b.ended_at),
                RunOrder::Duration => {
                    let dur = |r: &RunRecord| r.ended_at.map(|e| e - r.started_at);
                    dur(a).cmp(&dur(b))
                }
            };
            if filter.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let limit = if filter.limit > 0 {
            filter.limit as usize
        } else {
            50
        };
        matched.truncate(limit);
        Ok(matched)
    }

    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        let runs = lock(&self.runs);
        Ok(runs
            .values()
            .filter(|r| r.status == "running" && r.started_at < cutoff)
            .cloned()
            .collect())
    }

    async fn insert_run_test(&self, test: &RunTestRecord) -> Result<()> {
        lock(&self.run_tests).insert(test.workflow_id.clone(), test.clone());
        Ok(())
    }

    async fn update_run_test_status(
        &self,
        workflow_id: &str,
        status: &str,
        ended_at: Option<DateTime<Utc>>,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tests = lock(&self.run_tests);
        let test = tests.get_mut(workflow_id).ok_or(StoreError::NotFound {
            entity: "run test",
            id: workflow_id.to_string(),
        })?;
        test.status = status.to_string();
        test.ended_at = ended_at;
        test.duration_ms = duration_ms;
        test.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn list_run_tests(&self, run_id: &str) -> Result<Vec<RunTestRecord>> {
        let tests = lock(&self.run_tests);
        let mut matched: Vec<RunTestRecord> = tests
            .values()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(matched)
    }

    async fn list_stale_run_tests(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunTestRecord>> {
        let tests = lock(&self.run_tests);
        let mut matched: Vec<RunTestRecord> = tests
            .values()
            .filter(|t| (t.status == "pending" || t.status == "running") && t.started_at < cutoff)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        matched.truncate(limit.max(0) as usize);
        Ok(matched)
    }

    async fn fail_pending_run_tests(&self, run_id: &str, error_message: &str) -> Result<u64> {
        let mut tests = lock(&self.run_tests);
        let now = Utc::now();
        let mut failed = 0;
        for test in tests.values_mut() {
            if test.run_id == run_id && (test.status == "pending" || test.status == "running") {
                test.status = "failed".to_string();
                test.ended_at = Some(now);
                test.error_message = Some(error_message.to_string());
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn append_run_log(&self, log: &RunLogRecord) -> Result<()> {
        lock(&self.run_logs).push(log.clone());
        Ok(())
    }

    async fn list_run_logs(&self, run_id: &str) -> Result<Vec<RunLogRecord>> {
        let logs = lock(&self.run_logs);
        Ok(logs.iter().filter(|l| l.run_id == run_id).cloned().collect())
    }

    async fn upsert_run_step(&self, step: &RunStepRecord) -> Result<()> {
        lock(&self.run_steps).insert((step.run_test_id.clone(), step.step_index), step.clone());
        Ok(())
    }

    async fn get_environment_by_slug(
        &self,
        org_id: Uuid,
        slug: &str,
    ) -> Result<Option<EnvironmentRecord>> {
        let environments = lock(&self.environments);
        Ok(environments
            .iter()
            .find(|e| e.org_id == org_id && e.slug == slug)
            .cloned())
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectRecord>> {
        Ok(lock(&self.projects).get(&project_id).cloned())
    }

    async fn list_active_suites(
        &self,
        project_id: Uuid,
        branch: &str,
    ) -> Result<Vec<SuiteRecord>> {
        let suites = lock(&self.suites);
        Ok(suites
            .iter()
            .filter(|s| s.project_id == project_id && s.branch == branch && s.active)
            .cloned()
            .collect())
    }

    async fn update_suite_last_run(&self, suite_id: Uuid, run_id: &str) -> Result<()> {
        lock(&self.suite_last_runs).insert(suite_id, run_id.to_string());
        Ok(())
    }

    async fn update_test_last_run(&self, test_id: Uuid, workflow_id: &str) -> Result<()> {
        lock(&self.test_last_runs).insert(test_id, workflow_id.to_string());
        Ok(())
    }

    async fn discover_due_project_schedules(
        &self,
        now: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<Option<Vec<Uuid>>> {
        // try_lock stands in for pg_try_advisory_xact_lock: a holder elsewhere
        // means another instance leads this tick.
        let Ok(_leader) = self.scheduler_leader.try_lock() else {
            return Ok(None);
        };
        let schedules = lock(&self.schedules);
        let mut due: Vec<(DateTime<Utc>, Uuid)> = schedules
            .values()
            .filter(|s| s.next_fire_at <= now)
            .map(|s| (s.next_fire_at, s.id))
            .collect();
        due.sort();
        due.truncate(batch_size.max(0) as usize);
        Ok(Some(due.into_iter().map(|(_, id)| id).collect()))
    }

    async fn claim_due_project_schedule(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScheduleRecord>> {
        let mut schedules = lock(&self.schedules);
        let Some(schedule) = schedules.get_mut(&schedule_id) else {
            return Ok(None);
        };
        if schedule.next_fire_at > now {
            return Ok(None);
        }
        schedule.due_at = schedule.next_fire_at;
        schedule.next_fire_at = now + Duration::seconds(schedule.interval_seconds);
        Ok(Some(schedule.clone()))
    }

    async fn record_schedule_run(
        &self,
        _kind: ScheduleKind,
        schedule_id: Uuid,
        run_id: Option<&str>,
        status: &str,
    ) -> Result<()> {
        let mut schedules = lock(&self.schedules);
        if let Some(schedule) = schedules.get_mut(&schedule_id) {
            if let Some(run_id) = run_id {
                schedule.last_run_id = Some(run_id.to_string());
            }
            schedule.last_run_status = Some(status.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str, org_id: Uuid) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            run_id: run_id.to_string(),
            org_id,
            project_id: None,
            suite_id: None,
            suite_name: "suite".to_string(),
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
            started_at: now,
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let store = MemoryRunStore::new();
        let org = Uuid::new_v4();
        store.insert_run(&record("r1", org)).await.unwrap();

        let found = store.get_run(Some(org), "r1").await.unwrap();
        assert!(found.is_some());

        let cross_org = store.get_run(Some(Uuid::new_v4()), "r1").await.unwrap();
        assert!(cross_org.is_none());
    }

    #[tokio::test]
    async fn test_prefix_lookup_requires_unique_match() {
        let store = MemoryRunStore::new();
        let org = Uuid::new_v4();
        store.insert_run(&record("01jaaa", org)).await.unwrap();
        store.insert_run(&record("01jbbb", org)).await.unwrap();

        assert!(
            store
                .find_run_by_prefix(Some(org), "01ja")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .find_run_by_prefix(Some(org), "01j")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_claim_is_single_winner() {
        let store = MemoryRunStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        store.add_schedule(ScheduleRecord {
            id,
            project_id: Uuid::new_v4(),
            name: "nightly".to_string(),
            interval_seconds: 3600,
            due_at: now,
            next_fire_at: now - Duration::seconds(5),
            last_run_id: None,
            last_run_status: None,
        });

        let first = store.claim_due_project_schedule(id, now).await.unwrap();
        assert!(first.is_some());
        let second = store.claim_due_project_schedule(id, now).await.unwrap();
        assert!(second.is_none(), "a claimed schedule is no longer due");
    }

    #[tokio::test]
    async fn test_discovery_skips_when_lease_held() {
        let store = MemoryRunStore::new();
        let guard = store.hold_scheduler_lease();
        let result = store
            .discover_due_project_schedules(Utc::now(), 100)
            .await
            .unwrap();
        assert!(result.is_none());
        drop(guard);

        let result = store
            .discover_due_project_schedules(Utc::now(), 100)
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_fail_pending_run_tests() {
        let store = MemoryRunStore::new();
        let now = Utc::now();
        for (workflow_id, status) in [("w1", "pending"), ("w2", "passed")] {
            store
                .insert_run_test(&RunTestRecord {
                    workflow_id: workflow_id.to_string(),
                    run_id: "r1".to_string(),
                    test_id: None,
                    name: workflow_id.to_string(),
                    status: status.to_string(),
                    started_at: now,
                    ended_at: None,
                    duration_ms: 0,
                    step_count: 0,
                    error_message: None,
                })
                .await
                .unwrap();
        }

        let failed = store.fail_pending_run_tests("r1", "stale").await.unwrap();
        assert_eq!(failed, 1);
        assert_eq!(store.get_run_test("w1").unwrap().status, "failed");
        assert_eq!(store.get_run_test("w2").unwrap().status, "passed");
    }
}
