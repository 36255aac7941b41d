// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The run service: client-facing operations of the engine.
//!
//! Owns the suite-init -> tests -> suite-cleanup choreography of
//! `create_run`, plus lookup, listing, cancellation, log streaming and the
//! workflow-service callback endpoints (`add_log`, `upsert_run_step`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::ids;
use crate::runctx::{RunContext, detect_run_context};
use crate::state::{
    LogLine, PrefixMatch, RunInfo, RunStatus, ScheduleRef, TestInfo, TestStatus,
};
use crate::store::{
    RunOrder, RunFilter, RunRecord, RunStepRecord, RunTestRecord, RunTotals,
};
use crate::suite::{self, Suite, SuiteInitResult};
use crate::workflow::{WorkflowError, WorkflowOptions, WorkflowType};

/// Interval between streaming snapshots of a run's log.
const STREAM_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Point-in-time view of a run.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    /// Run id.
    pub run_id: String,
    /// Suite name.
    pub suite_name: String,
    /// Current status.
    pub status: RunStatus,
    /// Source label.
    pub source: String,
    /// Git branch, when known.
    pub branch: Option<String>,
    /// Trigger string.
    pub trigger: String,
    /// Schedule name for scheduled runs.
    pub schedule_name: Option<String>,
    /// Who started the run.
    pub initiator: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, for terminal runs.
    pub ended_at: Option<DateTime<Utc>>,
    /// Test totals.
    pub totals: RunTotals,
}

/// Point-in-time view of one test.
#[derive(Debug, Clone)]
pub struct TestSnapshot {
    /// Workflow id.
    pub workflow_id: String,
    /// Test name.
    pub name: String,
    /// Current status.
    pub status: TestStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, for terminal tests.
    pub ended_at: Option<DateTime<Utc>>,
}

/// `get_run` result: the run plus its test list.
#[derive(Debug, Clone)]
pub struct RunDetails {
    /// The run.
    pub run: RunSnapshot,
    /// Its tests.
    pub tests: Vec<TestSnapshot>,
}

/// Structured `cancel_run` result.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    /// False only when the run is unknown to this engine.
    pub success: bool,
    /// Human-readable outcome, enumerating any workflows that failed to
    /// cancel.
    pub message: String,
}

/// Validated `list_runs` query.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Restrict to one project.
    pub project_id: Option<String>,
    /// Restrict to one source label.
    pub source: Option<String>,
    /// Restrict to one branch.
    pub branch: Option<String>,
    /// Restrict to one status.
    pub status: Option<RunStatus>,
    /// Restrict to one schedule name.
    pub schedule_name: Option<String>,
    /// Ordering column (`started_at`, `ended_at`, `duration`).
    pub order_by: String,
    /// Descending order.
    pub descending: bool,
    /// Page size; zero means the default of 50.
    pub limit: i64,
}

/// A workflow-reported step, keyed by `(run_test_id, step_index)`.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Workflow id of the owning test.
    pub run_test_id: String,
    /// Zero-based step position.
    pub step_index: i32,
    /// Step name.
    pub name: String,
    /// Step status string.
    pub status: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time, when finished.
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

/// Parameters of an internal run creation (RPC path or scheduler path).
pub(crate) struct InternalRunParams {
    pub org_id: Option<Uuid>,
    pub initiator: String,
    pub payload: Vec<u8>,
    pub context: Option<RunContext>,
    pub suite_id: Option<Uuid>,
    pub schedule: Option<ScheduleRef>,
}

impl Engine {
    // ========================================================================
    // CreateRun
    // ========================================================================

    /// Create a run from a suite payload on behalf of an authenticated
    /// caller.
    #[instrument(skip(self, principal, payload, context), fields(initiator = %principal.initiator()))]
    pub async fn create_run(
        &self,
        principal: &Principal,
        payload: &[u8],
        context: Option<RunContext>,
    ) -> Result<String> {
        let org_id = self.caller_org(principal)?;
        self.create_run_internal(InternalRunParams {
            org_id,
            initiator: principal.initiator(),
            payload: payload.to_vec(),
            context,
            suite_id: None,
            schedule: None,
        })
        .await
    }

    /// Create a run. Shared by the RPC path and the scheduler.
    pub(crate) async fn create_run_internal(
        &self,
        params: InternalRunParams,
    ) -> Result<String> {
        // 1. Run id first: lexicographic order matches creation order.
        let run_id = ids::new_id();

        // 2. Parse the payload and reject empty suites.
        let parsed = suite::parse_suite(&params.payload)?;
        if parsed.tests.is_empty() {
            return Err(EngineError::InvalidArgument(
                "suite contains no tests".to_string(),
            ));
        }

        // 3. Client context, or best-effort detection.
        let context = params.context.unwrap_or_else(detect_run_context);

        let project_id = match context.project_id.as_deref().filter(|p| !p.is_empty()) {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
                EngineError::InvalidArgument(format!("invalid project id '{raw}'"))
            })?),
            None => None,
        };

        // The org column is always set when persistence is enabled; callers
        // without an org (auth disabled, static token) land in the nil org.
        let persist_org = params.org_id.unwrap_or(Uuid::nil());

        // 4. Resolve environment secrets before anything starts.
        let env_secrets = match &parsed.environment {
            Some(slug) => {
                let environment = match &self.store {
                    Some(store) => store.get_environment_by_slug(persist_org, slug).await?,
                    None => None,
                };
                match environment {
                    Some(environment) => environment.secrets,
                    None => {
                        return Err(EngineError::InvalidArgument(format!(
                            "unknown environment '{slug}'"
                        )));
                    }
                }
            }
            None => HashMap::new(),
        };

        // 5. Persist the run record.
        let now = Utc::now();
        if let Some(store) = &self.store {
            let bundle_sha = hex::encode(Sha256::digest(&params.payload));
            let record = RunRecord {
                run_id: run_id.clone(),
                org_id: persist_org,
                project_id,
                suite_id: params.suite_id,
                suite_name: parsed.name.clone(),
                status: RunStatus::Running.as_str().to_string(),
                initiator: params.initiator.clone(),
                trigger: context.trigger.as_str().to_string(),
                schedule_name: context.schedule_name.clone(),
                config_source: context.config_source.as_str().to_string(),
                source: context.source.clone(),
                branch: context.branch.clone(),
                commit_sha: context.commit_sha.clone(),
                bundle_sha: Some(bundle_sha),
                total_tests: parsed.tests.len() as i32,
                passed_tests: 0,
                failed_tests: 0,
                timeout_tests: 0,
                started_at: now,
                ended_at: None,
                created_at: now,
                updated_at: now,
            };
            store.insert_run(&record).await?;
        }

        // 6. Register the run in memory.
        self.state.insert_run(RunInfo {
            run_id: run_id.clone(),
            org_id: params.org_id,
            project_id,
            suite_id: params.suite_id,
            suite_name: parsed.name.clone(),
            initiator: params.initiator.clone(),
            status: RunStatus::Running,
            started_at: now,
            ended_at: None,
            expected_tests: parsed.tests.len(),
            tests: HashMap::new(),
            logs: Vec::new(),
            suite_init_completed: false,
            suite_init_failed: false,
            suite_cleanup_ran: false,
            saved_globals: HashMap::new(),
            vars: parsed.vars.clone(),
            cleanup: parsed.cleanup.clone(),
            openapi: parsed.openapi.clone(),
            env_secrets: env_secrets.clone(),
            schedule: params.schedule,
            context: context.clone(),
        });

        info!(%run_id, suite = %parsed.name, tests = parsed.tests.len(), "run created");
        self.append_log(
            &run_id,
            LogLine::plain(format!(
                "Starting suite \"{}\" ({} tests)",
                parsed.name,
                parsed.tests.len()
            )),
        )
        .await;

        // 7. Suite init runs to completion before any test starts.
        if !parsed.init.is_empty() {
            match self.run_suite_init(&run_id, &parsed, &env_secrets).await {
                Ok(saved) => {
                    self.state.with_run_mut(&run_id, |run| {
                        run.suite_init_completed = true;
                        run.saved_globals = saved;
                    });
                    self.append_log(&run_id, LogLine::plain("Suite initialization completed"))
                        .await;
                }
                Err(err) => {
                    self.handle_suite_init_failure(&run_id, parsed.tests.len(), &err)
                        .await;
                    // The run exists and is terminal; the call still
                    // succeeds so the client can inspect it.
                    return Ok(run_id);
                }
            }
        }

        // 8. One workflow per test.
        let globals = self
            .state
            .with_run(&run_id, |run| run.saved_globals.clone())
            .unwrap_or_default();

        for test in &parsed.tests {
            let workflow_id = ids::new_id();
            let started_at = Utc::now();

            if let Some(store) = &self.store {
                let row = RunTestRecord {
                    workflow_id: workflow_id.clone(),
                    run_id: run_id.clone(),
                    test_id: None,
                    name: test.name.clone(),
                    status: TestStatus::Pending.as_str().to_string(),
                    started_at,
                    ended_at: None,
                    duration_ms: 0,
                    step_count: test.steps.len() as i32,
                    error_message: None,
                };
                if let Err(err) = store.insert_run_test(&row).await {
                    self.handle_start_failure(&run_id, &test.name, &err.to_string())
                        .await;
                    return Err(err.into());
                }
            }

            let input = serde_json::json!({
                "run_id": run_id,
                "test": test,
                "vars": parsed.vars,
                "openapi": parsed.openapi,
                "globals": globals,
                "env": env_secrets,
            });
            if let Err(err) = self
                .workflows
                .execute(
                    WorkflowOptions::new(&workflow_id).with_timeout(self.monitor_timeout),
                    WorkflowType::Test,
                    input,
                )
                .await
            {
                self.handle_start_failure(&run_id, &test.name, &err.to_string())
                    .await;
                return Err(err.into());
            }

            self.append_log(
                &run_id,
                LogLine::plain(format!("Test \"{}\" started", test.name)),
            )
            .await;
            self.state.with_run_mut(&run_id, |run| {
                run.tests.insert(
                    workflow_id.clone(),
                    TestInfo {
                        workflow_id: workflow_id.clone(),
                        name: test.name.clone(),
                        status: TestStatus::Pending,
                        started_at,
                        ended_at: None,
                        run_id: run_id.clone(),
                        test_id: None,
                    },
                );
            });
            self.spawn_test_monitor(run_id.clone(), workflow_id);
        }

        Ok(run_id)
    }

    /// Start the suite-init workflow and await its saved globals.
    async fn run_suite_init(
        &self,
        run_id: &str,
        parsed: &Suite,
        env_secrets: &HashMap<String, String>,
    ) -> std::result::Result<HashMap<String, String>, WorkflowError> {
        let workflow_id = format!("{run_id}_suite_init");
        self.append_log(run_id, LogLine::plain("Running suite initialization"))
            .await;

        let input = serde_json::json!({
            "run_id": run_id,
            "test": { "name": "suite_init", "steps": parsed.init },
            "vars": parsed.vars,
            "openapi": parsed.openapi,
            "globals": {},
            "env": env_secrets,
        });
        self.workflows
            .execute(
                WorkflowOptions::new(&workflow_id).with_timeout(self.monitor_timeout),
                WorkflowType::Test,
                input,
            )
            .await?;

        let output = tokio::time::timeout(self.monitor_timeout, self.workflows.join(&workflow_id))
            .await
            .map_err(|_| WorkflowError::TimedOut("suite init monitoring timeout".to_string()))??;

        let saved = serde_json::from_value::<SuiteInitResult>(output)
            .map(|result| result.saved)
            .unwrap_or_default();
        Ok(saved)
    }

    /// Suite init failed: the run is terminal FAILED with zero test
    /// workflows started, and cleanup runs in failure mode.
    async fn handle_suite_init_failure(
        &self,
        run_id: &str,
        total_tests: usize,
        err: &WorkflowError,
    ) {
        let now = Utc::now();
        let message = crate::lifecycle::clean_error_message(&err.to_string());
        warn!(run_id, error = %message, "suite initialization failed");

        let line = LogLine::colored(format!("Suite initialization failed: {message}"), "red");
        self.state.with_run_mut(run_id, |run| {
            run.suite_init_failed = true;
            run.set_terminal(RunStatus::Failed, now);
            run.logs.push(line.clone());
        });
        self.persist_log(run_id, &line).await;

        self.trigger_suite_cleanup(run_id, true);

        if let Some(store) = &self.store {
            let totals = RunTotals {
                total: total_tests as i32,
                ..RunTotals::default()
            };
            if let Err(err) = store
                .update_run(run_id, RunStatus::Failed.as_str(), Some(now), &totals)
                .await
            {
                warn!(run_id, error = %err, "failed to persist suite-init failure");
            }
        }
    }

    /// A test workflow failed to start: log, clean up, persist FAILED.
    async fn handle_start_failure(&self, run_id: &str, test_name: &str, message: &str) {
        let now = Utc::now();
        warn!(run_id, test = test_name, error = message, "failed to start test workflow");

        let line = LogLine::colored(
            format!("Failed to start test \"{test_name}\": {message}"),
            "red",
        );
        let counts = self.state.with_run_mut(run_id, |run| {
            run.set_terminal(RunStatus::Failed, now);
            run.logs.push(line.clone());
            run.counts()
        });
        self.persist_log(run_id, &line).await;

        self.trigger_suite_cleanup(run_id, true);

        if let (Some(store), Some(counts)) = (&self.store, counts) {
            let totals = RunTotals {
                total: counts.total as i32,
                passed: counts.passed as i32,
                failed: counts.failed as i32,
                timed_out: counts.timed_out as i32,
            };
            if let Err(err) = store
                .update_run(run_id, RunStatus::Failed.as_str(), Some(now), &totals)
                .await
            {
                warn!(run_id, error = %err, "failed to persist start failure");
            }
        }
    }

    // ========================================================================
    // GetRun / ListRuns
    // ========================================================================

    /// Look up a run by exact id or a unique prefix of at most 12
    /// characters, scoped to the caller's org.
    #[instrument(skip(self, principal))]
    pub async fn get_run(
        &self,
        principal: &Principal,
        id_or_prefix: &str,
    ) -> Result<RunDetails> {
        if id_or_prefix.is_empty() {
            return Err(EngineError::InvalidArgument("missing run id".to_string()));
        }
        let org_id = self.caller_org(principal)?;

        // Exact resident match first.
        if let Some(details) = self.state.with_run(id_or_prefix, |run| {
            if org_id.is_none() || run.org_id == org_id {
                Some(details_from_info(run))
            } else {
                None
            }
        }) {
            // Cross-org lookups read as not-found to avoid confirming
            // existence.
            return details.ok_or_else(|| EngineError::RunNotFound(id_or_prefix.to_string()));
        }

        // Resident prefix match.
        if id_or_prefix.len() <= 12 {
            match self.state.resolve_prefix(id_or_prefix, org_id) {
                PrefixMatch::One(run_id) => {
                    if let Some(details) = self.state.with_run(&run_id, |run| details_from_info(run))
                    {
                        return Ok(details);
                    }
                }
                PrefixMatch::Ambiguous => {
                    return Err(EngineError::InvalidArgument(format!(
                        "run id prefix '{id_or_prefix}' is ambiguous"
                    )));
                }
                PrefixMatch::None => {}
            }
        }

        // Fall back to the store for historical runs.
        if let Some(store) = &self.store {
            let record = match store.get_run(org_id, id_or_prefix).await? {
                Some(record) => Some(record),
                None if id_or_prefix.len() <= 12 => {
                    store.find_run_by_prefix(org_id, id_or_prefix).await?
                }
                None => None,
            };
            if let Some(record) = record {
                let tests = store
                    .list_run_tests(&record.run_id)
                    .await?
                    .iter()
                    .map(test_from_record)
                    .collect();
                return Ok(RunDetails {
                    run: snapshot_from_record(&record),
                    tests,
                });
            }
        }

        Err(EngineError::RunNotFound(id_or_prefix.to_string()))
    }

    /// List runs, filtered and ordered.
    #[instrument(skip(self, principal, query))]
    pub async fn list_runs(
        &self,
        principal: &Principal,
        query: &ListQuery,
    ) -> Result<Vec<RunSnapshot>> {
        let org_id = self.caller_org(principal)?;

        let order = RunOrder::parse(&query.order_by).ok_or_else(|| {
            EngineError::InvalidArgument(format!("invalid order_by '{}'", query.order_by))
        })?;
        let project_id = match query.project_id.as_deref().filter(|p| !p.is_empty()) {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
                EngineError::InvalidArgument(format!("invalid project id '{raw}'"))
            })?),
            None => None,
        };
        let filter = RunFilter {
            org_id,
            project_id,
            source: query.source.clone(),
            branch: query.branch.clone(),
            status: query.status.map(|s| s.as_str().to_string()),
            schedule_name: query.schedule_name.clone(),
            order,
            descending: query.descending,
            limit: if query.limit > 0 { query.limit } else { 50 },
        };

        if let Some(store) = &self.store {
            let records = store.list_runs(&filter).await?;
            return Ok(records.iter().map(snapshot_from_record).collect());
        }

        // Persistence disabled: serve the listing from resident runs.
        let mut snapshots = self.state.with_runs(|runs| {
            runs.values()
                .filter(|run| filter.org_id.is_none() || run.org_id == filter.org_id)
                .filter(|run| filter.project_id.is_none() || run.project_id == filter.project_id)
                .filter(|run| {
                    filter
                        .source
                        .as_deref()
                        .is_none_or(|source| run.context.source == source)
                })
                .filter(|run| {
                    filter
                        .branch
                        .as_deref()
                        .is_none_or(|branch| run.context.branch.as_deref() == Some(branch))
                })
                .filter(|run| {
                    filter
                        .status
                        .as_deref()
                        .is_none_or(|status| run.status.as_str() == status)
                })
                .filter(|run| {
                    filter.schedule_name.as_deref().is_none_or(|name| {
                        run.context.schedule_name.as_deref() == Some(name)
                    })
                })
                .map(snapshot_from_info)
                .collect::<Vec<_>>()
        });
        snapshots.sort_by(|a, b| {
            let ordering = match order {
                RunOrder::StartedAt => a.started_at.cmp(&b.started_at),
                RunOrder::EndedAt => a.ended_at.cmp(&b.ended_at),
                RunOrder::Duration => {
                    let dur = |s: &RunSnapshot| s.ended_at.map(|e| e - s.started_at);
                    dur(a).cmp(&dur(b))
                }
            };
            if filter.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        snapshots.truncate(filter.limit as usize);
        Ok(snapshots)
    }

    // ========================================================================
    // CancelRun
    // ========================================================================

    /// Cancel a run: request cancellation of every test workflow and await
    /// their terminal states so per-test cleanup handlers complete.
    #[instrument(skip(self, principal))]
    pub async fn cancel_run(
        &self,
        principal: &Principal,
        run_id: &str,
    ) -> Result<CancelOutcome> {
        let org_id = self.caller_org(principal)?;

        enum Start {
            Unknown,
            AlreadyTerminal,
            Cancelled(Vec<String>),
        }

        let now = Utc::now();
        let start = self
            .state
            .with_run_mut(run_id, |run| {
                if org_id.is_some() && run.org_id != org_id {
                    return Start::Unknown;
                }
                if run.status.is_terminal() {
                    return Start::AlreadyTerminal;
                }
                run.set_terminal(RunStatus::Cancelled, now);
                // Pushed in the same critical section as the status flip so
                // streaming snapshots never miss it.
                run.logs
                    .push(LogLine::colored("Run cancelled by user (Ctrl+C)", "yellow"));
                Start::Cancelled(run.tests.keys().cloned().collect())
            })
            .unwrap_or(Start::Unknown);

        let workflow_ids = match start {
            Start::Unknown => {
                return Ok(CancelOutcome {
                    success: false,
                    message: format!("run '{run_id}' not found"),
                });
            }
            Start::AlreadyTerminal => {
                return Ok(CancelOutcome {
                    success: true,
                    message: "run already finished".to_string(),
                });
            }
            Start::Cancelled(ids) => ids,
        };

        self.persist_log(run_id, &LogLine::colored("Run cancelled by user (Ctrl+C)", "yellow"))
            .await;

        // Cancel each workflow, then await its terminal state so per-test
        // cleanup handlers run to completion.
        let mut failed_cancels = Vec::new();
        for workflow_id in &workflow_ids {
            if let Err(err) = self.workflows.cancel(workflow_id).await {
                warn!(run_id, %workflow_id, error = %err, "failed to cancel workflow");
                failed_cancels.push(workflow_id.clone());
                continue;
            }
            match tokio::time::timeout(self.monitor_timeout, self.workflows.join(workflow_id))
                .await
            {
                Ok(_) => {}
                Err(_) => {
                    warn!(run_id, %workflow_id, "timed out awaiting cancelled workflow");
                    failed_cancels.push(workflow_id.clone());
                }
            }
        }

        self.trigger_suite_cleanup(run_id, true);

        if let Some(store) = &self.store {
            let counts = self
                .state
                .with_run(run_id, |run| run.counts())
                .unwrap_or_default();
            let totals = RunTotals {
                total: counts.total as i32,
                passed: counts.passed as i32,
                failed: counts.failed as i32,
                timed_out: counts.timed_out as i32,
            };
            if let Err(err) = store
                .update_run(run_id, RunStatus::Cancelled.as_str(), Some(now), &totals)
                .await
            {
                warn!(run_id, error = %err, "failed to persist cancellation");
            }
        }

        info!(run_id, cancelled = workflow_ids.len(), "run cancelled");
        let message = if failed_cancels.is_empty() {
            "run cancelled".to_string()
        } else {
            format!(
                "run cancelled; failed to cancel workflows: {}",
                failed_cancels.join(", ")
            )
        };
        Ok(CancelOutcome {
            success: true,
            message,
        })
    }

    // ========================================================================
    // StreamLogs
    // ========================================================================

    /// Open a log stream for a run.
    ///
    /// Resident runs are tailed live on a 500 ms ticker; snapshots are taken
    /// under the read lock and sent outside it. Runs known only to the store
    /// get their persisted logs replayed once. The stream ends when the run
    /// reaches a terminal status or the receiver is dropped.
    pub async fn stream_logs(
        &self,
        principal: &Principal,
        run_id: &str,
    ) -> Result<mpsc::Receiver<LogLine>> {
        let org_id = self.caller_org(principal)?;

        let resident = self
            .state
            .with_run(run_id, |run| org_id.is_none() || run.org_id == org_id);

        match resident {
            Some(true) => {}
            Some(false) => return Err(EngineError::RunNotFound(run_id.to_string())),
            None => {
                // Replay persisted logs once for non-resident runs.
                let Some(store) = &self.store else {
                    return Err(EngineError::RunNotFound(run_id.to_string()));
                };
                let Some(_run) = store.get_run(org_id, run_id).await? else {
                    return Err(EngineError::RunNotFound(run_id.to_string()));
                };
                let logs = store.list_run_logs(run_id).await?;
                let (tx, rx) = mpsc::channel(logs.len().max(1));
                for record in logs {
                    let line = LogLine {
                        message: record.message,
                        color: record.color,
                        bold: record.bold,
                        test_name: record.test_name,
                        step_name: record.step_name,
                    };
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                return Ok(rx);
            }
        }

        let (tx, rx) = mpsc::channel(64);
        let Some(engine) = self.shared() else {
            return Err(EngineError::Internal("engine is shutting down".to_string()));
        };
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STREAM_POLL_INTERVAL);
            let mut sent = 0usize;
            loop {
                let Some((fresh, status)) = engine.state.logs_since(&run_id, sent) else {
                    break;
                };
                sent += fresh.len();
                for line in fresh {
                    if tx.send(line).await.is_err() {
                        debug!(%run_id, "log stream consumer went away");
                        return;
                    }
                }
                if status.is_terminal() {
                    break;
                }
                ticker.tick().await;
            }
        });
        Ok(rx)
    }

    // ========================================================================
    // AddLog / UpsertRunStep (workflow callback path)
    // ========================================================================

    /// Workflow-initiated log append. Unknown runs are logged and discarded,
    /// never an error.
    pub async fn add_log(&self, _principal: &Principal, run_id: &str, line: LogLine) {
        self.append_log(run_id, line).await;
    }

    /// Workflow-initiated step report.
    pub async fn upsert_run_step(
        &self,
        _principal: &Principal,
        report: StepReport,
    ) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let record = RunStepRecord {
            run_test_id: report.run_test_id,
            step_index: report.step_index,
            name: report.name,
            status: report.status,
            started_at: report.started_at,
            ended_at: report.ended_at,
            request_json: report.request_json,
            response_json: report.response_json,
            assertions_json: report.assertions_json,
            variables_json: report.variables_json,
            config_json: report.config_json,
        };
        store.upsert_run_step(&record).await?;
        Ok(())
    }
}

fn snapshot_from_info(run: &RunInfo) -> RunSnapshot {
    let counts = run.counts();
    RunSnapshot {
        run_id: run.run_id.clone(),
        suite_name: run.suite_name.clone(),
        status: run.status,
        source: run.context.source.clone(),
        branch: run.context.branch.clone(),
        trigger: run.context.trigger.as_str().to_string(),
        schedule_name: run.context.schedule_name.clone(),
        initiator: run.initiator.clone(),
        started_at: run.started_at,
        ended_at: run.ended_at,
        totals: RunTotals {
            total: counts.total as i32,
            passed: counts.passed as i32,
            failed: counts.failed as i32,
            timed_out: counts.timed_out as i32,
        },
    }
}

fn details_from_info(run: &RunInfo) -> RunDetails {
    let mut tests: Vec<TestSnapshot> = run
        .tests
        .values()
        .map(|test| TestSnapshot {
            workflow_id: test.workflow_id.clone(),
            name: test.name.clone(),
            status: test.status,
            started_at: test.started_at,
            ended_at: test.ended_at,
        })
        .collect();
    tests.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
    RunDetails {
        run: snapshot_from_info(run),
        tests,
    }
}

fn snapshot_from_record(record: &RunRecord) -> RunSnapshot {
    RunSnapshot {
        run_id: record.run_id.clone(),
        suite_name: record.suite_name.clone(),
        status: RunStatus::parse(&record.status),
        source: record.source.clone(),
        branch: record.branch.clone(),
        trigger: record.trigger.clone(),
        schedule_name: record.schedule_name.clone(),
        initiator: record.initiator.clone(),
        started_at: record.started_at,
        ended_at: record.ended_at,
        totals: RunTotals {
            total: record.total_tests,
            passed: record.passed_tests,
            failed: record.failed_tests,
            timed_out: record.timeout_tests,
        },
    }
}

fn test_from_record(record: &RunTestRecord) -> TestSnapshot {
    TestSnapshot {
        workflow_id: record.workflow_id.clone(),
        name: record.name.clone(),
        status: TestStatus::parse(&record.status),
        started_at: record.started_at,
        ended_at: record.ended_at,
    }
}
