// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC surface of the engine.
//!
//! Thin mapping layer: every handler authorizes through the shared
//! [`AuthGate`] routine first, converts proto messages to domain types,
//! delegates to the engine, and maps [`EngineError`] onto gRPC status codes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use slipstream_proto::engine_proto as pb;
use slipstream_proto::engine_proto::orchestrator_server::{Orchestrator, OrchestratorServer};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::auth::{AuthGate, Principal};
use crate::engine::Engine;
use crate::runctx::{ConfigSource, RunContext, Trigger};
use crate::service::{ListQuery, RunSnapshot, StepReport, TestSnapshot};
use crate::state::{LogLine, RunStatus, TestStatus};

/// Fully-qualified gRPC service name.
pub const SERVICE_NAME: &str = "slipstream.engine.v1.Orchestrator";

/// Capabilities advertised via `GetServerInfo`.
const CAPABILITIES: &[&str] = &[
    "run-orchestration",
    "log-streaming",
    "scheduling",
    "reconciliation",
];

/// Default `WaitForCleanup` deadline when the client supplies none.
const DEFAULT_CLEANUP_WAIT: Duration = Duration::from_secs(30);

fn full_method(method: &str) -> String {
    format!("/{SERVICE_NAME}/{method}")
}

/// The tonic service implementation.
pub struct OrchestratorService {
    engine: Arc<Engine>,
    gate: Arc<AuthGate>,
}

impl OrchestratorService {
    /// Create the service.
    pub fn new(engine: Arc<Engine>, gate: Arc<AuthGate>) -> Self {
        Self { engine, gate }
    }

    /// Wrap into the generated tonic server type.
    pub fn into_server(self) -> OrchestratorServer<Self> {
        OrchestratorServer::new(self)
    }

    async fn authorize<T>(&self, request: &Request<T>, method: &str) -> Result<Principal, Status> {
        self.gate
            .authorize(request.metadata(), &full_method(method))
            .await
    }
}

#[tonic::async_trait]
impl Orchestrator for OrchestratorService {
    async fn health(
        &self,
        request: Request<pb::HealthRequest>,
    ) -> Result<Response<pb::HealthResponse>, Status> {
        self.authorize(&request, "Health").await?;
        Ok(Response::new(pb::HealthResponse {
            status: "ok".to_string(),
        }))
    }

    async fn get_server_info(
        &self,
        request: Request<pb::GetServerInfoRequest>,
    ) -> Result<Response<pb::GetServerInfoResponse>, Status> {
        self.authorize(&request, "GetServerInfo").await?;

        let oidc = self.gate.oidc_config().map(|config| pb::OidcInfo {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            client_id: config.client_id.clone(),
            scopes: config.scopes.clone(),
            device_authorization_endpoint: config.device_authorization_endpoint.clone(),
            token_endpoint: config.token_endpoint.clone(),
        });

        Ok(Response::new(pb::GetServerInfoResponse {
            version: self.engine.version().to_string(),
            auth_enabled: self.gate.enabled(),
            auth_type: self.gate.auth_type().to_string(),
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            oidc,
        }))
    }

    async fn create_run(
        &self,
        request: Request<pb::CreateRunRequest>,
    ) -> Result<Response<pb::CreateRunResponse>, Status> {
        let principal = self.authorize(&request, "CreateRun").await?;
        let req = request.into_inner();

        let context = req.run_context.map(context_from_proto);
        let run_id = self
            .engine
            .create_run(&principal, &req.yaml_payload, context)
            .await?;

        Ok(Response::new(pb::CreateRunResponse { run_id }))
    }

    async fn list_runs(
        &self,
        request: Request<pb::ListRunsRequest>,
    ) -> Result<Response<pb::ListRunsResponse>, Status> {
        let principal = self.authorize(&request, "ListRuns").await?;
        let req = request.into_inner();

        let status = match req.status {
            Some(raw) => match run_status_from_proto(raw) {
                Some(status) => Some(status),
                None => return Err(Status::invalid_argument("invalid status filter")),
            },
            None => None,
        };

        let query = ListQuery {
            project_id: req.project_id,
            source: req.source,
            branch: req.branch,
            status,
            schedule_name: req.schedule_name,
            order_by: req.order_by,
            descending: req.descending,
            limit: req.limit as i64,
        };

        let runs = self.engine.list_runs(&principal, &query).await?;
        Ok(Response::new(pb::ListRunsResponse {
            runs: runs.iter().map(snapshot_to_proto).collect(),
        }))
    }

    async fn get_run(
        &self,
        request: Request<pb::GetRunRequest>,
    ) -> Result<Response<pb::GetRunResponse>, Status> {
        let principal = self.authorize(&request, "GetRun").await?;
        let req = request.into_inner();

        let details = self.engine.get_run(&principal, &req.run_id).await?;
        Ok(Response::new(pb::GetRunResponse {
            run: Some(snapshot_to_proto(&details.run)),
            tests: details.tests.iter().map(test_to_proto).collect(),
        }))
    }

    async fn cancel_run(
        &self,
        request: Request<pb::CancelRunRequest>,
    ) -> Result<Response<pb::CancelRunResponse>, Status> {
        let principal = self.authorize(&request, "CancelRun").await?;
        let req = request.into_inner();
        if req.run_id.is_empty() {
            return Err(Status::invalid_argument("missing run id"));
        }

        let outcome = self.engine.cancel_run(&principal, &req.run_id).await?;
        Ok(Response::new(pb::CancelRunResponse {
            success: outcome.success,
            message: outcome.message,
        }))
    }

    type StreamLogsStream = ReceiverStream<Result<pb::LogLine, Status>>;

    async fn stream_logs(
        &self,
        request: Request<pb::StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let principal = self.authorize(&request, "StreamLogs").await?;
        let req = request.into_inner();

        let mut lines = self.engine.stream_logs(&principal, &req.run_id).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if tx.send(Ok(log_line_to_proto(&line))).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn add_log(
        &self,
        request: Request<pb::AddLogRequest>,
    ) -> Result<Response<pb::AddLogResponse>, Status> {
        let principal = self.authorize(&request, "AddLog").await?;
        let req = request.into_inner();
        if req.run_id.is_empty() {
            return Err(Status::invalid_argument("missing run id"));
        }

        let line = LogLine {
            message: req.message,
            color: none_if_empty(req.color),
            bold: req.bold,
            test_name: none_if_empty(req.test_name),
            step_name: none_if_empty(req.step_name),
        };
        self.engine.add_log(&principal, &req.run_id, line).await;

        Ok(Response::new(pb::AddLogResponse {}))
    }

    async fn upsert_run_step(
        &self,
        request: Request<pb::UpsertRunStepRequest>,
    ) -> Result<Response<pb::UpsertRunStepResponse>, Status> {
        let principal = self.authorize(&request, "UpsertRunStep").await?;
        let req = request.into_inner();
        if req.run_test_id.is_empty() {
            return Err(Status::invalid_argument("missing run test id"));
        }

        let report = StepReport {
            run_test_id: req.run_test_id,
            step_index: req.step_index as i32,
            name: req.name,
            status: req.status,
            started_at: millis_to_datetime(req.started_at_ms),
            ended_at: req.ended_at_ms.map(millis_to_datetime),
            request_json: none_if_empty(req.request_json),
            response_json: none_if_empty(req.response_json),
            assertions_json: none_if_empty(req.assertions_json),
            variables_json: none_if_empty(req.variables_json),
            config_json: none_if_empty(req.config_json),
        };
        self.engine.upsert_run_step(&principal, report).await?;

        Ok(Response::new(pb::UpsertRunStepResponse {}))
    }

    async fn wait_for_cleanup(
        &self,
        request: Request<pb::WaitForCleanupRequest>,
    ) -> Result<Response<pb::WaitForCleanupResponse>, Status> {
        self.authorize(&request, "WaitForCleanup").await?;
        let req = request.into_inner();

        let deadline = if req.timeout_seconds > 0 {
            Duration::from_secs(req.timeout_seconds as u64)
        } else {
            DEFAULT_CLEANUP_WAIT
        };
        let completed = self.engine.wait_for_cleanup(deadline).await;

        Ok(Response::new(pb::WaitForCleanupResponse { completed }))
    }
}

// ============================================================================
// Proto Mapping
// ============================================================================

fn none_if_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn context_from_proto(ctx: pb::RunContext) -> RunContext {
    let commit_sha = none_if_empty(ctx.commit_sha);
    RunContext {
        project_id: none_if_empty(ctx.project_id),
        source: ctx.source,
        branch: none_if_empty(ctx.branch),
        config_source: if commit_sha.is_some() {
            ConfigSource::RepoCommit
        } else {
            ConfigSource::Uncommitted
        },
        commit_sha,
        trigger: Trigger::parse(&ctx.trigger),
        schedule_name: none_if_empty(ctx.schedule_name),
        metadata: ctx.metadata.into_iter().collect::<HashMap<_, _>>(),
    }
}

fn run_status_to_proto(status: RunStatus) -> pb::RunStatus {
    match status {
        RunStatus::Pending => pb::RunStatus::Pending,
        RunStatus::Running => pb::RunStatus::Running,
        RunStatus::Passed => pb::RunStatus::Passed,
        RunStatus::Failed => pb::RunStatus::Failed,
        RunStatus::Timeout => pb::RunStatus::Timeout,
        RunStatus::Cancelled => pb::RunStatus::Cancelled,
    }
}

fn run_status_from_proto(raw: i32) -> Option<RunStatus> {
    match pb::RunStatus::try_from(raw).ok()? {
        pb::RunStatus::Unspecified => None,
        pb::RunStatus::Pending => Some(RunStatus::Pending),
        pb::RunStatus::Running => Some(RunStatus::Running),
        pb::RunStatus::Passed => Some(RunStatus::Passed),
        pb::RunStatus::Failed => Some(RunStatus::Failed),
        pb::RunStatus::Timeout => Some(RunStatus::Timeout),
        pb::RunStatus::Cancelled => Some(RunStatus::Cancelled),
    }
}

fn test_status_to_proto(status: TestStatus) -> pb::TestStatus {
    match status {
        TestStatus::Pending => pb::TestStatus::Pending,
        TestStatus::Passed => pb::TestStatus::Passed,
        TestStatus::Failed => pb::TestStatus::Failed,
        TestStatus::Timeout => pb::TestStatus::Timeout,
    }
}

fn snapshot_to_proto(run: &RunSnapshot) -> pb::RunSummary {
    pb::RunSummary {
        run_id: run.run_id.clone(),
        suite_name: run.suite_name.clone(),
        status: run_status_to_proto(run.status).into(),
        source: run.source.clone(),
        branch: run.branch.clone().unwrap_or_default(),
        trigger: run.trigger.clone(),
        schedule_name: run.schedule_name.clone().unwrap_or_default(),
        initiator: run.initiator.clone(),
        started_at_ms: run.started_at.timestamp_millis(),
        ended_at_ms: run.ended_at.map(|t| t.timestamp_millis()),
        total_tests: run.totals.total.max(0) as u32,
        passed_tests: run.totals.passed.max(0) as u32,
        failed_tests: run.totals.failed.max(0) as u32,
        timeout_tests: run.totals.timed_out.max(0) as u32,
    }
}

fn test_to_proto(test: &TestSnapshot) -> pb::TestSummary {
    pb::TestSummary {
        workflow_id: test.workflow_id.clone(),
        name: test.name.clone(),
        status: test_status_to_proto(test.status).into(),
        started_at_ms: test.started_at.timestamp_millis(),
        ended_at_ms: test.ended_at.map(|t| t.timestamp_millis()),
    }
}

fn log_line_to_proto(line: &LogLine) -> pb::LogLine {
    pb::LogLine {
        message: line.message.clone(),
        color: line.color.clone().unwrap_or_default(),
        bold: line.bold,
        test_name: line.test_name.clone().unwrap_or_default(),
        step_name: line.step_name.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
            let proto = run_status_to_proto(status);
            assert_eq!(run_status_from_proto(proto.into()), Some(status));
        }
        assert_eq!(run_status_from_proto(0), None);
        assert_eq!(run_status_from_proto(999), None);
    }

    #[test]
    fn test_context_from_proto_detects_config_source() {
        let ctx = context_from_proto(pb::RunContext {
            project_id: String::new(),
            source: "ci-branch".to_string(),
            branch: "main".to_string(),
            commit_sha: "abc123".to_string(),
            trigger: "ci".to_string(),
            schedule_name: String::new(),
            metadata: Default::default(),
        });
        assert_eq!(ctx.config_source, ConfigSource::RepoCommit);
        assert_eq!(ctx.trigger, Trigger::Ci);
        assert!(ctx.project_id.is_none());

        let ctx = context_from_proto(pb::RunContext {
            project_id: String::new(),
            source: "cli-local".to_string(),
            branch: String::new(),
            commit_sha: String::new(),
            trigger: "manual".to_string(),
            schedule_name: String::new(),
            metadata: Default::default(),
        });
        assert_eq!(ctx.config_source, ConfigSource::Uncommitted);
    }
}
