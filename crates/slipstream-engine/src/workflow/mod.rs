// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow service abstraction.
//!
//! The engine does not execute test steps itself; it starts durable
//! workflows on an external workflow service and observes their terminal
//! results. This module defines the consumed contract.
//!
//! The service is a PURE execution engine from the engine's point of view -
//! it does not touch the run store. All persistence happens in the caller.

pub mod mock;

pub use self::mock::MockWorkflows;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Task queue every engine workflow is started on.
pub const TASK_QUEUE: &str = "test-workflows";

/// Workflow types the engine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowType {
    /// Executes one test (also used for the suite-init step set).
    Test,
    /// Executes a suite's cleanup step set.
    SuiteCleanup,
}

impl WorkflowType {
    /// Registered workflow type name on the workflow service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "TestWorkflow",
            Self::SuiteCleanup => "SuiteCleanupWorkflow",
        }
    }
}

/// Options for starting a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Workflow id (shared id format with run ids).
    pub workflow_id: String,
    /// Task queue to start on.
    pub task_queue: String,
    /// Upper bound on the workflow execution, when the caller sets one.
    pub execution_timeout: Option<Duration>,
}

impl WorkflowOptions {
    /// Options on the engine task queue.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_queue: TASK_QUEUE.to_string(),
            execution_timeout: None,
        }
    }

    /// Set the execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Closure status reported by the workflow service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowRunStatus {
    /// Still executing.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Hit its execution timeout.
    TimedOut,
    /// Cancelled.
    Canceled,
    /// Terminated by an operator.
    Terminated,
    /// Continued as a new execution.
    ContinuedAsNew,
    /// The service reported a status this engine does not know.
    Unknown,
}

/// Result of a `describe` call.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowDescription {
    /// Closure status.
    pub status: WorkflowRunStatus,
    /// When the workflow closed, for terminal statuses.
    pub close_time: Option<DateTime<Utc>>,
}

/// Errors from workflow service operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// Workflow could not be started.
    #[error("failed to start workflow '{workflow_id}': {reason}")]
    StartFailed {
        /// The workflow id that failed to start.
        workflow_id: String,
        /// The reason for failure.
        reason: String,
    },

    /// Workflow ran and failed.
    #[error("{0}")]
    Failed(String),

    /// Workflow hit its execution timeout.
    #[error("workflow timed out: {0}")]
    TimedOut(String),

    /// Workflow was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// Workflow id is unknown to the service.
    #[error("workflow '{0}' not found")]
    NotFound(String),

    /// Transport-level failure talking to the service.
    #[error("workflow service error: {0}")]
    Transport(String),
}

/// The consumed workflow service contract.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Start a workflow. Returns once the service has accepted the
    /// execution; the result is observed via [`join`](Self::join).
    async fn execute(
        &self,
        options: WorkflowOptions,
        workflow_type: WorkflowType,
        input: Value,
    ) -> Result<(), WorkflowError>;

    /// Await the terminal result of a workflow.
    async fn join(&self, workflow_id: &str) -> Result<Value, WorkflowError>;

    /// Request cancellation of a workflow.
    async fn cancel(&self, workflow_id: &str) -> Result<(), WorkflowError>;

    /// Describe a workflow's current execution status.
    async fn describe(&self, workflow_id: &str) -> Result<WorkflowDescription, WorkflowError>;
}
