// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock workflow service for testing.
//!
//! Simulates workflow execution without a real workflow service. Workflows
//! either auto-complete after a short delay or wait for the test to script
//! their outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{
    WorkflowDescription, WorkflowError, WorkflowOptions, WorkflowRunStatus, WorkflowService,
    WorkflowType,
};

#[derive(Debug, Clone)]
struct MockWorkflow {
    workflow_type: WorkflowType,
    input: Value,
    outcome: Option<Result<Value, WorkflowError>>,
    description_override: Option<WorkflowDescription>,
    cancelled: bool,
}

/// Mock workflow service.
pub struct MockWorkflows {
    workflows: Arc<Mutex<HashMap<String, MockWorkflow>>>,
    starts: Mutex<Vec<String>>,
    cancels: Mutex<Vec<String>>,
    /// If true, every `execute` call fails.
    pub fail_starts: bool,
    /// If true, workflows complete on their own after `auto_delay_ms`.
    pub auto_complete: bool,
    /// Delay before auto-completion (in milliseconds).
    pub auto_delay_ms: u64,
    /// If true, auto-completed workflows fail instead of succeeding.
    pub fail_by_default: bool,
}

impl Default for MockWorkflows {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkflows {
    /// Workflows auto-complete successfully after a short delay.
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(Mutex::new(HashMap::new())),
            starts: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            fail_starts: false,
            auto_complete: true,
            auto_delay_ms: 10,
            fail_by_default: false,
        }
    }

    /// Workflows stay running until the test scripts their outcome.
    pub fn manual() -> Self {
        Self {
            auto_complete: false,
            ..Self::new()
        }
    }

    /// Workflows auto-complete with a failure.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Every workflow start fails.
    pub fn failing_starts() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Mark a workflow completed with the given output.
    pub async fn complete_workflow(&self, workflow_id: &str, output: Value) {
        let mut workflows = self.workflows.lock().await;
        if let Some(workflow) = workflows.get_mut(workflow_id) {
            workflow.outcome.get_or_insert(Ok(output));
        }
    }

    /// Mark a workflow failed with the given error message.
    pub async fn fail_workflow(&self, workflow_id: &str, error: &str) {
        let mut workflows = self.workflows.lock().await;
        if let Some(workflow) = workflows.get_mut(workflow_id) {
            workflow
                .outcome
                .get_or_insert(Err(WorkflowError::Failed(error.to_string())));
        }
    }

    /// Mark a workflow as having hit its execution timeout.
    pub async fn time_out_workflow(&self, workflow_id: &str) {
        let mut workflows = self.workflows.lock().await;
        if let Some(workflow) = workflows.get_mut(workflow_id) {
            workflow.outcome.get_or_insert(Err(WorkflowError::TimedOut(
                "execution timeout".to_string(),
            )));
        }
    }

    /// Override what `describe` reports for a workflow, registering it if
    /// the engine never started it (reconciler recovery scenarios).
    pub async fn set_description(&self, workflow_id: &str, description: WorkflowDescription) {
        let mut workflows = self.workflows.lock().await;
        let workflow = workflows
            .entry(workflow_id.to_string())
            .or_insert(MockWorkflow {
                workflow_type: WorkflowType::Test,
                input: Value::Null,
                outcome: None,
                description_override: None,
                cancelled: false,
            });
        workflow.description_override = Some(description);
    }

    /// Workflow ids in start order.
    pub async fn started_ids(&self) -> Vec<String> {
        self.starts.lock().await.clone()
    }

    /// Workflow ids that received a cancel request.
    pub async fn cancelled_ids(&self) -> Vec<String> {
        self.cancels.lock().await.clone()
    }

    /// How many started workflow ids end with the given suffix. Used to
    /// witness at-most-once cleanup launches.
    pub async fn starts_with_suffix(&self, suffix: &str) -> usize {
        self.starts
            .lock()
            .await
            .iter()
            .filter(|id| id.ends_with(suffix))
            .count()
    }

    /// The input a workflow was started with.
    pub async fn input_of(&self, workflow_id: &str) -> Option<Value> {
        self.workflows
            .lock()
            .await
            .get(workflow_id)
            .map(|w| w.input.clone())
    }

    /// The type a workflow was started as.
    pub async fn type_of(&self, workflow_id: &str) -> Option<WorkflowType> {
        self.workflows
            .lock()
            .await
            .get(workflow_id)
            .map(|w| w.workflow_type)
    }
}

#[async_trait]
impl WorkflowService for MockWorkflows {
    async fn execute(
        &self,
        options: WorkflowOptions,
        workflow_type: WorkflowType,
        input: Value,
    ) -> Result<(), WorkflowError> {
        if self.fail_starts {
            return Err(WorkflowError::StartFailed {
                workflow_id: options.workflow_id,
                reason: "mock start failure".to_string(),
            });
        }

        {
            let mut workflows = self.workflows.lock().await;
            workflows.insert(
                options.workflow_id.clone(),
                MockWorkflow {
                    workflow_type,
                    input,
                    outcome: None,
                    description_override: None,
                    cancelled: false,
                },
            );
        }
        self.starts.lock().await.push(options.workflow_id.clone());

        if self.auto_complete {
            let workflows = self.workflows.clone();
            let workflow_id = options.workflow_id;
            let fail = self.fail_by_default;
            let delay = self.auto_delay_ms;

            tokio::spawn(async move {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let mut workflows = workflows.lock().await;
                if let Some(workflow) = workflows.get_mut(&workflow_id) {
                    workflow.outcome.get_or_insert(if fail {
                        Err(WorkflowError::Failed("mock failure".to_string()))
                    } else {
                        Ok(serde_json::json!({ "status": "completed" }))
                    });
                }
            });
        }

        Ok(())
    }

    async fn join(&self, workflow_id: &str) -> Result<Value, WorkflowError> {
        loop {
            {
                let workflows = self.workflows.lock().await;
                match workflows.get(workflow_id) {
                    Some(workflow) => {
                        if let Some(outcome) = &workflow.outcome {
                            return outcome.clone();
                        }
                    }
                    None => return Err(WorkflowError::NotFound(workflow_id.to_string())),
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn cancel(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        self.cancels.lock().await.push(workflow_id.to_string());

        let mut workflows = self.workflows.lock().await;
        match workflows.get_mut(workflow_id) {
            Some(workflow) => {
                workflow.cancelled = true;
                // The cancellation handler runs and closes the workflow.
                workflow.outcome.get_or_insert(Err(WorkflowError::Cancelled));
                Ok(())
            }
            None => Err(WorkflowError::NotFound(workflow_id.to_string())),
        }
    }

    async fn describe(&self, workflow_id: &str) -> Result<WorkflowDescription, WorkflowError> {
        let workflows = self.workflows.lock().await;
        let Some(workflow) = workflows.get(workflow_id) else {
            return Err(WorkflowError::NotFound(workflow_id.to_string()));
        };

        if let Some(description) = workflow.description_override {
            return Ok(description);
        }

        let status = match &workflow.outcome {
            None => WorkflowRunStatus::Running,
            Some(Ok(_)) => WorkflowRunStatus::Completed,
            Some(Err(WorkflowError::TimedOut(_))) => WorkflowRunStatus::TimedOut,
            Some(Err(WorkflowError::Cancelled)) => WorkflowRunStatus::Canceled,
            Some(Err(_)) => WorkflowRunStatus::Failed,
        };
        let close_time = match status {
            WorkflowRunStatus::Running => None,
            _ => Some(Utc::now()),
        };

        Ok(WorkflowDescription { status, close_time })
    }
}
