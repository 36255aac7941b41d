// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine value.
//!
//! One [`Engine`] exists per process. It owns the in-memory run state, the
//! optional run store, the workflow service handle, and the wait group
//! tracking detached suite-cleanup tasks. The run service operations live in
//! [`crate::service`], the monitor/finalizer machinery in
//! [`crate::lifecycle`]; both are `impl Engine` blocks over this value.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{EngineError, Result};
use crate::state::{EngineState, LogLine};
use crate::store::{RunLogRecord, RunStore};
use crate::workflow::WorkflowService;

/// Default upper bound on one test-workflow monitor.
pub const DEFAULT_MONITOR_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default upper bound on one suite-cleanup workflow.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Tunables of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Require user principals to carry an organization claim.
    pub require_org_scope: bool,
    /// Per-test monitor deadline.
    pub monitor_timeout: Duration,
    /// Suite-cleanup deadline.
    pub cleanup_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            require_org_scope: false,
            monitor_timeout: DEFAULT_MONITOR_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

/// The orchestrator engine. One value per process, shared as `Arc<Engine>`.
pub struct Engine {
    pub(crate) state: EngineState,
    pub(crate) store: Option<Arc<dyn RunStore>>,
    pub(crate) workflows: Arc<dyn WorkflowService>,
    pub(crate) cleanups: TaskTracker,
    pub(crate) require_org_scope: bool,
    pub(crate) monitor_timeout: Duration,
    pub(crate) cleanup_timeout: Duration,
    pub(crate) started: std::time::Instant,
    pub(crate) version: String,
    // Handle back to the owning Arc, for spawning monitor/cleanup tasks.
    self_ref: Weak<Engine>,
}

impl Engine {
    /// Create an engine with default options. Passing `None` for the store
    /// disables persistence; runs then live only in memory.
    pub fn new(store: Option<Arc<dyn RunStore>>, workflows: Arc<dyn WorkflowService>) -> Arc<Self> {
        Self::with_options(store, workflows, EngineOptions::default())
    }

    /// Create an engine with explicit options.
    pub fn with_options(
        store: Option<Arc<dyn RunStore>>,
        workflows: Arc<dyn WorkflowService>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: EngineState::new(),
            store,
            workflows,
            cleanups: TaskTracker::new(),
            require_org_scope: options.require_org_scope,
            monitor_timeout: options.monitor_timeout,
            cleanup_timeout: options.cleanup_timeout,
            started: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            self_ref: weak.clone(),
        })
    }

    /// Upgrade the self handle for task spawning. Fails only while the last
    /// `Arc` is being dropped, at which point no new work should start.
    pub(crate) fn shared(&self) -> Option<Arc<Engine>> {
        self.self_ref.upgrade()
    }

    /// The configured run store, when persistence is enabled.
    pub fn store(&self) -> Option<&Arc<dyn RunStore>> {
        self.store.as_ref()
    }

    /// Engine version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// Resolve the caller's organization scope.
    ///
    /// Service accounts (the workflow service's callback identity) may omit
    /// the org; user callers must carry one when org scoping is required.
    pub(crate) fn caller_org(&self, principal: &Principal) -> Result<Option<Uuid>> {
        if let Some(org_id) = principal.org_id {
            return Ok(Some(org_id));
        }
        if self.require_org_scope && !principal.is_service_account() {
            return Err(EngineError::PermissionDenied(
                "organization scope required".to_string(),
            ));
        }
        Ok(None)
    }

    /// Append a log line to the run, in memory and in the store.
    pub(crate) async fn append_log(&self, run_id: &str, line: LogLine) {
        if !self.state.append_log(run_id, line.clone()) {
            warn!(run_id, message = %line.message, "dropping log line for unknown run");
            return;
        }
        self.persist_log(run_id, &line).await;
    }

    /// Best-effort log persistence. Failures are logged at debug and never
    /// escalate.
    pub(crate) async fn persist_log(&self, run_id: &str, line: &LogLine) {
        let Some(store) = &self.store else {
            return;
        };
        let record = RunLogRecord {
            run_id: run_id.to_string(),
            message: line.message.clone(),
            color: line.color.clone(),
            bold: line.bold,
            test_name: line.test_name.clone(),
            step_name: line.step_name.clone(),
            created_at: Utc::now(),
        };
        if let Err(err) = store.append_run_log(&record).await {
            debug!(run_id, error = %err, "failed to persist log line");
        }
    }

    /// Block until all tracked suite-cleanup tasks finish, or the deadline
    /// elapses. Returns whether everything completed.
    pub async fn wait_for_cleanup(&self, deadline: Duration) -> bool {
        self.cleanups.close();
        let completed = tokio::time::timeout(deadline, self.cleanups.wait())
            .await
            .is_ok();
        self.cleanups.reopen();
        completed
    }
}
