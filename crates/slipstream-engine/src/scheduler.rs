// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler for project schedules.
//!
//! One daemon per engine process, safe to run on every instance. Each tick
//! has two phases:
//!
//! 1. Discovery: a transaction-scoped advisory lock elects the tick's
//!    leader, which fetches the due schedule ids and releases the lock
//!    immediately (held for milliseconds).
//! 2. Firing, outside the lock: every due schedule is claimed via an atomic
//!    compare-and-advance on its next-fire-at, so exactly one instance fires
//!    it even when several discovered it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::runctx::RunContext;
use crate::service::InternalRunParams;
use crate::state::ScheduleRef;
use crate::store::{RunStore, ScheduleKind, ScheduleRecord};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to poll for due schedules.
    pub poll_interval: Duration,
    /// Maximum schedules to discover per tick.
    pub batch_size: i64,
    /// Schedules overdue by more than this are claimed but not fired.
    pub stale_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            stale_grace: Duration::from_secs(10 * 60),
        }
    }
}

/// Scheduler daemon.
pub struct Scheduler {
    engine: Arc<Engine>,
    store: Arc<dyn RunStore>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler over the engine's store.
    pub fn new(engine: Arc<Engine>, store: Arc<dyn RunStore>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                }
            }
        }
    }

    /// One scheduler tick: discover then fire.
    pub async fn tick(&self) -> crate::error::Result<()> {
        let now = Utc::now();

        let Some(due) = self
            .store
            .discover_due_project_schedules(now, self.config.batch_size)
            .await?
        else {
            debug!("another instance holds the scheduler lock, skipping tick");
            return Ok(());
        };

        if due.is_empty() {
            debug!("no due schedules");
            return Ok(());
        }

        info!(count = due.len(), "discovered due schedules");

        for schedule_id in due {
            // Only one instance wins the claim; the rest skip quietly.
            let claimed = match self
                .store
                .claim_due_project_schedule(schedule_id, now)
                .await
            {
                Ok(Some(schedule)) => schedule,
                Ok(None) => {
                    debug!(%schedule_id, "schedule already claimed");
                    continue;
                }
                Err(err) => {
                    error!(%schedule_id, error = %err, "failed to claim schedule");
                    continue;
                }
            };

            let overdue = now - claimed.due_at;
            if overdue.to_std().unwrap_or_default() > self.config.stale_grace {
                warn!(
                    schedule_id = %claimed.id,
                    overdue_secs = overdue.num_seconds(),
                    "skipping stale schedule firing"
                );
                continue;
            }

            if let Err(err) = self.fire_schedule(&claimed).await {
                error!(schedule_id = %claimed.id, error = %err, "failed to fire schedule");
            }
        }

        Ok(())
    }

    /// Fire one claimed schedule: create an internal run per active suite on
    /// the project's default branch.
    async fn fire_schedule(&self, schedule: &ScheduleRecord) -> crate::error::Result<()> {
        let Some(project) = self.store.get_project(schedule.project_id).await? else {
            warn!(schedule_id = %schedule.id, "schedule points at a missing project");
            return Ok(());
        };

        let suites = self
            .store
            .list_active_suites(project.id, &project.default_branch)
            .await?;
        if suites.is_empty() {
            debug!(schedule_id = %schedule.id, "no active suites for schedule");
            return Ok(());
        }

        info!(
            schedule_id = %schedule.id,
            project = %project.name,
            suites = suites.len(),
            "firing schedule"
        );

        let mut first_run_id: Option<String> = None;
        let mut last_status = "running";

        for suite in suites {
            let mut context = RunContext::for_schedule(&schedule.name, &project.default_branch);
            context.project_id = Some(project.id.to_string());

            let params = InternalRunParams {
                org_id: Some(project.org_id),
                initiator: format!("schedule:{}", schedule.id),
                payload: suite.yaml.clone().into_bytes(),
                context: Some(context),
                suite_id: Some(suite.id),
                schedule: Some(ScheduleRef {
                    id: schedule.id,
                    kind: ScheduleKind::Project,
                }),
            };

            match self.engine.create_run_internal(params).await {
                Ok(run_id) => {
                    info!(schedule_id = %schedule.id, suite = %suite.name, %run_id, "scheduled run created");
                    if first_run_id.is_none() {
                        first_run_id = Some(run_id);
                    }
                }
                Err(err) => {
                    error!(schedule_id = %schedule.id, suite = %suite.name, error = %err, "scheduled run failed to start");
                    last_status = "error";
                }
            }
        }

        self.store
            .record_schedule_run(
                ScheduleKind::Project,
                schedule.id,
                first_run_id.as_deref(),
                last_status,
            )
            .await?;

        Ok(())
    }
}
