// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the slipstream engine.
//!
//! [`EngineRuntime`] spawns the gRPC server plus the scheduler and
//! reconciler daemons and supports graceful shutdown, so the engine can run
//! standalone (see `main.rs`) or embedded in a larger tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use slipstream_engine::runtime::EngineRuntime;
//! use slipstream_engine::store::PostgresRunStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .store(Arc::new(PostgresRunStore::new(pool)))
//!         .workflows(workflow_service_client)
//!         .bind_addr("0.0.0.0:7700".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::AuthGate;
use crate::engine::{Engine, EngineOptions};
use crate::grpc::OrchestratorService;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::RunStore;
use crate::workflow::WorkflowService;

/// How long shutdown waits for in-flight suite cleanups.
const SHUTDOWN_CLEANUP_WAIT: Duration = Duration::from_secs(30);

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn RunStore>>,
    workflows: Option<Arc<dyn WorkflowService>>,
    gate: Option<AuthGate>,
    bind_addr: SocketAddr,
    require_org_scope: bool,
    monitor_timeout: Option<Duration>,
    cleanup_timeout: Option<Duration>,
    scheduler: SchedulerConfig,
    reconciler: ReconcilerConfig,
    daemons_enabled: bool,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            workflows: None,
            gate: None,
            bind_addr: "0.0.0.0:7700".parse().unwrap(),
            require_org_scope: false,
            monitor_timeout: None,
            cleanup_timeout: None,
            scheduler: SchedulerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            daemons_enabled: true,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the run store. Without one, persistence is disabled and the
    /// scheduler/reconciler stay off.
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the workflow service handle (required).
    pub fn workflows(mut self, workflows: Arc<dyn WorkflowService>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Set the auth gate. Defaults to authentication disabled.
    pub fn gate(mut self, gate: AuthGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Set the gRPC bind address.
    ///
    /// Default: `0.0.0.0:7700`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Require user principals to carry an organization claim.
    pub fn require_org_scope(mut self, require: bool) -> Self {
        self.require_org_scope = require;
        self
    }

    /// Override the per-test monitor deadline.
    pub fn monitor_timeout(mut self, timeout: Duration) -> Self {
        self.monitor_timeout = Some(timeout);
        self
    }

    /// Override the suite-cleanup deadline.
    pub fn cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = Some(timeout);
        self
    }

    /// Set the scheduler knobs.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Set the reconciler knobs.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = config;
        self
    }

    /// Disable the scheduler and reconciler daemons (tests, single-shot
    /// tooling).
    pub fn without_daemons(mut self) -> Self {
        self.daemons_enabled = false;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let workflows = self
            .workflows
            .ok_or_else(|| anyhow::anyhow!("workflows is required"))?;

        Ok(EngineRuntimeConfig {
            store: self.store,
            workflows,
            gate: self.gate.unwrap_or_else(AuthGate::disabled),
            bind_addr: self.bind_addr,
            require_org_scope: self.require_org_scope,
            monitor_timeout: self.monitor_timeout,
            cleanup_timeout: self.cleanup_timeout,
            scheduler: self.scheduler,
            reconciler: self.reconciler,
            daemons_enabled: self.daemons_enabled,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    store: Option<Arc<dyn RunStore>>,
    workflows: Arc<dyn WorkflowService>,
    gate: AuthGate,
    bind_addr: SocketAddr,
    require_org_scope: bool,
    monitor_timeout: Option<Duration>,
    cleanup_timeout: Option<Duration>,
    scheduler: SchedulerConfig,
    reconciler: ReconcilerConfig,
    daemons_enabled: bool,
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the gRPC server and the daemons.
    pub async fn start(self) -> Result<EngineRuntime> {
        let defaults = EngineOptions::default();
        let engine = Engine::with_options(
            self.store.clone(),
            self.workflows.clone(),
            EngineOptions {
                require_org_scope: self.require_org_scope,
                monitor_timeout: self.monitor_timeout.unwrap_or(defaults.monitor_timeout),
                cleanup_timeout: self.cleanup_timeout.unwrap_or(defaults.cleanup_timeout),
            },
        );
        let gate = Arc::new(self.gate);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // gRPC server
        let service = OrchestratorService::new(engine.clone(), gate.clone());
        let bind_addr = self.bind_addr;
        let mut server_rx = shutdown_rx.clone();
        let server_handle = tokio::spawn(async move {
            info!(addr = %bind_addr, "gRPC server starting");
            let result = tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_shutdown(bind_addr, async move {
                    let _ = server_rx.changed().await;
                })
                .await;
            if let Err(err) = &result {
                error!(error = %err, "gRPC server exited with error");
            }
            result.map_err(anyhow::Error::from)
        });

        // Scheduler and reconciler need the store.
        let mut scheduler_shutdown = None;
        let mut scheduler_handle = None;
        let mut reconciler_shutdown = None;
        let mut reconciler_handle = None;

        if self.daemons_enabled {
            if let Some(store) = &self.store {
                let scheduler =
                    Scheduler::new(engine.clone(), store.clone(), self.scheduler.clone());
                scheduler_shutdown = Some(scheduler.shutdown_handle());
                scheduler_handle = Some(tokio::spawn(scheduler.run()));

                let reconciler = Reconciler::new(
                    engine.clone(),
                    store.clone(),
                    self.workflows.clone(),
                    self.reconciler.clone(),
                );
                reconciler_shutdown = Some(reconciler.shutdown_handle());
                reconciler_handle = Some(tokio::spawn(reconciler.run()));
            } else {
                info!("persistence disabled, scheduler and reconciler not started");
            }
        }

        info!(addr = %bind_addr, "EngineRuntime started");

        Ok(EngineRuntime {
            engine,
            bind_addr,
            shutdown_tx,
            server_handle,
            scheduler_shutdown,
            scheduler_handle,
            reconciler_shutdown,
            reconciler_handle,
        })
    }
}

/// A running engine that can be embedded in an application.
pub struct EngineRuntime {
    engine: Arc<Engine>,
    bind_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_handle: JoinHandle<Result<()>>,
    scheduler_shutdown: Option<Arc<Notify>>,
    scheduler_handle: Option<JoinHandle<()>>,
    reconciler_shutdown: Option<Arc<Notify>>,
    reconciler_handle: Option<JoinHandle<()>>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The gRPC bind address.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// The shared engine value.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Check if the gRPC server is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Gracefully shut down: stop the daemons, stop the server, then wait
    /// for in-flight suite cleanups.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        if let Some(notify) = &self.scheduler_shutdown {
            notify.notify_waiters();
        }
        if let Some(notify) = &self.reconciler_shutdown {
            notify.notify_waiters();
        }
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.scheduler_handle {
            let _ = handle.await;
        }
        if let Some(handle) = self.reconciler_handle {
            let _ = handle.await;
        }
        match self.server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "gRPC server error during shutdown");
                return Err(err);
            }
            Err(err) => {
                error!(error = %err, "gRPC server task panicked");
                return Err(anyhow::anyhow!("server task panicked: {err}"));
            }
        }

        if !self.engine.wait_for_cleanup(SHUTDOWN_CLEANUP_WAIT).await {
            warn!("suite cleanups still running at shutdown deadline");
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
