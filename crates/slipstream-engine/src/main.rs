// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slipstream Engine - standalone server binary.
//!
//! Wires the engine runtime from environment configuration: gRPC server,
//! optional PostgreSQL-backed run store, auth gate, scheduler and
//! reconciler.

use std::sync::Arc;

use tracing::{info, warn};

use slipstream_engine::auth::{AuthGate, OidcVerifier};
use slipstream_engine::config::{AuthSettings, Config};
use slipstream_engine::runtime::EngineRuntime;
use slipstream_engine::store::{PostgresRunStore, RunStore};
use slipstream_engine::workflow::MockWorkflows;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slipstream_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        grpc_addr = %config.grpc_addr,
        auth_mode = config.auth.mode(),
        persistence = config.database_url.is_some(),
        "Starting Slipstream Engine"
    );

    // Connect to the database when persistence is enabled
    let store: Option<Arc<dyn RunStore>> = match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.db_pool_size)
                .connect(url)
                .await?;
            info!("Connected to database");
            Some(Arc::new(PostgresRunStore::new(pool)))
        }
        None => {
            warn!("SLIPSTREAM_DATABASE_URL not set, persistence disabled");
            None
        }
    };

    // Build the auth gate
    let gate = match config.auth.clone() {
        AuthSettings::None => AuthGate::disabled(),
        AuthSettings::Token { secret } => AuthGate::token(secret),
        AuthSettings::Oidc(oidc) => AuthGate::oidc(OidcVerifier::new(oidc)?),
    };

    // The workflow service client is deployment-specific; without one the
    // engine runs against the embedded simulator (local development only).
    warn!("no workflow service client configured, using the embedded simulator");
    let workflows = Arc::new(MockWorkflows::new());

    // Start the runtime
    let mut builder = EngineRuntime::builder()
        .workflows(workflows)
        .gate(gate)
        .bind_addr(config.grpc_addr)
        .require_org_scope(config.require_org_scope)
        .scheduler_config(config.scheduler.clone())
        .reconciler_config(config.reconciler.clone());
    if let Some(store) = store {
        builder = builder.store(store);
    }
    let runtime = builder.build()?.start().await?;

    info!(addr = %config.grpc_addr, "Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Slipstream Engine shut down");

    Ok(())
}
