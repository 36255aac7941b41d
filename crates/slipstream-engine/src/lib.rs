// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slipstream Engine - Test Suite Orchestrator
//!
//! This crate is the orchestrator engine of the slipstream test-automation
//! platform. It parses submitted suites, starts one durable workflow per
//! test on the external workflow service, tracks live status in memory and
//! in the run store, streams incremental logs to clients, reconciles stale
//! state after crashes, and fires scheduled runs from a leader-elected
//! scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                                │
//! │                      (CLI, CI integrations)                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ gRPC (slipstream-proto)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Auth Gate                                      │
//! │        (bearer token / OIDC validation, permission classes)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ Principal
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Run Service                                    │
//! │   CreateRun / GetRun / ListRuns / CancelRun / StreamLogs / AddLog       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                  │                           │
//!        │ state            │ rows                      │ workflows
//!        ▼                  ▼                           ▼
//! ┌──────────────┐  ┌───────────────┐  ┌─────────────────────────────────┐
//! │ Engine State │  │   Run Store   │  │        Workflow Service         │
//! │ (in-memory)  │  │ (PostgreSQL)  │  │  (durable execution, external)  │
//! └──────────────┘  └───────────────┘  └─────────────────────────────────┘
//!        ▲                  ▲                           │
//!        │                  │                           ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │        Workflow Monitors ──► Run Finalizer ──► Suite Cleanup            │
//! └─────────────────────────────────────────────────────────────────────────┘
//!
//!   Parallel daemons: Scheduler (leader-elected)  │  Reconciler
//! ```
//!
//! # Run Status State Machine
//!
//! ```text
//!                     ┌─────────┐
//!          ┌──────────│ RUNNING │─────────────┐
//!          │          └────┬────┘             │
//!          │               │                  │
//!   all passed    any failed/timed out     cancel
//!          │               │                  │
//!          ▼               ▼                  ▼
//!     ┌────────┐      ┌────────┐        ┌───────────┐
//!     │ PASSED │      │ FAILED │        │ CANCELLED │
//!     └────────┘      └────────┘        └───────────┘
//! ```
//!
//! Terminal statuses are absorbing; `ended_at` is set exactly when a run
//! becomes terminal.
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`auth`]: Bearer/OIDC validation and per-method permissions
//! - [`state`]: In-memory run state under one reader-writer lock
//! - [`store`]: Persistence trait with PostgreSQL and in-memory backends
//! - [`workflow`]: Consumed workflow-service contract
//! - [`service`]: Client-facing run operations
//! - [`lifecycle`]: Workflow monitors, run finalizer, suite cleanup
//! - [`scheduler`]: Leader-elected schedule firing
//! - [`reconciler`]: Stale-state reconciliation
//! - [`grpc`]: tonic service implementation
//! - [`runtime`]: Embeddable builder runtime

#![deny(missing_docs)]

/// Authentication and authorization gate.
pub mod auth;

/// Engine configuration from environment variables.
pub mod config;

/// The engine value shared across components.
pub mod engine;

/// Error types with gRPC status mapping.
pub mod error;

/// gRPC service implementation.
pub mod grpc;

/// Run and workflow id generation.
pub mod ids;

/// Workflow monitors, run finalizer and suite cleanup.
pub mod lifecycle;

/// Stale-state reconciliation daemon.
pub mod reconciler;

/// Run context detection.
pub mod runctx;

/// Leader-elected schedule firing daemon.
pub mod scheduler;

/// Client-facing run operations.
pub mod service;

/// In-memory engine state.
pub mod state;

/// Persistence interfaces and backends.
pub mod store;

/// Parsed-suite contract.
pub mod suite;

/// Consumed workflow-service contract.
pub mod workflow;

/// Embeddable runtime.
pub mod runtime;
