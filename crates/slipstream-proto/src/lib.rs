// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slipstream Protocol - gRPC + Protobuf communication layer
//!
//! This crate provides the wire protocol between the slipstream engine and
//! its clients (CLI, CI integrations, the workflow service callback path).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    slipstream-proto                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: Unary calls + Server streaming (StreamLogs)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: gRPC over HTTP/2 (tonic)                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use slipstream_proto::engine_proto::orchestrator_client::OrchestratorClient;
//! use slipstream_proto::engine_proto::CreateRunRequest;
//!
//! let mut client = OrchestratorClient::connect("http://127.0.0.1:7700").await?;
//! let response = client
//!     .create_run(CreateRunRequest {
//!         yaml_payload: suite_yaml.into_bytes(),
//!         run_context: None,
//!     })
//!     .await?;
//! println!("run id: {}", response.into_inner().run_id);
//! ```

// Re-export generated protobuf types for the orchestrator protocol
pub mod engine_proto {
    tonic::include_proto!("slipstream.engine.v1");
}
