// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parsed-suite contract.
//!
//! The suite DSL lives in its own library; the engine only depends on the
//! parsed document shape defined here. [`parse_suite`] is the boundary: it
//! turns a raw YAML payload into a [`Suite`] and performs no semantic
//! validation beyond deserialization (the run service rejects zero-test
//! suites itself).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from suite payload parsing.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// The payload was empty.
    #[error("suite payload is empty")]
    Empty,

    /// The payload was not valid suite YAML.
    #[error("invalid suite yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A parsed test document.
#[derive(Debug, Clone, Deserialize)]
pub struct Suite {
    /// Suite name, shown in run listings.
    pub name: String,

    /// Variables merged into every test's inputs.
    #[serde(default)]
    pub vars: serde_json::Map<String, Value>,

    /// Steps executed once before any test workflow starts.
    #[serde(default)]
    pub init: Vec<StepSpec>,

    /// The tests; each one executes as a single workflow.
    #[serde(default)]
    pub tests: Vec<TestSpec>,

    /// Steps executed once after the last test reaches a terminal status.
    #[serde(default)]
    pub cleanup: Option<CleanupSpec>,

    /// OpenAPI validation configuration passed through to test workflows.
    #[serde(default)]
    pub openapi: Option<OpenApiConfig>,

    /// Slug of the environment providing secrets for this suite.
    #[serde(default)]
    pub environment: Option<String>,
}

/// One unit of work inside a suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Human-readable test name.
    pub name: String,

    /// Ordered steps; the step semantics belong to the workflow runtime.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// A single step. The engine treats step configuration as opaque; only the
/// workflow runtime interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name.
    pub name: String,

    /// Plugin identifier (http, sql, delay, ...).
    #[serde(default)]
    pub plugin: Option<String>,

    /// Opaque plugin configuration.
    #[serde(flatten)]
    pub config: serde_json::Map<String, Value>,
}

/// Cleanup specification executed by `SuiteCleanupWorkflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSpec {
    /// Ordered cleanup steps.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// OpenAPI validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiConfig {
    /// Location of the OpenAPI document.
    #[serde(default)]
    pub spec: String,

    /// Additional validator options, passed through untouched.
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

/// Saved variables returned by a successful suite-init workflow.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteInitResult {
    /// String globals made available to every subsequent test workflow.
    #[serde(default)]
    pub saved: HashMap<String, String>,
}

/// Parse a raw YAML payload into a [`Suite`].
pub fn parse_suite(payload: &[u8]) -> Result<Suite, SuiteError> {
    if payload.is_empty() {
        return Err(SuiteError::Empty);
    }
    Ok(serde_yaml::from_slice(payload)?)
}
