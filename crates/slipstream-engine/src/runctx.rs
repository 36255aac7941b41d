// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run context: where a run came from.
//!
//! Clients may supply the context explicitly; when they do not, the engine
//! fills it in best-effort from the process environment and the local git
//! checkout. Detection failures degrade to an empty field, never an error.

use std::collections::HashMap;
use std::process::Command;

/// What caused a run to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trigger {
    /// A human invoked the engine directly.
    #[default]
    Manual,
    /// A CI pipeline invoked the engine.
    Ci,
    /// The scheduler fired a due schedule.
    Schedule,
}

impl Trigger {
    /// String form persisted to the store and returned over the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Ci => "ci",
            Self::Schedule => "schedule",
        }
    }

    /// Parse a trigger from its wire form. Unknown values fall back to manual.
    pub fn parse(s: &str) -> Self {
        match s {
            "ci" => Self::Ci,
            "schedule" => Self::Schedule,
            _ => Self::Manual,
        }
    }
}

/// Where the run's suite definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// The payload matches a committed revision.
    RepoCommit,
    /// The payload carries local, uncommitted edits.
    #[default]
    Uncommitted,
}

impl ConfigSource {
    /// String form persisted to the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepoCommit => "repo_commit",
            Self::Uncommitted => "uncommitted",
        }
    }
}

/// Metadata provided by the client or auto-detected.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Owning project id, when the client knows it.
    pub project_id: Option<String>,
    /// Source label, e.g. `cli-local`, `ci-branch`, `scheduler`.
    pub source: String,
    /// Git branch the suite came from.
    pub branch: Option<String>,
    /// Git commit the suite came from.
    pub commit_sha: Option<String>,
    /// What caused the run.
    pub trigger: Trigger,
    /// Name of the schedule that fired the run, for scheduled runs.
    pub schedule_name: Option<String>,
    /// Opaque client metadata.
    pub metadata: HashMap<String, String>,
    /// Whether the payload matches a committed revision.
    pub config_source: ConfigSource,
}

impl RunContext {
    /// Context for a scheduler-fired run.
    pub fn for_schedule(schedule_name: &str, branch: &str) -> Self {
        Self {
            source: "scheduler".to_string(),
            branch: Some(branch.to_string()),
            trigger: Trigger::Schedule,
            schedule_name: Some(schedule_name.to_string()),
            config_source: ConfigSource::RepoCommit,
            ..Self::default()
        }
    }
}

/// Best-effort detection of the run context from the process environment.
///
/// Uses `git` subcommands when a checkout is present; any failure leaves the
/// corresponding field empty.
pub fn detect_run_context() -> RunContext {
    let ci = std::env::var("CI").map(|v| !v.is_empty()).unwrap_or(false);

    let branch = git_output(&["branch", "--show-current"]);
    let commit_sha = git_output(&["rev-parse", "HEAD"]);
    let dirty = git_output(&["status", "--porcelain"]).is_some();

    let config_source = if commit_sha.is_some() && !dirty {
        ConfigSource::RepoCommit
    } else {
        ConfigSource::Uncommitted
    };

    RunContext {
        project_id: None,
        source: if ci { "ci-branch" } else { "cli-local" }.to_string(),
        branch,
        commit_sha,
        trigger: if ci { Trigger::Ci } else { Trigger::Manual },
        schedule_name: None,
        metadata: HashMap::new(),
        config_source,
    }
}

/// Run a git subcommand and return its trimmed stdout, or None on any failure
/// or empty output.
fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
