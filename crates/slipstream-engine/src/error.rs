// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the slipstream engine.
//!
//! Provides a unified error type that maps to gRPC status codes at the
//! service boundary.

use thiserror::Error;
use tonic::{Code, Status};

use crate::store::StoreError;
use crate::suite::SuiteError;
use crate::workflow::WorkflowError;

/// Result type using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors surfaced to clients.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Request carried a malformed or unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Authorization header missing or malformed.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Token valid but caller lacks the required permission or scope.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Run is unknown in both memory and store, or belongs to another org.
    #[error("run '{0}' not found")]
    RunNotFound(String),

    /// Suite payload failed to parse.
    #[error(transparent)]
    Suite(#[from] SuiteError),

    /// Persistence operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Workflow service operation failed.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// A bounded wait ran out of time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Internal invariant violation or unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map this error to the gRPC status returned to clients.
    pub fn to_status(&self) -> Status {
        match self {
            Self::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
            Self::Unauthenticated(msg) => Status::unauthenticated(msg.clone()),
            Self::PermissionDenied(msg) => Status::permission_denied(msg.clone()),
            Self::RunNotFound(_) => Status::not_found(self.to_string()),
            Self::Suite(err) => Status::invalid_argument(err.to_string()),
            Self::Store(err) => Status::internal(err.to_string()),
            Self::Workflow(err) => Status::internal(err.to_string()),
            Self::DeadlineExceeded(msg) => Status::deadline_exceeded(msg.clone()),
            Self::Internal(msg) => Status::internal(msg.clone()),
        }
    }
}

impl From<EngineError> for Status {
    fn from(err: EngineError) -> Self {
        err.to_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let cases: Vec<(EngineError, Code)> = vec![
            (
                EngineError::InvalidArgument("bad order_by".into()),
                Code::InvalidArgument,
            ),
            (
                EngineError::Unauthenticated("missing authorization header".into()),
                Code::Unauthenticated,
            ),
            (
                EngineError::PermissionDenied("viewer role cannot write".into()),
                Code::PermissionDenied,
            ),
            (
                EngineError::RunNotFound("01jxyz".into()),
                Code::NotFound,
            ),
            (
                EngineError::DeadlineExceeded("cleanup wait timed out".into()),
                Code::DeadlineExceeded,
            ),
            (
                EngineError::Internal("nil verifier".into()),
                Code::Internal,
            ),
        ];

        for (err, code) in cases {
            let status = err.to_status();
            assert_eq!(status.code(), code, "error {err} should map to {code:?}");
            assert!(!status.message().is_empty());
        }
    }

    #[test]
    fn test_suite_error_maps_to_invalid_argument() {
        let err = EngineError::Suite(SuiteError::Empty);
        assert_eq!(err.to_status().code(), Code::InvalidArgument);
    }

    #[test]
    fn test_run_not_found_display() {
        let err = EngineError::RunNotFound("01jabc".into());
        assert_eq!(err.to_string(), "run '01jabc' not found");
    }
}
