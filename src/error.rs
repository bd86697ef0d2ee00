//! Gateway Error Types
//!
//! This module defines the error taxonomy of the execution pipeline and the
//! serialisable failure classes reported back through the transport contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error types for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Requested language is outside the policy allow-list
    #[error("Language '{0}' is not allowed by the execution policy")]
    ConfigurationDenied(String),

    /// Sandbox runtime missing or unreachable
    #[error("Sandbox runtime unavailable: {0}")]
    BackendUnavailable(String),

    /// Wall-clock ceiling exceeded
    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    /// Backend exited with a failure or could not be spawned
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// Structural parse error, degrades to pattern-only analysis
    #[error("Structural analysis failed: {0}")]
    AnalysisFailure(String),

    /// Audit log could not be written
    #[error("Audit write failed: {0}")]
    AuditWriteFailure(String),

    /// Persisted state (performance history) could not be read back
    #[error("Persisted state corrupted: {0}")]
    PersistenceCorruption(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Failure class reported to the caller for this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            GatewayError::ConfigurationDenied(_) => FailureKind::ConfigurationDenied,
            GatewayError::BackendUnavailable(_) => FailureKind::BackendUnavailable,
            GatewayError::ExecutionTimeout(_) => FailureKind::ExecutionTimeout,
            _ => FailureKind::ExecutionFailure,
        }
    }
}

/// Failure class carried on unsuccessful results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Language outside the allow-list, nothing was executed
    ConfigurationDenied,
    /// Sandbox runtime missing, the pipeline falls back
    BackendUnavailable,
    /// Wall-clock ceiling exceeded, process or instance terminated
    ExecutionTimeout,
    /// Non-zero exit or spawn failure
    ExecutionFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ConfigurationDenied => write!(f, "configuration_denied"),
            FailureKind::BackendUnavailable => write!(f, "backend_unavailable"),
            FailureKind::ExecutionTimeout => write!(f, "execution_timeout"),
            FailureKind::ExecutionFailure => write!(f, "execution_failure"),
        }
    }
}

/// Result alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
