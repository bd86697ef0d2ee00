//! Execution Backends
//!
//! A closed set of strategies for running a submission: an isolated
//! container instance, a host subprocess, the operator command interpreter,
//! or an outright denial. Every result records the backend and isolation it
//! actually received.

pub mod container;
pub mod memory;
pub mod process;
pub mod subprocess;
pub mod timeout;

pub use container::{ContainerBackend, ContainerConfig, IsolationProfile, RuntimeStatus};
pub use subprocess::{SubprocessBackend, SubprocessConfig};
pub use timeout::ExecutionTimeout;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FailureKind, GatewayError};
use crate::policy::{ExecutionPolicy, IsolationLevel, Language};

/// Maximum captured bytes per stream (1 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Backend that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Container,
    Subprocess,
    Command,
    Denied,
    /// The pipeline failed before any backend reported
    Internal,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Container => write!(f, "container"),
            BackendKind::Subprocess => write!(f, "subprocess"),
            BackendKind::Command => write!(f, "command"),
            BackendKind::Denied => write!(f, "denied"),
            BackendKind::Internal => write!(f, "internal"),
        }
    }
}

/// Result of one backend run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBackendResult {
    /// Whether execution succeeded
    pub success: bool,

    /// Standard output (truncated if too large)
    pub stdout: String,

    /// Standard error (truncated if too large)
    pub stderr: String,

    /// Wall-clock time in milliseconds
    pub elapsed_ms: f64,

    /// Peak resident memory in bytes, 0 when no sample was taken
    pub memory_used_bytes: u64,

    /// Backend actually used
    pub backend: BackendKind,

    /// Isolation actually received
    pub isolation: IsolationLevel,

    /// Sandbox instance name, container runs only
    pub instance_id: Option<String>,

    /// Exit code (None if terminated or never spawned)
    pub exit_code: Option<i32>,

    /// Failure class when `success` is false
    pub failure: Option<FailureKind>,
}

impl ExecutionBackendResult {
    /// Result of a process that ran to completion
    pub fn completed(
        backend: BackendKind,
        isolation: IsolationLevel,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        elapsed_ms: f64,
    ) -> Self {
        let success = exit_code == Some(0);
        Self {
            success,
            stdout,
            stderr,
            elapsed_ms,
            memory_used_bytes: 0,
            backend,
            isolation,
            instance_id: None,
            exit_code,
            failure: (!success).then_some(FailureKind::ExecutionFailure),
        }
    }

    /// Result of a run terminated by the supervising timer
    ///
    /// Partial output captured before termination is kept.
    pub fn timed_out(
        backend: BackendKind,
        isolation: IsolationLevel,
        stdout: String,
        limit_ms: u64,
        elapsed_ms: f64,
    ) -> Self {
        Self {
            success: false,
            stdout,
            stderr: GatewayError::ExecutionTimeout(limit_ms).to_string(),
            elapsed_ms,
            memory_used_bytes: 0,
            backend,
            isolation,
            instance_id: None,
            exit_code: None,
            failure: Some(FailureKind::ExecutionTimeout),
        }
    }

    /// Result carrying only an error
    pub fn from_error(backend: BackendKind, isolation: IsolationLevel, err: &GatewayError) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: err.to_string(),
            elapsed_ms: 0.0,
            memory_used_bytes: 0,
            backend,
            isolation,
            instance_id: None,
            exit_code: None,
            failure: Some(err.failure_kind()),
        }
    }

    /// Language outside the allow-list, nothing executed
    pub fn denied(language: &str) -> Self {
        Self::from_error(
            BackendKind::Denied,
            IsolationLevel::Denied,
            &GatewayError::ConfigurationDenied(language.to_string()),
        )
    }

    /// Operator directive output
    pub fn command(success: bool, output: String, elapsed_ms: f64) -> Self {
        Self {
            success,
            stdout: output,
            stderr: String::new(),
            elapsed_ms,
            memory_used_bytes: 0,
            backend: BackendKind::Command,
            isolation: IsolationLevel::Command,
            instance_id: None,
            exit_code: None,
            failure: (!success).then_some(FailureKind::ExecutionFailure),
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_used_bytes = bytes;
        self
    }

    /// Whether the sandbox runtime could not be used
    pub fn is_unavailable(&self) -> bool {
        self.failure == Some(FailureKind::BackendUnavailable)
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        match self.failure {
            Some(FailureKind::ExecutionTimeout) => {
                format!("Timeout after {:.0}ms on {}", self.elapsed_ms, self.backend)
            }
            Some(kind) if kind != FailureKind::ExecutionFailure => {
                format!("{} on {}", kind, self.backend)
            }
            _ => format!(
                "{} on {} [{}] (exit code: {:?}, {:.0}ms, {} bytes output)",
                if self.success { "Success" } else { "Failed" },
                self.backend,
                self.isolation,
                self.exit_code,
                self.elapsed_ms,
                self.stdout.len() + self.stderr.len()
            ),
        }
    }
}

/// A strategy that executes source under policy bounds
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend identifier
    fn kind(&self) -> BackendKind;

    /// Execute source in the given language
    ///
    /// Never returns an error: failures are reported on the result.
    async fn execute(
        &self,
        language: Language,
        code: &str,
        policy: &ExecutionPolicy,
    ) -> ExecutionBackendResult;
}

/// Decode captured bytes, keeping at most `max_bytes`
///
/// A multi-byte character cut by the limit is dropped whole. `total` is the
/// number of bytes the stream actually produced.
pub(crate) fn cap_output(bytes: &[u8], total: usize, max_bytes: usize) -> String {
    let mut end = bytes.len().min(max_bytes);
    if let Err(e) = std::str::from_utf8(&bytes[..end]) {
        if e.error_len().is_none() {
            end = e.valid_up_to();
        }
    }

    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    if total > max_bytes {
        text.push_str(&format!("\n[output truncated, {} bytes total]", total));
    }
    text
}
