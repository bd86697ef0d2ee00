//! Submissions and the transport data contract
//!
//! [`CodeSubmission`] is the immutable unit of work flowing through the
//! pipeline. [`ExecutionRequest`] and [`GatewayResponse`] are the decoded
//! shapes exchanged with the transport layer; the wire framing itself lives
//! elsewhere.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::RiskAssessment;
use crate::backend::{BackendKind, ExecutionBackendResult};
use crate::error::FailureKind;
use crate::performance::{BenchmarkStats, PerformanceInsight};
use crate::policy::{IsolationLevel, SecurityLevel};

/// Language tag that marks operator directives
pub const DIRECTIVE_LANGUAGE: &str = "slash";

/// Upper bound on benchmark repetitions
pub const MAX_BENCHMARK_ITERATIONS: u32 = 100;

/// An untrusted code submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSubmission {
    language: String,
    code: String,
    security_level: Option<SecurityLevel>,
    enable_quantum: bool,
    benchmark_iterations: Option<u32>,
}

impl CodeSubmission {
    pub fn new(language: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            code: code.into(),
            security_level: None,
            enable_quantum: false,
            benchmark_iterations: None,
        }
    }

    /// An operator directive such as `/status`
    pub fn directive(command: impl Into<String>) -> Self {
        Self::new(DIRECTIVE_LANGUAGE, command)
    }

    pub fn with_security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    pub fn with_quantum(mut self, enabled: bool) -> Self {
        self.enable_quantum = enabled;
        self
    }

    /// Request repeated runs, clamped to `1..=100`
    pub fn with_benchmark(mut self, iterations: u32) -> Self {
        self.benchmark_iterations = Some(iterations.clamp(1, MAX_BENCHMARK_ITERATIONS));
        self
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn security_level(&self) -> Option<SecurityLevel> {
        self.security_level
    }

    pub fn quantum_enabled(&self) -> bool {
        self.enable_quantum
    }

    pub fn benchmark_iterations(&self) -> Option<u32> {
        self.benchmark_iterations
    }

    /// Whether this is an operator directive rather than code
    pub fn is_directive(&self) -> bool {
        self.language.trim().eq_ignore_ascii_case(DIRECTIVE_LANGUAGE)
            && self.code.trim_start().starts_with('/')
    }
}

/// Decoded request from the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub security_level: Option<SecurityLevel>,
    #[serde(default)]
    pub enable_quantum: Option<bool>,
    #[serde(default)]
    pub benchmark_iterations: Option<u32>,
}

impl From<ExecutionRequest> for CodeSubmission {
    fn from(request: ExecutionRequest) -> Self {
        let mut submission = CodeSubmission::new(request.language, request.code)
            .with_quantum(request.enable_quantum.unwrap_or(false));
        if let Some(level) = request.security_level {
            submission = submission.with_security_level(level);
        }
        if let Some(iterations) = request.benchmark_iterations {
            submission = submission.with_benchmark(iterations);
        }
        submission
    }
}

/// Composite result returned to the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub execution_id: Uuid,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Seconds
    pub elapsed_time: f64,
    /// Peak bytes
    pub memory_used: u64,
    pub backend: BackendKind,
    /// Isolation actually received, `subprocess` for host fallback runs
    pub security_level: IsolationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<RiskAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceInsight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<BenchmarkStats>,
}

impl GatewayResponse {
    pub fn from_result(
        execution_id: Uuid,
        result: ExecutionBackendResult,
        risk_assessment: Option<RiskAssessment>,
    ) -> Self {
        Self {
            execution_id,
            success: result.success,
            stdout: result.stdout,
            stderr: result.stderr,
            elapsed_time: result.elapsed_ms / 1000.0,
            memory_used: result.memory_used_bytes,
            backend: result.backend,
            security_level: result.isolation,
            instance_id: result.instance_id,
            failure: result.failure,
            risk_assessment,
            performance: None,
            benchmark: None,
        }
    }
}
