//! Risk Assessment Types
//!
//! Severities, categories and the immutable [`RiskAssessment`] produced once
//! per submission. The risk level is derived from the violation set alone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::compliance::{self, ComplianceStatus};

/// Severity of a single violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// Weight contributed to the risk score
    pub fn weight(self) -> u32 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 5,
            Severity::Critical => 10,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Overall risk level of a submission
///
/// Advisory only: routing never blocks on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl RiskLevel {
    /// Map a weighted score onto a level
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 20 => RiskLevel::Critical,
            s if s >= 10 => RiskLevel::High,
            s if s >= 5 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    /// Whether this level triggers a security alert
    pub fn is_alerting(self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Violation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    // Pattern pass
    System,
    Injection,
    FileAccess,
    Network,
    Serialization,
    Input,

    // Structural pass
    DangerousFunction,
    SuspiciousImport,
    StringInjection,
    PathTraversal,
    NetworkAccess,
    Syntax,

    // Review aid
    Complexity,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::System => "system",
            Category::Injection => "injection",
            Category::FileAccess => "file_access",
            Category::Network => "network",
            Category::Serialization => "serialization",
            Category::Input => "input",
            Category::DangerousFunction => "dangerous_function",
            Category::SuspiciousImport => "suspicious_import",
            Category::StringInjection => "string_injection",
            Category::PathTraversal => "path_traversal",
            Category::NetworkAccess => "network_access",
            Category::Syntax => "syntax",
            Category::Complexity => "complexity",
        }
    }

    /// Templated remediation advice for this category
    pub fn recommendation(self) -> &'static str {
        match self {
            Category::System => "Minimize system-level access and prefer containerized execution",
            Category::Injection => "Implement input validation and avoid dynamic code evaluation",
            Category::FileAccess => "Implement proper file access controls",
            Category::Network => "Validate all network requests and use HTTPS",
            Category::Serialization => "Prefer data-only serialization formats such as JSON",
            Category::Input => "Validate and sanitize all user input",
            Category::DangerousFunction => "Replace reflective or dynamic calls with explicit code",
            Category::SuspiciousImport => "Review whether privileged modules are required",
            Category::StringInjection => "Validate arguments passed to string formatting",
            Category::PathTraversal => "Resolve and validate file paths against an allowed root",
            Category::NetworkAccess => "Restrict outbound network calls to known endpoints",
            Category::Syntax => "Review source that fails to parse for obfuscation",
            Category::Complexity => "Split complex code into smaller reviewable units",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding from either analysis pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub severity: Severity,
    pub category: Category,
    pub description: String,
    /// 1-based source line, when known
    pub line: Option<usize>,
    pub suggestion: String,
    /// Identifier of the rule or check that produced this finding
    pub rule: String,
}

/// Immutable risk assessment for one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    risk_level: RiskLevel,
    score: u32,
    violations: Vec<Violation>,
    complexity_score: u32,
    compliance: BTreeMap<String, ComplianceStatus>,
    recommendations: Vec<String>,
}

impl RiskAssessment {
    /// Build an assessment from a finished violation list
    ///
    /// Everything derived here (level, compliance, recommendations) is a pure
    /// function of `violations`.
    pub fn from_violations(violations: Vec<Violation>, complexity_score: u32) -> Self {
        let score = violations.iter().map(|v| v.severity.weight()).sum();
        let compliance = compliance::evaluate(&violations);

        let categories: BTreeSet<Category> = violations.iter().map(|v| v.category).collect();
        let recommendations = categories
            .into_iter()
            .map(|c| c.recommendation().to_string())
            .collect();

        Self {
            risk_level: RiskLevel::from_score(score),
            score,
            violations,
            complexity_score,
            compliance,
            recommendations,
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    /// Weighted severity sum
    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn complexity_score(&self) -> u32 {
        self.complexity_score
    }

    pub fn compliance(&self) -> &BTreeMap<String, ComplianceStatus> {
        &self.compliance
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    pub fn critical_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count()
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "risk={} score={} violations={} critical={} complexity={}",
            self.risk_level,
            self.score,
            self.violations.len(),
            self.critical_count(),
            self.complexity_score
        )
    }
}
