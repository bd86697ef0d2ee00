//! Execution Router
//!
//! Chooses a backend for each submission from a small, closed rule table.
//!
//! # Routing Rules
//!
//! Evaluated in order, first match wins:
//! 1. Operator directives go to the command interpreter, skipping every
//!    other check
//! 2. Languages outside the policy allow-list are denied without execution
//! 3. When the container runtime is available and the effective security
//!    level is `maximum` or `balanced`, the container sandbox is used
//! 4. Otherwise the submission runs as a host subprocess, tagged with the
//!    `subprocess` isolation level
//!
//! Risk never blocks a submission. A high or critical assessment only sets
//! [`RouteDecision::alert`], which the caller turns into a fire-and-forget
//! notification.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analysis::{RiskAssessment, RiskLevel};
use crate::backend::BackendKind;
use crate::policy::{ExecutionPolicy, IsolationLevel, Language, SecurityLevel};
use crate::submission::CodeSubmission;

/// Runtime availability of optional backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendAvailability {
    pub container: bool,
}

impl BackendAvailability {
    pub fn new(container: bool) -> Self {
        Self { container }
    }
}

/// Chosen execution strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    /// Operator directive
    Command,
    /// Language not allowed; carries the requested tag
    Deny { language: String },
    /// Isolated container instance
    Container {
        language: Language,
        level: SecurityLevel,
    },
    /// Host subprocess with reduced isolation
    Subprocess { language: Language },
}

impl Route {
    pub fn backend(&self) -> BackendKind {
        match self {
            Route::Command => BackendKind::Command,
            Route::Deny { .. } => BackendKind::Denied,
            Route::Container { .. } => BackendKind::Container,
            Route::Subprocess { .. } => BackendKind::Subprocess,
        }
    }

    /// Isolation the route grants
    pub fn isolation(&self) -> IsolationLevel {
        match self {
            Route::Command => IsolationLevel::Command,
            Route::Deny { .. } => IsolationLevel::Denied,
            Route::Container { level, .. } => IsolationLevel::sandboxed(*level),
            Route::Subprocess { .. } => IsolationLevel::Subprocess,
        }
    }

    pub fn language(&self) -> Option<Language> {
        match self {
            Route::Container { language, .. } | Route::Subprocess { language } => Some(*language),
            Route::Command | Route::Deny { .. } => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Command => write!(f, "command"),
            Route::Deny { language } => write!(f, "deny ({})", language),
            Route::Container { language, level } => write!(f, "container ({}, {})", language, level),
            Route::Subprocess { language } => write!(f, "subprocess ({})", language),
        }
    }
}

/// Outcome of routing one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,

    /// Set when the assessment warrants a security alert
    pub alert: Option<RiskLevel>,

    /// Security level after applying the submission's request
    pub effective_level: SecurityLevel,

    /// Why this route was chosen
    pub reason: String,
}

/// Stateless backend selector
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionRouter;

impl ExecutionRouter {
    /// Choose a backend for a submission
    ///
    /// # Arguments
    ///
    /// * `submission` - The submission being routed
    /// * `assessment` - Its risk assessment; `None` for directives
    /// * `policy` - Active execution policy
    /// * `availability` - Which optional backends are usable right now
    ///
    /// # Examples
    ///
    /// ```
    /// use sentinel_gateway::policy::ExecutionPolicy;
    /// use sentinel_gateway::router::{BackendAvailability, ExecutionRouter, Route};
    /// use sentinel_gateway::submission::CodeSubmission;
    ///
    /// let policy = ExecutionPolicy::default();
    /// let submission = CodeSubmission::new("python", "print(1)");
    ///
    /// let decision = ExecutionRouter::route(&submission, None, &policy, BackendAvailability::new(false));
    /// assert!(matches!(decision.route, Route::Subprocess { .. }));
    /// ```
    pub fn route(
        submission: &CodeSubmission,
        assessment: Option<&RiskAssessment>,
        policy: &ExecutionPolicy,
        availability: BackendAvailability,
    ) -> RouteDecision {
        let effective_level = submission.security_level().unwrap_or(policy.security_level());

        if submission.is_directive() {
            return RouteDecision {
                route: Route::Command,
                alert: None,
                effective_level,
                reason: "Operator directive".to_string(),
            };
        }

        let alert = assessment
            .map(|a| a.risk_level())
            .filter(|level| level.is_alerting());

        let Some(language) = policy.allowed_language(submission.language()) else {
            return RouteDecision {
                route: Route::Deny {
                    language: submission.language().to_string(),
                },
                alert,
                effective_level,
                reason: format!("Language '{}' is not allowed by policy", submission.language()),
            };
        };

        let (route, reason) = if effective_level.wants_sandbox() && availability.container {
            (
                Route::Container {
                    language,
                    level: effective_level,
                },
                format!("Container sandbox at {} level", effective_level),
            )
        } else if effective_level.wants_sandbox() {
            (
                Route::Subprocess { language },
                format!(
                    "Container runtime unavailable; running on host with reduced isolation instead of {}",
                    effective_level
                ),
            )
        } else {
            (
                Route::Subprocess { language },
                "Development level permits host execution".to_string(),
            )
        };

        RouteDecision {
            route,
            alert,
            effective_level,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SecurityAnalyzer;
    use std::time::Duration;

    const AVAILABLE: BackendAvailability = BackendAvailability { container: true };
    const UNAVAILABLE: BackendAvailability = BackendAvailability { container: false };

    fn python_only() -> ExecutionPolicy {
        ExecutionPolicy::new(
            SecurityLevel::Balanced,
            [Language::Python],
            Duration::from_secs(5),
            128,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_directive_bypasses_allow_list() {
        let submission = CodeSubmission::directive("/status");
        let decision = ExecutionRouter::route(&submission, None, &python_only(), AVAILABLE);
        assert_eq!(decision.route, Route::Command);
        assert_eq!(decision.route.isolation(), IsolationLevel::Command);
    }

    #[test]
    fn test_disallowed_language_denied() {
        let submission = CodeSubmission::new("bash", "echo hi");
        let decision = ExecutionRouter::route(&submission, None, &python_only(), AVAILABLE);
        assert_eq!(
            decision.route,
            Route::Deny {
                language: "bash".to_string()
            }
        );
        assert_eq!(decision.route.backend(), BackendKind::Denied);
    }

    #[test]
    fn test_unknown_language_denied() {
        let submission = CodeSubmission::new("cobol", "DISPLAY 'HI'");
        let decision = ExecutionRouter::route(&submission, None, &ExecutionPolicy::default(), AVAILABLE);
        assert!(matches!(decision.route, Route::Deny { .. }));
    }

    #[test]
    fn test_container_when_available() {
        let submission = CodeSubmission::new("python", "print(1)");
        let decision = ExecutionRouter::route(&submission, None, &python_only(), AVAILABLE);
        assert_eq!(
            decision.route,
            Route::Container {
                language: Language::Python,
                level: SecurityLevel::Balanced
            }
        );
        assert_eq!(decision.route.isolation(), IsolationLevel::Balanced);
    }

    #[test]
    fn test_fallback_reports_subprocess_isolation() {
        let submission = CodeSubmission::new("python", "print(1)");
        let decision = ExecutionRouter::route(&submission, None, &python_only(), UNAVAILABLE);
        assert_eq!(decision.route, Route::Subprocess { language: Language::Python });
        assert_eq!(decision.route.isolation(), IsolationLevel::Subprocess);
        assert_ne!(decision.route.isolation(), IsolationLevel::Balanced);
        assert!(decision.reason.contains("unavailable"));
    }

    #[test]
    fn test_development_runs_on_host_even_with_runtime() {
        let submission = CodeSubmission::new("py", "print(1)").with_security_level(SecurityLevel::Development);
        let decision = ExecutionRouter::route(&submission, None, &python_only(), AVAILABLE);
        assert_eq!(decision.route, Route::Subprocess { language: Language::Python });
        assert_eq!(decision.effective_level, SecurityLevel::Development);
    }

    #[test]
    fn test_requested_level_overrides_policy() {
        let submission = CodeSubmission::new("python", "print(1)").with_security_level(SecurityLevel::Maximum);
        let decision = ExecutionRouter::route(&submission, None, &python_only(), AVAILABLE);
        assert_eq!(decision.route.isolation(), IsolationLevel::Maximum);
    }

    #[test]
    fn test_critical_risk_alerts_but_still_routes() {
        let code = "import os\nos.system('ls')\neval('1')";
        let assessment = SecurityAnalyzer::new().analyze(code, "python");
        assert_eq!(assessment.risk_level(), RiskLevel::Critical);

        let submission = CodeSubmission::new("python", code);
        let decision = ExecutionRouter::route(&submission, Some(&assessment), &python_only(), UNAVAILABLE);
        assert_eq!(decision.alert, Some(RiskLevel::Critical));
        assert!(matches!(decision.route, Route::Subprocess { .. }));
    }

    #[test]
    fn test_low_risk_no_alert() {
        let assessment = SecurityAnalyzer::new().analyze("print(1)", "python");
        let submission = CodeSubmission::new("python", "print(1)");
        let decision = ExecutionRouter::route(&submission, Some(&assessment), &python_only(), AVAILABLE);
        assert_eq!(decision.alert, None);
    }
}
