//! Security Analysis
//!
//! Scores the risk of a submission from two passes whose violations are
//! unioned:
//!
//! 1. **Pattern pass** ([`rules`]): a fixed rule table matched against raw
//!    source, independent of language grammar.
//! 2. **Structural pass** ([`structural`]): a syntax-tree walk, attempted only
//!    for languages with a grammar (Python). A parse failure degrades to a
//!    single medium violation and never aborts the analysis.
//!
//! The resulting [`RiskAssessment`] is deterministic and advisory.

pub mod assessment;
pub mod complexity;
pub mod compliance;
pub mod rules;
pub mod structural;

pub use assessment::{Category, RiskAssessment, RiskLevel, Severity, Violation};
pub use compliance::ComplianceStatus;

use crate::error::GatewayError;
use crate::policy::Language;
use tracing::debug;

/// Deterministic, side-effect free risk analyzer
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityAnalyzer;

impl SecurityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Analyze a source text
    ///
    /// # Arguments
    ///
    /// * `code` - Submitted source text
    /// * `language` - Transport language tag; unknown tags get the pattern pass only
    ///
    /// # Returns
    ///
    /// The immutable assessment for this source
    pub fn analyze(&self, code: &str, language: &str) -> RiskAssessment {
        let mut violations = rules::scan(code);

        if Language::from_tag(language) == Some(Language::Python) {
            match structural::analyze(code) {
                Ok(found) => violations.extend(found),
                Err(failure) => {
                    violations.push(failure.to_violation());
                    let err = GatewayError::from(failure);
                    debug!(error = %err, "Structural pass degraded to pattern results");
                }
            }
        }

        let complexity = complexity::score(code);
        if complexity > complexity::COMPLEXITY_THRESHOLD {
            violations.push(Violation {
                severity: Severity::Low,
                category: Category::Complexity,
                description: format!(
                    "High complexity score {} exceeds {}",
                    complexity,
                    complexity::COMPLEXITY_THRESHOLD
                ),
                line: None,
                suggestion: "Consider splitting the code for review".to_string(),
                rule: "complexity".to_string(),
            });
        }

        RiskAssessment::from_violations(violations, complexity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_plus_eval_is_critical() {
        let assessment = SecurityAnalyzer::new().analyze("os.system('ls')\neval('1+1')\n", "python");
        assert_eq!(assessment.risk_level(), RiskLevel::Critical);
        assert!(assessment.score() >= 20);
    }

    #[test]
    fn test_pattern_only_for_other_languages() {
        let assessment = SecurityAnalyzer::new().analyze("os.system('ls')\neval('1+1')\n", "bash");
        assert_eq!(assessment.score(), 20);
        assert_eq!(assessment.risk_level(), RiskLevel::Critical);
        assert!(assessment.violations().iter().all(|v| v.rule.starts_with("pattern:")));
    }

    #[test]
    fn test_clean_code_is_low_with_no_violations() {
        let assessment = SecurityAnalyzer::new().analyze("x = 1 + 2\nprint(x)\n", "python");
        assert_eq!(assessment.risk_level(), RiskLevel::Low);
        assert!(assessment.violations().is_empty());
        assert!(assessment.compliance().values().all(|c| c.passed));
    }

    #[test]
    fn test_parse_failure_keeps_pattern_results() {
        let assessment = SecurityAnalyzer::new().analyze("os.system('ls'\ndef (:\n", "python");
        let rules: Vec<&str> = assessment.violations().iter().map(|v| v.rule.as_str()).collect();
        assert!(rules.contains(&"pattern:os_system"));
        assert_eq!(rules.iter().filter(|r| **r == "structural:parse").count(), 1);
        assert!(!rules.iter().any(|r| r.starts_with("structural:") && *r != "structural:parse"));
    }

    #[test]
    fn test_complexity_violation_added_above_threshold() {
        let code = "if x:\n    pass\n".repeat(60);
        let assessment = SecurityAnalyzer::new().analyze(&code, "python");
        assert!(assessment.complexity_score() > complexity::COMPLEXITY_THRESHOLD);
        assert!(assessment
            .violations()
            .iter()
            .any(|v| v.category == Category::Complexity && v.severity == Severity::Low));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let code = "import os\nimport pickle\nopen('../x')\nrequests.get(u)\n";
        let analyzer = SecurityAnalyzer::new();
        assert_eq!(analyzer.analyze(code, "python"), analyzer.analyze(code, "python"));
    }
}
