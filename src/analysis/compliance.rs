//! Compliance framework mapping
//!
//! Each framework cares about a fixed set of violation categories and fails
//! when any violation falls inside that set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::assessment::{Category, Violation};

/// Framework name and the categories it considers relevant
pub const FRAMEWORKS: &[(&str, &[Category])] = &[
    (
        "OWASP",
        &[
            Category::Injection,
            Category::DangerousFunction,
            Category::StringInjection,
            Category::FileAccess,
            Category::PathTraversal,
            Category::Serialization,
            Category::Input,
        ],
    ),
    (
        "SOC2",
        &[
            Category::System,
            Category::Network,
            Category::NetworkAccess,
            Category::FileAccess,
            Category::PathTraversal,
        ],
    ),
    (
        "ISO27001",
        &[
            Category::System,
            Category::SuspiciousImport,
            Category::Network,
            Category::NetworkAccess,
            Category::Serialization,
        ],
    ),
];

/// Pass/fail status for one framework
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceStatus {
    pub passed: bool,
    pub violation_count: usize,
    /// Categories that caused the failure
    pub risk_areas: Vec<Category>,
}

/// Evaluate every framework against a violation list
pub fn evaluate(violations: &[Violation]) -> BTreeMap<String, ComplianceStatus> {
    FRAMEWORKS
        .iter()
        .map(|(name, categories)| {
            let matching: Vec<&Violation> = violations
                .iter()
                .filter(|v| categories.contains(&v.category))
                .collect();
            let risk_areas: BTreeSet<Category> = matching.iter().map(|v| v.category).collect();

            (
                name.to_string(),
                ComplianceStatus {
                    passed: matching.is_empty(),
                    violation_count: matching.len(),
                    risk_areas: risk_areas.into_iter().collect(),
                },
            )
        })
        .collect()
}
