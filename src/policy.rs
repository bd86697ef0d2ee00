//! Execution Policy
//!
//! Immutable policy values: security level, language allow-list and
//! resource ceilings. Built once from [`crate::config::Config`] at startup
//! and shared read-only by every pipeline component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GatewayError;

/// Isolation a policy entitles an execution to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// No network, read-only root filesystem
    Maximum,
    /// Restricted NAT network, writable root filesystem
    Balanced,
    /// Host execution is acceptable
    Development,
}

impl SecurityLevel {
    /// Whether this level asks for container isolation
    pub fn wants_sandbox(self) -> bool {
        matches!(self, SecurityLevel::Maximum | SecurityLevel::Balanced)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityLevel::Maximum => write!(f, "maximum"),
            SecurityLevel::Balanced => write!(f, "balanced"),
            SecurityLevel::Development => write!(f, "development"),
        }
    }
}

impl FromStr for SecurityLevel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "maximum" => Ok(SecurityLevel::Maximum),
            "balanced" => Ok(SecurityLevel::Balanced),
            "development" => Ok(SecurityLevel::Development),
            other => Err(GatewayError::InvalidConfig(format!(
                "Unknown security level: {}. Must be one of: maximum, balanced, development",
                other
            ))),
        }
    }
}

/// Isolation an execution actually received
///
/// Reported on every result. `Subprocess` is never conflated with a
/// sandboxed level, so fallback runs stay visible in audits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Container, no network, read-only root
    Maximum,
    /// Container, restricted network
    Balanced,
    /// Host process, reduced isolation
    Subprocess,
    /// Operator directive, no code executed
    Command,
    /// Nothing executed
    Denied,
    /// Not known, the pipeline aborted
    Unknown,
}

impl IsolationLevel {
    /// Container isolation for a security level
    pub fn sandboxed(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Maximum => IsolationLevel::Maximum,
            _ => IsolationLevel::Balanced,
        }
    }

    pub fn is_sandboxed(self) -> bool {
        matches!(self, IsolationLevel::Maximum | IsolationLevel::Balanced)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Maximum => write!(f, "maximum"),
            IsolationLevel::Balanced => write!(f, "balanced"),
            IsolationLevel::Subprocess => write!(f, "subprocess"),
            IsolationLevel::Command => write!(f, "command"),
            IsolationLevel::Denied => write!(f, "denied"),
            IsolationLevel::Unknown => write!(f, "unknown"),
        }
    }
}

/// Languages the gateway knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Bash,
}

impl Language {
    /// Parse a transport language tag, accepting common aliases
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "bash" | "sh" | "shell" => Some(Language::Bash),
            _ => None,
        }
    }

    /// Canonical tag
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable execution policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    security_level: SecurityLevel,
    allowed_languages: BTreeSet<Language>,
    max_execution_time: Duration,
    max_memory_mb: u64,
    enterprise_mode: bool,
}

impl ExecutionPolicy {
    /// Create a policy
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the allow-list is empty or a ceiling is zero.
    pub fn new(
        security_level: SecurityLevel,
        allowed_languages: impl IntoIterator<Item = Language>,
        max_execution_time: Duration,
        max_memory_mb: u64,
        enterprise_mode: bool,
    ) -> Result<Self, GatewayError> {
        let allowed_languages: BTreeSet<Language> = allowed_languages.into_iter().collect();
        if allowed_languages.is_empty() {
            return Err(GatewayError::InvalidConfig(
                "At least one language must be allowed".to_string(),
            ));
        }
        if max_execution_time.is_zero() {
            return Err(GatewayError::InvalidConfig(
                "Max execution time must be > 0".to_string(),
            ));
        }
        if max_memory_mb == 0 {
            return Err(GatewayError::InvalidConfig(
                "Max memory must be > 0".to_string(),
            ));
        }

        Ok(Self {
            security_level,
            allowed_languages,
            max_execution_time,
            max_memory_mb,
            enterprise_mode,
        })
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn allowed_languages(&self) -> &BTreeSet<Language> {
        &self.allowed_languages
    }

    pub fn max_execution_time(&self) -> Duration {
        self.max_execution_time
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    pub fn enterprise_mode(&self) -> bool {
        self.enterprise_mode
    }

    /// Copy of this policy at a different security level
    pub fn with_security_level(&self, security_level: SecurityLevel) -> Self {
        Self {
            security_level,
            ..self.clone()
        }
    }

    /// Resolve a language tag against the allow-list
    ///
    /// Unknown tags are never allowed.
    pub fn allowed_language(&self, tag: &str) -> Option<Language> {
        Language::from_tag(tag).filter(|lang| self.allowed_languages.contains(lang))
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Balanced,
            allowed_languages: [Language::Python, Language::JavaScript, Language::Bash]
                .into_iter()
                .collect(),
            max_execution_time: Duration::from_secs(30),
            max_memory_mb: 256,
            enterprise_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_level_parse() {
        assert_eq!("maximum".parse::<SecurityLevel>().unwrap(), SecurityLevel::Maximum);
        assert_eq!(" Balanced ".parse::<SecurityLevel>().unwrap(), SecurityLevel::Balanced);
        assert!("paranoid".parse::<SecurityLevel>().is_err());
    }

    #[test]
    fn test_wants_sandbox() {
        assert!(SecurityLevel::Maximum.wants_sandbox());
        assert!(SecurityLevel::Balanced.wants_sandbox());
        assert!(!SecurityLevel::Development.wants_sandbox());
    }

    #[test]
    fn test_isolation_levels() {
        assert_eq!(IsolationLevel::sandboxed(SecurityLevel::Maximum), IsolationLevel::Maximum);
        assert_eq!(IsolationLevel::sandboxed(SecurityLevel::Balanced), IsolationLevel::Balanced);
        assert!(!IsolationLevel::Subprocess.is_sandboxed());
        assert_eq!(IsolationLevel::Subprocess.to_string(), "subprocess");
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!(Language::from_tag("py"), Some(Language::Python));
        assert_eq!(Language::from_tag("JS"), Some(Language::JavaScript));
        assert_eq!(Language::from_tag("sh"), Some(Language::Bash));
        assert_eq!(Language::from_tag("ruby"), None);
    }

    #[test]
    fn test_allow_list() {
        let policy = ExecutionPolicy::new(
            SecurityLevel::Maximum,
            [Language::Python],
            Duration::from_secs(5),
            128,
            false,
        )
        .unwrap();

        assert_eq!(policy.allowed_language("python"), Some(Language::Python));
        assert_eq!(policy.allowed_language("bash"), None);
        assert_eq!(policy.allowed_language("cobol"), None);
    }

    #[test]
    fn test_with_security_level_keeps_ceilings() {
        let policy = ExecutionPolicy::default();
        let maximum = policy.with_security_level(SecurityLevel::Maximum);
        assert_eq!(maximum.security_level(), SecurityLevel::Maximum);
        assert_eq!(maximum.max_memory_mb(), policy.max_memory_mb());
        assert_eq!(policy.security_level(), SecurityLevel::Balanced);
    }

    #[test]
    fn test_policy_rejects_empty_allow_list() {
        let result = ExecutionPolicy::new(
            SecurityLevel::Balanced,
            Vec::new(),
            Duration::from_secs(5),
            128,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_rejects_zero_ceilings() {
        assert!(ExecutionPolicy::new(
            SecurityLevel::Balanced,
            [Language::Bash],
            Duration::ZERO,
            128,
            false
        )
        .is_err());
        assert!(ExecutionPolicy::new(
            SecurityLevel::Balanced,
            [Language::Bash],
            Duration::from_secs(1),
            0,
            false
        )
        .is_err());
    }

    #[test]
    fn test_default_policy() {
        let policy = ExecutionPolicy::default();
        assert_eq!(policy.security_level(), SecurityLevel::Balanced);
        assert_eq!(policy.allowed_languages().len(), 3);
        assert_eq!(policy.max_execution_time(), Duration::from_secs(30));
        assert_eq!(policy.max_memory_mb(), 256);
        assert!(!policy.enterprise_mode());
    }
}
