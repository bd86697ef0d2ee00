// Configuration File Support
//
// TOML configuration for the Sentinel gateway with SENTINEL_* environment
// variable overrides. Loaded once at startup from the XDG config directory
// (~/.config/sentinel-gateway/config.toml) and handed to components as
// plain values; nothing else reads the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{ContainerConfig, SubprocessConfig};
use crate::performance::HISTORY_CAPACITY;
use crate::policy::{ExecutionPolicy, Language, SecurityLevel};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Execution policy
    pub policy: PolicyConfig,

    /// Container sandbox backend
    pub sandbox: ContainerConfig,

    /// Host subprocess backend
    pub subprocess: SubprocessConfig,

    /// Audit log and performance history storage
    pub storage: StorageConfig,

    /// Notification behaviour
    pub notifications: NotificationConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Execution policy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Security level (maximum, balanced, development)
    pub security_level: SecurityLevel,

    /// Language tags allowed to execute
    pub allowed_languages: Vec<String>,

    /// Wall-clock ceiling per execution
    pub max_execution_time_secs: u64,

    /// Memory ceiling per execution
    pub max_memory_mb: u64,

    /// Attach source and full results to audit entries
    pub enterprise_mode: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Balanced,
            allowed_languages: vec!["python".to_string(), "javascript".to_string(), "bash".to_string()],
            max_execution_time_secs: 30,
            max_memory_mb: 256,
            enterprise_mode: false,
        }
    }
}

/// Storage for the audit log and performance history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; defaults to the XDG data directory
    pub data_dir: Option<PathBuf>,

    /// Append audit entries to `audit.jsonl`
    pub persist_audit: bool,

    /// Save performance history to `performance.json`
    pub persist_performance: bool,

    /// Rolling history capacity
    pub history_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            persist_audit: true,
            persist_performance: true,
            history_capacity: HISTORY_CAPACITY,
        }
    }
}

/// Notification settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Send notifications at all
    pub enabled: bool,

    /// Alert on high and critical risk submissions
    pub security_alerts: bool,

    /// Notify when the sandbox is unavailable and execution falls back
    pub backend_alerts: bool,

    /// Notify on significant performance changes
    pub performance_insights: bool,

    /// Identical titles are suppressed within this window
    pub rate_limit_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            security_alerts: true,
            backend_alerts: true,
            performance_insights: false,
            rate_limit_secs: 5,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve metrics while the batch command runs
    pub enabled: bool,

    /// Interface to bind
    pub bind: String,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    /// If the config file does not exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// Environment overrides are applied and the result validated. A
    /// missing file yields the defaults (with overrides).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load_from_path`] with an explicit variable lookup
    pub fn load_with<P, F>(path: P, lookup: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/sentinel-gateway/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "sentinel", "sentinel-gateway") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            PathBuf::from(".sentinel").join("config.toml")
        }
    }

    /// Apply environment variable overrides from the process environment
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup
    ///
    /// Recognised variables:
    /// - SENTINEL_SECURITY_LEVEL
    /// - SENTINEL_ALLOWED_LANGUAGES (comma separated)
    /// - SENTINEL_MAX_EXECUTION_TIME (seconds)
    /// - SENTINEL_MAX_MEMORY_MB
    /// - SENTINEL_ENTERPRISE_MODE
    /// - SENTINEL_CONTAINER_ENABLED
    /// - SENTINEL_CONTAINER_RUNTIME
    /// - SENTINEL_LOG_LEVEL
    /// - SENTINEL_LOG_FORMAT
    /// - SENTINEL_DATA_DIR
    /// - SENTINEL_METRICS_PORT
    ///
    /// Unparseable values are ignored and the existing setting kept.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Policy overrides
        if let Some(level) = lookup("SENTINEL_SECURITY_LEVEL") {
            match level.parse::<SecurityLevel>() {
                Ok(level) => self.policy.security_level = level,
                Err(e) => tracing::warn!("Ignoring SENTINEL_SECURITY_LEVEL: {}", e),
            }
        }
        if let Some(languages) = lookup("SENTINEL_ALLOWED_LANGUAGES") {
            let languages: Vec<String> = languages
                .split(',')
                .map(|l| l.trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect();
            if !languages.is_empty() {
                self.policy.allowed_languages = languages;
            }
        }
        if let Some(secs) = lookup("SENTINEL_MAX_EXECUTION_TIME") {
            if let Ok(secs) = secs.trim().parse::<u64>() {
                if secs > 0 {
                    self.policy.max_execution_time_secs = secs;
                }
            }
        }
        if let Some(memory) = lookup("SENTINEL_MAX_MEMORY_MB") {
            if let Ok(memory) = memory.trim().parse::<u64>() {
                if memory > 0 {
                    self.policy.max_memory_mb = memory;
                }
            }
        }
        if let Some(enterprise) = lookup("SENTINEL_ENTERPRISE_MODE") {
            self.policy.enterprise_mode = parse_bool(&enterprise).unwrap_or(self.policy.enterprise_mode);
        }

        // Sandbox overrides
        if let Some(enabled) = lookup("SENTINEL_CONTAINER_ENABLED") {
            self.sandbox.enabled = parse_bool(&enabled).unwrap_or(self.sandbox.enabled);
        }
        if let Some(runtime) = lookup("SENTINEL_CONTAINER_RUNTIME") {
            if !runtime.trim().is_empty() {
                self.sandbox.runtime = runtime.trim().to_string();
            }
        }

        // Logging overrides
        if let Some(level) = lookup("SENTINEL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("SENTINEL_LOG_FORMAT") {
            self.logging.format = format;
        }

        // Storage and metrics overrides
        if let Some(dir) = lookup("SENTINEL_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.storage.data_dir = Some(PathBuf::from(dir.trim()));
            }
        }
        if let Some(port) = lookup("SENTINEL_METRICS_PORT") {
            if let Ok(port) = port.trim().parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        self.policy().context("Invalid policy configuration")?;

        if self.sandbox.runtime.trim().is_empty() {
            anyhow::bail!("Sandbox runtime must not be empty");
        }
        if self.sandbox.name_prefix.trim().is_empty() {
            anyhow::bail!("Sandbox name prefix must not be empty");
        }
        if self.sandbox.grace_secs == 0 {
            anyhow::bail!("Sandbox grace period must be > 0 seconds");
        }
        if self.sandbox.max_output_bytes == 0 || self.subprocess.max_output_bytes == 0 {
            anyhow::bail!("Output limits must be > 0 bytes");
        }

        if self.storage.history_capacity == 0 {
            anyhow::bail!("History capacity must be > 0");
        }

        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Build the immutable execution policy
    pub fn policy(&self) -> Result<ExecutionPolicy> {
        let languages = self
            .policy
            .allowed_languages
            .iter()
            .map(|tag| {
                Language::from_tag(tag).ok_or_else(|| anyhow::anyhow!("Unknown language in allow-list: {}", tag))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ExecutionPolicy::new(
            self.policy.security_level,
            languages,
            Duration::from_secs(self.policy.max_execution_time_secs),
            self.policy.max_memory_mb,
            self.policy.enterprise_mode,
        )?)
    }

    /// Directory holding the audit log and performance history
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "sentinel", "sentinel-gateway")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".sentinel"))
    }

    /// Audit log path, if audit persistence is enabled
    pub fn audit_path(&self) -> Option<PathBuf> {
        self.storage.persist_audit.then(|| self.data_dir().join("audit.jsonl"))
    }

    /// Performance history path, if persistence is enabled
    pub fn performance_path(&self) -> Option<PathBuf> {
        self.storage
            .persist_performance
            .then(|| self.data_dir().join("performance.json"))
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
