//! Container Sandbox Backend
//!
//! Runs code inside an ephemeral, uniquely named container instance with a
//! fixed isolation profile: capabilities dropped, memory capped, network
//! disabled (maximum) or NAT-restricted (balanced), read-only root at
//! maximum. The runtime itself (podman or docker) is an external program;
//! this module only builds its argument list and interprets the outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::memory::{PeakSampler, SAMPLE_INTERVAL};
use super::process::{run_supervised, SuperviseOptions};
use super::timeout::{ExecutionTimeout, DEFAULT_GRACE};
use super::{BackendKind, ExecutionBackend, ExecutionBackendResult, DEFAULT_MAX_OUTPUT_BYTES};
use crate::error::GatewayError;
use crate::policy::{ExecutionPolicy, IsolationLevel, Language, SecurityLevel};

/// Runtime exit code for errors in the runtime itself rather than the payload
const RUNTIME_ERROR_EXIT: i32 = 125;

/// Exit code of a SIGKILLed payload
const KILLED_EXIT: i32 = 137;

/// Timeout for short runtime management commands
const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Container backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Use the container backend at all
    pub enabled: bool,

    /// Runtime binary (podman or docker)
    pub runtime: String,

    /// Instance name prefix, also used to find leftovers during cleanup
    pub name_prefix: String,

    pub python_image: String,
    pub node_image: String,
    pub shell_image: String,

    /// Seconds added to the policy limit for the host-side timer
    pub grace_secs: u64,

    /// Maximum captured bytes per stream
    pub max_output_bytes: usize,

    /// Poll runtime stats for peak memory
    pub sample_memory: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            runtime: "podman".to_string(),
            name_prefix: "sentinel".to_string(),
            python_image: "python:3.11-alpine".to_string(),
            node_image: "node:18-alpine".to_string(),
            shell_image: "alpine:latest".to_string(),
            grace_secs: DEFAULT_GRACE.as_secs(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            sample_memory: true,
        }
    }
}

impl ContainerConfig {
    /// Image and interpreter argv for a language
    pub fn invocation(&self, language: Language, code: &str) -> (String, Vec<String>) {
        let (image, interpreter, flag) = match language {
            Language::Python => (&self.python_image, "python", "-c"),
            Language::JavaScript => (&self.node_image, "node", "-e"),
            Language::Bash => (&self.shell_image, "sh", "-c"),
        };
        (
            image.clone(),
            vec![interpreter.to_string(), flag.to_string(), code.to_string()],
        )
    }

    /// Whether the runtime accepts `run --timeout`
    fn runtime_timeout_flag(&self) -> bool {
        Path::new(&self.runtime)
            .file_name()
            .map(|name| name.to_string_lossy().starts_with("podman"))
            .unwrap_or(false)
    }
}

/// Fixed isolation profile derived from a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationProfile {
    pub network: &'static str,
    pub read_only: bool,
    pub memory_mb: u64,
    pub timeout: ExecutionTimeout,
    pub isolation: IsolationLevel,
}

impl IsolationProfile {
    pub fn from_policy(policy: &ExecutionPolicy) -> Self {
        let maximum = policy.security_level() == SecurityLevel::Maximum;
        Self {
            network: if maximum { "none" } else { "slirp4netns" },
            read_only: maximum,
            memory_mb: policy.max_memory_mb(),
            timeout: ExecutionTimeout::new(policy.max_execution_time()),
            isolation: IsolationLevel::sandboxed(policy.security_level()),
        }
    }

    /// Full `run` argument list for one instance
    pub fn run_args(&self, name: &str, image: &str, command: &[String], runtime_timeout: bool) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            format!("{}m", self.memory_mb),
            "--network".to_string(),
            self.network.to_string(),
        ];
        if runtime_timeout {
            args.push("--timeout".to_string());
            args.push(self.timeout.limit_secs_ceil().to_string());
        }
        if self.read_only {
            args.push("--read-only".to_string());
        }
        args.extend(["--cap-drop".to_string(), "ALL".to_string()]);
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        args
    }
}

/// Result of a runtime availability probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub runtime: String,
    pub available: bool,
    pub version: Option<String>,
    pub detail: Option<String>,
}

/// Container sandbox backend
#[derive(Debug)]
pub struct ContainerBackend {
    config: ContainerConfig,
    available: AtomicBool,
}

impl ContainerBackend {
    /// Create a backend; availability is unknown (false) until probed
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            available: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Last known availability
    pub fn is_available(&self) -> bool {
        self.config.enabled && self.available.load(Ordering::Acquire)
    }

    /// Record that the runtime failed, so routing stops choosing it
    pub fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Release);
    }

    /// Probe the runtime and update availability
    pub async fn probe(&self) -> RuntimeStatus {
        let status = self.check_runtime().await;
        self.available.store(status.available, Ordering::Release);
        if status.available {
            info!(runtime = %status.runtime, version = ?status.version, "Container runtime available");
        } else {
            warn!(runtime = %status.runtime, detail = ?status.detail, "Container runtime unavailable");
        }
        status
    }

    async fn check_runtime(&self) -> RuntimeStatus {
        let runtime = self.config.runtime.clone();
        let unavailable = |detail: String| RuntimeStatus {
            runtime: runtime.clone(),
            available: false,
            version: None,
            detail: Some(detail),
        };

        if !self.config.enabled {
            return unavailable("container backend disabled by configuration".to_string());
        }
        if let Err(e) = which::which(&self.config.runtime) {
            return unavailable(format!("{} not found: {}", self.config.runtime, e));
        }

        let mut command = Command::new(&self.config.runtime);
        command.arg("--version").kill_on_drop(true);
        match ExecutionTimeout::new(MANAGEMENT_TIMEOUT).run(command.output()).await {
            Ok(Ok(output)) if output.status.success() => RuntimeStatus {
                runtime: runtime.clone(),
                available: true,
                version: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
                detail: None,
            },
            Ok(Ok(output)) => unavailable(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            Ok(Err(e)) => unavailable(e.to_string()),
            Err(e) => unavailable(e.to_string()),
        }
    }

    /// Unique, ephemeral instance name
    pub fn instance_name(&self, language: Language) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.config.name_prefix, language, &id[..8])
    }

    /// Names of instances carrying the gateway prefix
    pub async fn list_instances(&self) -> Result<Vec<String>, GatewayError> {
        let filter = format!("name=^{}-", self.config.name_prefix);
        let output = self
            .management(&["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&format!("{}-", self.config.name_prefix)))
            .map(str::to_string)
            .collect())
    }

    /// Force-remove leftover instances, returning how many were removed
    pub async fn cleanup(&self) -> Result<usize, GatewayError> {
        let names = self.list_instances().await?;
        let mut removed = 0;
        for name in &names {
            if self.force_remove(name).await {
                removed += 1;
            }
        }
        info!(removed, found = names.len(), "Container cleanup finished");
        Ok(removed)
    }

    /// `rm -f` an instance; returns whether the runtime reported success
    pub async fn force_remove(&self, name: &str) -> bool {
        match self.management(&["rm", "-f", name]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(instance = %name, error = %e, "Failed to remove container instance");
                false
            }
        }
    }

    /// Whether the runtime can reach its engine, checked with `info`
    ///
    /// `--version` is answered by the client alone, so it says nothing about
    /// a daemon that went away after the startup probe.
    pub async fn daemon_reachable(&self) -> bool {
        match self.management(&["info"]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(runtime = %self.config.runtime, error = %e, "Container runtime failed its health check");
                false
            }
        }
    }

    async fn management(&self, args: &[&str]) -> Result<String, GatewayError> {
        let mut command = Command::new(&self.config.runtime);
        command.args(args).kill_on_drop(true);

        let output = ExecutionTimeout::new(MANAGEMENT_TIMEOUT)
            .run(command.output())
            .await?
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => GatewayError::BackendUnavailable(e.to_string()),
                _ => GatewayError::Io(e),
            })?;

        if !output.status.success() {
            return Err(GatewayError::ExecutionFailure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn execute(&self, language: Language, code: &str, policy: &ExecutionPolicy) -> ExecutionBackendResult {
        let profile = IsolationProfile::from_policy(policy);
        let timeout = profile
            .timeout
            .with_grace(Duration::from_secs(self.config.grace_secs.max(1)));
        let name = self.instance_name(language);
        let (image, interpreter) = self.config.invocation(language, code);
        let args = profile.run_args(&name, &image, &interpreter, self.config.runtime_timeout_flag());

        info!(
            instance = %name,
            %image,
            network = profile.network,
            read_only = profile.read_only,
            "Starting sandbox instance"
        );

        let mut command = Command::new(&self.config.runtime);
        command.args(&args);

        let sampler = self.config.sample_memory.then(|| {
            PeakSampler::for_container(self.config.runtime.clone(), name.clone(), SAMPLE_INTERVAL)
        });

        let outcome = run_supervised(
            command,
            SuperviseOptions {
                deadline: timeout.supervising(),
                max_output_bytes: self.config.max_output_bytes,
                sample_memory: false,
            },
        )
        .await;
        let peak = sampler.as_ref().map(PeakSampler::finish).unwrap_or(0);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.mark_unavailable();
                return ExecutionBackendResult::from_error(
                    BackendKind::Container,
                    profile.isolation,
                    &GatewayError::BackendUnavailable(format!("{}: {}", self.config.runtime, e)),
                );
            }
            Err(e) => {
                return ExecutionBackendResult::from_error(
                    BackendKind::Container,
                    profile.isolation,
                    &GatewayError::ExecutionFailure(e.to_string()),
                );
            }
        };

        let elapsed_ms = outcome.elapsed_ms();
        let hit_limit = outcome.elapsed >= timeout.limit();
        let result = if outcome.timed_out || (hit_limit && matches!(outcome.exit_code, None | Some(KILLED_EXIT))) {
            if outcome.timed_out {
                self.force_remove(&name).await;
            }
            ExecutionBackendResult::timed_out(
                BackendKind::Container,
                profile.isolation,
                outcome.stdout,
                timeout.limit_ms(),
                elapsed_ms,
            )
        } else if outcome.exit_code == Some(RUNTIME_ERROR_EXIT) && !self.daemon_reachable().await {
            // 125 is also a legal payload status; only a runtime that fails
            // its own health check counts as down
            self.mark_unavailable();
            ExecutionBackendResult::from_error(
                BackendKind::Container,
                profile.isolation,
                &GatewayError::BackendUnavailable(outcome.stderr.trim().to_string()),
            )
        } else {
            ExecutionBackendResult::completed(
                BackendKind::Container,
                profile.isolation,
                outcome.exit_code,
                outcome.stdout,
                outcome.stderr,
                elapsed_ms,
            )
        };

        debug!(instance = %name, summary = %result.summary(), "Sandbox instance finished");
        result.with_instance(name).with_memory(peak)
    }
}
