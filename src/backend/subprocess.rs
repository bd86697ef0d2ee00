//! Subprocess Backend
//!
//! Best-effort host execution used when no sandbox is available or the
//! policy does not ask for one. Isolation is limited to a private temporary
//! working directory, a cleared environment and a wall-clock deadline.
//! Results are always tagged [`IsolationLevel::Subprocess`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{run_supervised, SuperviseOptions};
use super::timeout::ExecutionTimeout;
use super::{BackendKind, ExecutionBackend, ExecutionBackendResult, DEFAULT_MAX_OUTPUT_BYTES};
use crate::error::GatewayError;
use crate::policy::{ExecutionPolicy, IsolationLevel, Language};

/// Subprocess backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    pub python: String,
    pub node: String,
    pub bash: String,

    /// PATH given to child processes
    pub path: String,

    /// Maximum captured bytes per stream
    pub max_output_bytes: usize,

    /// Sample the interpreter's resident memory
    pub sample_memory: bool,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            node: "node".to_string(),
            bash: "bash".to_string(),
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            sample_memory: true,
        }
    }
}

impl SubprocessConfig {
    fn interpreter(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.node,
            Language::Bash => &self.bash,
        }
    }
}

/// Host subprocess backend
#[derive(Debug, Clone, Default)]
pub struct SubprocessBackend {
    config: SubprocessConfig,
}

impl SubprocessBackend {
    pub fn new(config: SubprocessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SubprocessConfig {
        &self.config
    }

    /// Build the interpreter command inside `workdir`
    ///
    /// Python and Bash run from a script file in the work dir, JavaScript is
    /// passed inline.
    fn build_command(
        &self,
        interpreter: &Path,
        language: Language,
        code: &str,
        workdir: &Path,
    ) -> Result<Command, GatewayError> {
        let mut command = Command::new(interpreter);
        match language {
            Language::Python => {
                let script = workdir.join("main.py");
                std::fs::write(&script, code)?;
                command.arg(script);
            }
            Language::Bash => {
                let script = workdir.join("main.sh");
                std::fs::write(&script, code)?;
                command.arg(script);
            }
            Language::JavaScript => {
                command.args(["-e", code]);
            }
        }

        command
            .current_dir(workdir)
            .env_clear()
            .env("PATH", &self.config.path)
            .env("HOME", workdir)
            .env("LANG", "C.UTF-8")
            .env("TERM", "dumb");
        Ok(command)
    }

    fn failure(&self, err: GatewayError) -> ExecutionBackendResult {
        ExecutionBackendResult::from_error(BackendKind::Subprocess, IsolationLevel::Subprocess, &err)
    }
}

#[async_trait]
impl ExecutionBackend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn execute(&self, language: Language, code: &str, policy: &ExecutionPolicy) -> ExecutionBackendResult {
        let interpreter = match which::which(self.config.interpreter(language)) {
            Ok(path) => path,
            Err(e) => {
                return self.failure(GatewayError::ExecutionFailure(format!(
                    "interpreter '{}' not found: {}",
                    self.config.interpreter(language),
                    e
                )))
            }
        };

        // Removed on drop, on every return path below
        let workdir = match tempfile::Builder::new().prefix("sentinel-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return self.failure(GatewayError::Io(e)),
        };

        let command = match self.build_command(&interpreter, language, code, workdir.path()) {
            Ok(command) => command,
            Err(e) => return self.failure(e),
        };

        let timeout = ExecutionTimeout::new(policy.max_execution_time());
        info!(
            interpreter = %interpreter.display(),
            %language,
            timeout_ms = timeout.limit_ms(),
            "Executing on host with reduced isolation"
        );

        let outcome = run_supervised(
            command,
            SuperviseOptions {
                deadline: timeout.limit(),
                max_output_bytes: self.config.max_output_bytes,
                sample_memory: self.config.sample_memory,
            },
        )
        .await;

        let result = match outcome {
            Ok(outcome) if outcome.timed_out => {
                let elapsed_ms = outcome.elapsed_ms();
                ExecutionBackendResult::timed_out(
                    BackendKind::Subprocess,
                    IsolationLevel::Subprocess,
                    outcome.stdout,
                    timeout.limit_ms(),
                    elapsed_ms,
                )
                .with_memory(outcome.peak_memory_bytes)
            }
            Ok(outcome) => {
                let elapsed_ms = outcome.elapsed_ms();
                ExecutionBackendResult::completed(
                    BackendKind::Subprocess,
                    IsolationLevel::Subprocess,
                    outcome.exit_code,
                    outcome.stdout,
                    outcome.stderr,
                    elapsed_ms,
                )
                .with_memory(outcome.peak_memory_bytes)
            }
            Err(e) => self.failure(GatewayError::ExecutionFailure(format!(
                "failed to spawn {}: {}",
                interpreter.display(),
                e
            ))),
        };

        cleanup(workdir);
        debug!(summary = %result.summary(), "Host execution finished");
        result
    }
}

fn cleanup(workdir: TempDir) {
    let path = workdir.path().to_path_buf();
    if let Err(e) = workdir.close() {
        warn!(path = %path.display(), error = %e, "Failed to remove work directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::policy::SecurityLevel;
    use std::time::Duration;

    fn policy(timeout: Duration) -> ExecutionPolicy {
        ExecutionPolicy::new(
            SecurityLevel::Development,
            [Language::Python, Language::Bash, Language::JavaScript],
            timeout,
            256,
            false,
        )
        .unwrap()
    }

    fn have(binary: &str) -> bool {
        if which::which(binary).is_ok() {
            return true;
        }
        eprintln!("skipping: {} not installed", binary);
        false
    }

    #[tokio::test]
    async fn test_bash_success_tagged_subprocess() {
        if !have("bash") {
            return;
        }
        let backend = SubprocessBackend::default();
        let result = backend
            .execute(Language::Bash, "echo hello", &policy(Duration::from_secs(10)))
            .await;

        assert!(result.success, "{}", result.stderr);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.backend, BackendKind::Subprocess);
        assert_eq!(result.isolation, IsolationLevel::Subprocess);
        assert!(result.instance_id.is_none());
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        if !have("bash") {
            return;
        }
        std::env::set_var("SENTINEL_TEST_SECRET", "leak");
        let backend = SubprocessBackend::default();
        let result = backend
            .execute(
                Language::Bash,
                "echo \"[$SENTINEL_TEST_SECRET]\"; echo \"$HOME\"",
                &policy(Duration::from_secs(10)),
            )
            .await;

        let mut lines = result.stdout.lines();
        assert_eq!(lines.next(), Some("[]"));
        assert!(lines.next().unwrap_or("").contains("sentinel-"));
    }

    #[tokio::test]
    async fn test_workdir_removed_after_run() {
        if !have("bash") {
            return;
        }
        let backend = SubprocessBackend::default();
        let result = backend
            .execute(Language::Bash, "touch scratch.txt; pwd", &policy(Duration::from_secs(10)))
            .await;

        let dir = result.stdout.trim();
        assert!(!dir.is_empty());
        assert!(!Path::new(dir).exists());
    }

    #[tokio::test]
    async fn test_workdir_removed_after_timeout() {
        if !have("bash") {
            return;
        }
        let backend = SubprocessBackend::default();
        let result = backend
            .execute(Language::Bash, "pwd; sleep 30", &policy(Duration::from_millis(500)))
            .await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::ExecutionTimeout));
        let dir = result.stdout.trim();
        assert!(!dir.is_empty());
        assert!(!Path::new(dir).exists());
    }

    #[tokio::test]
    async fn test_python_failure_surfaces_stderr() {
        if !have("python3") {
            return;
        }
        let backend = SubprocessBackend::default();
        let result = backend
            .execute(Language::Python, "raise SystemExit('bad input')", &policy(Duration::from_secs(10)))
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.failure, Some(FailureKind::ExecutionFailure));
        assert!(result.stderr.contains("bad input"));
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let backend = SubprocessBackend::new(SubprocessConfig {
            bash: "no-such-shell-91ab".to_string(),
            ..Default::default()
        });
        let result = backend
            .execute(Language::Bash, "true", &policy(Duration::from_secs(1)))
            .await;
        assert!(!result.success);
        assert!(result.stderr.contains("not found"));
    }
}
