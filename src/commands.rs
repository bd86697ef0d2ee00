//! Operator Directives
//!
//! A closed set of control commands (`/help`, `/status`, `/container`,
//! `/perf`, `/audit`) answered from the gateway's own components. Directives
//! never execute submitted source and never go through risk analysis.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::audit::AuditRecorder;
use crate::backend::{ContainerBackend, ExecutionBackendResult};
use crate::performance::PerformanceTracker;
use crate::policy::ExecutionPolicy;

/// Audit entries shown by `/audit` without an argument
const DEFAULT_AUDIT_ENTRIES: usize = 10;

const HELP: &str = "\
Available directives:
  /help                       Show this message
  /status                     Gateway policy and backend status
  /container status           Probe the container runtime
  /container list             List gateway sandbox instances
  /container cleanup          Remove leftover sandbox instances
  /perf                       Performance history summary
  /audit [n]                  Show the last n audit entries (default 10)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Status,
    List,
    Cleanup,
}

/// A parsed directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Help,
    Status,
    Container(ContainerAction),
    Perf,
    Audit(usize),
}

impl Directive {
    /// Parse directive text such as `/container list`
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let Some(body) = input.strip_prefix('/') else {
            return Err("Directives must start with '/'".to_string());
        };

        let mut parts = body.split_whitespace();
        let Some(name) = parts.next() else {
            return Err("Empty directive".to_string());
        };
        let args: Vec<&str> = parts.collect();

        match name.to_lowercase().as_str() {
            "help" => Ok(Directive::Help),
            "status" => Ok(Directive::Status),
            "perf" => Ok(Directive::Perf),
            "container" => match args.first().map(|a| a.to_lowercase()).as_deref() {
                Some("status") => Ok(Directive::Container(ContainerAction::Status)),
                Some("list") => Ok(Directive::Container(ContainerAction::List)),
                Some("cleanup") => Ok(Directive::Container(ContainerAction::Cleanup)),
                Some(other) => Err(format!(
                    "Unknown container action: {}. Use status, list or cleanup",
                    other
                )),
                None => Err("Container directive requires an action (status, list, cleanup)".to_string()),
            },
            "audit" => match args.first() {
                None => Ok(Directive::Audit(DEFAULT_AUDIT_ENTRIES)),
                Some(n) => n
                    .parse()
                    .map(Directive::Audit)
                    .map_err(|_| format!("Invalid entry count: {}", n)),
            },
            other => Err(format!("Unknown directive: /{}. Type '/help' for available directives.", other)),
        }
    }
}

/// Answers operator directives
#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    container: Arc<ContainerBackend>,
    performance: Arc<PerformanceTracker>,
    audit: AuditRecorder,
    policy: Arc<ExecutionPolicy>,
}

impl CommandInterpreter {
    pub fn new(
        container: Arc<ContainerBackend>,
        performance: Arc<PerformanceTracker>,
        audit: AuditRecorder,
        policy: Arc<ExecutionPolicy>,
    ) -> Self {
        Self {
            container,
            performance,
            audit,
            policy,
        }
    }

    /// Run a directive, reporting its output as a command result
    pub async fn execute(&self, input: &str) -> ExecutionBackendResult {
        let start = Instant::now();
        let outcome = match Directive::parse(input) {
            Ok(directive) => {
                debug!(?directive, "Running directive");
                self.run(directive).await
            }
            Err(e) => Err(e),
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(output) => ExecutionBackendResult::command(true, output, elapsed_ms),
            Err(message) => {
                let mut result = ExecutionBackendResult::command(false, String::new(), elapsed_ms);
                result.stderr = message;
                result
            }
        }
    }

    async fn run(&self, directive: Directive) -> Result<String, String> {
        match directive {
            Directive::Help => Ok(HELP.to_string()),
            Directive::Status => Ok(self.status()),
            Directive::Perf => Ok(self.performance.summary().render()),
            Directive::Audit(n) => Ok(self.audit_tail(n)),
            Directive::Container(action) => self.container_action(action).await,
        }
    }

    fn status(&self) -> String {
        let languages: Vec<&str> = self.policy.allowed_languages().iter().map(|l| l.as_str()).collect();
        let mut out = String::new();
        let _ = writeln!(out, "Security level: {}", self.policy.security_level());
        let _ = writeln!(out, "Allowed languages: {}", languages.join(", "));
        let _ = writeln!(out, "Max execution time: {}s", self.policy.max_execution_time().as_secs_f64());
        let _ = writeln!(out, "Max memory: {}MB", self.policy.max_memory_mb());
        let _ = writeln!(out, "Enterprise mode: {}", self.policy.enterprise_mode());
        let _ = writeln!(
            out,
            "Container runtime: {} ({})",
            self.container.config().runtime,
            if self.container.is_available() { "available" } else { "unavailable" }
        );
        let _ = writeln!(out, "Performance samples: {}", self.performance.len());
        let _ = write!(out, "Audit entries: {}", self.audit.len());
        out
    }

    fn audit_tail(&self, n: usize) -> String {
        let entries = self.audit.recent(n);
        if entries.is_empty() {
            return "No audit entries".to_string();
        }
        entries
            .iter()
            .map(|e| {
                format!(
                    "#{} {} {} {} [{}] {} {:.1}ms risk={}",
                    e.sequence,
                    e.submitted_at.format("%Y-%m-%dT%H:%M:%SZ"),
                    e.language,
                    e.backend,
                    e.isolation,
                    if e.success { "ok" } else { "failed" },
                    e.elapsed_ms,
                    e.risk.as_ref().map(|r| r.level.to_string()).unwrap_or_else(|| "n/a".to_string()),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn container_action(&self, action: ContainerAction) -> Result<String, String> {
        match action {
            ContainerAction::Status => {
                let status = self.container.probe().await;
                let mut out = format!(
                    "Runtime: {}\nStatus: {}",
                    status.runtime,
                    if status.available { "available" } else { "unavailable" }
                );
                if let Some(version) = status.version {
                    out.push_str(&format!("\nVersion: {}", version));
                }
                if let Some(detail) = status.detail {
                    out.push_str(&format!("\nDetail: {}", detail));
                }
                Ok(out)
            }
            ContainerAction::List => {
                let names = self.container.list_instances().await.map_err(|e| e.to_string())?;
                if names.is_empty() {
                    Ok("No gateway instances".to_string())
                } else {
                    Ok(names.join("\n"))
                }
            }
            ContainerAction::Cleanup => {
                let removed = self.container.cleanup().await.map_err(|e| e.to_string())?;
                Ok(format!("Removed {} instance(s)", removed))
            }
        }
    }
}
