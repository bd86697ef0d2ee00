//! Execution Gateway
//!
//! Wires the pipeline together: analysis, routing, execution, then
//! performance and audit recording. Each submission runs on its own task,
//! so a caller that goes away mid-execution does not abandon the child
//! process or sandbox instance; the backend's supervising timer still
//! reclaims it and the audit entry is still written.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::SecurityAnalyzer;
use crate::audit::{AuditRecorder, AuditTicket};
use crate::backend::{
    BackendKind, ContainerBackend, ContainerConfig, ExecutionBackend, ExecutionBackendResult, RuntimeStatus,
    SubprocessBackend, SubprocessConfig,
};
use crate::commands::CommandInterpreter;
use crate::config::{Config, NotificationConfig};
use crate::error::{FailureKind, GatewayError};
use crate::metrics;
use crate::notify::{self, Notification, NotificationKind, NotificationSink, RateLimitedNotifier, TracingNotifier};
use crate::performance::{BenchmarkStats, PerformanceSample, PerformanceTracker, HISTORY_CAPACITY};
use crate::policy::{ExecutionPolicy, IsolationLevel};
use crate::router::{BackendAvailability, ExecutionRouter, Route, RouteDecision};
use crate::submission::{CodeSubmission, GatewayResponse};

/// Keeps the in-flight gauge honest on every exit path
struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        metrics::ACTIVE_EXECUTIONS.inc();
        Self
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        metrics::ACTIVE_EXECUTIONS.dec();
    }
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    policy: ExecutionPolicy,
    container: ContainerConfig,
    subprocess: SubprocessConfig,
    audit: Option<AuditRecorder>,
    performance: Option<Arc<PerformanceTracker>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    notifications: NotificationConfig,
}

impl GatewayBuilder {
    pub fn new(policy: ExecutionPolicy) -> Self {
        Self {
            policy,
            container: ContainerConfig::default(),
            subprocess: SubprocessConfig::default(),
            audit: None,
            performance: None,
            notifier: None,
            notifications: NotificationConfig::default(),
        }
    }

    pub fn container(mut self, config: ContainerConfig) -> Self {
        self.container = config;
        self
    }

    pub fn subprocess(mut self, config: SubprocessConfig) -> Self {
        self.subprocess = config;
        self
    }

    pub fn audit(mut self, recorder: AuditRecorder) -> Self {
        self.audit = Some(recorder);
        self
    }

    pub fn performance(mut self, tracker: Arc<PerformanceTracker>) -> Self {
        self.performance = Some(tracker);
        self
    }

    /// Notification sink; defaults to a rate-limited log notifier
    pub fn notifier(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(sink);
        self
    }

    pub fn notifications(mut self, config: NotificationConfig) -> Self {
        self.notifications = config;
        self
    }

    /// Build the gateway; the container runtime is unprobed until
    /// [`Gateway::probe`] runs
    pub fn build(self) -> Arc<Gateway> {
        if let Err(e) = metrics::init() {
            warn!("Metrics unavailable: {}", e);
        }

        let policy = Arc::new(self.policy);
        let container = Arc::new(ContainerBackend::new(self.container));
        let audit = self
            .audit
            .unwrap_or_else(|| AuditRecorder::new(policy.enterprise_mode()));
        let performance = self
            .performance
            .unwrap_or_else(|| Arc::new(PerformanceTracker::new(HISTORY_CAPACITY)));
        let window = Duration::from_secs(self.notifications.rate_limit_secs);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(RateLimitedNotifier::new(Arc::new(TracingNotifier), window)));

        let commands = CommandInterpreter::new(
            Arc::clone(&container),
            Arc::clone(&performance),
            audit.clone(),
            Arc::clone(&policy),
        );

        Arc::new(Gateway {
            policy,
            analyzer: SecurityAnalyzer::new(),
            container,
            subprocess: SubprocessBackend::new(self.subprocess),
            commands,
            audit,
            performance,
            notifier,
            notifications: self.notifications,
        })
    }
}

/// The policy-driven execution gateway
pub struct Gateway {
    policy: Arc<ExecutionPolicy>,
    analyzer: SecurityAnalyzer,
    container: Arc<ContainerBackend>,
    subprocess: SubprocessBackend,
    commands: CommandInterpreter,
    audit: AuditRecorder,
    performance: Arc<PerformanceTracker>,
    notifier: Arc<dyn NotificationSink>,
    notifications: NotificationConfig,
}

impl Gateway {
    pub fn builder(policy: ExecutionPolicy) -> GatewayBuilder {
        GatewayBuilder::new(policy)
    }

    /// Build a gateway from configuration and probe the container runtime
    ///
    /// Audit and performance stores are file-backed when the storage
    /// section enables them.
    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let policy = config.policy()?;

        let audit = match config.audit_path() {
            Some(path) => AuditRecorder::with_file(policy.enterprise_mode(), path),
            None => AuditRecorder::new(policy.enterprise_mode()),
        };
        let capacity = config.storage.history_capacity;
        let performance = match config.performance_path() {
            Some(path) => {
                tokio::task::spawn_blocking(move || PerformanceTracker::open(path, capacity)).await?
            }
            None => PerformanceTracker::new(capacity),
        };

        let gateway = GatewayBuilder::new(policy)
            .container(config.sandbox.clone())
            .subprocess(config.subprocess.clone())
            .audit(audit)
            .performance(Arc::new(performance))
            .notifications(config.notifications.clone())
            .build();
        gateway.probe().await;
        Ok(gateway)
    }

    /// Probe the container runtime, updating routing availability
    pub async fn probe(&self) -> RuntimeStatus {
        self.container.probe().await
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn analyzer(&self) -> &SecurityAnalyzer {
        &self.analyzer
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.performance
    }

    pub fn container(&self) -> &ContainerBackend {
        &self.container
    }

    /// Run a submission through the full pipeline
    ///
    /// The audit slot is reserved when `execute` is called, before the
    /// returned future is first polled, so audit entries follow call order.
    /// Never fails; problems are reported on the response.
    pub fn execute(self: &Arc<Self>, submission: CodeSubmission) -> impl Future<Output = GatewayResponse> + Send + 'static {
        let ticket = self.audit.reserve();
        let execution_id = ticket.execution_id();
        let gateway = Arc::clone(self);

        async move {
            let pipeline = tokio::spawn(async move { gateway.run(ticket, submission).await });
            match pipeline.await {
                Ok(response) => response,
                Err(e) => {
                    error!(%execution_id, error = %e, "Execution pipeline aborted");
                    aborted_response(execution_id, &e)
                }
            }
        }
    }

    async fn run(&self, ticket: AuditTicket, submission: CodeSubmission) -> GatewayResponse {
        let _active = ActiveGuard::enter();
        let execution_id = ticket.execution_id();

        let assessment = (!submission.is_directive())
            .then(|| self.analyzer.analyze(submission.code(), submission.language()));
        if let Some(assessment) = &assessment {
            metrics::RISK_ASSESSMENTS_TOTAL
                .with_label_values(&[&assessment.risk_level().to_string()])
                .inc();
        }

        let availability = BackendAvailability::new(self.container.is_available());
        let decision = ExecutionRouter::route(&submission, assessment.as_ref(), &self.policy, availability);
        info!(
            %execution_id,
            language = %submission.language(),
            route = %decision.route,
            risk = ?assessment.as_ref().map(|a| a.risk_level()),
            "{}",
            decision.reason
        );

        if let (Some(level), Some(assessment)) = (decision.alert, &assessment) {
            metrics::SECURITY_ALERTS_TOTAL.inc();
            if self.notifications.enabled && self.notifications.security_alerts {
                self.notify(Notification::new(
                    NotificationKind::Security,
                    format!("{} risk submission", capitalize(&level.to_string())),
                    format!(
                        "Execution {} ({}): {}. Executing anyway; risk is advisory.",
                        execution_id,
                        submission.language(),
                        assessment.summary()
                    ),
                ));
            }
        }

        let policy = match submission.security_level() {
            Some(level) => self.policy.with_security_level(level),
            None => self.policy.as_ref().clone(),
        };
        if matches!(decision.route, Route::Subprocess { .. }) && decision.effective_level.wants_sandbox() {
            self.note_fallback(execution_id, "container runtime unavailable at routing time");
        }

        let iterations = match decision.route {
            Route::Container { .. } | Route::Subprocess { .. } => submission.benchmark_iterations().unwrap_or(1),
            Route::Command | Route::Deny { .. } => 1,
        };

        let complexity = assessment.as_ref().map(|a| a.complexity_score()).unwrap_or(0);
        let mut results = Vec::with_capacity(iterations as usize);
        let mut insight = None;
        for _ in 0..iterations {
            let result = self.dispatch_route(execution_id, &decision, &submission, &policy).await;
            self.observe(&result);
            if matches!(result.backend, BackendKind::Container | BackendKind::Subprocess) {
                insight = Some(self.performance.record(PerformanceSample::from_result(&result, complexity)));
            }
            results.push(result);
        }

        if insight.is_some() {
            self.persist_performance().await;
        }
        if let Some(message) = insight.as_ref().and_then(|i| i.message.clone()) {
            info!(%execution_id, "Performance change: {}", message);
            if self.notifications.enabled && self.notifications.performance_insights {
                self.notify(Notification::new(NotificationKind::Info, "Performance change", message));
            }
        }

        let benchmark = submission
            .benchmark_iterations()
            .and_then(|_| BenchmarkStats::from_results(&results));
        let Some(result) = results.pop() else {
            let err = GatewayError::ExecutionFailure("no execution attempted".to_string());
            return GatewayResponse::from_result(
                execution_id,
                ExecutionBackendResult::from_error(decision.route.backend(), decision.route.isolation(), &err),
                assessment,
            );
        };

        self.audit.record(ticket, &submission, assessment.as_ref(), &result);
        info!(%execution_id, "{}", result.summary());

        let mut response = GatewayResponse::from_result(execution_id, result, assessment);
        response.performance = insight;
        response.benchmark = benchmark;
        response
    }

    async fn dispatch_route(
        &self,
        execution_id: Uuid,
        decision: &RouteDecision,
        submission: &CodeSubmission,
        policy: &ExecutionPolicy,
    ) -> ExecutionBackendResult {
        match &decision.route {
            Route::Command => self.commands.execute(submission.code()).await,
            Route::Deny { language } => {
                warn!(%execution_id, %language, "Language denied by policy");
                ExecutionBackendResult::denied(language)
            }
            Route::Subprocess { language } => self.subprocess.execute(*language, submission.code(), policy).await,
            Route::Container { language, .. } => {
                let result = self.container.execute(*language, submission.code(), policy).await;
                if result.is_unavailable() {
                    self.note_fallback(execution_id, &result.stderr);
                    return self.subprocess.execute(*language, submission.code(), policy).await;
                }
                result
            }
        }
    }

    fn note_fallback(&self, execution_id: Uuid, reason: &str) {
        metrics::BACKEND_FALLBACKS_TOTAL.inc();
        warn!(%execution_id, reason, "Sandbox unavailable; executing as host subprocess");
        if self.notifications.enabled && self.notifications.backend_alerts {
            self.notify(Notification::new(
                NotificationKind::Warning,
                "Sandbox unavailable",
                format!("Falling back to host execution with reduced isolation: {}", reason),
            ));
        }
    }

    fn observe(&self, result: &ExecutionBackendResult) {
        let backend = result.backend.to_string();
        let status = match result.failure {
            None => "success",
            Some(FailureKind::ExecutionTimeout) => "timeout",
            Some(FailureKind::ConfigurationDenied) => "denied",
            Some(FailureKind::BackendUnavailable) => "unavailable",
            Some(FailureKind::ExecutionFailure) => "failure",
        };
        metrics::EXECUTIONS_TOTAL.with_label_values(&[&backend, status]).inc();
        metrics::EXECUTION_DURATION_SECONDS
            .with_label_values(&[&backend])
            .observe(result.elapsed_ms / 1000.0);
        if result.memory_used_bytes > 0 {
            metrics::EXECUTION_PEAK_MEMORY_BYTES
                .with_label_values(&[&backend])
                .observe(result.memory_used_bytes as f64);
        }
        if result.failure == Some(FailureKind::ExecutionTimeout) {
            metrics::EXECUTION_TIMEOUTS_TOTAL.inc();
        }
    }

    async fn persist_performance(&self) {
        let tracker = Arc::clone(&self.performance);
        if let Err(e) = tokio::task::spawn_blocking(move || tracker.persist()).await {
            warn!(error = %e, "Performance persistence task failed");
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = notify::dispatch(&self.notifier, notification);
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Response for a pipeline that panicked or was cancelled
///
/// Carries no backend or isolation claim, since neither is known.
fn aborted_response(execution_id: Uuid, reason: &dyn std::fmt::Display) -> GatewayResponse {
    let err = GatewayError::ExecutionFailure(format!("execution pipeline aborted: {}", reason));
    GatewayResponse::from_result(
        execution_id,
        ExecutionBackendResult::from_error(BackendKind::Internal, IsolationLevel::Unknown, &err),
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::RiskLevel;
    use crate::policy::{Language, SecurityLevel};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for Collecting {
        async fn notify(&self, notification: Notification) {
            self.seen.lock().unwrap().push(notification);
        }
    }

    fn has(binary: &str) -> bool {
        if which::which(binary).is_err() {
            eprintln!("skipping: {} not installed", binary);
            return false;
        }
        true
    }

    fn gateway(sink: Arc<Collecting>) -> Arc<Gateway> {
        Gateway::builder(ExecutionPolicy::default())
            .container(ContainerConfig {
                runtime: "sentinel-test-missing-runtime".to_string(),
                ..ContainerConfig::default()
            })
            .notifier(sink)
            .build()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_directive_skips_analysis() {
        let gateway = gateway(Arc::new(Collecting::default()));
        let response = gateway.execute(CodeSubmission::directive("/help")).await;

        assert!(response.success);
        assert_eq!(response.backend, BackendKind::Command);
        assert!(response.risk_assessment.is_none());
        assert_eq!(gateway.audit().len(), 1);
        assert!(gateway.performance().is_empty());
    }

    #[test]
    fn test_aborted_pipeline_is_not_reported_as_denial() {
        let id = Uuid::new_v4();
        let response = aborted_response(id, &"task panicked");

        assert!(!response.success);
        assert_eq!(response.execution_id, id);
        assert_eq!(response.backend, BackendKind::Internal);
        assert_eq!(response.security_level, IsolationLevel::Unknown);
        assert_eq!(response.failure, Some(FailureKind::ExecutionFailure));
        assert_ne!(response.failure, Some(FailureKind::ConfigurationDenied));
        assert!(response.stderr.contains("task panicked"));
    }

    #[tokio::test]
    async fn test_denied_language_is_audited() {
        let gateway = gateway(Arc::new(Collecting::default()));
        let response = gateway.execute(CodeSubmission::new("ruby", "puts 1")).await;

        assert!(!response.success);
        assert_eq!(response.failure, Some(FailureKind::ConfigurationDenied));
        assert_eq!(response.security_level, IsolationLevel::Denied);
        assert!(response.risk_assessment.is_some());

        let entries = gateway.audit().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].execution_id, response.execution_id);
        assert_eq!(entries[0].backend, BackendKind::Denied);
    }

    #[tokio::test]
    async fn test_fallback_is_visible_and_notified() {
        if !has("bash") {
            return;
        }
        let sink = Arc::new(Collecting::default());
        let gateway = gateway(sink.clone());
        gateway.probe().await;
        assert!(!gateway.container().is_available());

        let response = gateway
            .execute(CodeSubmission::new("bash", "echo hello").with_security_level(SecurityLevel::Balanced))
            .await;

        assert!(response.success, "stderr: {}", response.stderr);
        assert_eq!(response.stdout.trim(), "hello");
        assert_eq!(response.backend, BackendKind::Subprocess);
        assert_eq!(response.security_level, IsolationLevel::Subprocess);

        settle().await;
        let seen = sink.seen.lock().unwrap();
        assert!(seen.iter().any(|n| n.title == "Sandbox unavailable"));
    }

    #[tokio::test]
    async fn test_critical_risk_still_executes_and_alerts() {
        if !has("python3") {
            return;
        }
        let sink = Arc::new(Collecting::default());
        let gateway = gateway(sink.clone());

        let code = "import os\nif False:\n    os.system('true')\n    eval('1')\nprint('ran')";
        let response = gateway.execute(CodeSubmission::new("python", code)).await;

        let assessment = response.risk_assessment.as_ref().unwrap();
        assert_eq!(assessment.risk_level(), RiskLevel::Critical);
        assert!(response.success, "stderr: {}", response.stderr);
        assert_eq!(response.stdout.trim(), "ran");

        settle().await;
        let seen = sink.seen.lock().unwrap();
        assert!(seen
            .iter()
            .any(|n| n.kind == NotificationKind::Security && n.title == "Critical risk submission"));
    }

    #[tokio::test]
    async fn test_benchmark_runs_repeatedly() {
        if !has("bash") {
            return;
        }
        let gateway = gateway(Arc::new(Collecting::default()));
        let response = gateway
            .execute(CodeSubmission::new("bash", "echo bench").with_benchmark(3))
            .await;

        let benchmark = response.benchmark.unwrap();
        assert_eq!(benchmark.iterations, 3);
        assert_eq!(benchmark.success_rate, 1.0);
        assert!(benchmark.min_ms <= benchmark.mean_ms && benchmark.mean_ms <= benchmark.max_ms);
        assert_eq!(gateway.performance().len(), 3);
        assert_eq!(gateway.audit().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_reported() {
        if !has("bash") {
            return;
        }
        let policy = ExecutionPolicy::new(
            SecurityLevel::Development,
            [Language::Bash],
            Duration::from_millis(300),
            64,
            false,
        )
        .unwrap();
        let gateway = Gateway::builder(policy).notifier(Arc::new(Collecting::default())).build();

        let response = gateway.execute(CodeSubmission::new("bash", "echo start; sleep 30")).await;
        assert!(!response.success);
        assert_eq!(response.failure, Some(FailureKind::ExecutionTimeout));
        assert!(response.stdout.contains("start"));
        assert!(response.elapsed_time < 10.0);
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("critical"), "Critical");
        assert_eq!(capitalize(""), "");
    }
}
