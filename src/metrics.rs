// Prometheus metrics for the execution gateway
//
// Exposed on the /metrics HTTP endpoint when the metrics server runs:
// - Executions by backend and outcome (counter)
// - Execution latencies and peak memory (histograms)
// - Risk assessments by level (counter)
// - Fallbacks, timeouts and instrumentation failures (counters)
// - Executions in flight (gauge)

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Execution metrics
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("gateway_executions_total", "Total executions by backend and status"),
        &["backend", "status"]
    ).expect("Failed to create executions total metric");

    pub static ref EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("gateway_execution_duration_seconds", "Execution wall time in seconds"),
        &["backend"]
    ).expect("Failed to create execution duration metric");

    pub static ref EXECUTION_PEAK_MEMORY_BYTES: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("gateway_execution_peak_memory_bytes", "Peak resident memory per execution")
            .buckets(prometheus::exponential_buckets(1024.0 * 1024.0, 2.0, 12).unwrap_or_default()),
        &["backend"]
    ).expect("Failed to create peak memory metric");

    pub static ref ACTIVE_EXECUTIONS: IntGauge = IntGauge::new(
        "gateway_active_executions",
        "Number of executions currently in flight"
    ).expect("Failed to create active executions metric");

    pub static ref EXECUTION_TIMEOUTS_TOTAL: IntCounter = IntCounter::new(
        "gateway_execution_timeouts_total",
        "Executions terminated by the supervising deadline"
    ).expect("Failed to create execution timeouts metric");

    pub static ref BACKEND_FALLBACKS_TOTAL: IntCounter = IntCounter::new(
        "gateway_backend_fallbacks_total",
        "Sandbox runs that fell back to host execution"
    ).expect("Failed to create backend fallbacks metric");

    // Analysis metrics
    pub static ref RISK_ASSESSMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("gateway_risk_assessments_total", "Risk assessments by level"),
        &["level"]
    ).expect("Failed to create risk assessments metric");

    pub static ref SECURITY_ALERTS_TOTAL: IntCounter = IntCounter::new(
        "gateway_security_alerts_total",
        "High or critical risk alerts raised"
    ).expect("Failed to create security alerts metric");

    // Instrumentation failures
    pub static ref AUDIT_WRITE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "gateway_audit_write_failures_total",
        "Audit entries that could not be persisted"
    ).expect("Failed to create audit write failures metric");

    pub static ref PERSISTENCE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "gateway_persistence_failures_total",
        "Performance history load or save failures"
    ).expect("Failed to create persistence failures metric");
}

static INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Register every metric with [`REGISTRY`]
///
/// Safe to call more than once; registration happens on the first call.
pub fn init() -> anyhow::Result<()> {
    INIT.get_or_init(|| register().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))
}

fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EXECUTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_PEAK_MEMORY_BYTES.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_EXECUTIONS.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_TIMEOUTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BACKEND_FALLBACKS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RISK_ASSESSMENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SECURITY_ALERTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUDIT_WRITE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PERSISTENCE_FAILURES_TOTAL.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_execution_metrics_exported() {
        init().unwrap();
        EXECUTIONS_TOTAL.with_label_values(&["subprocess", "success"]).inc();
        EXECUTION_DURATION_SECONDS.with_label_values(&["subprocess"]).observe(0.01);

        let text = gather_metrics().unwrap();
        assert!(text.contains("gateway_executions_total"));
        assert!(text.contains("gateway_execution_duration_seconds"));
    }

    #[test]
    fn test_active_gauge() {
        ACTIVE_EXECUTIONS.inc();
        assert!(ACTIVE_EXECUTIONS.get() >= 1);
        ACTIVE_EXECUTIONS.dec();
    }
}
