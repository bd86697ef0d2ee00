//! Performance Tracking
//!
//! A capacity-bounded rolling history of execution samples with change and
//! trend detection. The history is optionally persisted as JSON and reloaded
//! at startup; persistence problems are diagnosed and never reach callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{BackendKind, ExecutionBackendResult};
use crate::error::GatewayError;
use crate::metrics;

/// Default rolling history capacity
pub const HISTORY_CAPACITY: usize = 1000;

/// Samples averaged for the change baseline
const BASELINE_WINDOW: usize = 5;

/// Samples considered for the trend
const TREND_WINDOW: usize = 10;

/// Relative time change flagged as significant
const TIME_CHANGE_THRESHOLD: f64 = 0.5;

/// Relative memory change flagged as significant
const MEMORY_CHANGE_THRESHOLD: f64 = 0.3;

/// One recorded execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: f64,
    pub memory_bytes: u64,
    pub complexity: u32,
    pub backend: BackendKind,
    pub success: bool,
}

impl PerformanceSample {
    pub fn from_result(result: &ExecutionBackendResult, complexity: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            elapsed_ms: result.elapsed_ms,
            memory_bytes: result.memory_used_bytes,
            complexity,
            backend: result.backend,
            success: result.success,
        }
    }
}

/// Direction of recent execution times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
    InsufficientData,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Improving => write!(f, "improving"),
            Trend::Degrading => write!(f, "degrading"),
            Trend::Stable => write!(f, "stable"),
            Trend::InsufficientData => write!(f, "insufficient data"),
        }
    }
}

/// Analysis of a newly recorded sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceInsight {
    /// Percent change in elapsed time against the baseline
    pub time_change_pct: Option<f64>,
    /// Percent change in memory against the baseline
    pub memory_change_pct: Option<f64>,
    pub significant_change: bool,
    pub trend: Trend,
    pub message: Option<String>,
}

/// Aggregate view for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub samples: usize,
    pub success_rate: f64,
    /// Mean elapsed time over the most recent samples
    pub recent_mean_ms: Option<f64>,
    pub trend: Trend,
    pub per_backend: BTreeMap<BackendKind, usize>,
}

impl PerformanceSummary {
    /// Multi-line text rendering
    pub fn render(&self) -> String {
        let mut out = format!(
            "Performance: {} samples, {:.1}% success, trend {}\n",
            self.samples,
            self.success_rate * 100.0,
            self.trend
        );
        if let Some(mean) = self.recent_mean_ms {
            out.push_str(&format!("Recent mean: {:.1}ms\n", mean));
        }
        for (backend, count) in &self.per_backend {
            out.push_str(&format!("  {}: {}\n", backend, count));
        }
        out
    }
}

/// Timing statistics for a benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStats {
    pub iterations: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub std_dev_ms: f64,
    pub success_rate: f64,
}

impl BenchmarkStats {
    /// Statistics over a set of runs; `None` for an empty set
    pub fn from_results(results: &[ExecutionBackendResult]) -> Option<Self> {
        if results.is_empty() {
            return None;
        }
        let n = results.len() as f64;
        let times: Vec<f64> = results.iter().map(|r| r.elapsed_ms).collect();
        let mean = times.iter().sum::<f64>() / n;
        let variance = times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;

        Some(Self {
            iterations: results.len(),
            mean_ms: mean,
            min_ms: times.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: times.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            std_dev_ms: variance.sqrt(),
            success_rate: results.iter().filter(|r| r.success).count() as f64 / n,
        })
    }
}

/// Bounded rolling history shared by all executions
#[derive(Debug)]
pub struct PerformanceTracker {
    history: Mutex<VecDeque<PerformanceSample>>,
    capacity: usize,
    path: Option<PathBuf>,
    /// Bumped on every record; saves skip snapshots older than the file
    generation: AtomicU64,
    saved_generation: Mutex<u64>,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl PerformanceTracker {
    /// In-memory tracker
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY))),
            capacity: capacity.max(1),
            path: None,
            generation: AtomicU64::new(0),
            saved_generation: Mutex::new(0),
        }
    }

    /// Tracker persisted at `path`, reloading any existing history
    ///
    /// A corrupt file is diagnosed and yields an empty history.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let mut tracker = Self::new(capacity);

        match load_history(&path, tracker.capacity) {
            Ok(samples) => {
                debug!(path = %path.display(), samples = samples.len(), "Loaded performance history");
                tracker.history = Mutex::new(samples);
            }
            Err(e) => {
                metrics::PERSISTENCE_FAILURES_TOTAL.inc();
                warn!(path = %path.display(), error = %e, "Discarding unreadable performance history");
            }
        }

        tracker.path = Some(path);
        tracker
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a sample and analyze it against recent history
    pub fn record(&self, sample: PerformanceSample) -> PerformanceInsight {
        let mut history = self.lock_history();
        history.push_back(sample.clone());
        while history.len() > self.capacity {
            history.pop_front();
        }

        // The window ends with the new sample itself
        let baseline = (history.len() >= BASELINE_WINDOW).then(|| {
            let recent = history.iter().rev().take(BASELINE_WINDOW);
            let (time, memory) = recent.fold((0.0, 0.0), |(t, m), s| (t + s.elapsed_ms, m + s.memory_bytes as f64));
            (time / BASELINE_WINDOW as f64, memory / BASELINE_WINDOW as f64)
        });
        let trend = trend_of(&history);
        drop(history);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let Some((mean_time, mean_memory)) = baseline else {
            return PerformanceInsight {
                time_change_pct: None,
                memory_change_pct: None,
                significant_change: false,
                trend,
                message: None,
            };
        };

        let time_change = relative_change(sample.elapsed_ms, mean_time);
        let memory_change = relative_change(sample.memory_bytes as f64, mean_memory);

        let time_significant = time_change.is_some_and(|c| c.abs() > TIME_CHANGE_THRESHOLD);
        let memory_significant = memory_change.is_some_and(|c| c.abs() > MEMORY_CHANGE_THRESHOLD);

        let mut messages = Vec::new();
        if let Some(change) = time_change.filter(|_| time_significant) {
            messages.push(format!(
                "Execution time {} by {:.1}%",
                if change > 0.0 { "increased" } else { "decreased" },
                change.abs() * 100.0
            ));
        }
        if let Some(change) = memory_change.filter(|_| memory_significant) {
            messages.push(format!(
                "Memory usage {} by {:.1}%",
                if change > 0.0 { "increased" } else { "decreased" },
                change.abs() * 100.0
            ));
        }

        PerformanceInsight {
            time_change_pct: time_change.map(|c| c * 100.0),
            memory_change_pct: memory_change.map(|c| c * 100.0),
            significant_change: time_significant || memory_significant,
            trend,
            message: (!messages.is_empty()).then(|| messages.join("; ")),
        }
    }

    /// Snapshot of the history, oldest first
    pub fn history(&self) -> Vec<PerformanceSample> {
        self.lock_history().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn trend(&self) -> Trend {
        trend_of(&self.lock_history())
    }

    /// Aggregate summary of the current history
    pub fn summary(&self) -> PerformanceSummary {
        let history = self.lock_history();
        let samples = history.len();

        let mut per_backend = BTreeMap::new();
        for sample in history.iter() {
            *per_backend.entry(sample.backend).or_insert(0) += 1;
        }

        let recent: Vec<f64> = history.iter().rev().take(TREND_WINDOW).map(|s| s.elapsed_ms).collect();
        PerformanceSummary {
            samples,
            success_rate: if samples == 0 {
                0.0
            } else {
                history.iter().filter(|s| s.success).count() as f64 / samples as f64
            },
            recent_mean_ms: (!recent.is_empty()).then(|| recent.iter().sum::<f64>() / recent.len() as f64),
            trend: trend_of(&history),
            per_backend,
        }
    }

    /// Write the history to disk if configured
    ///
    /// Blocking; call from a blocking context. Errors are diagnosed, counted
    /// and returned for callers that care.
    pub fn persist(&self) -> Result<(), GatewayError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut saved = self
            .saved_generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (generation, snapshot) = {
            let history = self.lock_history();
            (self.generation.load(Ordering::Acquire), history.iter().cloned().collect::<Vec<_>>())
        };
        if generation <= *saved && *saved != 0 {
            return Ok(());
        }

        let result = write_history(path, &snapshot);
        match &result {
            Ok(()) => *saved = generation,
            Err(e) => {
                metrics::PERSISTENCE_FAILURES_TOTAL.inc();
                warn!(path = %path.display(), error = %e, "Failed to persist performance history");
            }
        }
        result
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<PerformanceSample>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn relative_change(current: f64, baseline: f64) -> Option<f64> {
    (baseline > 0.0).then(|| (current - baseline) / baseline)
}

/// Compare the earlier and later halves of the last ten samples
fn trend_of(history: &VecDeque<PerformanceSample>) -> Trend {
    if history.len() < TREND_WINDOW {
        return Trend::InsufficientData;
    }
    let window: Vec<f64> = history
        .iter()
        .skip(history.len() - TREND_WINDOW)
        .map(|s| s.elapsed_ms)
        .collect();
    let half = TREND_WINDOW / 2;
    let earlier = window[..half].iter().sum::<f64>() / half as f64;
    let later = window[half..].iter().sum::<f64>() / half as f64;

    if later <= earlier * 0.9 {
        Trend::Improving
    } else if later >= earlier * 1.1 {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn load_history(path: &Path, capacity: usize) -> Result<VecDeque<PerformanceSample>, GatewayError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(GatewayError::Io(e)),
    };
    let samples: Vec<PerformanceSample> = serde_json::from_str(&content)
        .map_err(|e| GatewayError::PersistenceCorruption(format!("{}: {}", path.display(), e)))?;

    let skip = samples.len().saturating_sub(capacity);
    Ok(samples.into_iter().skip(skip).collect())
}

fn write_history(path: &Path, samples: &[PerformanceSample]) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(samples)
        .map_err(|e| GatewayError::PersistenceCorruption(e.to_string()))?;

    // Write then rename so readers never see a partial file
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(elapsed_ms: f64, memory_bytes: u64) -> PerformanceSample {
        PerformanceSample {
            timestamp: Utc::now(),
            elapsed_ms,
            memory_bytes,
            complexity: 1,
            backend: BackendKind::Subprocess,
            success: true,
        }
    }

    #[test]
    fn test_history_bounded_to_most_recent() {
        let tracker = PerformanceTracker::default();
        for i in 0..1500 {
            tracker.record(sample(i as f64, 0));
        }

        let history = tracker.history();
        assert_eq!(history.len(), 1000);
        assert_eq!(history.first().unwrap().elapsed_ms, 500.0);
        assert_eq!(history.last().unwrap().elapsed_ms, 1499.0);
        assert!(history.windows(2).all(|w| w[0].elapsed_ms < w[1].elapsed_ms));
    }

    #[test]
    fn test_no_deltas_below_five_samples() {
        let tracker = PerformanceTracker::default();
        for _ in 0..4 {
            let insight = tracker.record(sample(10.0, 100));
            assert!(insight.time_change_pct.is_none());
            assert!(!insight.significant_change);
        }

        // The fifth sample completes the window
        let insight = tracker.record(sample(10.0, 100));
        assert_eq!(insight.time_change_pct, Some(0.0));
    }

    #[test]
    fn test_fifth_sample_compared_against_window() {
        let tracker = PerformanceTracker::default();
        for _ in 0..4 {
            tracker.record(sample(100.0, 0));
        }
        // Window mean is (4 * 100 + 300) / 5 = 140
        let insight = tracker.record(sample(300.0, 0));
        assert!(insight.significant_change);
        let change = insight.time_change_pct.unwrap();
        assert!((change - 114.285).abs() < 0.01, "change {}", change);
    }

    #[test]
    fn test_significant_time_change() {
        let tracker = PerformanceTracker::default();
        for _ in 0..5 {
            tracker.record(sample(100.0, 1000));
        }
        // Window mean is (4 * 100 + 400) / 5 = 160
        let insight = tracker.record(sample(400.0, 1000));
        assert!(insight.significant_change);
        assert_eq!(insight.time_change_pct, Some(150.0));
        assert!(insight.message.unwrap().contains("increased by 150.0%"));
    }

    #[test]
    fn test_memory_change_threshold() {
        let tracker = PerformanceTracker::default();
        for _ in 0..5 {
            tracker.record(sample(100.0, 1000));
        }
        assert!(!tracker.record(sample(100.0, 1250)).significant_change);

        let tracker = PerformanceTracker::default();
        for _ in 0..5 {
            tracker.record(sample(100.0, 1000));
        }
        assert!(tracker.record(sample(100.0, 1500)).significant_change);
    }

    #[test]
    fn test_trend_detection() {
        let tracker = PerformanceTracker::default();
        for _ in 0..9 {
            tracker.record(sample(100.0, 0));
        }
        assert_eq!(tracker.trend(), Trend::InsufficientData);

        let tracker = PerformanceTracker::default();
        for t in [100.0, 100.0, 100.0, 100.0, 100.0, 50.0, 50.0, 50.0, 50.0, 50.0] {
            tracker.record(sample(t, 0));
        }
        assert_eq!(tracker.trend(), Trend::Improving);

        let tracker = PerformanceTracker::default();
        for t in [100.0, 100.0, 100.0, 100.0, 100.0, 120.0, 120.0, 120.0, 120.0, 120.0] {
            tracker.record(sample(t, 0));
        }
        assert_eq!(tracker.trend(), Trend::Degrading);

        let tracker = PerformanceTracker::default();
        for _ in 0..10 {
            tracker.record(sample(100.0, 0));
        }
        assert_eq!(tracker.trend(), Trend::Stable);
    }

    #[test]
    fn test_summary() {
        let tracker = PerformanceTracker::default();
        tracker.record(sample(10.0, 0));
        let mut failed = sample(30.0, 0);
        failed.success = false;
        failed.backend = BackendKind::Container;
        tracker.record(failed);

        let summary = tracker.summary();
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.success_rate, 0.5);
        assert_eq!(summary.recent_mean_ms, Some(20.0));
        assert_eq!(summary.per_backend[&BackendKind::Container], 1);
        assert!(summary.render().contains("2 samples"));
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("performance.json");

        let tracker = PerformanceTracker::open(&path, 3);
        for i in 0..5 {
            tracker.record(sample(i as f64, 0));
        }
        tracker.persist().unwrap();

        let reloaded = PerformanceTracker::open(&path, 2);
        let history = reloaded.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].elapsed_ms, 4.0);
    }

    #[test]
    fn test_corrupt_history_yields_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("performance.json");
        std::fs::write(&path, "{ not json").unwrap();

        let tracker = PerformanceTracker::open(&path, 10);
        assert!(tracker.is_empty());

        // Still usable and overwrites the corrupt file on save
        tracker.record(sample(1.0, 0));
        tracker.persist().unwrap();
        assert_eq!(PerformanceTracker::open(&path, 10).len(), 1);
    }

    #[test]
    fn test_benchmark_stats() {
        let results: Vec<ExecutionBackendResult> = [10.0, 20.0, 30.0]
            .into_iter()
            .map(|ms| {
                ExecutionBackendResult::completed(
                    BackendKind::Subprocess,
                    crate::policy::IsolationLevel::Subprocess,
                    Some(0),
                    String::new(),
                    String::new(),
                    ms,
                )
            })
            .collect();

        let stats = BenchmarkStats::from_results(&results).unwrap();
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.mean_ms, 20.0);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert!((stats.std_dev_ms - 8.1649).abs() < 0.001);
        assert_eq!(stats.success_rate, 1.0);
        assert!(BenchmarkStats::from_results(&[]).is_none());
    }
}
