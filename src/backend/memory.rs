//! Peak memory sampling
//!
//! Background samplers that poll a running process (via `sysinfo`) or a
//! sandbox instance (via the runtime's `stats` command) and keep the
//! highest resident size seen.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::trace;

/// Default polling interval
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Background peak-memory sampler
///
/// The sampling task is aborted when [`PeakSampler::finish`] is called or
/// the sampler is dropped.
#[derive(Debug)]
pub struct PeakSampler {
    peak: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl PeakSampler {
    /// Sample a host process by pid
    pub fn for_pid(pid: u32, interval: Duration) -> Self {
        let peak = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&peak);

        let handle = tokio::spawn(async move {
            let pid = Pid::from_u32(pid);
            let mut system = System::new();
            loop {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                match system.process(pid) {
                    Some(process) => {
                        sink.fetch_max(process.memory(), Ordering::Relaxed);
                    }
                    None => break,
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self { peak, handle }
    }

    /// Sample a sandbox instance through the runtime CLI
    pub fn for_container(runtime: String, instance: String, interval: Duration) -> Self {
        let peak = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&peak);

        let handle = tokio::spawn(async move {
            loop {
                if let Some(bytes) = container_memory(&runtime, &instance).await {
                    sink.fetch_max(bytes, Ordering::Relaxed);
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self { peak, handle }
    }

    /// Stop sampling and return the peak in bytes
    pub fn finish(&self) -> u64 {
        self.handle.abort();
        self.peak.load(Ordering::Relaxed)
    }
}

impl Drop for PeakSampler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One `stats` poll for an instance
async fn container_memory(runtime: &str, instance: &str) -> Option<u64> {
    let mut command = Command::new(runtime);
    command
        .args(["stats", "--no-stream", "--format", "{{.MemUsage}}", instance])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(2), command.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let parsed = parse_mem_usage(&text);
    trace!(instance, usage = %text.trim(), ?parsed, "Container memory sample");
    parsed
}

/// Parse the usage half of a `"12.3MiB / 256MiB"` runtime stat
pub fn parse_mem_usage(stat: &str) -> Option<u64> {
    let usage = stat.lines().next()?.split('/').next()?.trim();
    let split = usage
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(usage.len());
    let (number, unit) = usage.split_at(split);
    let value: f64 = number.trim().parse().ok()?;

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" => 1e3,
        "kib" => 1024.0,
        "mb" => 1e6,
        "mib" => 1024.0 * 1024.0,
        "gb" => 1e9,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    Some((value * multiplier) as u64)
}
