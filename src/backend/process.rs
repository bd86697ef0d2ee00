//! Supervised process execution
//!
//! Every backend child process runs inside a detached task that owns the
//! child and its deadline. The caller only awaits the task's result, so a
//! caller that goes away mid-run cannot stop the supervising timer from
//! killing the process.

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cap_output;
use super::memory::{PeakSampler, SAMPLE_INTERVAL};

/// How long to wait for pipe readers after a kill
const READER_DRAIN: Duration = Duration::from_secs(2);

/// Outcome of a supervised run
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// Exit code (None if killed by a signal or the deadline)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Whether the supervising deadline fired
    pub timed_out: bool,
    pub elapsed: Duration,
    /// Peak resident bytes of the direct child, 0 if not sampled
    pub peak_memory_bytes: u64,
}

impl ProcessOutcome {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }
}

/// Options for a supervised run
#[derive(Debug, Clone, Copy)]
pub struct SuperviseOptions {
    /// Deadline after which the process group is killed
    pub deadline: Duration,
    /// Maximum captured bytes per stream
    pub max_output_bytes: usize,
    /// Sample the direct child's resident memory
    pub sample_memory: bool,
}

/// Spawn `command` and supervise it to completion or deadline
///
/// The child is placed in its own process group. The group is killed when
/// the deadline fires and again once the child exits, so background
/// processes it started never outlive the run.
///
/// # Errors
///
/// Returns the spawn error if the program could not be started. `NotFound`
/// means the program is not installed.
pub async fn run_supervised(mut command: Command, options: SuperviseOptions) -> io::Result<ProcessOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let start = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    debug!(?pid, "Spawned supervised process");

    let stdout_reader = spawn_reader(child.stdout.take(), options.max_output_bytes);
    let stderr_reader = spawn_reader(child.stderr.take(), options.max_output_bytes);
    let sampler = pid
        .filter(|_| options.sample_memory)
        .map(|pid| PeakSampler::for_pid(pid, SAMPLE_INTERVAL));

    let supervisor = tokio::spawn(async move {
        let (exit_code, timed_out) = match tokio::time::timeout(options.deadline, child.wait()).await {
            Ok(Ok(status)) => {
                // Background descendants share the group and die with it
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                (status.code(), false)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait on child process");
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                (None, false)
            }
            Err(_) => {
                warn!(?pid, deadline = ?options.deadline, "Supervising deadline expired, killing process group");
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Child already exited before kill");
                }
                (None, true)
            }
        };
        let elapsed = start.elapsed();
        let peak_memory_bytes = sampler.as_ref().map(PeakSampler::finish).unwrap_or(0);

        let stdout = drain(stdout_reader, options.max_output_bytes).await;
        let stderr = drain(stderr_reader, options.max_output_bytes).await;

        ProcessOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            elapsed,
            peak_memory_bytes,
        }
    });

    supervisor
        .await
        .map_err(|e| io::Error::other(format!("supervisor task failed: {}", e)))
}

type Captured = (Vec<u8>, usize);

/// Read a pipe to EOF, keeping at most `max` bytes but counting all of them
fn spawn_reader<R>(pipe: Option<R>, max: usize) -> Option<JoinHandle<Captured>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe = pipe?;
    Some(tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut total = 0usize;
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    total += n;
                    let room = max.saturating_sub(kept.len());
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
        (kept, total)
    }))
}

async fn drain(reader: Option<JoinHandle<Captured>>, max: usize) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_DRAIN, &mut handle).await {
        Ok(Ok((bytes, total))) => cap_output(&bytes, total, max),
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            // A descendant escaped the process group and still holds the pipe
            handle.abort();
            String::new()
        }
    }
}

/// SIGKILL a process group, ignoring groups that are already gone
#[cfg(unix)]
pub fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
pub fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn options(deadline: Duration) -> SuperviseOptions {
        SuperviseOptions {
            deadline,
            max_output_bytes: 1024,
            sample_memory: false,
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 3"]);

        let outcome = run_supervised(command, options(Duration::from_secs(5))).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_deadline_kills_and_keeps_partial_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo started; sleep 30"]);

        let outcome = run_supervised(command, options(Duration::from_millis(300))).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.stdout, "started\n");
        assert!(outcome.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let mut command = Command::new("sh");
        command.args(["-c", "head -c 5000 /dev/zero | tr '\\0' 'a'"]);

        let outcome = run_supervised(command, options(Duration::from_secs(5))).await.unwrap();
        assert!(outcome.stdout.starts_with(&"a".repeat(1024)));
        assert!(outcome.stdout.contains("5000 bytes total"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_background_child_killed_after_normal_exit() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 4242 >/dev/null 2>&1 & echo $!"]);

        let outcome = run_supervised(command, options(Duration::from_secs(5))).await.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);

        let pid: u32 = outcome.stdout.trim().parse().unwrap();
        let running = |pid: u32| match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => !matches!(
                stat.rsplit_once(") ").and_then(|(_, rest)| rest.chars().next()),
                Some('Z') | Some('X') | None
            ),
            Err(_) => false,
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!running(pid), "background sleep {} survived", pid);
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let command = Command::new("definitely-not-a-real-binary-4f1c");
        let err = run_supervised(command, options(Duration::from_secs(1))).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
