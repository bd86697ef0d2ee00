//! Audit Trail
//!
//! Append-only record of every execution. Entries are immutable, uniquely
//! identified and kept in submission order: each submission reserves a
//! sequence number up front ([`AuditRecorder::reserve`]) and entries are
//! committed strictly in sequence, regardless of which execution finishes
//! first. Recording never fails; write problems are logged and counted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::analysis::{RiskAssessment, RiskLevel};
use crate::backend::{BackendKind, ExecutionBackendResult};
use crate::error::{FailureKind, GatewayError};
use crate::metrics;
use crate::policy::IsolationLevel;
use crate::submission::CodeSubmission;

/// Condensed risk information stored on every entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub level: RiskLevel,
    pub score: u32,
    pub violation_count: usize,
    pub critical_count: usize,
    pub complexity: u32,
}

impl From<&RiskAssessment> for RiskSummary {
    fn from(assessment: &RiskAssessment) -> Self {
        Self {
            level: assessment.risk_level(),
            score: assessment.score(),
            violation_count: assessment.violations().len(),
            critical_count: assessment.critical_count(),
            complexity: assessment.complexity_score(),
        }
    }
}

/// Host the gateway runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl HostInfo {
    pub fn current() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Details attached only in enterprise mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterpriseDetail {
    pub source: String,
    pub assessment: Option<RiskAssessment>,
    pub result: ExecutionBackendResult,
}

/// A single immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Recorder session this entry belongs to
    pub session_id: Uuid,

    /// Unique identifier of the execution
    pub execution_id: Uuid,

    /// Position in submission order, starting at 0
    pub sequence: u64,

    pub language: String,

    /// SHA-256 of the source, hex encoded
    pub source_sha256: String,

    pub source_len: usize,

    /// Absent for directives, which are not analyzed
    pub risk: Option<RiskSummary>,

    pub backend: BackendKind,
    pub isolation: IsolationLevel,
    pub success: bool,
    pub failure: Option<FailureKind>,
    pub elapsed_ms: f64,
    pub memory_used_bytes: u64,
    pub instance_id: Option<String>,

    pub quantum: bool,
    pub benchmark_iterations: Option<u32>,

    pub host: HostInfo,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise: Option<EnterpriseDetail>,
}

/// Reserved slot in the audit order
///
/// Dropping a ticket without recording releases its slot, so later entries
/// are never held back by an execution that vanished.
#[derive(Debug)]
pub struct AuditTicket {
    inner: Arc<AuditInner>,
    sequence: u64,
    execution_id: Uuid,
    submitted_at: DateTime<Utc>,
    consumed: bool,
}

impl AuditTicket {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for AuditTicket {
    fn drop(&mut self) {
        if !self.consumed {
            debug!(sequence = self.sequence, "Audit ticket abandoned");
            self.inner.commit(self.sequence, None);
        }
    }
}

#[derive(Debug, Default)]
struct AuditState {
    /// Finished slots waiting for earlier ones; `None` marks an abandoned slot
    pending: BTreeMap<u64, Option<AuditEntry>>,
    next_commit: u64,
    entries: Vec<AuditEntry>,
    write_failures: u64,
    log: Option<AuditLog>,
}

/// JSONL sink holding its append handle between entries
#[derive(Debug)]
struct AuditLog {
    path: PathBuf,
    file: Option<File>,
}

impl AuditLog {
    /// Create the parent directory and open the file up front
    fn open(path: PathBuf) -> Self {
        let file = match open_log(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open audit log; retrying on next entry");
                None
            }
        };
        Self { path, file }
    }

    /// Append one entry, reopening the file if an earlier open or write failed
    fn append(&mut self, entry: &AuditEntry) -> Result<(), GatewayError> {
        let mut line = serde_json::to_string(entry).map_err(|e| GatewayError::AuditWriteFailure(e.to_string()))?;
        line.push('\n');

        let mut file = match self.file.take() {
            Some(file) => file,
            None => open_log(&self.path)?,
        };
        file.write_all(line.as_bytes())?;
        self.file = Some(file);
        Ok(())
    }
}

#[derive(Debug)]
struct AuditInner {
    session_id: Uuid,
    enterprise_mode: bool,
    path: Option<PathBuf>,
    host: HostInfo,
    next_sequence: AtomicU64,
    state: Mutex<AuditState>,
}

impl AuditInner {
    fn lock(&self) -> MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place a finished slot and flush every contiguous slot after the cursor
    fn commit(&self, sequence: u64, entry: Option<AuditEntry>) {
        let mut state = self.lock();
        state.pending.insert(sequence, entry);

        loop {
            let next = state.next_commit;
            let Some(slot) = state.pending.remove(&next) else {
                break;
            };
            state.next_commit += 1;

            let Some(entry) = slot else {
                continue;
            };
            let written = state.log.as_mut().map(|log| log.append(&entry));
            if let Some(Err(e)) = written {
                state.write_failures += 1;
                metrics::AUDIT_WRITE_FAILURES_TOTAL.inc();
                warn!(
                    execution_id = %entry.execution_id,
                    path = ?self.path,
                    error = %e,
                    "Audit write failed; entry kept in memory only"
                );
            }
            state.entries.push(entry);
        }
    }
}

fn open_log(path: &Path) -> Result<File, GatewayError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Hex SHA-256 of a source text
pub fn hash_source(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Append-only audit recorder
///
/// Cheap to clone; clones share the same log.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    inner: Arc<AuditInner>,
}

impl AuditRecorder {
    /// In-memory recorder
    pub fn new(enterprise_mode: bool) -> Self {
        Self::build(enterprise_mode, None)
    }

    /// Recorder that also appends JSON lines to `path`
    pub fn with_file(enterprise_mode: bool, path: impl Into<PathBuf>) -> Self {
        Self::build(enterprise_mode, Some(path.into()))
    }

    fn build(enterprise_mode: bool, path: Option<PathBuf>) -> Self {
        let log = path.clone().map(AuditLog::open);
        Self {
            inner: Arc::new(AuditInner {
                session_id: Uuid::new_v4(),
                enterprise_mode,
                path,
                host: HostInfo::current(),
                next_sequence: AtomicU64::new(0),
                state: Mutex::new(AuditState {
                    log,
                    ..AuditState::default()
                }),
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Reserve the next slot in submission order
    ///
    /// Call synchronously when a submission arrives, before any await.
    pub fn reserve(&self) -> AuditTicket {
        AuditTicket {
            inner: Arc::clone(&self.inner),
            sequence: self.inner.next_sequence.fetch_add(1, Ordering::AcqRel),
            execution_id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            consumed: false,
        }
    }

    /// Record a finished execution into its reserved slot
    ///
    /// Never fails. The source text is stored only in enterprise mode;
    /// otherwise only its hash and length are kept.
    pub fn record(
        &self,
        mut ticket: AuditTicket,
        submission: &CodeSubmission,
        assessment: Option<&RiskAssessment>,
        result: &ExecutionBackendResult,
    ) -> Uuid {
        ticket.consumed = true;

        let enterprise = self.inner.enterprise_mode.then(|| EnterpriseDetail {
            source: submission.code().to_string(),
            assessment: assessment.cloned(),
            result: result.clone(),
        });

        let entry = AuditEntry {
            session_id: self.inner.session_id,
            execution_id: ticket.execution_id,
            sequence: ticket.sequence,
            language: submission.language().to_string(),
            source_sha256: hash_source(submission.code()),
            source_len: submission.code().len(),
            risk: assessment.map(RiskSummary::from),
            backend: result.backend,
            isolation: result.isolation,
            success: result.success,
            failure: result.failure,
            elapsed_ms: result.elapsed_ms,
            memory_used_bytes: result.memory_used_bytes,
            instance_id: result.instance_id.clone(),
            quantum: submission.quantum_enabled(),
            benchmark_iterations: submission.benchmark_iterations(),
            host: self.inner.host.clone(),
            submitted_at: ticket.submitted_at,
            completed_at: Utc::now(),
            enterprise,
        };

        debug!(
            execution_id = %entry.execution_id,
            sequence = entry.sequence,
            backend = %entry.backend,
            "Recording audit entry"
        );
        ticket.inner.commit(ticket.sequence, Some(entry));
        ticket.execution_id
    }

    /// Committed entries in submission order
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().entries.clone()
    }

    /// The last `n` committed entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let state = self.inner.lock();
        let skip = state.entries.len().saturating_sub(n);
        state.entries[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries reserved but not yet committable
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn write_failures(&self) -> u64 {
        self.inner.lock().write_failures
    }

    /// Export committed entries as pretty JSON
    pub fn export_json(&self) -> anyhow::Result<String> {
        let json = serde_json::to_string_pretty(&self.entries())?;
        Ok(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SecurityAnalyzer;
    use tempfile::TempDir;

    fn result() -> ExecutionBackendResult {
        ExecutionBackendResult::completed(
            BackendKind::Subprocess,
            IsolationLevel::Subprocess,
            Some(0),
            "ok".into(),
            String::new(),
            5.0,
        )
    }

    #[test]
    fn test_hash_source() {
        assert_eq!(
            hash_source("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_source_not_stored_without_enterprise() {
        let recorder = AuditRecorder::new(false);
        let submission = CodeSubmission::new("python", "print('top secret')");
        recorder.record(recorder.reserve(), &submission, None, &result());

        let json = recorder.export_json().unwrap();
        assert!(!json.contains("top secret"));
        assert!(json.contains(&hash_source("print('top secret')")));
    }

    #[test]
    fn test_enterprise_attaches_details() {
        let recorder = AuditRecorder::new(true);
        let submission = CodeSubmission::new("python", "import os");
        let assessment = SecurityAnalyzer::new().analyze(submission.code(), "python");
        recorder.record(recorder.reserve(), &submission, Some(&assessment), &result());

        let entry = &recorder.entries()[0];
        let detail = entry.enterprise.as_ref().unwrap();
        assert_eq!(detail.source, "import os");
        assert!(detail.assessment.is_some());
        assert_eq!(entry.risk.as_ref().unwrap().violation_count, assessment.violations().len());
    }

    #[test]
    fn test_out_of_order_completion_keeps_submission_order() {
        let recorder = AuditRecorder::new(false);
        let submission = CodeSubmission::new("bash", "true");

        let tickets: Vec<AuditTicket> = (0..5).map(|_| recorder.reserve()).collect();
        let ids: Vec<Uuid> = tickets.iter().map(|t| t.execution_id()).collect();

        for ticket in tickets.into_iter().rev() {
            recorder.record(ticket, &submission, None, &result());
        }

        let entries = recorder.entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries.iter().map(|e| e.execution_id).collect::<Vec<_>>(), ids);
        assert!(entries.iter().enumerate().all(|(i, e)| e.sequence == i as u64));
        assert_eq!(recorder.pending(), 0);
    }

    #[test]
    fn test_entries_wait_for_earlier_slots() {
        let recorder = AuditRecorder::new(false);
        let submission = CodeSubmission::new("bash", "true");

        let first = recorder.reserve();
        let second = recorder.reserve();
        recorder.record(second, &submission, None, &result());
        assert_eq!(recorder.len(), 0);
        assert_eq!(recorder.pending(), 1);

        recorder.record(first, &submission, None, &result());
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_dropped_ticket_does_not_stall_log() {
        let recorder = AuditRecorder::new(false);
        let submission = CodeSubmission::new("bash", "true");

        let abandoned = recorder.reserve();
        let kept = recorder.reserve();
        recorder.record(kept, &submission, None, &result());
        assert_eq!(recorder.len(), 0);

        drop(abandoned);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.entries()[0].sequence, 1);
    }

    #[test]
    fn test_jsonl_file_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");
        let recorder = AuditRecorder::with_file(false, &path);
        let submission = CodeSubmission::new("bash", "echo hi");

        for _ in 0..3 {
            recorder.record(recorder.reserve(), &submission, None, &result());
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: AuditEntry = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.sequence, 2);
        assert_eq!(parsed.session_id, recorder.session_id());
    }

    #[test]
    fn test_log_opened_at_construction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let recorder = AuditRecorder::with_file(false, &path);

        // Directory and file exist before the first entry
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        let submission = CodeSubmission::new("bash", "echo hi");
        recorder.record(recorder.reserve(), &submission, None, &result());
        recorder.record(recorder.reserve(), &submission, None, &result());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
        assert_eq!(recorder.write_failures(), 0);
    }

    #[test]
    fn test_write_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened for append
        let recorder = AuditRecorder::with_file(false, dir.path());
        let submission = CodeSubmission::new("bash", "true");

        recorder.record(recorder.reserve(), &submission, None, &result());

        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.write_failures(), 1);
    }

    #[test]
    fn test_recent() {
        let recorder = AuditRecorder::new(false);
        let submission = CodeSubmission::new("bash", "true");
        for _ in 0..4 {
            recorder.record(recorder.reserve(), &submission, None, &result());
        }
        let recent = recorder.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].sequence, 2);
        assert_eq!(recorder.recent(10).len(), 4);
    }
}
