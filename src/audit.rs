//! Append-only, hash-chained audit trail.
//!
//! Every invocation attempt produces exactly one [`AuditRecord`]. Records
//! are chained: each carries the hash of its predecessor and a hash over its
//! own body, so editing, removing or reordering a line breaks
//! [`AuditLog::verify`]. The log exposes no way to update or delete a
//! record.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, GatewayError, Result};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
const RESULT_DIGEST_LEN: usize = 16;

/// Outcome class recorded for each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    ValidationRejected,
    ExecutionError,
    Timeout,
    ResourceExceeded,
    RateLimited,
    PermissionDenied,
    LoadError,
    InternalError,
}

impl OutcomeClass {
    /// Classify an envelope's error kind (`None` for success).
    pub fn from_error_kind(kind: Option<ErrorKind>) -> Self {
        match kind {
            None => OutcomeClass::Success,
            Some(
                ErrorKind::ValidationError
                | ErrorKind::FunctionNotFound
                | ErrorKind::PathEscape
                | ErrorKind::NotFound,
            ) => OutcomeClass::ValidationRejected,
            Some(ErrorKind::ExecutionError) => OutcomeClass::ExecutionError,
            Some(ErrorKind::TimeoutError) => OutcomeClass::Timeout,
            Some(ErrorKind::ResourceExceeded) => OutcomeClass::ResourceExceeded,
            Some(ErrorKind::RateLimitExceeded) => OutcomeClass::RateLimited,
            Some(ErrorKind::PermissionDenied) => OutcomeClass::PermissionDenied,
            Some(ErrorKind::LoadError) => OutcomeClass::LoadError,
            Some(ErrorKind::ConfigError | ErrorKind::InternalError) => OutcomeClass::InternalError,
        }
    }
}

/// What the router knows about an attempt when it is audited.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub operation: String,
    pub identity: String,
    pub call_hash: String,
    pub outcome: OutcomeClass,
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: u64,
    /// Truncated digest of the filtered result, for successful calls.
    pub result_digest: Option<String>,
}

/// One persisted line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub execution_id: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub identity: String,
    pub call_hash: String,
    pub outcome: OutcomeClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_digest: Option<String>,
    pub prev_hash: String,
    pub record_hash: String,
}

/// Everything except `record_hash`, in a fixed field order.
#[derive(Serialize)]
struct RecordBody<'a> {
    execution_id: u64,
    timestamp: &'a DateTime<Utc>,
    operation: &'a str,
    identity: &'a str,
    call_hash: &'a str,
    outcome: OutcomeClass,
    error_kind: Option<ErrorKind>,
    elapsed_ms: u64,
    result_digest: Option<&'a str>,
}

impl AuditRecord {
    fn compute_hash(&self) -> String {
        let body = RecordBody {
            execution_id: self.execution_id,
            timestamp: &self.timestamp,
            operation: &self.operation,
            identity: &self.identity,
            call_hash: &self.call_hash,
            outcome: self.outcome,
            error_kind: self.error_kind,
            elapsed_ms: self.elapsed_ms,
            result_digest: self.result_digest.as_deref(),
        };
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        // Serializing a struct of plain fields cannot fail.
        hasher.update(serde_json::to_vec(&body).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}

/// Hash identifying a call: module path, function and a parameter
/// fingerprint. Parameter values are not stored.
pub fn call_hash(module_path: &str, function: &str, params: &Map<String, Value>) -> String {
    let mut param_hasher = Sha256::new();
    param_hasher.update(Value::Object(params.clone()).to_string().as_bytes());
    let param_fingerprint = hex::encode(param_hasher.finalize());

    let mut hasher = Sha256::new();
    hasher.update(module_path.as_bytes());
    hasher.update([0]);
    hasher.update(function.as_bytes());
    hasher.update([0]);
    hasher.update(param_fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Truncated SHA-256 of a filtered result.
pub fn result_digest(value: &Value) -> String {
    let digest = hex::encode(Sha256::digest(value.to_string().as_bytes()));
    digest[..RESULT_DIGEST_LEN].to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines file; the log is kept in memory when unset.
    pub path: Option<PathBuf>,
    /// Flush every record to stable storage before returning.
    pub fsync: bool,
}

/// Append-mode storage under a file-backed log.
trait LogFile: Write + Send + std::fmt::Debug {
    fn committed_len(&self) -> io::Result<u64>;
    fn truncate(&self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl LogFile for File {
    fn committed_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug)]
enum Sink {
    Memory(Vec<AuditRecord>),
    File {
        file: Box<dyn LogFile>,
        path: PathBuf,
        fsync: bool,
    },
}

#[derive(Debug)]
struct Chain {
    sink: Sink,
    next_id: u64,
    last_hash: String,
    len: usize,
    /// Set when a failed write could not be rolled back. The file may end
    /// in a partial line, so nothing more is appended.
    poisoned: bool,
}

/// The audit trail. The only writer of its store.
#[derive(Debug)]
pub struct AuditLog {
    chain: Mutex<Chain>,
}

impl AuditLog {
    /// A log that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self::resume(Sink::Memory(Vec::new()), &[])
    }

    /// Open or create a JSON-lines log at `path`.
    ///
    /// An existing log is verified first; ids and the hash chain resume
    /// from its last record. A broken chain refuses to open.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let existing = if path.exists() {
            read_records(&path)?
        } else {
            Vec::new()
        };
        verify_chain(&existing)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), records = existing.len(), "audit log opened");

        let sink = Sink::File {
            file: Box::new(file),
            path,
            fsync,
        };
        Ok(Self::resume(sink, &existing))
    }

    /// A file log when `path` is set. Without one the trail does not
    /// survive a restart, which is logged as a warning.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path, config.fsync),
            None => {
                tracing::warn!("no audit.path configured; audit records are kept in memory only");
                Ok(Self::in_memory())
            }
        }
    }

    fn resume(sink: Sink, existing: &[AuditRecord]) -> Self {
        let (next_id, last_hash) = match existing.last() {
            Some(last) => (last.execution_id + 1, last.record_hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };
        Self {
            chain: Mutex::new(Chain {
                sink,
                next_id,
                last_hash,
                len: existing.len(),
                poisoned: false,
            }),
        }
    }

    /// Whether records outlive this value.
    pub fn is_durable(&self) -> bool {
        matches!(self.chain.lock().sink, Sink::File { .. })
    }

    /// Append one record and return it with its id and hashes filled in.
    ///
    /// A failed write leaves neither a partial line nor a spent id: the file
    /// is cut back to its previous length and the next append reuses the id.
    pub fn append(&self, event: AuditEvent) -> Result<AuditRecord> {
        let mut guard = self.chain.lock();
        let chain = &mut *guard;
        if chain.poisoned {
            return Err(GatewayError::Audit(
                "log refuses appends after an unrecovered write failure".into(),
            ));
        }
        let mut record = AuditRecord {
            execution_id: chain.next_id,
            timestamp: Utc::now(),
            operation: event.operation,
            identity: event.identity,
            call_hash: event.call_hash,
            outcome: event.outcome,
            error_kind: event.error_kind,
            elapsed_ms: event.elapsed_ms,
            result_digest: event.result_digest,
            prev_hash: chain.last_hash.clone(),
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash();

        match &mut chain.sink {
            Sink::Memory(records) => records.push(record.clone()),
            Sink::File { file, fsync, .. } => {
                let mut line = serde_json::to_vec(&record)
                    .map_err(|e| GatewayError::Audit(format!("failed to encode record: {e}")))?;
                line.push(b'\n');
                let start = file
                    .committed_len()
                    .map_err(|e| GatewayError::Audit(format!("failed to stat log: {e}")))?;
                if let Err(e) = write_line(&mut **file, &line, *fsync) {
                    match file.truncate(start) {
                        Ok(()) => tracing::warn!(error = %e, "audit write rolled back"),
                        Err(undo) => {
                            chain.poisoned = true;
                            tracing::error!(error = %e, rollback = %undo, "audit log poisoned");
                        }
                    }
                    return Err(GatewayError::Audit(format!("failed to write record: {e}")));
                }
            }
        }

        chain.next_id += 1;
        chain.last_hash = record.record_hash.clone();
        chain.len += 1;
        Ok(record)
    }

    /// Number of records in the log.
    pub fn len(&self) -> usize {
        self.chain.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, oldest first.
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        let chain = self.chain.lock();
        match &chain.sink {
            Sink::Memory(records) => Ok(records.clone()),
            Sink::File { path, .. } => read_records(path),
        }
    }

    /// Walk the chain. Returns the number of records verified.
    pub fn verify(&self) -> Result<usize> {
        let records = self.records()?;
        verify_chain(&records)?;
        Ok(records.len())
    }
}

fn write_line(file: &mut dyn LogFile, line: &[u8], fsync: bool) -> io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    if fsync {
        file.sync()?;
    }
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .map_err(|e| GatewayError::Audit(format!("line {} is not a record: {e}", n + 1)))?;
        records.push(record);
    }
    Ok(records)
}

fn verify_chain(records: &[AuditRecord]) -> Result<()> {
    let mut prev = GENESIS_HASH;
    let mut prev_id = 0;
    for record in records {
        if record.prev_hash != prev || record.execution_id <= prev_id {
            return Err(GatewayError::Audit(format!(
                "chain broken before execution id {}",
                record.execution_id
            )));
        }
        if record.compute_hash() != record.record_hash {
            return Err(GatewayError::Audit(format!(
                "record {} does not match its hash",
                record.execution_id
            )));
        }
        prev = &record.record_hash;
        prev_id = record.execution_id;
    }
    Ok(())
}
