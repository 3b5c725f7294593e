//! Audit Logging - Query Attempt Recording
//!
//! Every `validate_sql_query` and `execute_query` call produces exactly one
//! record. Records are appended as JSON lines and flushed before the gateway
//! answers the caller.
//!
//! # Log Format
//!
//! ```json
//! {"timestamp":"2026-01-21T10:30:00Z","correlationId":"...","operation":"execute","originalSql":"SELECT ...","sanitizedSql":"SELECT ... LIMIT 1000","outcome":"Pass","errorKind":null,"rowCount":58,"durationMs":12}
//! ```
//!
//! # Degraded mode
//!
//! If the file cannot be opened or written, records go to `tracing` at error
//! level instead and [`AuditLog::health`] reports `degraded`. Requests are
//! never failed because of the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlgate_security::ErrorKind;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{error, warn};

/// Which gateway operation produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Validate,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Pass,
    Fail,
}

/// One audit line. Never updated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub operation: Operation,
    pub original_sql: String,
    pub sanitized_sql: Option<String>,
    pub outcome: AuditOutcome,
    pub error_kind: Option<ErrorKind>,
    pub row_count: Option<u64>,
    pub duration_ms: u64,
}

impl AuditRecord {
    pub fn pass(
        correlation_id: &str,
        operation: Operation,
        original_sql: &str,
        sanitized_sql: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            operation,
            original_sql: original_sql.to_string(),
            sanitized_sql: Some(sanitized_sql.to_string()),
            outcome: AuditOutcome::Pass,
            error_kind: None,
            row_count: None,
            duration_ms: 0,
        }
    }

    pub fn fail(
        correlation_id: &str,
        operation: Operation,
        original_sql: &str,
        error_kind: ErrorKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            correlation_id: correlation_id.to_string(),
            operation,
            original_sql: original_sql.to_string(),
            sanitized_sql: None,
            outcome: AuditOutcome::Fail,
            error_kind: Some(error_kind),
            row_count: None,
            duration_ms: 0,
        }
    }

    pub fn with_sanitized_sql(mut self, sanitized_sql: &str) -> Self {
        self.sanitized_sql = Some(sanitized_sql.to_string());
        self
    }

    pub fn with_row_count(mut self, rows: u64) -> Self {
        self.row_count = Some(rows);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write audit record: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The record went to the tracing fallback instead of the file.
    #[error("Audit log is degraded; record emitted to the error log")]
    Degraded,
}

/// Audit log counters exposed on the health resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHealth {
    pub path: Option<String>,
    pub degraded: bool,
    pub records_written: u64,
    pub failed_writes: u64,
}

/// Append-only audit log.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    writer: Mutex<Option<BufWriter<File>>>,
    degraded: AtomicBool,
    records_written: AtomicU64,
    failed_writes: AtomicU64,
}

impl AuditLog {
    /// Open (or create) the log file in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        let file = open_append(&path).map_err(|source| AuditError::Open {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path: Some(path),
            writer: Mutex::new(Some(BufWriter::new(file))),
            degraded: AtomicBool::new(false),
            records_written: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
        })
    }

    /// Like [`AuditLog::open`], but starts in degraded mode instead of failing.
    pub fn open_or_degraded(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::open(&path) {
            Ok(log) => log,
            Err(e) => {
                error!(error = %e, kind = %ErrorKind::AuditWriteDegraded, "Audit log unavailable, falling back to error log");
                Self {
                    path: Some(path),
                    writer: Mutex::new(None),
                    degraded: AtomicBool::new(true),
                    records_written: AtomicU64::new(0),
                    failed_writes: AtomicU64::new(0),
                }
            }
        }
    }

    /// Append one record and flush it.
    ///
    /// On any failure the record is emitted through `tracing` instead and the
    /// log stays degraded from then on. The error is informational only.
    pub fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, correlation_id = %record.correlation_id, "Failed to serialize audit record");
                return Err(e.into());
            }
        };

        let mut guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let written = match guard.as_mut() {
            Some(writer) => writeln!(writer, "{}", line).and_then(|_| writer.flush()),
            None => return Err(self.fall_back(&line, None)),
        };

        match written {
            Ok(()) => {
                self.records_written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                *guard = None;
                warn!(error = %e, "Audit log write failed, switching to degraded mode");
                Err(self.fall_back(&line, Some(e)))
            }
        }
    }

    fn fall_back(&self, line: &str, cause: Option<std::io::Error>) -> AuditError {
        self.degraded.store(true, Ordering::Release);
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        error!(target: "sqlgate::audit", kind = %ErrorKind::AuditWriteDegraded, record = %line, "audit record");
        match cause {
            Some(e) => AuditError::Write(e),
            None => AuditError::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn health(&self) -> AuditHealth {
        AuditHealth {
            path: self.path.as_ref().map(|p| p.display().to_string()),
            degraded: self.is_degraded(),
            records_written: self.records_written.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
        }
    }

    /// Get the log file path
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}
