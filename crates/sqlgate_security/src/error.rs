//! Error taxonomy shared by every SQLGate layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Every way a request can fail, as reported to callers and the audit log.
///
/// Validation kinds are terminal: they are never retried and no database work
/// happens. Infrastructure kinds are retryable signals for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseError,
    Empty,
    MultiStatement,
    StatementNotAllowed,
    TableNotAllowed,
    ColumnNotAllowed,
    DangerousPattern,
    PoolTimeout,
    PoolExhausted,
    ExecutionError,
    DeadlineExceeded,
    CircuitOpen,
    AuditWriteDegraded,
    InvalidParams,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "ParseError",
            ErrorKind::Empty => "Empty",
            ErrorKind::MultiStatement => "MultiStatement",
            ErrorKind::StatementNotAllowed => "StatementNotAllowed",
            ErrorKind::TableNotAllowed => "TableNotAllowed",
            ErrorKind::ColumnNotAllowed => "ColumnNotAllowed",
            ErrorKind::DangerousPattern => "DangerousPattern",
            ErrorKind::PoolTimeout => "PoolTimeout",
            ErrorKind::PoolExhausted => "PoolExhausted",
            ErrorKind::ExecutionError => "ExecutionError",
            ErrorKind::DeadlineExceeded => "DeadlineExceeded",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::AuditWriteDegraded => "AuditWriteDegraded",
            ErrorKind::InvalidParams => "InvalidParams",
        }
    }

    /// Produced by the validator (or request decoding) before any database access.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorKind::ParseError
                | ErrorKind::Empty
                | ErrorKind::MultiStatement
                | ErrorKind::StatementNotAllowed
                | ErrorKind::TableNotAllowed
                | ErrorKind::ColumnNotAllowed
                | ErrorKind::DangerousPattern
                | ErrorKind::InvalidParams
        )
    }

    /// Whether a caller may retry the same request later (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PoolTimeout
                | ErrorKind::PoolExhausted
                | ErrorKind::ExecutionError
                | ErrorKind::DeadlineExceeded
                | ErrorKind::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while building a [`crate::SecurityPolicy`].
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("max_rows must be at least 1")]
    ZeroMaxRows,

    #[error("Invalid forbidden pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Table '{0}' is declared more than once (names are case-insensitive)")]
    DuplicateTable(String),

    #[error("Table '{0}' has an empty name or column list")]
    EmptyTable(String),

    #[error("allowed_statements must contain at least one statement kind")]
    NoStatementKinds,
}
