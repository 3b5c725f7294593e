//! Error types for the engine, pool and breaker.

use std::time::Duration;
use thiserror::Error;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Query was interrupted")]
    Interrupted,

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Errors from the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No slot freed up within the acquire timeout. Retryable.
    #[error("Timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// Every slot is in use and the caller asked not to wait. Retryable.
    #[error("Connection pool exhausted")]
    Exhausted,

    #[error("Connection pool is shut down")]
    Closed,

    #[error("Failed to open engine connection: {0}")]
    Connect(#[source] BackendError),

    /// Connection creation rejected by the circuit breaker.
    #[error("Circuit breaker is open, not opening new connections")]
    CircuitOpen,

    #[error("Query exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Query failed: {0}")]
    Execution(#[source] BackendError),

    /// The handle's connection was discarded by an earlier deadline or panic.
    #[error("Connection handle no longer holds a connection")]
    Discarded,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether the caller may retry later with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PoolError::Closed | PoolError::Discarded | PoolError::InvalidConfig(_)
        )
    }
}

/// Errors from [`crate::CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the dependency.
    #[error("Circuit breaker is open")]
    Open,

    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}
