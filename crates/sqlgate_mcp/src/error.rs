//! Gateway errors and their caller-facing payload.

use serde::Serialize;
use serde_json::Value;
use sqlgate_db::PoolError;
use sqlgate_security::{ErrorKind, Rejection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Query rejected: {}", .0.message)]
    Rejected(Rejection),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Rejected(rejection) => rejection.kind,
            GatewayError::Pool(e) => pool_error_kind(e),
            GatewayError::InvalidParams(_)
            | GatewayError::UnknownTool(_)
            | GatewayError::UnknownResource(_) => ErrorKind::InvalidParams,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Pool(e) => e.is_retryable() && self.kind().is_retryable(),
            _ => self.kind().is_retryable(),
        }
    }

    /// Message safe to show the caller. Engine messages never appear here;
    /// they are logged server-side under the correlation id.
    pub fn caller_message(&self) -> String {
        match self {
            GatewayError::Rejected(rejection) => rejection.message.clone(),
            GatewayError::Pool(e) => match e {
                PoolError::Timeout(waited) => format!(
                    "No database connection became available within {} ms",
                    waited.as_millis()
                ),
                PoolError::Exhausted => "All database connections are busy".to_string(),
                PoolError::Closed => "The gateway is shutting down".to_string(),
                PoolError::CircuitOpen => {
                    "The database is temporarily unavailable; retry later".to_string()
                }
                PoolError::DeadlineExceeded(deadline) => format!(
                    "Query exceeded its time limit of {} ms",
                    deadline.as_millis()
                ),
                PoolError::Connect(_)
                | PoolError::Execution(_)
                | PoolError::Discarded
                | PoolError::InvalidConfig(_) => {
                    "Query execution failed; see the server log for this correlation id"
                        .to_string()
                }
            },
            GatewayError::InvalidParams(detail) => format!("Invalid params: {}", detail),
            GatewayError::UnknownTool(name) => format!("Unknown tool: {}", name),
            GatewayError::UnknownResource(uri) => format!("Unknown resource: {}", uri),
        }
    }

    pub fn offending_token(&self) -> Option<&str> {
        match self {
            GatewayError::Rejected(rejection) => rejection.offending_token.as_deref(),
            _ => None,
        }
    }

    pub fn payload(&self, correlation_id: &str) -> ErrorPayload {
        ErrorPayload {
            error_kind: self.kind(),
            message: self.caller_message(),
            retryable: self.is_retryable(),
            offending_token: self.offending_token().map(str::to_string),
            correlation_id: correlation_id.to_string(),
        }
    }
}

fn pool_error_kind(error: &PoolError) -> ErrorKind {
    match error {
        PoolError::Timeout(_) => ErrorKind::PoolTimeout,
        PoolError::Exhausted | PoolError::Closed => ErrorKind::PoolExhausted,
        PoolError::CircuitOpen => ErrorKind::CircuitOpen,
        PoolError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
        PoolError::Connect(_)
        | PoolError::Execution(_)
        | PoolError::Discarded
        | PoolError::InvalidConfig(_) => ErrorKind::ExecutionError,
    }
}

/// `{ errorKind, message, retryable, correlationId }` as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_token: Option<String>,
    pub correlation_id: String,
}

impl ErrorPayload {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
