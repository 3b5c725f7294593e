//! Engine capability interface.
//!
//! The pool only ever talks to `dyn ConnectionFactory` and
//! `dyn EngineConnection`; DuckDB is one implementation, test fakes are others.

use crate::error::BackendError;
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;

/// Cancels whatever query the owning connection is running. Callable from any thread.
pub type InterruptFn = Arc<dyn Fn() + Send + Sync>;

/// Value type for result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

impl DbValue {
    /// JSON rendering used in query responses.
    ///
    /// Non-finite reals become `null`; blobs become lowercase hex strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            DbValue::Null => JsonValue::Null,
            DbValue::Integer(v) => JsonValue::from(*v),
            DbValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DbValue::Text(v) => JsonValue::String(v.clone()),
            DbValue::Blob(v) => JsonValue::String(hex::encode(v)),
            DbValue::Boolean(v) => JsonValue::Bool(*v),
            DbValue::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
        }
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// A materialized result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<DbValue>>,
}

impl QueryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<DbValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drop rows past `max`. Returns true if anything was dropped.
    pub fn truncate(&mut self, max: usize) -> bool {
        let truncated = self.rows.len() > max;
        self.rows.truncate(max);
        truncated
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_json_rows(&self) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                JsonValue::Object(object)
            })
            .collect()
    }
}

/// One live engine connection.
///
/// Calls block; the pool runs them on tokio's blocking thread pool.
pub trait EngineConnection: Send {
    fn query(&mut self, sql: &str) -> Result<QueryRows, BackendError>;

    /// Cheap liveness check used by the health check.
    fn ping(&mut self) -> Result<(), BackendError>;

    /// Handle that cancels an in-flight `query` from another thread, if supported.
    fn interrupter(&self) -> Option<InterruptFn>;
}

/// Opens engine connections for the pool.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn EngineConnection>, BackendError>;

    /// Engine name for logs.
    fn name(&self) -> &str;
}

impl fmt::Debug for dyn ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("engine", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_render_to_json() {
        assert_eq!(DbValue::Null.to_json(), JsonValue::Null);
        assert_eq!(DbValue::Integer(42).to_json(), json!(42));
        assert_eq!(DbValue::Real(1.5).to_json(), json!(1.5));
        assert_eq!(DbValue::Real(f64::NAN).to_json(), JsonValue::Null);
        assert_eq!(DbValue::from("ok").to_json(), json!("ok"));
        assert_eq!(DbValue::Blob(vec![0, 171, 255]).to_json(), json!("00abff"));
        assert_eq!(DbValue::from(None::<i64>), DbValue::Null);
    }

    #[test]
    fn test_rows_to_json_objects() {
        let rows = QueryRows::new(
            vec!["county_name".into(), "population".into()],
            vec![
                vec!["Alameda".into(), 1_682_353i64.into()],
                vec!["Kern".into(), DbValue::Null],
            ],
        );
        assert_eq!(
            rows.to_json_rows(),
            vec![
                json!({"county_name": "Alameda", "population": 1_682_353}),
                json!({"county_name": "Kern", "population": null}),
            ]
        );
    }

    #[test]
    fn test_truncate_reports_dropped_rows() {
        let mut rows = QueryRows::new(vec!["n".into()], (0..5).map(|i| vec![DbValue::Integer(i)]).collect());
        assert!(!rows.truncate(5));
        assert!(rows.truncate(3));
        assert_eq!(rows.len(), 3);
    }
}
