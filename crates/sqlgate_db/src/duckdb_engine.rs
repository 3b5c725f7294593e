//! DuckDB engine.
//!
//! One root connection is opened with the configured limits and every pooled
//! connection is a `try_clone` of it, so all of them share one database
//! instance (required for `:memory:`, cheap for files).

use crate::engine::{ConnectionFactory, DbValue, EngineConnection, InterruptFn, QueryRows};
use crate::error::BackendError;
use duckdb::types::TimeUnit;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug_span, info, warn};

pub const IN_MEMORY: &str = ":memory:";

/// `[engine]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Database file, or `:memory:`.
    pub path: String,
    /// Open the file read-only. Ignored for in-memory databases.
    pub read_only: bool,
    /// DuckDB `max_memory`, e.g. `"1GB"`.
    pub memory_limit: Option<String>,
    pub threads: Option<u32>,
    /// Script run once on the root connection after opening.
    pub init_sql: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: IN_MEMORY.to_string(),
            read_only: true,
            memory_limit: None,
            threads: None,
            init_sql: None,
        }
    }
}

impl EngineConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.is_empty() || self.path == IN_MEMORY
    }

    pub fn with_init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql = Some(sql.into());
        self
    }
}

/// Opens pooled DuckDB connections.
pub struct DuckDbFactory {
    root: Mutex<duckdb::Connection>,
    description: String,
}

impl DuckDbFactory {
    /// Open the database described by `config`.
    ///
    /// External access (file readers, `ATTACH`, extension downloads) is always
    /// disabled; the gateway only ever reads tables already in the database.
    pub fn open(config: &EngineConfig) -> Result<Self, BackendError> {
        use duckdb::{AccessMode, Config};

        let in_memory = config.is_in_memory();
        let mut flags = Config::default().enable_external_access(false)?;
        if config.read_only && !in_memory {
            flags = flags.access_mode(AccessMode::ReadOnly)?;
        }
        if let Some(limit) = &config.memory_limit {
            flags = flags.max_memory(limit)?;
        }
        if let Some(threads) = config.threads {
            if threads == 0 {
                return Err(BackendError::InvalidConfig(
                    "threads must be at least 1".to_string(),
                ));
            }
            flags = flags.threads(i64::from(threads))?;
        }

        let root = if in_memory {
            duckdb::Connection::open_in_memory_with_flags(flags)?
        } else {
            duckdb::Connection::open_with_flags(&config.path, flags)?
        };

        if let Some(init_sql) = &config.init_sql {
            let span = debug_span!("db.init", sql_hash = %hash_sql(init_sql));
            let _guard = span.enter();
            root.execute_batch(init_sql)?;
        }

        let description = if in_memory {
            "in-memory".to_string()
        } else if config.read_only {
            format!("{} (read-only)", config.path)
        } else {
            config.path.clone()
        };
        info!("Opened DuckDB database: {}", description);

        Ok(Self {
            root: Mutex::new(root),
            description,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl ConnectionFactory for DuckDbFactory {
    fn connect(&self) -> Result<Box<dyn EngineConnection>, BackendError> {
        let root = self
            .root
            .lock()
            .map_err(|_| BackendError::Database("DuckDB root connection lock poisoned".into()))?;
        let conn = root.try_clone()?;
        Ok(Box::new(DuckDbConnection { conn }))
    }

    fn name(&self) -> &str {
        "duckdb"
    }
}

/// A pooled DuckDB connection.
pub struct DuckDbConnection {
    conn: duckdb::Connection,
}

impl EngineConnection for DuckDbConnection {
    fn query(&mut self, sql: &str) -> Result<QueryRows, BackendError> {
        let span = debug_span!(
            "db.query",
            op = sql_op_name(sql),
            sql_hash = %hash_sql(sql),
            rows = tracing::field::Empty,
            duration_ms = tracing::field::Empty
        );
        let _guard = span.enter();
        let start = Instant::now();

        let result = query_rows(&self.conn, sql).map_err(map_query_error);

        if let Ok(rows) = &result {
            span.record("rows", rows.len());
        }
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        result
    }

    fn ping(&mut self) -> Result<(), BackendError> {
        let one: i64 = self.conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one != 1 {
            return Err(BackendError::Database(format!(
                "Health ping returned {}",
                one
            )));
        }
        Ok(())
    }

    fn interrupter(&self) -> Option<InterruptFn> {
        let handle = self.conn.interrupt_handle();
        Some(Arc::new(move || handle.interrupt()))
    }
}

fn query_rows(conn: &duckdb::Connection, sql: &str) -> Result<QueryRows, duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows_iter = stmt.query([])?;

    let (column_count, columns) = if let Some(stmt_ref) = rows_iter.as_ref() {
        let count = stmt_ref.column_count();
        let cols: Vec<String> = (0..count)
            .map(|i| {
                stmt_ref
                    .column_name(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| format!("col{}", i))
            })
            .collect();
        (count, cols)
    } else {
        return Ok(QueryRows::default());
    };

    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(duckdb_value_to_db_value(row, i)?);
        }
        rows.push(values);
    }

    Ok(QueryRows::new(columns, rows))
}

fn map_query_error(err: duckdb::Error) -> BackendError {
    if err.to_string().contains("Interrupted") {
        BackendError::Interrupted
    } else {
        BackendError::Query(err.to_string())
    }
}

/// `None` when the value does not fit in `i64` microseconds.
fn to_micros(unit: TimeUnit, v: i64) -> Option<i64> {
    match unit {
        TimeUnit::Second => v.checked_mul(1_000_000),
        TimeUnit::Millisecond => v.checked_mul(1_000),
        TimeUnit::Microsecond => Some(v),
        TimeUnit::Nanosecond => Some(v / 1_000),
    }
}

fn time_of_day(micros: i64) -> Option<chrono::NaiveTime> {
    let secs = u32::try_from(micros / 1_000_000).ok()?;
    let nanos = u32::try_from((micros % 1_000_000) * 1_000).ok()?;
    chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

fn duckdb_value_to_db_value(row: &duckdb::Row, index: usize) -> Result<DbValue, duckdb::Error> {
    use duckdb::types::ValueRef;

    match row.get_ref(index)? {
        ValueRef::Null => Ok(DbValue::Null),
        ValueRef::Boolean(v) => Ok(DbValue::Boolean(v)),
        ValueRef::TinyInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::SmallInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::Int(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::BigInt(v) => Ok(DbValue::Integer(v)),
        ValueRef::HugeInt(v) => Ok(i64::try_from(v)
            .map(DbValue::Integer)
            .unwrap_or(DbValue::Real(v as f64))),
        ValueRef::UTinyInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::USmallInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::UInt(v) => Ok(DbValue::Integer(v as i64)),
        ValueRef::UBigInt(v) => Ok(i64::try_from(v)
            .map(DbValue::Integer)
            .unwrap_or(DbValue::Real(v as f64))),
        ValueRef::Float(v) => Ok(DbValue::Real(v as f64)),
        ValueRef::Double(v) => Ok(DbValue::Real(v)),
        ValueRef::Decimal(v) => Ok(v
            .to_string()
            .parse::<f64>()
            .map(DbValue::Real)
            .unwrap_or_else(|_| DbValue::Text(v.to_string()))),
        ValueRef::Text(v) => Ok(DbValue::Text(String::from_utf8_lossy(v).to_string())),
        ValueRef::Blob(v) => Ok(DbValue::Blob(v.to_vec())),
        ValueRef::Timestamp(unit, v) => {
            match to_micros(unit, v).and_then(chrono::DateTime::from_timestamp_micros) {
                Some(dt) => Ok(DbValue::Timestamp(dt)),
                None => Ok(DbValue::Integer(v)),
            }
        }
        ValueRef::Date32(days) => {
            let date = days
                .checked_add(719163)
                .and_then(chrono::NaiveDate::from_num_days_from_ce_opt);
            if let Some(date) = date {
                Ok(DbValue::Text(date.format("%Y-%m-%d").to_string()))
            } else {
                Ok(DbValue::Integer(days as i64))
            }
        }
        ValueRef::Time64(unit, v) => match to_micros(unit, v).and_then(time_of_day) {
            Some(time) => Ok(DbValue::Text(time.format("%H:%M:%S%.6f").to_string())),
            None => Ok(DbValue::Integer(v)),
        },
        ValueRef::Interval {
            months,
            days,
            nanos,
        } => Ok(DbValue::Text(format!("P{}M{}DT{}N", months, days, nanos))),
        other => {
            warn!(
                "DuckDB type {:?} at column {} mapped to debug string",
                std::mem::discriminant(&other),
                index
            );
            Ok(DbValue::Text(format!("{:?}", other)))
        }
    }
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

/// First 8 bytes of the SHA-256 digest, hex encoded, so spans identify
/// statements without logging them.
pub fn hash_sql(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
