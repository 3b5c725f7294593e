//! Gateway - validate, execute, audit
//!
//! The one place where the validator, the connection pool and the audit log
//! meet. Each request carries a [`RequestContext`]; every validate/execute
//! call writes exactly one audit record before returning, whatever the
//! outcome.
//!
//! ```text
//! caller -> validate -> (reject fast) -> acquire -> execute(deadline) -> release -> audit -> caller
//! ```

use crate::audit::{AuditHealth, AuditLog, AuditRecord, Operation};
use crate::budget::OutputBudget;
use crate::error::GatewayError;
use crate::protocol::ResourceDefinition;
use serde::Serialize;
use serde_json::Value;
use sqlgate_db::{
    hash_sql, BreakerConfig, CircuitBreaker, ConnectionFactory, ConnectionPool, PoolConfig,
    PoolError, PoolStats, QueryRows,
};
use sqlgate_security::{
    validate, ErrorKind, SecurityPolicy, StatementKind, TableRule, ValidationOutcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const SCHEMA_URI: &str = "sqlgate://schema";
pub const HEALTH_URI: &str = "sqlgate://health";
pub const TABLE_URI_PREFIX: &str = "sqlgate://tables/";

const JSON_MIME: &str = "application/json";

/// Per-request limits.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub max_response_bytes: usize,
    /// Deadline for one engine call.
    pub query_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_response_bytes: 1024 * 1024, // 1MB
            query_timeout: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(1),
        }
    }
}

/// Correlation id for one request, echoed in every result and audit line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    correlation_id: String,
}

impl RequestContext {
    /// Use the caller's id, or generate a UUID v4.
    pub fn new(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id: correlation_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn generated() -> Self {
        Self::new(None)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Allowed tables and columns as the caller may use them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InformationSchema {
    pub tables: BTreeMap<String, TableSchema>,
    pub max_rows: u64,
    pub allowed_statements: Vec<StatementKind>,
}

impl InformationSchema {
    pub fn from_policy(policy: &SecurityPolicy) -> Self {
        let tables = policy
            .tables()
            .map(|rule| {
                (
                    rule.name().to_string(),
                    TableSchema {
                        columns: rule.columns().to_vec(),
                        description: rule.description().map(str::to_string),
                    },
                )
            })
            .collect();

        Self {
            tables,
            max_rows: policy.max_rows(),
            allowed_statements: policy.allowed_statements().collect(),
        }
    }
}

/// `validate_sql_query` result. A rejection is a normal result here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_token: Option<String>,
    pub correlation_id: String,
}

/// `execute_query` success result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    pub row_count: usize,
    /// Rows were dropped to fit `max_rows` or the response byte budget.
    pub truncated: bool,
    pub duration_ms: u64,
    pub sanitized_sql: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealth {
    pub name: String,
    pub state: &'static str,
    pub is_open: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, `degraded` or `shutting_down`.
    pub status: &'static str,
    pub pool: PoolStats,
    pub breaker: BreakerHealth,
    pub audit: AuditHealth,
}

/// Owns every collaborator a request needs. No globals.
pub struct Gateway {
    policy: Arc<SecurityPolicy>,
    pool: ConnectionPool,
    breaker: Arc<CircuitBreaker>,
    audit: AuditLog,
    settings: GatewaySettings,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("pool", &self.pool)
            .field("breaker", &self.breaker.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Gateway {
    pub fn new(
        policy: Arc<SecurityPolicy>,
        pool: ConnectionPool,
        breaker: Arc<CircuitBreaker>,
        audit: AuditLog,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            policy,
            pool,
            breaker,
            audit,
            settings,
        }
    }

    /// Build the breaker, start the pool behind it and assemble the gateway.
    pub async fn start(
        policy: Arc<SecurityPolicy>,
        factory: Arc<dyn ConnectionFactory>,
        pool_config: PoolConfig,
        breaker_config: BreakerConfig,
        audit: AuditLog,
        settings: GatewaySettings,
    ) -> Result<Self, PoolError> {
        let breaker = Arc::new(CircuitBreaker::new(factory.name().to_string(), breaker_config));
        let pool = ConnectionPool::start(factory, pool_config, Some(breaker.clone())).await?;
        Ok(Self::new(policy, pool, breaker, audit, settings))
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn information_schema(&self) -> InformationSchema {
        InformationSchema::from_policy(&self.policy)
    }

    /// Validate without executing. Audited.
    pub fn validate_sql_query(&self, ctx: &RequestContext, sql: &str) -> ValidationReport {
        let started = Instant::now();
        let outcome = validate(sql, &self.policy);

        let record = match &outcome {
            ValidationOutcome::Valid { sanitized_sql } => AuditRecord::pass(
                ctx.correlation_id(),
                Operation::Validate,
                sql,
                sanitized_sql,
            ),
            ValidationOutcome::Invalid(rejection) => AuditRecord::fail(
                ctx.correlation_id(),
                Operation::Validate,
                sql,
                rejection.kind,
            ),
        };
        self.write_audit(record.with_duration_ms(elapsed_ms(started)));

        let correlation_id = ctx.correlation_id().to_string();
        match outcome {
            ValidationOutcome::Valid { sanitized_sql } => ValidationReport {
                valid: true,
                sanitized_sql: Some(sanitized_sql),
                error_kind: None,
                message: None,
                offending_token: None,
                correlation_id,
            },
            ValidationOutcome::Invalid(rejection) => ValidationReport {
                valid: false,
                sanitized_sql: None,
                error_kind: Some(rejection.kind),
                message: Some(rejection.message),
                offending_token: rejection.offending_token,
                correlation_id,
            },
        }
    }

    /// Validate, then run the sanitized statement on a pooled connection.
    ///
    /// A rejected query never touches the pool. The connection is released
    /// on every path, including deadline expiry. A call abandoned by its
    /// caller mid-query is still audited, as an `ExecutionError` failure.
    pub async fn execute_query(
        &self,
        ctx: &RequestContext,
        sql: &str,
    ) -> Result<QueryResult, GatewayError> {
        let started = Instant::now();

        let sanitized_sql = match validate(sql, &self.policy) {
            ValidationOutcome::Valid { sanitized_sql } => sanitized_sql,
            ValidationOutcome::Invalid(rejection) => {
                self.write_audit(
                    AuditRecord::fail(ctx.correlation_id(), Operation::Execute, sql, rejection.kind)
                        .with_duration_ms(elapsed_ms(started)),
                );
                return Err(GatewayError::Rejected(rejection));
            }
        };

        let pending = PendingAudit {
            gateway: self,
            correlation_id: ctx.correlation_id(),
            original_sql: sql,
            sanitized_sql: &sanitized_sql,
            started,
            settled: false,
        };

        let span = info_span!(
            "gateway.execute",
            correlation_id = %ctx.correlation_id(),
            sql_hash = %hash_sql(&sanitized_sql),
        );
        let executed = self.run_query(&sanitized_sql).instrument(span).await;
        let duration_ms = elapsed_ms(started);
        pending.settle();

        match executed {
            Ok(rows) => {
                let result = self.shape_result(ctx, rows, sanitized_sql, duration_ms);
                self.write_audit(
                    AuditRecord::pass(
                        ctx.correlation_id(),
                        Operation::Execute,
                        sql,
                        &result.sanitized_sql,
                    )
                    .with_row_count(result.row_count as u64)
                    .with_duration_ms(duration_ms),
                );
                debug!(
                    correlation_id = %ctx.correlation_id(),
                    rows = result.row_count,
                    duration_ms,
                    "Query executed"
                );
                Ok(result)
            }
            Err(e) => {
                let err = GatewayError::Pool(e);
                match err.kind() {
                    // The raw engine message stays in the server log.
                    ErrorKind::ExecutionError => error!(
                        correlation_id = %ctx.correlation_id(),
                        error = %err,
                        "Query execution failed"
                    ),
                    kind => warn!(
                        correlation_id = %ctx.correlation_id(),
                        kind = %kind,
                        error = %err,
                        "Query not executed"
                    ),
                }
                self.write_audit(
                    AuditRecord::fail(ctx.correlation_id(), Operation::Execute, sql, err.kind())
                        .with_sanitized_sql(&sanitized_sql)
                        .with_duration_ms(duration_ms),
                );
                Err(err)
            }
        }
    }

    /// Record a validate/execute call whose arguments could not be decoded.
    pub fn reject_params(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        detail: impl Into<String>,
    ) -> GatewayError {
        self.write_audit(AuditRecord::fail(
            ctx.correlation_id(),
            operation,
            "",
            ErrorKind::InvalidParams,
        ));
        GatewayError::InvalidParams(detail.into())
    }

    pub fn health(&self) -> HealthReport {
        let pool = self.pool.stats();
        let audit = self.audit.health();
        let breaker_open = self.breaker.is_open();

        let status = if pool.closed {
            "shutting_down"
        } else if breaker_open || audit.degraded {
            "degraded"
        } else {
            "ok"
        };

        HealthReport {
            status,
            pool,
            breaker: BreakerHealth {
                name: self.breaker.name().to_string(),
                state: self.breaker.state().label(),
                is_open: breaker_open,
            },
            audit,
        }
    }

    /// Resources for resources/list: schema, health, then one per table.
    pub fn resource_definitions(&self) -> Vec<ResourceDefinition> {
        let mut resources = vec![
            ResourceDefinition {
                uri: SCHEMA_URI.to_string(),
                name: "schema".to_string(),
                description: Some("Tables and columns queries may reference".to_string()),
                mime_type: JSON_MIME.to_string(),
            },
            ResourceDefinition {
                uri: HEALTH_URI.to_string(),
                name: "health".to_string(),
                description: Some("Pool, circuit breaker and audit log status".to_string()),
                mime_type: JSON_MIME.to_string(),
            },
        ];

        resources.extend(self.policy.tables().map(|rule| ResourceDefinition {
            uri: format!("{}{}", TABLE_URI_PREFIX, rule.name()),
            name: rule.name().to_string(),
            description: rule.description().map(str::to_string),
            mime_type: JSON_MIME.to_string(),
        }));
        resources
    }

    /// Read a resource. Table views go through the normal execute path.
    pub async fn read_resource(
        &self,
        ctx: &RequestContext,
        uri: &str,
    ) -> Result<Value, GatewayError> {
        if uri == SCHEMA_URI {
            return Ok(to_json(&self.information_schema()));
        }
        if uri == HEALTH_URI {
            return Ok(to_json(&self.health()));
        }

        let table = uri
            .strip_prefix(TABLE_URI_PREFIX)
            .and_then(|name| self.policy.table(name))
            .ok_or_else(|| GatewayError::UnknownResource(uri.to_string()))?;

        let result = self.execute_query(ctx, &table_view_sql(table)).await?;
        Ok(to_json(&result))
    }

    /// Stop accepting queries and drain the pool.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.pool.shutdown(self.pool.config().drain_timeout()).await;
    }

    async fn run_query(&self, sql: &str) -> Result<QueryRows, PoolError> {
        let mut handle = self.pool.acquire(self.settings.acquire_timeout).await?;
        let rows = handle.execute(sql, self.settings.query_timeout).await;
        handle.release();
        rows
    }

    fn shape_result(
        &self,
        ctx: &RequestContext,
        mut rows: QueryRows,
        sanitized_sql: String,
        duration_ms: u64,
    ) -> QueryResult {
        let max_rows = usize::try_from(self.policy.max_rows()).unwrap_or(usize::MAX);
        let capped = rows.truncate(max_rows);

        let budget = OutputBudget::new(self.settings.max_response_bytes, max_rows);
        let (json_rows, trimmed) = budget.enforce_rows(rows.to_json_rows());
        if trimmed {
            warn!(
                correlation_id = %ctx.correlation_id(),
                kept = json_rows.len(),
                max_bytes = budget.max_bytes(),
                "Response rows trimmed to fit output budget"
            );
        }

        QueryResult {
            row_count: json_rows.len(),
            columns: rows.columns,
            rows: json_rows,
            truncated: capped || trimmed,
            duration_ms,
            sanitized_sql,
            correlation_id: ctx.correlation_id().to_string(),
        }
    }

    fn write_audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(&record) {
            debug!(
                correlation_id = %record.correlation_id,
                kind = %ErrorKind::AuditWriteDegraded,
                error = %e,
                "Audit record not persisted"
            );
        }
    }
}

/// Audit record owed by an execute call that has passed validation.
///
/// If the caller's future is dropped before the engine answers, nothing
/// else writes the record, so `Drop` writes a failure in its place.
struct PendingAudit<'a> {
    gateway: &'a Gateway,
    correlation_id: &'a str,
    original_sql: &'a str,
    sanitized_sql: &'a str,
    started: Instant,
    settled: bool,
}

impl PendingAudit<'_> {
    /// The caller writes the record itself from here on.
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingAudit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(
            correlation_id = %self.correlation_id,
            "Execute call dropped before the query finished"
        );
        self.gateway.write_audit(
            AuditRecord::fail(
                self.correlation_id,
                Operation::Execute,
                self.original_sql,
                ErrorKind::ExecutionError,
            )
            .with_sanitized_sql(self.sanitized_sql)
            .with_duration_ms(elapsed_ms(self.started)),
        );
    }
}

/// `SELECT <allowed columns> FROM <table>`, identifiers quoted.
pub fn table_view_sql(table: &TableRule) -> String {
    let projection = if table.allows_all_columns() || table.columns().is_empty() {
        "*".to_string()
    } else {
        table
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("SELECT {} FROM {}", projection, quote_ident(table.name()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
