//! `sqlgate check-config`: load the config and report what would be served.
//!
//! With `--connect`, also opens the database and checks every allowed table,
//! so a policy naming a column the database lacks is caught before serving.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlgate::GatewayConfig;
use sqlgate_db::{ConnectionFactory, DuckDbFactory};
use sqlgate_mcp::table_view_sql;
use std::path::Path;

#[derive(Debug, Serialize)]
struct CheckReport {
    config: String,
    server: String,
    database: String,
    tables: usize,
    max_rows: u64,
    pool_max_connections: usize,
    query_timeout_ms: u64,
    audit_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    checks: Vec<TableCheck>,
}

#[derive(Debug, Serialize)]
struct TableCheck {
    table: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Returns whether every table check passed (always true without `--connect`).
pub fn run(config: &GatewayConfig, origin: &Path, connect: bool, json: bool) -> Result<bool> {
    let policy = config.build_policy()?;

    let mut report = CheckReport {
        config: origin.display().to_string(),
        server: config.server.name.clone(),
        database: config.engine.path.clone(),
        tables: policy.tables().count(),
        max_rows: policy.max_rows(),
        pool_max_connections: config.pool.max_connections,
        query_timeout_ms: config.execution.query_timeout_ms,
        audit_path: config.audit_path().display().to_string(),
        checks: Vec::new(),
    };

    if connect {
        let factory = DuckDbFactory::open(&config.engine)
            .with_context(|| format!("Failed to open database '{}'", config.engine.path))?;
        report.database = factory.description().to_string();

        let mut conn = factory.connect().context("Failed to connect to database")?;
        conn.ping().context("Database did not answer a ping")?;

        for table in policy.tables() {
            let check_sql = format!("{} LIMIT 0", table_view_sql(table));
            let outcome = conn.query(&check_sql);
            report.checks.push(TableCheck {
                table: table.name().to_string(),
                ok: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
    }

    let healthy = report.checks.iter().all(|check| check.ok);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(healthy);
    }

    println!("Config OK: {}", report.config);
    println!("  server:        {}", report.server);
    println!("  database:      {}", report.database);
    println!("  tables:        {}", report.tables);
    println!("  max rows:      {}", report.max_rows);
    println!("  pool max:      {}", report.pool_max_connections);
    println!("  query timeout: {}ms", report.query_timeout_ms);
    println!("  audit log:     {}", report.audit_path);

    if connect {
        println!();
        for check in &report.checks {
            match &check.error {
                None => println!("  [ok]   {}", check.table),
                Some(error) => println!("  [FAIL] {}: {}", check.table, error),
            }
        }
    }

    Ok(healthy)
}
