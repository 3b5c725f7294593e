//! `sqlgate serve`: the stdio JSON-RPC gateway.

use anyhow::{Context, Result};
use sqlgate::GatewayConfig;
use sqlgate_db::DuckDbFactory;
use sqlgate_mcp::{AuditLog, Gateway, McpServer};
use std::sync::Arc;
use tracing::{info, warn};

/// Serve until stdin closes, then drain the pool.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let policy = Arc::new(config.build_policy()?);

    let factory = DuckDbFactory::open(&config.engine)
        .with_context(|| format!("Failed to open database '{}'", config.engine.path))?;
    let database = factory.description().to_string();

    let audit_path = config.audit_path();
    let audit = AuditLog::open_or_degraded(&audit_path);
    if audit.is_degraded() {
        warn!(
            "Audit log {} unavailable; records go to the error log",
            audit_path.display()
        );
    }

    let gateway = Gateway::start(
        policy,
        Arc::new(factory),
        config.pool.clone(),
        config.breaker.clone(),
        audit,
        config.gateway_settings(),
    )
    .await
    .context("Failed to start connection pool")?;
    let gateway = Arc::new(gateway);

    info!(
        "SQLGate serving {} ({} tables allowed, max_rows={}, pool max={})",
        database,
        gateway.policy().tables().count(),
        gateway.policy().max_rows(),
        config.pool.max_connections
    );

    let server = Arc::new(McpServer::new(Arc::clone(&gateway), config.server_config()));
    let served = server.run_stdio().await;

    gateway.shutdown().await;
    served
}
