//! MCP-style gateway for SQLGate
//!
//! Exposes validated, bounded, audited SQL execution to an upstream caller
//! (typically an LLM turning questions into SQL) over JSON-RPC 2.0.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Caller (LLM backend / MCP client)                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               │ JSON-RPC over stdio
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Server   │ request framing, one task per request, one writer   │
//! │  Tools    │ get_information_schema, validate_sql_query,         │
//! │           │ execute_query                                       │
//! │  Gateway  │ validator -> pool -> audit, resources               │
//! │  Audit    │ append-only JSON lines, degraded fallback           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! 1. **Reject before touching the database:** a query that fails
//!    validation never acquires a connection.
//!
//! 2. **Every attempt is audited:** exactly one record per validate or
//!    execute call, whatever the outcome.
//!
//! 3. **No raw engine errors leave the process:** callers get an error kind,
//!    a safe message, a retryable flag and the correlation id.

pub mod audit;
mod budget;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod server;
pub mod tools;

// Re-exports for convenience
pub use audit::{AuditError, AuditHealth, AuditLog, AuditOutcome, AuditRecord, Operation};
pub use budget::OutputBudget;
pub use error::{ErrorPayload, GatewayError};
pub use gateway::{
    Gateway, GatewaySettings, HealthReport, InformationSchema, QueryResult, RequestContext,
    ValidationReport, table_view_sql, HEALTH_URI, SCHEMA_URI, TABLE_URI_PREFIX,
};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId};
pub use server::{McpServer, McpServerConfig};
pub use tools::{McpTool, ToolRegistry};
