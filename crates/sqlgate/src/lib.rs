//! SQLGate
//!
//! Sits between an LLM that writes SQL and a DuckDB database: every query is
//! checked against a table/column allowlist, capped with `LIMIT`, executed on
//! a bounded connection pool under a deadline, and written to an audit log.
//!
//! This crate holds the binary's configuration; the moving parts live in
//! `sqlgate_security`, `sqlgate_db` and `sqlgate_mcp`.

pub mod config;

pub use config::{ConfigError, GatewayConfig};
