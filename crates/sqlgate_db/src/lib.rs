//! Engine access for SQLGate
//!
//! - **Engine**: the connection capability interface the pool depends on
//! - **DuckDB**: the embedded analytical engine behind that interface
//! - **Pool**: bounded, deadline-aware connection pool
//! - **Breaker**: circuit breaker guarding connection establishment

pub mod breaker;
mod duckdb_engine;
pub mod engine;
mod error;
pub mod pool;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, MAX_COOLDOWN};
pub use duckdb_engine::{hash_sql, DuckDbConnection, DuckDbFactory, EngineConfig, IN_MEMORY};
pub use engine::{ConnectionFactory, DbValue, EngineConnection, InterruptFn, QueryRows};
pub use error::{BackendError, BreakerError, PoolError};
pub use pool::{
    ConnectionHandle, ConnectionMeta, ConnectionPool, ConnectionState, PoolConfig, PoolStats,
};
