//! Gateway configuration file.
//!
//! One TOML file, loaded once at start and never reloaded. Every section is
//! optional and falls back to its defaults:
//!
//! ```toml
//! [server]
//! name = "sqlgate"
//! max_response_bytes = 1048576
//!
//! [policy]
//! max_rows = 1000
//! allowed_statements = ["select"]
//!
//! [policy.tables.county_data]
//! columns = ["state_name", "county_name", "population"]
//!
//! [engine]
//! path = "/var/lib/sqlgate/census.duckdb"
//!
//! [pool]
//! max_connections = 4
//!
//! [execution]
//! query_timeout_ms = 2000
//!
//! [breaker]
//! failure_threshold = 5
//!
//! [audit]
//! path = "/var/log/sqlgate/audit.ndjson"
//! ```

use serde::{Deserialize, Serialize};
use sqlgate_db::{BreakerConfig, EngineConfig, PoolConfig, PoolError, MAX_COOLDOWN};
use sqlgate_mcp::{GatewaySettings, McpServerConfig};
use sqlgate_security::{PolicyConfig, PolicyError, SecurityPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file name looked up under `$SQLGATE_HOME` when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "sqlgate.toml";

/// Audit file name under `$SQLGATE_HOME` when `[audit] path` is unset.
pub const DEFAULT_AUDIT_FILE: &str = "audit.ndjson";

/// Smallest response budget that still fits an error payload.
const MIN_RESPONSE_BYTES: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid [policy]: {0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid [pool]: {0}")]
    Pool(#[from] PoolError),

    #[error("Invalid [{section}]: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(section: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            section,
            message: message.into(),
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub server: ServerSection,
    pub policy: PolicyConfig,
    pub engine: EngineConfig,
    pub pool: PoolConfig,
    pub execution: ExecutionSection,
    pub breaker: BreakerConfig,
    pub audit: AuditSection,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// Reported to clients in `initialize`.
    pub name: String,
    pub max_response_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "sqlgate".to_string(),
            max_response_bytes: 1024 * 1024,
        }
    }
}

/// `[execution]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSection {
    pub query_timeout_ms: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            query_timeout_ms: 2_000,
        }
    }
}

/// `[audit]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuditSection {
    /// Defaults to `$SQLGATE_HOME/audit.ndjson`.
    pub path: Option<PathBuf>,
}

impl GatewayConfig {
    /// Read, parse and validate `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse and validate config text. `origin` only labels errors.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints. Compiles the policy to do so.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::invalid("server", "name must not be empty"));
        }
        if self.server.max_response_bytes < MIN_RESPONSE_BYTES {
            return Err(ConfigError::invalid(
                "server",
                format!("max_response_bytes must be at least {}", MIN_RESPONSE_BYTES),
            ));
        }

        let policy = self.build_policy()?;
        if policy.tables().next().is_none() {
            return Err(ConfigError::invalid(
                "policy",
                "at least one [policy.tables.<name>] entry is required",
            ));
        }

        if self.engine.threads == Some(0) {
            return Err(ConfigError::invalid("engine", "threads must be at least 1"));
        }

        self.pool.validate()?;

        if self.execution.query_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "execution",
                "query_timeout_ms must be at least 1",
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker",
                "failure_threshold must be at least 1",
            ));
        }
        if self.breaker.open_duration_ms == 0 {
            return Err(ConfigError::invalid(
                "breaker",
                "open_duration_ms must be at least 1",
            ));
        }
        let max_cooldown_ms = MAX_COOLDOWN.as_millis() as u64;
        for (key, value) in [
            ("open_duration_ms", self.breaker.open_duration_ms),
            ("backoff_cap_ms", self.breaker.backoff_cap_ms),
        ] {
            if value > max_cooldown_ms {
                return Err(ConfigError::invalid(
                    "breaker",
                    format!("{} must not exceed {} (one day)", key, max_cooldown_ms),
                ));
            }
        }

        if let Some(path) = &self.audit.path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::invalid("audit", "path must not be empty"));
            }
        }

        Ok(())
    }

    pub fn build_policy(&self) -> Result<SecurityPolicy, ConfigError> {
        Ok(SecurityPolicy::from_config(&self.policy)?)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            max_response_bytes: self.server.max_response_bytes,
            query_timeout: Duration::from_millis(self.execution.query_timeout_ms),
            acquire_timeout: self.pool.acquire_timeout(),
        }
    }

    pub fn server_config(&self) -> McpServerConfig {
        McpServerConfig {
            server_name: self.server.name.clone(),
            ..McpServerConfig::default()
        }
    }

    /// Resolved audit file path.
    pub fn audit_path(&self) -> PathBuf {
        self.audit
            .path
            .clone()
            .unwrap_or_else(|| sqlgate_logging::sqlgate_home().join(DEFAULT_AUDIT_FILE))
    }
}

/// Config path when neither `--config` nor `SQLGATE_CONFIG` is set.
pub fn default_config_path() -> PathBuf {
    sqlgate_logging::sqlgate_home().join(DEFAULT_CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[policy.tables.county_data]
columns = ["state_name", "county_name", "population"]
"#;

    fn parse(text: &str) -> Result<GatewayConfig, ConfigError> {
        GatewayConfig::parse(text, Path::new("test.toml"))
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse(MINIMAL).unwrap();

        assert_eq!(config.server.name, "sqlgate");
        assert_eq!(config.policy.max_rows, 1000);
        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.execution.query_timeout_ms, 2_000);
        assert!(config.engine.is_in_memory());

        let settings = config.gateway_settings();
        assert_eq!(settings.query_timeout, Duration::from_secs(2));
        assert_eq!(settings.acquire_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_every_section() {
        let config = parse(
            r#"
[server]
name = "census-gateway"
max_response_bytes = 65536

[policy]
max_rows = 50
allowed_statements = ["select", "explain"]
extra_forbidden_patterns = ["pg_sleep"]

[policy.tables.county_data]
columns = ["county_name"]
description = "US counties"

[engine]
path = "census.duckdb"
read_only = true
threads = 2

[pool]
min_connections = 0
max_connections = 2
acquire_timeout_ms = 250

[execution]
query_timeout_ms = 500

[breaker]
failure_threshold = 3

[audit]
path = "/tmp/sqlgate-audit.ndjson"
"#,
        )
        .unwrap();

        assert_eq!(config.server_config().server_name, "census-gateway");
        assert_eq!(config.gateway_settings().max_response_bytes, 65536);
        assert_eq!(config.gateway_settings().acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.gateway_settings().query_timeout, Duration::from_millis(500));
        assert_eq!(config.engine.path, "census.duckdb");
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.audit_path(), PathBuf::from("/tmp/sqlgate-audit.ndjson"));

        let policy = config.build_policy().unwrap();
        assert_eq!(policy.max_rows(), 50);
        assert!(policy.table("county_data").is_some());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = parse(&format!("{}\n[pool]\nmax_conections = 3\n", MINIMAL)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn test_min_above_max_rejected() {
        let err = parse(&format!(
            "{}\n[pool]\nmin_connections = 5\nmax_connections = 2\n",
            MINIMAL
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Pool(_)), "{err}");
    }

    #[test]
    fn test_zero_max_rows_rejected() {
        let err = parse(&format!("[policy]\nmax_rows = 0\n{}", MINIMAL)).unwrap_err();
        assert!(matches!(err, ConfigError::Policy(PolicyError::ZeroMaxRows)), "{err}");
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let err = parse(&format!(
            "[policy]\nextra_forbidden_patterns = [\"(unclosed\"]\n{}",
            MINIMAL
        ))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::Policy(PolicyError::InvalidPattern { .. })),
            "{err}"
        );
    }

    #[test]
    fn test_policy_without_tables_rejected() {
        let err = parse("[policy]\nmax_rows = 10\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { section: "policy", .. }),
            "{err}"
        );
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let err = parse(&format!("{}\n[execution]\nquery_timeout_ms = 0\n", MINIMAL)).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { section: "execution", .. }),
            "{err}"
        );

        let err = parse(&format!("{}\n[breaker]\nfailure_threshold = 0\n", MINIMAL)).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { section: "breaker", .. }),
            "{err}"
        );
    }

    #[test]
    fn test_cooldown_longer_than_a_day_rejected() {
        let err = parse(&format!(
            "{}\n[breaker]\nbackoff_cap_ms = 86400001\n",
            MINIMAL
        ))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { section: "breaker", .. }),
            "{err}"
        );
        assert!(err.to_string().contains("backoff_cap_ms"));

        parse(&format!("{}\n[breaker]\nbackoff_cap_ms = 86400000\n", MINIMAL)).unwrap();
    }

    #[test]
    fn test_tiny_response_budget_rejected() {
        let err = parse(&format!("[server]\nmax_response_bytes = 100\n{}", MINIMAL)).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { section: "server", .. }),
            "{err}"
        );
    }
}
