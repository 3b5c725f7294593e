//! Security Policy Store
//!
//! The allowlist that bounds what SQL may run: tables, their columns, the
//! row cap, statement kinds, and forbidden lexical patterns. Built once at
//! start-up from [`PolicyConfig`] and shared read-only (`Arc<SecurityPolicy>`).
//!
//! Table and column names compare case-insensitively, as DuckDB identifiers do.

use crate::error::PolicyError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Default cap on returned rows.
pub const DEFAULT_MAX_ROWS: u64 = 1000;

/// Column-set entry that allows every column of a table.
pub const ALL_COLUMNS: &str = "*";

/// Patterns rejected anywhere in the raw query text.
///
/// Comment tokens enable truncation attacks; the rest are well-known
/// injection idioms and DuckDB functions that reach outside the database.
pub const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    r"--",
    r"/\*",
    r"\*/",
    r"\bxp_cmdshell\b",
    r"\bpg_sleep\s*\(",
    r"\bbenchmark\s*\(",
    r"\bwaitfor\s+delay\b",
    r"\binto\s+(out|dump)file\b",
    r"\bor\s+\d+\s*=\s*\d+",
    r"'\s*or\s*'",
    r"\bunion\s+(all\s+)?select\s+null\b",
    r"\bread_(csv|csv_auto|parquet|json|json_auto|ndjson|text|blob)\s*\(",
    r"\bparquet_scan\s*\(",
    r"\bglob\s*\(",
    r"\bgetenv\s*\(",
];

/// Root statement kinds the validator can classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Explain,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Copy,
    Other,
}

impl StatementKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Explain => "EXPLAIN",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Create => "CREATE",
            StatementKind::Drop => "DROP",
            StatementKind::Alter => "ALTER",
            StatementKind::Truncate => "TRUNCATE",
            StatementKind::Copy => "COPY",
            StatementKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// How `*` projections over a column-restricted table are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WildcardMode {
    /// Rewrite `*` into the table's allowed columns.
    #[default]
    Expand,
    /// Reject `*` unless the table allows every column.
    Reject,
}

/// `[policy]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub max_rows: u64,
    pub allowed_statements: Vec<StatementKind>,
    /// Replaces [`DEFAULT_FORBIDDEN_PATTERNS`] when set.
    pub forbidden_patterns: Option<Vec<String>>,
    /// Added on top of the default (or replaced) list.
    pub extra_forbidden_patterns: Vec<String>,
    pub wildcards: WildcardMode,
    pub tables: BTreeMap<String, TableConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            allowed_statements: vec![StatementKind::Select],
            forbidden_patterns: None,
            extra_forbidden_patterns: Vec::new(),
            wildcards: WildcardMode::default(),
            tables: BTreeMap::new(),
        }
    }
}

/// `[policy.tables.<name>]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    pub columns: Vec<String>,
    pub description: Option<String>,
}

/// A compiled, case-insensitive forbidden pattern.
#[derive(Debug, Clone)]
pub struct ForbiddenPattern {
    source: String,
    regex: Regex,
}

impl ForbiddenPattern {
    pub fn new(source: impl Into<String>) -> Result<Self, PolicyError> {
        let source = source.into();
        let regex = Regex::new(&format!("(?i){}", source)).map_err(|e| {
            PolicyError::InvalidPattern {
                pattern: source.clone(),
                source: e,
            }
        })?;
        Ok(Self { source, regex })
    }

    /// Pattern matching `token` literally.
    pub fn literal(token: &str) -> Result<Self, PolicyError> {
        Self::new(regex::escape(token))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The matched text, if any.
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.regex.find(text).map(|m| m.as_str())
    }
}

/// Allowed table with its column allowlist.
#[derive(Debug, Clone)]
pub struct TableRule {
    name: String,
    columns: Vec<String>,
    lookup: BTreeSet<String>,
    all_columns: bool,
    description: Option<String>,
}

impl TableRule {
    /// Name as configured (original case).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns as configured (original case, configuration order).
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn allows_all_columns(&self) -> bool {
        self.all_columns
    }

    /// Case-insensitive column check.
    pub fn allows_column(&self, column: &str) -> bool {
        self.all_columns || self.lookup.contains(&column.to_lowercase())
    }
}

/// Immutable, process-wide security policy.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    tables: BTreeMap<String, TableRule>,
    max_rows: u64,
    forbidden_patterns: Vec<ForbiddenPattern>,
    allowed_statements: BTreeSet<StatementKind>,
    wildcards: WildcardMode,
}

impl SecurityPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        if config.max_rows == 0 {
            return Err(PolicyError::ZeroMaxRows);
        }
        if config.allowed_statements.is_empty() {
            return Err(PolicyError::NoStatementKinds);
        }

        let mut builder = PolicyBuilder::new()
            .max_rows(config.max_rows)
            .wildcards(config.wildcards);
        builder.allowed_statements = config.allowed_statements.iter().copied().collect();

        let base: Vec<String> = match &config.forbidden_patterns {
            Some(patterns) => patterns.clone(),
            None => DEFAULT_FORBIDDEN_PATTERNS.iter().map(|p| p.to_string()).collect(),
        };
        builder.patterns = base
            .into_iter()
            .chain(config.extra_forbidden_patterns.iter().cloned())
            .collect();

        for (name, table) in &config.tables {
            builder = builder.described_table(name, &table.columns, table.description.clone());
        }

        builder.build()
    }

    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Look up a table by (case-insensitive, possibly dotted) name.
    pub fn table(&self, name: &str) -> Option<&TableRule> {
        self.tables.get(&name.to_lowercase())
    }

    /// Allowed tables ordered by name.
    pub fn tables(&self) -> impl Iterator<Item = &TableRule> {
        self.tables.values()
    }

    pub fn forbidden_patterns(&self) -> &[ForbiddenPattern] {
        &self.forbidden_patterns
    }

    pub fn allows_statement(&self, kind: StatementKind) -> bool {
        self.allowed_statements.contains(&kind)
    }

    pub fn allowed_statements(&self) -> impl Iterator<Item = StatementKind> + '_ {
        self.allowed_statements.iter().copied()
    }

    pub fn wildcard_mode(&self) -> WildcardMode {
        self.wildcards
    }
}

/// Programmatic construction, mainly for tests and embedding.
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    tables: Vec<(String, Vec<String>, Option<String>)>,
    max_rows: u64,
    patterns: Vec<String>,
    allowed_statements: BTreeSet<StatementKind>,
    wildcards: WildcardMode,
}

impl PolicyBuilder {
    fn new() -> Self {
        Self {
            tables: Vec::new(),
            max_rows: DEFAULT_MAX_ROWS,
            patterns: DEFAULT_FORBIDDEN_PATTERNS.iter().map(|p| p.to_string()).collect(),
            allowed_statements: [StatementKind::Select].into_iter().collect(),
            wildcards: WildcardMode::default(),
        }
    }

    pub fn table<I, S>(self, name: &str, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        self.described_table(name, &columns, None)
    }

    fn described_table(mut self, name: &str, columns: &[String], description: Option<String>) -> Self {
        self.tables
            .push((name.to_string(), columns.to_vec(), description));
        self
    }

    pub fn max_rows(mut self, max_rows: u64) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn forbid(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn allow_statement(mut self, kind: StatementKind) -> Self {
        self.allowed_statements.insert(kind);
        self
    }

    pub fn wildcards(mut self, mode: WildcardMode) -> Self {
        self.wildcards = mode;
        self
    }

    pub fn build(self) -> Result<SecurityPolicy, PolicyError> {
        if self.max_rows == 0 {
            return Err(PolicyError::ZeroMaxRows);
        }
        if self.allowed_statements.is_empty() {
            return Err(PolicyError::NoStatementKinds);
        }

        let mut tables = BTreeMap::new();
        for (name, columns, description) in self.tables {
            let key = name.trim().to_lowercase();
            if key.is_empty() || columns.is_empty() {
                return Err(PolicyError::EmptyTable(name));
            }
            let lookup: BTreeSet<String> = columns.iter().map(|c| c.to_lowercase()).collect();
            let all_columns = lookup.contains(ALL_COLUMNS);
            let rule = TableRule {
                name: name.trim().to_string(),
                columns,
                lookup,
                all_columns,
                description,
            };
            if tables.insert(key, rule).is_some() {
                return Err(PolicyError::DuplicateTable(name));
            }
        }
        if tables.is_empty() {
            warn!("Security policy allows no tables; every query will be rejected");
        }

        let forbidden_patterns = self
            .patterns
            .into_iter()
            .map(ForbiddenPattern::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SecurityPolicy {
            tables,
            max_rows: self.max_rows,
            forbidden_patterns,
            allowed_statements: self.allowed_statements,
            wildcards: self.wildcards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup_is_case_insensitive() {
        let policy = SecurityPolicy::builder()
            .table("County_Data", ["State_Name", "population"])
            .build()
            .unwrap();

        let table = policy.table("county_data").unwrap();
        assert_eq!(table.name(), "County_Data");
        assert!(table.allows_column("STATE_NAME"));
        assert!(table.allows_column("Population"));
        assert!(!table.allows_column("secret_col"));
        assert!(policy.table("COUNTY_DATA").is_some());
    }

    #[test]
    fn test_wildcard_column_allows_everything() {
        let policy = SecurityPolicy::builder()
            .table("events", ["*"])
            .build()
            .unwrap();
        let table = policy.table("events").unwrap();
        assert!(table.allows_all_columns());
        assert!(table.allows_column("anything"));
    }

    #[test]
    fn test_rejects_duplicate_tables() {
        let result = SecurityPolicy::builder()
            .table("events", ["id"])
            .table("EVENTS", ["id"])
            .build();
        assert!(matches!(result, Err(PolicyError::DuplicateTable(_))));
    }

    #[test]
    fn test_rejects_zero_max_rows() {
        let result = SecurityPolicy::builder().max_rows(0).build();
        assert!(matches!(result, Err(PolicyError::ZeroMaxRows)));
    }

    #[test]
    fn test_rejects_invalid_pattern() {
        let result = SecurityPolicy::builder().forbid("(unclosed").build();
        assert!(matches!(result, Err(PolicyError::InvalidPattern { .. })));
    }

    #[test]
    fn test_default_patterns_compile_and_match_case_insensitively() {
        let policy = SecurityPolicy::builder().build().unwrap();
        assert_eq!(
            policy.forbidden_patterns().len(),
            DEFAULT_FORBIDDEN_PATTERNS.len()
        );
        let hits: Vec<&str> = policy
            .forbidden_patterns()
            .iter()
            .filter_map(|p| p.find("SELECT 1 WHERE x = '' OR 1=1 AND READ_CSV ('f')"))
            .collect();
        assert!(hits.iter().any(|h| h.eq_ignore_ascii_case("or 1=1")));
        assert!(hits.iter().any(|h| h.to_lowercase().starts_with("read_csv")));
    }

    #[test]
    fn test_literal_pattern_is_escaped() {
        let pattern = ForbiddenPattern::literal("a.b").unwrap();
        assert!(pattern.find("xa.by").is_some());
        assert!(pattern.find("axb").is_none());
    }

    #[test]
    fn test_from_config_toml() {
        let config: PolicyConfig = toml::from_str(
            r#"
            max_rows = 250
            extra_forbidden_patterns = ["\\bpragma\\b"]

            [tables.county_data]
            columns = ["state_name", "county_name", "population"]
            description = "US counties"
            "#,
        )
        .unwrap();

        let policy = SecurityPolicy::from_config(&config).unwrap();
        assert_eq!(policy.max_rows(), 250);
        assert!(policy.allows_statement(StatementKind::Select));
        assert!(!policy.allows_statement(StatementKind::Explain));
        assert_eq!(policy.wildcard_mode(), WildcardMode::Expand);
        assert_eq!(
            policy.forbidden_patterns().len(),
            DEFAULT_FORBIDDEN_PATTERNS.len() + 1
        );
        let table = policy.table("county_data").unwrap();
        assert_eq!(table.columns().len(), 3);
        assert_eq!(table.description(), Some("US counties"));
    }

    #[test]
    fn test_wildcard_mode_from_toml() {
        let config: PolicyConfig = toml::from_str(r#"wildcards = "reject""#).unwrap();
        let policy = SecurityPolicy::from_config(&config).unwrap();
        assert_eq!(policy.wildcard_mode(), WildcardMode::Reject);

        assert!(toml::from_str::<PolicyConfig>(r#"wildcards = "sometimes""#).is_err());
    }

    #[test]
    fn test_from_config_replaces_default_patterns() {
        let config = PolicyConfig {
            forbidden_patterns: Some(vec!["--".to_string()]),
            ..PolicyConfig::default()
        };
        let policy = SecurityPolicy::from_config(&config).unwrap();
        assert_eq!(policy.forbidden_patterns().len(), 1);
        assert_eq!(policy.forbidden_patterns()[0].source(), "--");
    }
}
