//! SQL Validator
//!
//! Turns an untrusted SQL string into either a sanitized, execution-safe
//! statement or a typed rejection. The checks run in a fixed order:
//!
//! 1. empty input
//! 2. statement separators (lexical, before parsing)
//! 3. parse with the DuckDB dialect; failure is a hard rejection
//! 4. root statement kind against the policy
//! 5. every relation and column reference against the allowlist, scope by
//!    scope; `*` over a column-restricted table expands to its allowed columns
//! 6. forbidden lexical patterns on the raw text
//! 7. `LIMIT` clamped to the policy's row cap
//!
//! Nothing else is rewritten. The output is the parser's canonical rendering,
//! so validating a sanitized statement again returns it unchanged.
//!
//! `validate` is a pure function: no I/O, no shared mutable state.

use crate::error::ErrorKind;
use crate::lexical;
use crate::policy::{SecurityPolicy, StatementKind};
use crate::resolver;
use serde::Serialize;
use sqlparser::ast::{Expr, Query, Statement, Value};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;
use tracing::debug;

/// Result of validating one SQL string. Never partially valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Valid { sanitized_sql: String },
    Invalid(Rejection),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid { .. })
    }

    pub fn sanitized_sql(&self) -> Option<&str> {
        match self {
            ValidationOutcome::Valid { sanitized_sql } => Some(sanitized_sql),
            ValidationOutcome::Invalid(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ValidationOutcome::Valid { .. } => None,
            ValidationOutcome::Invalid(rejection) => Some(rejection),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.rejection().map(|r| r.kind)
    }
}

/// Why a query was rejected, naming the offending token when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_token: Option<String>,
}

impl Rejection {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offending_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.offending_token = Some(token.into());
        self
    }
}

/// Validate `sql` against `policy`.
pub fn validate(sql: &str, policy: &SecurityPolicy) -> ValidationOutcome {
    match sanitize(sql, policy) {
        Ok(sanitized_sql) => ValidationOutcome::Valid { sanitized_sql },
        Err(rejection) => {
            debug!(kind = %rejection.kind, message = %rejection.message, "SQL rejected");
            ValidationOutcome::Invalid(rejection)
        }
    }
}

fn sanitize(sql: &str, policy: &SecurityPolicy) -> Result<String, Rejection> {
    if sql.trim().is_empty() {
        return Err(Rejection::new(ErrorKind::Empty, "Query is empty"));
    }

    let statement_text = lexical::single_statement(sql)?;

    let mut statements = Parser::parse_sql(&DuckDbDialect {}, statement_text)
        .map_err(|e| Rejection::new(ErrorKind::ParseError, e.to_string()))?;
    let mut statement = match statements.len() {
        0 => return Err(Rejection::new(ErrorKind::Empty, "Query contains no statement")),
        1 => statements.remove(0),
        n => {
            return Err(Rejection::new(
                ErrorKind::MultiStatement,
                format!("Expected one statement, found {}", n),
            ))
        }
    };

    let kind = statement_kind(&statement);
    if !policy.allows_statement(kind) {
        return Err(Rejection::new(
            ErrorKind::StatementNotAllowed,
            format!("{} statements are not allowed", kind),
        )
        .with_token(kind.keyword()));
    }

    resolver::resolve(&mut statement, policy)?;

    lexical::scan_forbidden(sql, policy)?;

    let query = root_query_mut(&mut statement).ok_or_else(|| {
        Rejection::new(
            ErrorKind::StatementNotAllowed,
            "Only query statements can be executed",
        )
    })?;
    clamp_limit(query, policy.max_rows());

    Ok(statement.to_string())
}

fn statement_kind(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(_) => StatementKind::Select,
        Statement::Explain { .. } => StatementKind::Explain,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateSchema { .. } => StatementKind::Create,
        Statement::Drop { .. } => StatementKind::Drop,
        Statement::AlterTable { .. } => StatementKind::Alter,
        Statement::Truncate { .. } => StatementKind::Truncate,
        Statement::Copy { .. } => StatementKind::Copy,
        _ => StatementKind::Other,
    }
}

/// The query whose `LIMIT` bounds the result set.
fn root_query_mut(statement: &mut Statement) -> Option<&mut Query> {
    match statement {
        Statement::Query(query) => Some(query),
        Statement::Explain { statement, .. } => match statement.as_mut() {
            Statement::Query(query) => Some(query),
            _ => None,
        },
        _ => None,
    }
}

fn clamp_limit(query: &mut Query, max_rows: u64) {
    let within_cap = match &query.limit {
        Some(Expr::Value(Value::Number(n, _))) => {
            n.parse::<u64>().map(|rows| rows <= max_rows).unwrap_or(false)
        }
        _ => false,
    };
    if !within_cap {
        query.limit = Some(Expr::Value(Value::Number(max_rows.to_string(), false)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::WildcardMode;

    fn policy() -> SecurityPolicy {
        SecurityPolicy::builder()
            .table(
                "county_data",
                ["state_name", "county_name", "population", "median_income"],
            )
            .table("state_data", ["state_name", "region"])
            .max_rows(1000)
            .build()
            .unwrap()
    }

    fn kind_of(sql: &str) -> Option<ErrorKind> {
        validate(sql, &policy()).error_kind()
    }

    fn sanitized(sql: &str) -> String {
        match validate(sql, &policy()) {
            ValidationOutcome::Valid { sanitized_sql } => sanitized_sql,
            ValidationOutcome::Invalid(r) => panic!("expected valid, got {:?}", r),
        }
    }

    #[test]
    fn test_appends_limit_when_absent() {
        assert_eq!(
            sanitized("SELECT county_name FROM county_data WHERE state_name = 'California'"),
            "SELECT county_name FROM county_data WHERE state_name = 'California' LIMIT 1000"
        );
    }

    #[test]
    fn test_clamps_limit_above_cap() {
        assert_eq!(
            sanitized("SELECT county_name FROM county_data LIMIT 5000"),
            "SELECT county_name FROM county_data LIMIT 1000"
        );
    }

    #[test]
    fn test_keeps_limit_within_cap() {
        assert_eq!(
            sanitized("SELECT county_name FROM county_data LIMIT 10"),
            "SELECT county_name FROM county_data LIMIT 10"
        );
        assert_eq!(
            sanitized("SELECT county_name FROM county_data LIMIT 1000"),
            "SELECT county_name FROM county_data LIMIT 1000"
        );
    }

    #[test]
    fn test_replaces_non_literal_limit() {
        assert_eq!(
            sanitized("SELECT county_name FROM county_data LIMIT 10 + 5"),
            "SELECT county_name FROM county_data LIMIT 1000"
        );
    }

    #[test]
    fn test_limit_keeps_offset() {
        assert_eq!(
            sanitized("SELECT county_name FROM county_data OFFSET 20"),
            "SELECT county_name FROM county_data LIMIT 1000 OFFSET 20"
        );
    }

    #[test]
    fn test_trailing_semicolon_is_dropped() {
        assert_eq!(
            sanitized("SELECT county_name FROM county_data;"),
            "SELECT county_name FROM county_data LIMIT 1000"
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(kind_of(""), Some(ErrorKind::Empty));
        assert_eq!(kind_of("   \n\t "), Some(ErrorKind::Empty));
    }

    #[test]
    fn test_multi_statement() {
        assert_eq!(
            kind_of("SELECT * FROM county_data; DROP TABLE county_data"),
            Some(ErrorKind::MultiStatement)
        );
    }

    #[test]
    fn test_parse_error_keeps_parser_message() {
        let outcome = validate("SELEC * FROM county_data", &policy());
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.kind, ErrorKind::ParseError);
        assert!(!rejection.message.is_empty());
    }

    #[test]
    fn test_non_select_statements_rejected() {
        for sql in [
            "DROP TABLE county_data",
            "DELETE FROM county_data",
            "UPDATE county_data SET population = 0",
            "INSERT INTO county_data VALUES ('a', 'b', 1, 2)",
            "ALTER TABLE county_data ADD COLUMN x INT",
            "CREATE TABLE x (id INT)",
        ] {
            assert_eq!(kind_of(sql), Some(ErrorKind::StatementNotAllowed), "{sql}");
        }
    }

    #[test]
    fn test_statement_rejection_names_keyword() {
        let outcome = validate("DROP TABLE county_data", &policy());
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.offending_token.as_deref(), Some("DROP"));
    }

    #[test]
    fn test_select_into_rejected() {
        assert_eq!(
            kind_of("SELECT county_name INTO copy_table FROM county_data"),
            Some(ErrorKind::StatementNotAllowed)
        );
    }

    #[test]
    fn test_unknown_table_named() {
        let outcome = validate("SELECT * FROM users", &policy());
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.kind, ErrorKind::TableNotAllowed);
        assert_eq!(rejection.offending_token.as_deref(), Some("users"));
    }

    #[test]
    fn test_unknown_table_in_subquery_and_join() {
        assert_eq!(
            kind_of("SELECT * FROM county_data WHERE state_name IN (SELECT name FROM users)"),
            Some(ErrorKind::TableNotAllowed)
        );
        assert_eq!(
            kind_of("SELECT c.county_name FROM county_data c JOIN users u ON u.id = c.population"),
            Some(ErrorKind::TableNotAllowed)
        );
        assert_eq!(
            kind_of("SELECT state_name FROM county_data UNION SELECT name FROM users"),
            Some(ErrorKind::TableNotAllowed)
        );
    }

    #[test]
    fn test_table_functions_rejected() {
        assert_eq!(
            kind_of("SELECT * FROM read_csv_auto('/etc/passwd')"),
            Some(ErrorKind::TableNotAllowed)
        );
    }

    #[test]
    fn test_qualified_table_name_must_match_policy() {
        assert_eq!(
            kind_of("SELECT * FROM other_db.county_data"),
            Some(ErrorKind::TableNotAllowed)
        );
    }

    #[test]
    fn test_disallowed_column() {
        let outcome = validate("SELECT secret_col FROM county_data", &policy());
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.kind, ErrorKind::ColumnNotAllowed);
        assert_eq!(rejection.offending_token.as_deref(), Some("secret_col"));
    }

    #[test]
    fn test_disallowed_column_in_where_and_qualified() {
        assert_eq!(
            kind_of("SELECT county_name FROM county_data WHERE ssn = '1'"),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert_eq!(
            kind_of("SELECT c.region FROM county_data c"),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert_eq!(
            kind_of("SELECT x.county_name FROM county_data c"),
            Some(ErrorKind::ColumnNotAllowed)
        );
    }

    #[test]
    fn test_join_using_columns_checked() {
        assert_eq!(
            kind_of("SELECT county_name FROM county_data JOIN state_data USING (secret_col)"),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert!(validate(
            "SELECT county_name, region FROM county_data JOIN state_data USING (state_name)",
            &policy()
        )
        .is_valid());
    }

    #[test]
    fn test_aliases_ctes_and_derived_tables() {
        let valid = [
            "SELECT state_name, SUM(population) AS total FROM county_data GROUP BY state_name ORDER BY total DESC",
            "WITH big AS (SELECT county_name, population FROM county_data WHERE population > 100000) SELECT county_name FROM big",
            "SELECT s.n FROM (SELECT county_name AS n FROM county_data) AS s",
            "SELECT c.county_name, s.region FROM county_data AS c JOIN state_data AS s ON c.state_name = s.state_name",
            "SELECT COUNT(*) FROM county_data",
        ];
        for sql in valid {
            assert!(validate(sql, &policy()).is_valid(), "{sql}");
        }
    }

    #[test]
    fn test_cte_cannot_launder_forbidden_table() {
        assert_eq!(
            kind_of("WITH x AS (SELECT * FROM users) SELECT * FROM x"),
            Some(ErrorKind::TableNotAllowed)
        );
    }

    #[test]
    fn test_dangerous_comment_pattern() {
        let outcome = validate("SELECT * FROM county_data -- ' OR 1=1", &policy());
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.kind, ErrorKind::DangerousPattern);
        assert_eq!(rejection.offending_token.as_deref(), Some("--"));
    }

    #[test]
    fn test_wildcard_expands_to_allowed_columns() {
        let outcome = validate(
            "SELECT * FROM county_data WHERE state_name = 'California'",
            &policy(),
        );
        assert_eq!(
            outcome.sanitized_sql(),
            Some(
                "SELECT state_name, county_name, population, median_income FROM county_data \
                 WHERE state_name = 'California' LIMIT 1000"
            )
        );

        let outcome = validate("SELECT c.* FROM county_data AS c", &policy());
        assert_eq!(
            outcome.sanitized_sql(),
            Some(
                "SELECT c.state_name, c.county_name, c.population, c.median_income \
                 FROM county_data AS c LIMIT 1000"
            )
        );
    }

    #[test]
    fn test_wildcard_expansion_across_joins() {
        let policy = SecurityPolicy::builder()
            .table("county_data", ["county_name"])
            .table("events", ["*"])
            .build()
            .unwrap();

        let outcome = validate(
            "SELECT * FROM events JOIN county_data ON events.county_name = county_data.county_name",
            &policy,
        );
        let sanitized = outcome.sanitized_sql().unwrap();
        assert!(
            sanitized.starts_with("SELECT events.*, county_data.county_name FROM events JOIN"),
            "{sanitized}"
        );

        // Nothing restricted in reach: left as written.
        assert_eq!(
            validate("SELECT * FROM events", &policy).sanitized_sql(),
            Some("SELECT * FROM events LIMIT 1000")
        );
        assert_eq!(
            validate("SELECT * FROM (SELECT county_name FROM county_data) AS d", &policy)
                .sanitized_sql(),
            Some("SELECT * FROM (SELECT county_name FROM county_data) AS d LIMIT 1000")
        );

        assert_eq!(
            validate(
                "SELECT * FROM county_data, (SELECT county_name FROM county_data)",
                &policy
            )
            .error_kind(),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert_eq!(
            validate("SELECT * EXCLUDE (county_name) FROM county_data", &policy).error_kind(),
            Some(ErrorKind::ColumnNotAllowed)
        );
    }

    #[test]
    fn test_expanded_wildcard_is_a_fixed_point() {
        let policy = policy();
        let first = validate("SELECT * FROM county_data JOIN state_data USING (state_name)", &policy);
        let sanitized = first.sanitized_sql().unwrap().to_string();
        assert!(!sanitized.contains('*'), "{sanitized}");
        assert_eq!(
            validate(&sanitized, &policy),
            ValidationOutcome::Valid {
                sanitized_sql: sanitized.clone()
            }
        );
    }

    #[test]
    fn test_wildcard_rejected_when_configured() {
        let policy = SecurityPolicy::builder()
            .table("county_data", ["county_name"])
            .table("events", ["*"])
            .wildcards(WildcardMode::Reject)
            .build()
            .unwrap();
        let kind = |sql: &str| validate(sql, &policy).error_kind();

        assert_eq!(kind("SELECT * FROM county_data"), Some(ErrorKind::ColumnNotAllowed));
        assert_eq!(kind("SELECT c.* FROM county_data c"), Some(ErrorKind::ColumnNotAllowed));
        assert_eq!(
            kind("SELECT * FROM events JOIN county_data ON events.county_name = county_data.county_name"),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert_eq!(kind("SELECT x.* FROM events"), Some(ErrorKind::ColumnNotAllowed));

        assert_eq!(kind("SELECT * FROM events"), None);
        assert_eq!(kind("SELECT e.* FROM events e"), None);
        assert_eq!(kind("SELECT * FROM (SELECT county_name FROM county_data) d"), None);
        assert_eq!(
            kind("WITH t AS (SELECT county_name FROM county_data) SELECT * FROM t"),
            None
        );
        assert_eq!(kind("SELECT COUNT(*) FROM county_data"), None);
    }

    #[test]
    fn test_output_aliases_stay_in_their_select() {
        for sql in [
            "SELECT county_name AS ssn FROM county_data UNION ALL SELECT ssn FROM county_data",
            "SELECT county_name AS ssn FROM county_data WHERE ssn LIKE '1%'",
            "WITH x(ssn) AS (SELECT county_name FROM county_data) SELECT ssn FROM county_data",
            "SELECT county_name FROM (SELECT county_name AS ssn FROM county_data) d, county_data c WHERE c.population > 0 AND c.ssn = '1'",
        ] {
            let outcome = validate(sql, &policy());
            let rejection = outcome.rejection().unwrap_or_else(|| panic!("accepted: {sql}"));
            assert_eq!(rejection.kind, ErrorKind::ColumnNotAllowed, "{sql}");
            assert_eq!(rejection.offending_token.as_deref(), Some("ssn"), "{sql}");
        }

        for sql in [
            "WITH x(ssn) AS (SELECT county_name FROM county_data) SELECT ssn FROM x",
            "SELECT county_name AS n FROM county_data ORDER BY n",
            "SELECT n FROM (SELECT county_name AS n FROM county_data) d",
            "SELECT county_name AS n FROM county_data UNION ALL SELECT region FROM state_data ORDER BY n",
        ] {
            assert!(validate(sql, &policy()).is_valid(), "{sql}");
        }
    }

    #[test]
    fn test_cte_names_are_scoped() {
        let outcome = validate(
            "SELECT * FROM users WHERE EXISTS (WITH users AS (SELECT 1 AS a) SELECT a FROM users)",
            &policy(),
        );
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.kind, ErrorKind::TableNotAllowed);
        assert_eq!(rejection.offending_token.as_deref(), Some("users"));

        // Visible from nested queries, but not from a sibling.
        assert!(validate(
            "WITH t AS (SELECT state_name FROM state_data) \
             SELECT county_name FROM county_data WHERE state_name IN (SELECT state_name FROM t)",
            &policy()
        )
        .is_valid());
        assert_eq!(
            kind_of(
                "SELECT county_name FROM county_data \
                 WHERE state_name IN (WITH t AS (SELECT state_name FROM state_data) SELECT state_name FROM t) \
                 AND population > (SELECT COUNT(*) FROM t)"
            ),
            Some(ErrorKind::TableNotAllowed)
        );
    }

    #[test]
    fn test_columns_expression_reads_every_column() {
        let outcome = validate("SELECT COLUMNS('.*') FROM county_data", &policy());
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.kind, ErrorKind::ColumnNotAllowed);
        assert_eq!(rejection.offending_token.as_deref(), Some("COLUMNS"));

        assert_eq!(
            kind_of("SELECT county_name FROM county_data WHERE COLUMNS('.*') = 'x'"),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert_eq!(
            kind_of("SELECT struct_pack(*) FROM county_data"),
            Some(ErrorKind::ColumnNotAllowed)
        );
        assert!(validate(
            "SELECT COLUMNS('.*') FROM (SELECT county_name, population FROM county_data) d",
            &policy()
        )
        .is_valid());
    }

    #[test]
    fn test_hidden_columns_unreachable_through_renames() {
        for sql in [
            // whole row as a struct
            "SELECT c FROM county_data c",
            "SELECT a FROM county_data AS c(a)",
            "SELECT county_name FROM county_data NATURAL JOIN state_data",
            "SELECT county_name FROM county_data WHERE EXISTS (SELECT 1 FROM state_data WHERE capital = 'x')",
        ] {
            assert_eq!(kind_of(sql), Some(ErrorKind::ColumnNotAllowed), "{sql}");
        }
    }

    #[test]
    fn test_correlated_references_resolve_outward() {
        for sql in [
            "SELECT county_name FROM county_data c WHERE EXISTS \
             (SELECT 1 FROM state_data s WHERE s.state_name = c.state_name)",
            "SELECT county_name FROM county_data WHERE population > \
             (SELECT AVG(population) FROM county_data)",
            "SELECT d.n FROM county_data c, (SELECT c.county_name AS n) d",
        ] {
            assert!(validate(sql, &policy()).is_valid(), "{sql}");
        }
    }

    #[test]
    fn test_dangerous_tautology() {
        assert_eq!(
            kind_of("SELECT county_name FROM county_data WHERE state_name = 'x' OR 1=1"),
            Some(ErrorKind::DangerousPattern)
        );
    }

    #[test]
    fn test_explain_only_when_configured() {
        assert_eq!(
            kind_of("EXPLAIN SELECT county_name FROM county_data"),
            Some(ErrorKind::StatementNotAllowed)
        );

        let policy = SecurityPolicy::builder()
            .table("county_data", ["county_name"])
            .allow_statement(StatementKind::Explain)
            .max_rows(50)
            .build()
            .unwrap();
        let outcome = validate("EXPLAIN SELECT county_name FROM county_data", &policy);
        assert_eq!(
            outcome.sanitized_sql(),
            Some("EXPLAIN SELECT county_name FROM county_data LIMIT 50")
        );
        assert_eq!(
            validate("EXPLAIN SELECT secret FROM county_data", &policy).error_kind(),
            Some(ErrorKind::ColumnNotAllowed)
        );
    }

    #[test]
    fn test_sanitized_output_is_a_fixed_point() {
        let policy = policy();
        for sql in [
            "select county_name from county_data",
            "SELECT county_name FROM county_data WHERE population > 10 ORDER BY county_name LIMIT 99999",
            "WITH t AS (SELECT state_name FROM state_data) SELECT state_name FROM t",
        ] {
            let first = validate(sql, &policy);
            let sanitized = first.sanitized_sql().unwrap().to_string();
            let second = validate(&sanitized, &policy);
            assert_eq!(second, ValidationOutcome::Valid { sanitized_sql: sanitized });
        }
    }
}
