//! `sqlgate validate`: run the validator offline against the configured policy.
//!
//! No database is opened and nothing is audited; this is for policy authors.

use anyhow::Result;
use sqlgate::GatewayConfig;
use sqlgate_security::{validate, ValidationOutcome};

/// Returns whether the query was accepted.
pub fn run(config: &GatewayConfig, sql: &str, json: bool) -> Result<bool> {
    let policy = config.build_policy()?;
    let outcome = validate(sql, &policy);

    if json {
        let rendered = match &outcome {
            ValidationOutcome::Valid { sanitized_sql } => serde_json::json!({
                "valid": true,
                "sanitizedSql": sanitized_sql,
            }),
            ValidationOutcome::Invalid(rejection) => serde_json::json!({
                "valid": false,
                "errorKind": rejection.kind,
                "message": rejection.message,
                "offendingToken": rejection.offending_token,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    } else {
        match &outcome {
            ValidationOutcome::Valid { sanitized_sql } => {
                println!("VALID");
                println!("  {}", sanitized_sql);
            }
            ValidationOutcome::Invalid(rejection) => {
                println!("REJECTED ({})", rejection.kind);
                println!("  {}", rejection.message);
                if let Some(token) = &rejection.offending_token {
                    println!("  offending token: {}", token);
                }
            }
        }
    }

    Ok(outcome.is_valid())
}
