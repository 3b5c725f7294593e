//! validate_sql_query - check a query without running it

use super::*;

pub struct ValidateSqlQueryTool;

#[async_trait]
impl McpTool for ValidateSqlQueryTool {
    fn name(&self) -> &'static str {
        "validate_sql_query"
    }

    fn description(&self) -> &'static str {
        "Check a SQL query against the security policy without executing it. \
         Returns the sanitized SQL, or the rule that rejected the query."
    }

    fn input_schema(&self) -> Value {
        sql_input_schema("SQL query to check")
    }

    async fn call(
        &self,
        gateway: &Gateway,
        ctx: &RequestContext,
        args: Value,
    ) -> Result<Value, GatewayError> {
        let sql = parse_sql_args(gateway, ctx, Operation::Validate, args)?;
        to_payload(&gateway.validate_sql_query(ctx, &sql))
    }
}
