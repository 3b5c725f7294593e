//! execute_query - validate, then run on a pooled read-only connection

use super::*;

pub struct ExecuteQueryTool;

#[async_trait]
impl McpTool for ExecuteQueryTool {
    fn name(&self) -> &'static str {
        "execute_query"
    }

    fn description(&self) -> &'static str {
        "Run a read-only SQL query. The query is validated first and its LIMIT \
         is clamped to the configured maximum; rejected queries never reach the database."
    }

    fn input_schema(&self) -> Value {
        sql_input_schema("SELECT query to run")
    }

    async fn call(
        &self,
        gateway: &Gateway,
        ctx: &RequestContext,
        args: Value,
    ) -> Result<Value, GatewayError> {
        let sql = parse_sql_args(gateway, ctx, Operation::Execute, args)?;
        let result = gateway.execute_query(ctx, &sql).await?;
        to_payload(&result)
    }
}
