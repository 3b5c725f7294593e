//! get_information_schema - allowed tables and columns

use super::*;

pub struct InformationSchemaTool;

#[async_trait]
impl McpTool for InformationSchemaTool {
    fn name(&self) -> &'static str {
        "get_information_schema"
    }

    fn description(&self) -> &'static str {
        "List the tables and columns queries may reference, and the maximum rows a query returns."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn call(
        &self,
        gateway: &Gateway,
        ctx: &RequestContext,
        _args: Value,
    ) -> Result<Value, GatewayError> {
        let mut payload = to_payload(&gateway.information_schema())?;
        if let Value::Object(map) = &mut payload {
            map.insert(
                "correlationId".to_string(),
                Value::String(ctx.correlation_id().to_string()),
            );
        }
        Ok(payload)
    }
}
