//! MCP Server Implementation
//!
//! JSON-RPC 2.0 server over stdio for the Model Context Protocol.
//!
//! # Architecture
//!
//! One reader loop parses newline-delimited requests and spawns a task per
//! request, so a slow query never blocks a `validate_sql_query` behind it.
//! All responses funnel through a single writer task, which keeps output
//! lines whole. Notifications get no response.
//!
//! # Example
//!
//! ```ignore
//! let server = Arc::new(McpServer::new(gateway, McpServerConfig::default()));
//! server.run_stdio().await?;
//! ```

use crate::error::GatewayError;
use crate::gateway::{Gateway, RequestContext};
use crate::protocol::{
    codes, methods, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, ListChanged, RequestId, ResourceContents, ResourceReadParams,
    ResourceReadResult, ResourcesListResult, ServerCapabilities, ServerInfo, ToolCallParams,
    ToolCallResult, ToolsListResult, JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use crate::tools::ToolRegistry;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Queued responses waiting for the writer.
const RESPONSE_QUEUE: usize = 256;

/// MCP Server configuration
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Server name (reported in initialize)
    pub server_name: String,

    /// Server version (reported in initialize)
    pub server_version: String,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            server_name: "sqlgate".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// MCP Server
pub struct McpServer {
    config: McpServerConfig,
    gateway: Arc<Gateway>,
    tools: ToolRegistry,
    initialized: AtomicBool,
}

impl McpServer {
    pub fn new(gateway: Arc<Gateway>, config: McpServerConfig) -> Self {
        Self {
            config,
            gateway,
            tools: ToolRegistry::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Serve on this process's stdin/stdout until stdin closes.
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        self.serve(stdin, tokio::io::stdout()).await
    }

    /// Serve newline-delimited JSON-RPC from `reader`, answering on `writer`.
    ///
    /// Returns after `reader` hits EOF and every in-flight request has been
    /// answered.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        info!("MCP server starting");

        let (tx, rx) = mpsc::channel::<String>(RESPONSE_QUEUE);
        let writer_task = tokio::spawn(write_responses(rx, writer));
        let mut requests = JoinSet::new();
        let mut lines = reader.lines();

        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read from stdin")?
        {
            if line.trim().is_empty() {
                continue;
            }
            debug!("Received: {}", line);

            let request = match parse_request(&line) {
                Ok(request) => request,
                Err(response) => {
                    send_response(&tx, response).await;
                    continue;
                }
            };

            // The handshake is answered before anything after it is read, so
            // pipelined requests never race initialization.
            if request.method == methods::INITIALIZE {
                if let Some(response) = self.handle_request(request).await {
                    send_response(&tx, response).await;
                }
                continue;
            }

            let server = Arc::clone(&self);
            let tx = tx.clone();
            requests.spawn(async move {
                if let Some(response) = server.handle_request(request).await {
                    send_response(&tx, response).await;
                }
            });

            // Reap finished tasks so the set does not grow with the session.
            while let Some(joined) = requests.try_join_next() {
                log_join(joined);
            }
        }

        debug!("stdin closed (EOF), waiting for in-flight requests");
        while let Some(joined) = requests.join_next().await {
            log_join(joined);
        }
        drop(tx);

        writer_task
            .await
            .context("Response writer panicked")?
            .context("Failed to write to stdout")?;

        info!("MCP server shutting down");
        Ok(())
    }

    /// Parse and handle one input line. `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        match parse_request(line) {
            Ok(request) => self.handle_request(request).await,
            Err(response) => Some(response),
        }
    }

    /// Handle a single JSON-RPC request. `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!(
                    "Invalid JSON-RPC version: {}",
                    request.jsonrpc
                )),
            ));
        }

        let ctx = RequestContext::new(request.correlation_id());
        let params = request.params.unwrap_or(Value::Null);

        let outcome = match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(params),
            methods::PING => Ok(Value::Object(Default::default())),
            methods::TOOLS_LIST => to_json(&ToolsListResult {
                tools: self.tools.list_tools(),
            }),
            methods::TOOLS_CALL => self.handle_tools_call(&ctx, params).await,
            methods::RESOURCES_LIST => to_json(&ResourcesListResult {
                resources: self.gateway.resource_definitions(),
            }),
            methods::RESOURCES_READ => self.handle_resources_read(&ctx, params).await,
            methods::GET_INFORMATION_SCHEMA
            | methods::VALIDATE_SQL_QUERY
            | methods::EXECUTE_QUERY => self
                .tools
                .call_tool(&request.method, &self.gateway, &ctx, params)
                .await
                .map_err(|e| gateway_rpc_error(&e, &ctx)),
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            methods::INITIALIZED => debug!("Client finished initialization"),
            methods::CANCELLED => debug!("Client cancelled a request"),
            other => debug!("Ignoring notification: {}", other),
        }
    }

    fn handle_initialize(&self, params: Value) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = serde_json::from_value(params).map_err(|e| {
            JsonRpcError::invalid_params(format!("Invalid initialize params: {}", e))
        })?;

        info!(
            "Initialize from {} v{} (protocol {})",
            params.client_info.name, params.client_info.version, params.protocol_version
        );

        self.initialized.store(true, Ordering::Release);

        to_json(&InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ListChanged {
                    list_changed: false,
                }),
                resources: Some(ListChanged {
                    list_changed: false,
                }),
            },
            server_info: ServerInfo {
                name: self.config.server_name.clone(),
                version: self.config.server_version.clone(),
            },
        })
    }

    /// Tool failures are reported inside the result (`isError`), as MCP expects.
    async fn handle_tools_call(
        &self,
        ctx: &RequestContext,
        params: Value,
    ) -> Result<Value, JsonRpcError> {
        self.require_initialized()?;

        let params: ToolCallParams = serde_json::from_value(params).map_err(|e| {
            JsonRpcError::invalid_params(format!("Invalid tool call params: {}", e))
        })?;

        info!(correlation_id = %ctx.correlation_id(), "Tool call: {}", params.name);

        let result = match self
            .tools
            .call_tool(&params.name, &self.gateway, ctx, params.arguments)
            .await
        {
            Ok(payload) => ToolCallResult::json(&payload, false),
            Err(GatewayError::UnknownTool(name)) => {
                return Err(JsonRpcError::invalid_params(format!("Unknown tool: {}", name)))
            }
            Err(e) => {
                debug!(correlation_id = %ctx.correlation_id(), "Tool error: {}", e);
                ToolCallResult::json(&e.payload(ctx.correlation_id()).to_value(), true)
            }
        };

        to_json(&result)
    }

    async fn handle_resources_read(
        &self,
        ctx: &RequestContext,
        params: Value,
    ) -> Result<Value, JsonRpcError> {
        self.require_initialized()?;

        let params: ResourceReadParams = serde_json::from_value(params).map_err(|e| {
            JsonRpcError::invalid_params(format!("Invalid resource read params: {}", e))
        })?;

        let payload = self
            .gateway
            .read_resource(ctx, &params.uri)
            .await
            .map_err(|e| gateway_rpc_error(&e, ctx))?;

        to_json(&ResourceReadResult {
            contents: vec![ResourceContents {
                uri: params.uri,
                mime_type: "application/json".to_string(),
                text: payload.to_string(),
            }],
        })
    }

    fn require_initialized(&self) -> Result<(), JsonRpcError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(JsonRpcError::new(
                codes::NOT_INITIALIZED,
                "Server not initialized",
            ))
        }
    }
}

/// Direct-method failures: a JSON-RPC error whose `data` is the error payload.
fn gateway_rpc_error(error: &GatewayError, ctx: &RequestContext) -> JsonRpcError {
    let code = match error {
        GatewayError::InvalidParams(_)
        | GatewayError::UnknownTool(_)
        | GatewayError::UnknownResource(_) => codes::INVALID_PARAMS,
        _ => codes::GATEWAY_ERROR,
    };
    JsonRpcError::new(code, error.caller_message())
        .with_data(error.payload(ctx.correlation_id()).to_value())
}

fn parse_request(line: &str) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
    serde_json::from_str(line).map_err(|e| {
        warn!("Failed to parse request: {}", e);
        JsonRpcResponse::error(
            RequestId::Null,
            JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
        )
    })
}

async fn send_response(tx: &mpsc::Sender<String>, response: JsonRpcResponse) {
    match serde_json::to_string(&response) {
        Ok(json) => {
            // Only fails once the writer is gone.
            let _ = tx.send(json).await;
        }
        Err(e) => error!("Failed to serialize response: {}", e),
    }
}

async fn write_responses<W>(mut rx: mpsc::Receiver<String>, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(json) = rx.recv().await {
        debug!("Sending: {}", json);
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Request task failed: {}", e);
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| {
        error!("Failed to serialize result: {}", e);
        JsonRpcError::internal_error("Failed to serialize result")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_unserializable_result_is_internal_error() {
        let mut value = BTreeMap::new();
        value.insert((1, 2), "tuple keys cannot be JSON object keys");
        let err = to_json(&value).unwrap_err();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert!(err.data.is_none());
    }
}
