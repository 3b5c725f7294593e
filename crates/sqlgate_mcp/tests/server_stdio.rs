//! The stdio server driven through in-memory pipes.

use serde_json::{json, Value};
use sqlgate_db::{BreakerConfig, DuckDbFactory, EngineConfig, PoolConfig};
use sqlgate_mcp::protocol::codes;
use sqlgate_mcp::{AuditLog, Gateway, GatewaySettings, McpServer, McpServerConfig};
use sqlgate_security::SecurityPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

const SEED_SQL: &str = r#"
CREATE TABLE county_data (state_name VARCHAR, county_name VARCHAR, population BIGINT, secret_col VARCHAR);
INSERT INTO county_data VALUES ('California', 'Alameda', 1682353, 'x'), ('Oregon', 'Multnomah', 815428, 'y');
"#;

async fn server(dir: &TempDir) -> Arc<McpServer> {
    let policy = SecurityPolicy::builder()
        .table("county_data", ["state_name", "county_name", "population"])
        .max_rows(1000)
        .build()
        .unwrap();
    let factory = DuckDbFactory::open(&EngineConfig::in_memory().with_init_sql(SEED_SQL)).unwrap();
    let gateway = Gateway::start(
        Arc::new(policy),
        Arc::new(factory),
        PoolConfig {
            health_check_interval_ms: 0,
            ..PoolConfig::default()
        },
        BreakerConfig::default(),
        AuditLog::open(dir.path().join("audit.ndjson")).unwrap(),
        GatewaySettings::default(),
    )
    .await
    .unwrap();

    Arc::new(McpServer::new(Arc::new(gateway), McpServerConfig::default()))
}

/// Feed `lines` to the server, wait for EOF handling, and return responses by id.
async fn exchange(server: Arc<McpServer>, lines: &[String]) -> (HashMap<String, Value>, usize) {
    let input = lines.join("\n") + "\n";
    let (server_out, mut client_in) = tokio::io::duplex(64 * 1024);

    let collector = tokio::spawn(async move {
        let mut output = String::new();
        client_in.read_to_string(&mut output).await.unwrap();
        output
    });

    server.serve(input.as_bytes(), server_out).await.unwrap();
    let output = collector.await.unwrap();

    let responses: Vec<Value> = output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let count = responses.len();
    let by_id = responses
        .into_iter()
        .map(|r| (r["id"].to_string(), r))
        .collect();
    (by_id, count)
}

fn request(id: i64, method: &str, params: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string()
}

fn initialize(id: i64) -> String {
    request(
        id,
        "initialize",
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.1"}
        }),
    )
}

fn tool_payload(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_session() {
    let dir = TempDir::new().unwrap();
    let lines = vec![
        initialize(1),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
        request(2, "tools/list", json!({})),
        request(
            3,
            "tools/call",
            json!({
                "name": "execute_query",
                "arguments": {"sql": "SELECT county_name FROM county_data ORDER BY county_name"},
                "_meta": {"correlationId": "corr-3"}
            }),
        ),
        request(
            4,
            "tools/call",
            json!({"name": "validate_sql_query", "arguments": {"sql": "DROP TABLE county_data"}}),
        ),
        request(5, "ping", json!({})),
        "{not json".to_string(),
        request(6, "tables/drop", json!({})),
        request(
            7,
            "execute_query",
            json!({"sql": "SELECT secret_col FROM county_data", "_meta": {"correlationId": "corr-7"}}),
        ),
        request(8, "resources/read", json!({"uri": "sqlgate://tables/county_data"})),
        request(9, "resources/list", json!({})),
        request(10, "tools/call", json!({"name": "drop_everything", "arguments": {}})),
        request(11, "tools/call", json!({"name": "execute_query", "arguments": {"query": "SELECT 1"}})),
    ];

    let (responses, count) = exchange(server(&dir).await, &lines).await;
    // Every request with an id plus the parse error; nothing for the notification.
    assert_eq!(count, 12);

    let init = &responses["1"]["result"];
    assert_eq!(init["protocolVersion"], "2024-11-05");
    assert_eq!(init["serverInfo"]["name"], "sqlgate");
    assert!(init["capabilities"]["tools"].is_object());
    assert!(init["capabilities"]["resources"].is_object());

    let tools: Vec<&str> = responses["2"]["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(tools, vec!["execute_query", "get_information_schema", "validate_sql_query"]);

    let executed = tool_payload(&responses["3"]);
    assert!(responses["3"]["result"].get("isError").is_none());
    assert_eq!(executed["rowCount"], 2);
    assert_eq!(executed["rows"][0]["county_name"], "Alameda");
    assert_eq!(executed["correlationId"], "corr-3");

    let validated = tool_payload(&responses["4"]);
    assert_eq!(validated["valid"], false);
    assert_eq!(validated["errorKind"], "StatementNotAllowed");

    assert_eq!(responses["5"]["result"], json!({}));

    assert_eq!(responses["null"]["error"]["code"], codes::PARSE_ERROR);
    assert_eq!(responses["6"]["error"]["code"], codes::METHOD_NOT_FOUND);

    let rejected = &responses["7"]["error"];
    assert_eq!(rejected["code"], codes::GATEWAY_ERROR);
    assert_eq!(rejected["data"]["errorKind"], "ColumnNotAllowed");
    assert_eq!(rejected["data"]["offendingToken"], "secret_col");
    assert_eq!(rejected["data"]["retryable"], false);
    assert_eq!(rejected["data"]["correlationId"], "corr-7");

    let contents = &responses["8"]["result"]["contents"][0];
    assert_eq!(contents["uri"], "sqlgate://tables/county_data");
    let table: Value = serde_json::from_str(contents["text"].as_str().unwrap()).unwrap();
    assert_eq!(table["rowCount"], 2);
    assert!(table["rows"][0].get("secret_col").is_none());

    let resources = responses["9"]["result"]["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 3);

    assert_eq!(responses["10"]["error"]["code"], codes::INVALID_PARAMS);

    let bad_args = &responses["11"]["result"];
    assert_eq!(bad_args["isError"], true);
    assert_eq!(tool_payload(&responses["11"])["errorKind"], "InvalidParams");

    // Validate/execute calls audited: 3, 4, 7, 8 (table view) and 11.
    let audit = std::fs::read_to_string(dir.path().join("audit.ndjson")).unwrap();
    assert_eq!(audit.lines().count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tools_require_initialize() {
    let dir = TempDir::new().unwrap();
    let lines = vec![
        request(1, "tools/call", json!({"name": "get_information_schema", "arguments": {}})),
        request(2, "get_information_schema", json!({})),
    ];

    let (responses, count) = exchange(server(&dir).await, &lines).await;
    assert_eq!(count, 2);
    assert_eq!(responses["1"]["error"]["code"], codes::NOT_INITIALIZED);

    let schema = &responses["2"]["result"];
    assert_eq!(
        schema["tables"]["county_data"]["columns"],
        json!(["state_name", "county_name", "population"])
    );
    assert_eq!(schema["maxRows"], 1000);
    assert!(schema["correlationId"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_jsonrpc_version() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir).await;

    let response = server
        .handle_line(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#)
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, codes::INVALID_REQUEST);

    let notification = server
        .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":3}}"#)
        .await;
    assert!(notification.is_none());
}
