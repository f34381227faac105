//! MCP JSON-RPC protocol handler over stdio.
//!
//! Reads line-delimited JSON-RPC 2.0 requests from stdin, routes each to
//! a handler on its own task, and writes whole-line responses through a
//! serialized writer. Non-whitelisted methods pass through the
//! idempotency ledger: a replayed fingerprint short-circuits to a
//! `cached` envelope and no side-effecting handler runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::execution::circuit::BreakerSet;
use crate::execution::ledger;
use crate::execution::retry::RetrySweeper;
use crate::mcp::handlers::BuiltinHost;
use crate::mcp::registry::{Tool, ToolRegistry};
use crate::mcp::template::{self, ToolError};
use crate::observability::MetricsHub;
use crate::storage::Storage;

/// Input buffer size: requests up to 1 MiB arrive without reallocation.
const STDIN_BUFFER: usize = 1024 * 1024;

/// Fallback tool timeout when a definition carries none.
const DEFAULT_TOOL_TIMEOUT_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// JSON-RPC message types
// ---------------------------------------------------------------------------

/// Incoming JSON-RPC request.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Outgoing JSON-RPC response.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(
        id: Option<Value>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Shared server state: every component a request handler can touch.
pub struct McpServer {
    pub storage: Storage,
    pub registry: Arc<ToolRegistry>,
    pub host: Arc<BuiltinHost>,
    pub breakers: Arc<BreakerSet>,
    pub retry: Arc<RetrySweeper>,
    pub metrics: Arc<MetricsHub>,
}

impl McpServer {
    pub fn new(
        storage: Storage,
        registry: Arc<ToolRegistry>,
        host: Arc<BuiltinHost>,
        breakers: Arc<BreakerSet>,
        retry: Arc<RetrySweeper>,
        metrics: Arc<MetricsHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            registry,
            host,
            breakers,
            retry,
            metrics,
        })
    }

    /// Read stdin until EOF or shutdown; each line gets its own task.
    /// Returns once the input loop has closed (in-flight handlers may
    /// still be draining; the supervisor waits on the task gauge).
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let stdin = BufReader::with_capacity(STDIN_BUFFER, tokio::io::stdin());
        let stdout: Arc<Mutex<tokio::io::Stdout>> = Arc::new(Mutex::new(tokio::io::stdout()));
        let mut lines = stdin.lines();

        info!("MCP server reading stdin");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("input loop stopped by shutdown signal");
                    break;
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(l)) => l,
                        Ok(None) => {
                            info!("stdin closed");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "stdin read failed");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }

                    let server = Arc::clone(&self);
                    let writer = Arc::clone(&stdout);
                    self.metrics.task_started();
                    tokio::spawn(async move {
                        let response = server.handle_line(&line).await;
                        if let Some(response) = response {
                            write_line(&writer, &response).await;
                        }
                        server.metrics.task_finished();
                    });
                }
            }
        }
    }

    /// Full per-line pipeline: parse, ledger check, route, ledger commit.
    /// `None` means the line was a notification and gets no response.
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let started = Instant::now();

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                self.metrics.request_failed();
                return Some(JsonRpcResponse::failure(
                    None,
                    -32700,
                    "Parse error",
                    Some(json!(e.to_string())),
                ));
            }
        };

        if request.jsonrpc != "2.0" {
            return request.id.clone().map(|id| {
                JsonRpcResponse::failure(Some(id), -32600, "Invalid JSON-RPC version", None)
            });
        }

        // Notifications are consumed without a response.
        if matches!(
            request.method.as_str(),
            "initialized" | "notifications/initialized" | "notifications/cancelled"
        ) {
            info!(method = %request.method, "notification");
            return None;
        }

        let fingerprint = ledger::request_fingerprint(&request.method, &request.params.to_string());

        if !ledger::is_exempt(&request.method) {
            match self.storage.check_processed(&fingerprint) {
                Ok(true) => {
                    return Some(JsonRpcResponse::success(
                        request.id.clone(),
                        ledger::cached_reply(),
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    self.metrics.request_failed();
                    return Some(JsonRpcResponse::failure(
                        request.id.clone(),
                        -32603,
                        "Internal error",
                        Some(json!(e.to_string())),
                    ));
                }
            }
        }

        let outcome = self.route(&request, &fingerprint).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.record_latency(latency_ms);

        let request_id_text = request
            .id
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();

        match outcome {
            Ok(result) => {
                self.metrics.request_succeeded();
                if !ledger::is_exempt(&request.method) {
                    let result_hash = ledger::result_fingerprint(&result);
                    if let Err(e) = self.storage.mark_processed(
                        &fingerprint,
                        &request_id_text,
                        &request.method,
                        "success",
                        &result_hash,
                        latency_ms as i64,
                    ) {
                        // A concurrent duplicate won the race; its verdict stands.
                        warn!(error = %e, "ledger insert failed");
                    }
                }
                Some(JsonRpcResponse::success(request.id, result))
            }
            Err(rpc) => {
                self.metrics.request_failed();
                if !ledger::is_exempt(&request.method) {
                    let _ = self.storage.mark_processed(
                        &fingerprint,
                        &request_id_text,
                        &request.method,
                        "failed",
                        "",
                        latency_ms as i64,
                    );
                }
                Some(JsonRpcResponse::failure(
                    request.id,
                    rpc.code,
                    rpc.message,
                    rpc.data,
                ))
            }
        }
    }

    /// Method routing.
    async fn route(
        &self,
        request: &JsonRpcRequest,
        fingerprint: &str,
    ) -> Result<Value, JsonRpcError> {
        match request.method.as_str() {
            "initialize" => Ok(initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list()),
            "tools/call" => self.tools_call(&request.params, fingerprint).await,
            "resources/list" => Ok(json!({"resources": []})),
            "prompts/list" => Ok(json!({"prompts": []})),
            other => Err(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: Some(json!(other)),
            }),
        }
    }

    /// Built-in descriptors first, then the SQL-backed catalog.
    fn tools_list(&self) -> Value {
        let mut tools = self.host.descriptors();
        tools.extend(self.registry.descriptors());
        json!({"tools": tools})
    }

    async fn tools_call(&self, params: &Value, fingerprint: &str) -> Result<Value, JsonRpcError> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(JsonRpcError {
                code: -32602,
                message: "Invalid params".into(),
                data: Some(json!("missing tool name")),
            });
        }
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        // Built-in master tools bypass the breaker/template machinery;
        // they classify their own failures.
        if BuiltinHost::is_builtin(&name) {
            return match self.host.execute(&name, &arguments).await {
                Ok(value) => Ok(content_envelope(&value)),
                Err(e) => Err(JsonRpcError {
                    code: -32000,
                    message: format!("{name} tool failed"),
                    data: Some(json!(e)),
                }),
            };
        }

        let Some(tool) = self.registry.get(&name) else {
            return Err(JsonRpcError {
                code: -32602,
                message: "Tool not found".into(),
                data: Some(json!(name)),
            });
        };

        let breaker = self.breakers.acquire(&name);
        if let Err(reason) = breaker.lock().unwrap().can_execute() {
            self.metrics
                .record_security_event("circuit_open", "warning", &reason);
            return Err(JsonRpcError {
                code: -32000,
                message: "Circuit breaker open".into(),
                data: Some(json!(name)),
            });
        }

        match self.execute_with_timeout(&tool, &arguments).await {
            Ok(result) => {
                breaker.lock().unwrap().record_success(&self.storage.execution);
                self.persist_result(fingerprint, &name, &result);
                Ok(content_envelope(&result))
            }
            Err(err) => {
                breaker.lock().unwrap().record_failure(&self.storage.execution);
                if let ToolError::ForbiddenPath(ref denied) = err {
                    self.metrics
                        .record_security_event("attach_denied", "warning", &denied.to_string());
                }
                if tool.retry_policy.retryable() && err.retryable() {
                    if let Err(e) = self.retry.enqueue(
                        fingerprint,
                        &name,
                        &arguments,
                        tool.retry_policy,
                        tool.max_retries,
                    ) {
                        warn!(error = %e, tool = %name, "retry enqueue failed");
                    }
                }
                Err(JsonRpcError {
                    code: -32000,
                    message: "Tool execution failed".into(),
                    data: Some(json!(err.to_string())),
                })
            }
        }
    }

    /// Run a tool's steps on a blocking thread, racing its timeout.
    async fn execute_with_timeout(
        &self,
        tool: &Arc<Tool>,
        arguments: &Value,
    ) -> Result<Value, ToolError> {
        let args = arguments.as_object().cloned().unwrap_or_default();
        let timeout_secs = if tool.timeout_seconds > 0 {
            tool.timeout_seconds
        } else {
            DEFAULT_TOOL_TIMEOUT_SECS
        };

        let storage = self.storage.clone();
        let tool = Arc::clone(tool);
        let handle =
            tokio::task::spawn_blocking(move || template::execute_steps(&storage, &tool.steps, &args));

        match tokio::time::timeout(Duration::from_secs(timeout_secs as u64), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ToolError::Sql {
                step: "execute".into(),
                message: format!("execution task failed: {join_err}"),
            }),
            Err(_) => Err(ToolError::Timeout {
                seconds: timeout_secs,
            }),
        }
    }

    /// Synchronous execution path used by the retry sweeper.
    pub fn execute_tool_by_name(&self, name: &str, params: &Value) -> Result<Value, String> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| format!("Tool not found: {name}"))?;
        let args = params.as_object().cloned().unwrap_or_default();
        template::execute_steps(&self.storage, &tool.steps, &args).map_err(|e| e.to_string())
    }

    /// Persist the serialized result keyed by its fingerprint.
    fn persist_result(&self, request_fingerprint: &str, tool_name: &str, result: &Value) {
        let serialized = result.to_string();
        let result_hash = ledger::result_fingerprint(result);
        self.storage.output.exec_or_log(
            "INSERT OR IGNORE INTO tool_results
                 (hash, request_id, tool_name, result_json, result_type)
             VALUES (?1, ?2, ?3, ?4, 'success')",
            &[&result_hash, &request_fingerprint, &tool_name, &serialized],
        );
    }
}

/// `initialize` result: protocol version and capabilities.
fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": {
            "name": "holow-mcp",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": {"listChanged": true},
            "resources": {"subscribe": false, "listChanged": false},
            "prompts": {"listChanged": false},
        },
    })
}

/// MCP content envelope around a serialized tool result.
fn content_envelope(result: &Value) -> Value {
    json!({
        "content": [
            {"type": "text", "text": result.to_string()}
        ]
    })
}

/// Serialize and write one whole response line; the writer lock keeps
/// concurrent handlers from interleaving output.
async fn write_line(writer: &Arc<Mutex<tokio::io::Stdout>>, response: &JsonRpcResponse) {
    let serialized = match serde_json::to_string(response) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "response serialization failed");
            return;
        }
    };
    let mut out = writer.lock().await;
    if let Err(e) = out.write_all(format!("{serialized}\n").as_bytes()).await {
        error!(error = %e, "failed to write response");
    }
    if let Err(e) = out.flush().await {
        error!(error = %e, "failed to flush stdout");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handlers::browser::{BrowserTools, UnavailableTransport};
    use crate::mcp::handlers::toolbox::ToolboxTools;

    fn test_server() -> (tempfile::TempDir, Arc<McpServer>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();

        let registry = Arc::new(ToolRegistry::new(storage.tools.clone()));
        registry.reload().unwrap();
        let breakers = Arc::new(BreakerSet::new(storage.execution.clone()));
        let retry = Arc::new(RetrySweeper::new(
            storage.execution.clone(),
            storage.output.clone(),
        ));
        let metrics = Arc::new(MetricsHub::new(
            storage.core.clone(),
            storage.metadata.clone(),
            storage.output.clone(),
        ));
        let browser = BrowserTools::new(Arc::new(UnavailableTransport), 9222);
        let toolbox = ToolboxTools::new(
            storage.clone(),
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&retry),
            Arc::clone(&metrics),
        );
        let host = BuiltinHost::new(browser, toolbox);

        let server = McpServer::new(storage, registry, host, breakers, retry, metrics);
        (dir, server)
    }

    fn result_text(response: &JsonRpcResponse) -> String {
        response.result.as_ref().unwrap()["content"][0]["text"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_initialize_shape() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "holow-mcp");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["capabilities"]["resources"]["subscribe"], false);
    }

    #[tokio::test]
    async fn test_parse_error_has_no_id() {
        let (_dir, server) = test_server();
        let resp = server.handle_line("this is not json").await.unwrap();
        assert!(resp.id.is_none());
        assert_eq!(resp.error.as_ref().unwrap().code, -32700);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":7,"method":"no/such","params":{}}"#)
            .await
            .unwrap();
        assert_eq!(resp.error.as_ref().unwrap().code, -32601);
        assert_eq!(resp.id, Some(json!(7)));
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let (_dir, server) = test_server();
        assert!(server
            .handle_line(r#"{"jsonrpc":"2.0","method":"initialized"}"#)
            .await
            .is_none());
        assert!(server
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{}}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_tools_list_concatenates_builtin_and_sql() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#)
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert!(names.contains(&"browser"));
        assert!(names.contains(&"brainloop"));
        assert!(names.contains(&"ping_db"));
        // Built-ins lead the list.
        assert_eq!(names[0], "browser");
    }

    #[tokio::test]
    async fn test_tools_call_seed_tool() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"ping_db","arguments":{}}}"#,
            )
            .await
            .unwrap();
        assert_eq!(result_text(&resp), "1");
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_cached() {
        let (_dir, server) = test_server();
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"ping_db","arguments":{}}}"#;

        let first = server.handle_line(line).await.unwrap();
        assert!(first.error.is_none());
        assert_eq!(result_text(&first), "1");

        let second = server.handle_line(line).await.unwrap();
        let result = second.result.unwrap();
        assert_eq!(result["cached"], true);
        assert_eq!(result["message"], "Request already processed");
    }

    #[tokio::test]
    async fn test_tools_list_replay_never_cached() {
        let (_dir, server) = test_server();
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#;
        for _ in 0..3 {
            let resp = server.handle_line(line).await.unwrap();
            let result = resp.result.unwrap();
            assert!(result.get("cached").is_none());
            assert!(result["tools"].is_array());
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"ghost","arguments":{}}}"#,
            )
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32602);
        assert_eq!(err.data, Some(json!("ghost")));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_failures() {
        let (_dir, server) = test_server();
        server
            .registry
            .create_tool(
                "always_fails",
                "broken on purpose",
                &json!({}),
                "custom",
                "SELECT * FROM table_that_does_not_exist",
                "test",
            )
            .unwrap();
        server.registry.force_reload().unwrap();

        for i in 0..5 {
            let line = format!(
                r#"{{"jsonrpc":"2.0","id":{i},"method":"tools/call","params":{{"name":"always_fails","arguments":{{"n":{i}}}}}}}"#
            );
            let resp = server.handle_line(&line).await.unwrap();
            let err = resp.error.unwrap();
            assert_eq!(err.code, -32000);
            assert_eq!(err.message, "Tool execution failed");
        }

        // Sixth call: breaker is open.
        let resp = server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":99,"method":"tools/call","params":{"name":"always_fails","arguments":{"n":99}}}"#,
            )
            .await
            .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "Circuit breaker open");

        // The rejection left a security event behind.
        let events: i64 = server
            .storage
            .core
            .with(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM telemetry_security_events WHERE event_type = 'circuit_open'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(events, 1);
    }

    #[tokio::test]
    async fn test_failed_tool_with_policy_enqueues_retry() {
        let (_dir, server) = test_server();
        server
            .registry
            .create_tool(
                "flaky",
                "fails but retryable",
                &json!({}),
                "custom",
                "SELECT * FROM missing_table",
                "test",
            )
            .unwrap();
        server
            .storage
            .tools
            .with(|c| {
                c.execute(
                    "UPDATE tool_definitions SET retry_policy = 'exponential', max_retries = 3
                     WHERE name = 'flaky'",
                    [],
                )
            })
            .unwrap();
        server.registry.force_reload().unwrap();

        server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"flaky","arguments":{}}}"#,
            )
            .await
            .unwrap();

        assert_eq!(server.retry.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_result_row_persisted_with_hash() {
        let (_dir, server) = test_server();
        server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"ping_db","arguments":{}}}"#,
            )
            .await
            .unwrap();

        let (tool, result_json): (String, String) = server
            .storage
            .output
            .with(|c| {
                c.query_row(
                    "SELECT tool_name, result_json FROM tool_results",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(tool, "ping_db");
        assert_eq!(result_json, "1");
    }

    #[tokio::test]
    async fn test_resources_and_prompts_empty() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"resources/list","params":{}}"#)
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["resources"], json!([]));

        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"prompts/list","params":{}}"#)
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["prompts"], json!([]));
    }

    #[tokio::test]
    async fn test_ping_answers_empty_object() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_builtin_route_takes_precedence() {
        let (_dir, server) = test_server();
        let resp = server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"brainloop","arguments":{"action":"list_actions"}}}"#,
            )
            .await
            .unwrap();
        assert!(result_text(&resp).contains("create_tool"));
    }

    #[tokio::test]
    async fn test_hot_reload_end_to_end() {
        let (_dir, server) = test_server();

        // Insert a new tool directly; the trigger raises the dirty flag.
        server
            .storage
            .tools
            .with(|c| {
                c.execute(
                    "INSERT INTO tool_definitions (name, description, input_schema)
                     VALUES ('ping_tool', 'returns one', '{}')",
                    [],
                )?;
                c.execute(
                    "INSERT INTO tool_implementations (tool_name, step_order, step_name, step_type, sql_template)
                     VALUES ('ping_tool', 1, 'execute', 'sql', 'SELECT 1 AS v')",
                    [],
                )
            })
            .unwrap();

        // Simulates one supervisor poll tick.
        assert!(server.registry.poll_dirty_and_reload());

        let resp = server
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#)
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().clone();
        assert!(tools.iter().any(|t| t["name"] == "ping_tool"));

        let resp = server
            .handle_line(
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"ping_tool","arguments":{}}}"#,
            )
            .await
            .unwrap();
        assert_eq!(result_text(&resp), "1");
    }
}
