//! mcp.rs - stdio JSON-RPC 适配层
//!
//! 协议外壳保持最薄: 解析一行请求、路由到工具或资源、写回一行响应。
//! 工具执行放在独立任务里, 任何错误(包括 panic)都折叠成统一的错误信封,
//! 绝不向 MCP 客户端抛裸异常。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Result, SplunkMcpError};
use crate::executor::QueryExecutor;
use crate::session::SessionManager;
use crate::summary::ResponseFormatter;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

/// 工具与资源背后的组件集合。构造一次, 整个 stdio 循环共享。
pub struct McpServer {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    executor: QueryExecutor,
    formatter: ResponseFormatter,
}

impl McpServer {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionManager>) -> Self {
        let executor = QueryExecutor::new(config.clone(), sessions.clone());
        Self {
            config,
            sessions,
            executor,
            formatter: ResponseFormatter::new(),
        }
    }

    /// 执行一个工具并返回文本载荷。所有失败都渲染成
    /// `{status, tool, error, message}` 信封, 这里绝不返回 Err。
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> String {
        match self.dispatch_tool(name, arguments).await {
            Ok(text) => text,
            Err(e) => {
                error!(tool = name, error = %e, "tool execution failed");
                tool_error_envelope(name, &e)
            }
        }
    }

    async fn dispatch_tool(&self, name: &str, arguments: &Value) -> Result<String> {
        info!(tool = name, "executing tool");
        match name {
            "get_index_for_environment" => {
                let environment = require_str_arg(arguments, "environment")?;
                let index = self.config.index_for_environment(&environment)?;
                Ok(self
                    .formatter
                    .format_environment_index_response(&environment, index))
            }
            "check_connection" => {
                let status = self.sessions.check_connection().await;
                Ok(self.formatter.format_connection_response(&status))
            }
            "execute_query" => {
                let query = unescape_query(&require_str_arg(arguments, "query")?);
                let earliest = optional_str_arg(arguments, "earliest_time");
                let latest = optional_str_arg(arguments, "latest_time");
                let max_results = arguments
                    .get("max_results")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize);

                let envelope = self
                    .executor
                    .execute(&query, earliest, latest, max_results, None)
                    .await;
                let qs = &self.config.query_settings;
                Ok(self.formatter.format_query_response(
                    &envelope,
                    qs.include_raw_events,
                    qs.page_size,
                ))
            }
            "get_available_indexes" => {
                let indexes = self.executor.get_indexes().await;
                Ok(self.formatter.format_indexes_response(&indexes))
            }
            "get_sourcetypes" => {
                let index = optional_str_arg(arguments, "index");
                let sourcetypes = self.executor.get_sourcetypes(index.as_deref()).await;
                Ok(self
                    .formatter
                    .format_sourcetypes_response(&sourcetypes, index.as_deref()))
            }
            other => Err(SplunkMcpError::InvalidRequest(format!(
                "unknown tool: {other}"
            ))),
        }
    }

    fn read_resource(&self, uri: &str) -> Result<String> {
        match uri {
            "splunk://config" => {
                let view = self.config.sanitized()?;
                Ok(serde_json::to_string_pretty(&view)?)
            }
            "splunk://environments" => {
                let mut envs = serde_json::Map::new();
                for env in self.config.list_environments() {
                    let index = self.config.index_for_environment(&env)?;
                    envs.insert(env, json!({ "index": index }));
                }
                Ok(serde_json::to_string_pretty(&Value::Object(envs))?)
            }
            other => Err(SplunkMcpError::InvalidRequest(format!(
                "unknown resource: {other}"
            ))),
        }
    }
}

pub async fn run_stdio(server: Arc<McpServer>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let req: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                write_response(
                    &mut stdout,
                    RpcResponse {
                        jsonrpc: "2.0",
                        id: Value::Null,
                        result: None,
                        error: Some(RpcError {
                            code: -32700,
                            message: format!("parse error: {e}"),
                        }),
                    },
                )
                .await?;
                continue;
            }
        };

        let resp = match req.method.as_str() {
            "initialize" => handle_initialize(&req),
            "notifications/initialized" => {
                // 通知没有 id, 不需要应答; 带 id 的按普通请求确认。
                if req.id.is_null() {
                    continue;
                }
                RpcResponse {
                    jsonrpc: "2.0",
                    id: req.id,
                    result: Some(Value::Bool(true)),
                    error: None,
                }
            }
            "tools/list" => handle_list_tools(&req),
            "tools/call" => handle_call_tool(&server, &req).await,
            "resources/list" => handle_list_resources(&req),
            "resources/read" => handle_read_resource(&server, &req),
            _ => RpcResponse {
                jsonrpc: "2.0",
                id: req.id,
                result: None,
                error: Some(RpcError {
                    code: -32601,
                    message: format!("method not found: {}", req.method),
                }),
            },
        };

        write_response(&mut stdout, resp).await?;
    }

    Ok(())
}

fn handle_initialize(req: &RpcRequest) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id: req.id.clone(),
        result: Some(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {},
                "resources": {}
            },
            "serverInfo": {
                "name": "splunk-search-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
        error: None,
    }
}

async fn handle_call_tool(server: &Arc<McpServer>, req: &RpcRequest) -> RpcResponse {
    let name = match req.params.get("name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => return rpc_error(req, -32602, "tools/call requires a tool name".to_string()),
    };
    let arguments = req.params.get("arguments").cloned().unwrap_or(json!({}));

    // 在独立任务里跑, 即使工具 panic 也能降级成错误信封。
    let task_server = server.clone();
    let task_name = name.clone();
    let handle = tokio::spawn(async move { task_server.call_tool(&task_name, &arguments).await });
    let text = match handle.await {
        Ok(text) => text,
        Err(e) => {
            error!(tool = %name, error = %e, "tool task aborted");
            tool_error_envelope(
                &name,
                &SplunkMcpError::Internal(format!("tool task aborted: {e}")),
            )
        }
    };

    RpcResponse {
        jsonrpc: "2.0",
        id: req.id.clone(),
        result: Some(json!({
            "content": [{ "type": "text", "text": text }]
        })),
        error: None,
    }
}

fn handle_list_resources(req: &RpcRequest) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id: req.id.clone(),
        result: Some(json!({
            "resources": [
                {
                    "uri": "splunk://config",
                    "name": "Current Configuration",
                    "description": "View current Splunk MCP configuration (sanitized)",
                    "mimeType": "application/json"
                },
                {
                    "uri": "splunk://environments",
                    "name": "Available Environments",
                    "description": "List configured Splunk environments",
                    "mimeType": "application/json"
                }
            ]
        })),
        error: None,
    }
}

fn handle_read_resource(server: &McpServer, req: &RpcRequest) -> RpcResponse {
    let uri = match req.params.get("uri").and_then(Value::as_str) {
        Some(uri) => uri,
        None => return rpc_error(req, -32602, "resources/read requires a uri".to_string()),
    };
    match server.read_resource(uri) {
        Ok(text) => RpcResponse {
            jsonrpc: "2.0",
            id: req.id.clone(),
            result: Some(json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": text
                }]
            })),
            error: None,
        },
        Err(e) => rpc_error(req, -32002, e.to_string()),
    }
}

async fn write_response(stdout: &mut tokio::io::Stdout, resp: RpcResponse) -> Result<()> {
    let line = serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string());
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

fn rpc_error(req: &RpcRequest, code: i32, message: String) -> RpcResponse {
    RpcResponse {
        jsonrpc: "2.0",
        id: req.id.clone(),
        result: None,
        error: Some(RpcError { code, message }),
    }
}

/// 统一错误信封。message 按错误类别给操作者可读的指引。
fn tool_error_envelope(tool: &str, err: &SplunkMcpError) -> String {
    let message = match err {
        SplunkMcpError::ConfigMissing(_) => {
            "Configuration file not found. Please ensure config.yml exists and is properly configured."
                .to_string()
        }
        SplunkMcpError::InvalidRequest(e) => format!("Invalid parameters: {e}"),
        SplunkMcpError::AuthFailed(_) | SplunkMcpError::ConnectFailed { .. } => {
            "Failed to connect to Splunk. Check your configuration and network.".to_string()
        }
        other => format!("Failed to execute {tool}: {other}"),
    };
    serde_json::to_string_pretty(&json!({
        "status": "error",
        "tool": tool,
        "error": err.to_string(),
        "message": message,
    }))
    .unwrap_or_else(|_| "{}".to_string())
}

fn require_str_arg(arguments: &Value, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| SplunkMcpError::InvalidRequest(format!("{key} parameter is required")))
}

fn optional_str_arg(arguments: &Value, key: &str) -> Option<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// 有些 MCP 客户端会把引号二次转义后再发过来, 这里还原。
fn unescape_query(query: &str) -> String {
    if query.contains("\\\"") {
        let unescaped = query.replace("\\\"", "\"");
        info!(query = %unescaped, "unescaped over-escaped query");
        unescaped
    } else {
        query.to_string()
    }
}

fn handle_list_tools(req: &RpcRequest) -> RpcResponse {
    let tools = vec![
        json!({
            "name": "get_index_for_environment",
            "description": "Get the index name for a specific environment (UAT or PROD). Use this first to determine which index to use for your queries.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "environment": {
                        "type": "string",
                        "description": "Environment to get index for (uat or prod)",
                        "enum": ["uat", "prod"]
                    }
                },
                "required": ["environment"]
            }
        }),
        json!({
            "name": "check_connection",
            "description": "Check connection status to Splunk server. Returns server info and available indexes.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "required": []
            }
        }),
        json!({
            "name": "execute_query",
            "description": "Execute a Splunk SPL query. Use the index from get_index_for_environment. To filter by sourcetype, first use get_sourcetypes to find available sourcetypes, then add 'sourcetype=your_sourcetype' to your query. Supports time ranges and pagination.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "SPL query to execute (e.g., 'index=index_app_uat sourcetype=trade_server order_id=ABC')"
                    },
                    "earliest_time": {
                        "type": "string",
                        "description": "Earliest time for search (e.g., '-2d' for last 2 days, '-7d', '2024-01-01T00:00:00')",
                        "default": "-30d"
                    },
                    "latest_time": {
                        "type": "string",
                        "description": "Latest time for search (e.g., 'now', '-1h', '2024-01-01T23:59:59')",
                        "default": "now"
                    },
                    "max_results": {
                        "type": "integer",
                        "description": "Maximum number of results to return (default from config)",
                        "minimum": 1,
                        "maximum": 50000
                    }
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "get_available_indexes",
            "description": "Get list of all available indexes in Splunk.",
            "inputSchema": {
                "type": "object",
                "properties": {},
                "required": []
            }
        }),
        json!({
            "name": "get_sourcetypes",
            "description": "Get list of available sourcetypes from Splunk, optionally filtered by index. Use this to discover what sourcetypes are available, then include 'sourcetype=your_sourcetype' in your execute_query calls.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "index": {
                        "type": "string",
                        "description": "Optional index to filter sourcetypes"
                    }
                },
                "required": []
            }
        }),
    ];

    RpcResponse {
        jsonrpc: "2.0",
        id: req.id.clone(),
        result: Some(json!({ "tools": tools })),
        error: None,
    }
}
