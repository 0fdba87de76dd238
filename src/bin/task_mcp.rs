//! MCP server exposing task delegation and broadcast tools.
//!
//! Communicates over stdio using JSON-RPC 2.0. The calling session is taken
//! from the `session_id` tool argument, falling back to `OPENCODE_SESSION_ID`.
//!
//! Each `tools/call` runs as its own task on the runtime, so a sync
//! `create_task` does not hold up other calls. Responses may therefore
//! arrive out of request order; clients match them by `id`. A single
//! writer thread owns stdout.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use opencode_tasks::broadcast::DeliveryStatus;
use opencode_tasks::notifier::CompletionNotifier;
use opencode_tasks::{Config, DeliveryCache, OpenCodeClient, TaskTools, ToolContext};

// =============================================================================
// JSON-RPC Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// =============================================================================
// MCP Types
// =============================================================================

#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ToolResult {
    content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ToolResult {
    fn text(text: String, is_error: bool) -> Self {
        Self {
            content: vec![ToolContent::Text { text }],
            is_error,
        }
    }

    fn json<T: Serialize>(value: &T, is_error: bool) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(text) => Self::text(text, is_error),
            Err(e) => Self::text(format!("Failed to serialize result: {}", e), true),
        }
    }
}

// =============================================================================
// Tool Registry
// =============================================================================

fn work_dir_schema() -> Value {
    json!({
        "type": "string",
        "description": "Project directory to resolve sessions in. Defaults to the current workspace."
    })
}

fn session_id_schema() -> Value {
    json!({
        "type": "string",
        "description": "Calling session id. Defaults to OPENCODE_SESSION_ID."
    })
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "broadcast",
            description: "Share a short notice with sibling and/or child tasks. Delivered as context; it does not interrupt them.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Notice to share (capped at the configured length)." },
                    "category": { "type": "string", "enum": ["discovery", "warning", "context", "blocker"] },
                    "target": { "type": "string", "enum": ["siblings", "children", "all"], "default": "siblings" },
                    "work_dir": work_dir_schema(),
                    "session_id": session_id_schema()
                },
                "required": ["message", "category"]
            }),
        },
        ToolDefinition {
            name: "cancel_task",
            description: "Abort a running child or sibling task.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "work_dir": work_dir_schema(),
                    "session_id": session_id_schema()
                },
                "required": ["task_id"]
            }),
        },
        ToolDefinition {
            name: "create_task",
            description: "Run a prompt in a new child session with the given agent. Synchronous tasks deliver their output as your next message; async tasks return immediately with a task id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string", "description": "Short label for the task." },
                    "agent": { "type": "string", "description": "Agent to run the task with." },
                    "prompt": { "type": "string", "description": "Instructions for the task." },
                    "async": { "type": "boolean", "default": false },
                    "timeout_ms": { "type": "integer", "minimum": 0 },
                    "work_dir": work_dir_schema(),
                    "session_id": session_id_schema()
                },
                "required": ["title", "agent", "prompt"]
            }),
        },
        ToolDefinition {
            name: "get_task_output",
            description: "Collect the latest output of a child or sibling task. The output arrives as your next message.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "wait": { "type": "boolean", "default": false, "description": "Wait for the task to finish." },
                    "timeout_ms": { "type": "integer", "minimum": 0 },
                    "work_dir": work_dir_schema(),
                    "session_id": session_id_schema()
                },
                "required": ["task_id"]
            }),
        },
        ToolDefinition {
            name: "read_broadcasts",
            description: "List broadcasts found in this session's history or its children's, newest first.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "category": { "type": "string", "enum": ["discovery", "warning", "context", "blocker"] },
                    "limit": { "type": "integer", "minimum": 0, "default": 10 },
                    "source": { "type": "string", "enum": ["self", "children"], "default": "self" },
                    "work_dir": work_dir_schema(),
                    "session_id": session_id_schema()
                }
            }),
        },
        ToolDefinition {
            name: "send_task_message",
            description: "Send a follow-up message to a child or sibling task. With no_reply the message is appended without starting a new turn.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "message": { "type": "string" },
                    "no_reply": { "type": "boolean", "default": false },
                    "work_dir": work_dir_schema(),
                    "session_id": session_id_schema()
                },
                "required": ["task_id", "message"]
            }),
        },
    ]
}

fn parse_args<T: DeserializeOwned>(name: &str, args: &Value) -> Result<T, ToolResult> {
    serde_json::from_value(args.clone())
        .map_err(|e| ToolResult::text(format!("Invalid arguments for {}: {}", name, e), true))
}

fn caller_context(args: &Value, workspace: &RwLock<Option<String>>) -> Option<ToolContext> {
    let session_id = args
        .get("session_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| std::env::var("OPENCODE_SESSION_ID").ok())
        .filter(|id| !id.trim().is_empty())?;
    let work_dir = workspace.read().ok().and_then(|guard| guard.clone());
    Some(ToolContext::new(session_id).with_work_dir(work_dir))
}

async fn execute_tool(tools: &TaskTools, ctx: &ToolContext, name: &str, args: &Value) -> ToolResult {
    tracing::debug!(tool = name, session_id = %ctx.session_id, "Tool call");
    dispatch(tools, ctx, name, args)
        .await
        .unwrap_or_else(|err| err)
}

async fn dispatch(
    tools: &TaskTools,
    ctx: &ToolContext,
    name: &str,
    args: &Value,
) -> Result<ToolResult, ToolResult> {
    let result = match name {
        "create_task" => {
            let result = tools.create_task(ctx, parse_args(name, args)?).await;
            ToolResult::json(&result, result.code().is_some())
        }
        "get_task_output" => {
            let result = tools.get_task_output(ctx, parse_args(name, args)?).await;
            ToolResult::json(&result, result.code().is_some())
        }
        "send_task_message" => {
            let result = tools.send_task_message(ctx, parse_args(name, args)?).await;
            ToolResult::json(&result, result.code().is_some())
        }
        "cancel_task" => {
            let result = tools.cancel_task(ctx, parse_args(name, args)?).await;
            ToolResult::json(&result, result.code().is_some())
        }
        "broadcast" => {
            let outcome = tools.broadcast(ctx, parse_args(name, args)?).await;
            ToolResult::json(&outcome, outcome.status == DeliveryStatus::Failed)
        }
        "read_broadcasts" => {
            let result = tools.read_broadcasts(ctx, parse_args(name, args)?).await;
            ToolResult::json(&result, result.is_failed())
        }
        other => return Err(ToolResult::text(format!("Unknown tool: {}", other), true)),
    };
    Ok(result)
}

fn extract_workspace_from_initialize(params: &Value) -> Option<PathBuf> {
    if let Some(path) = params.get("rootPath").and_then(|v| v.as_str()) {
        return Some(PathBuf::from(path));
    }

    if let Some(uri) = params.get("rootUri").and_then(|v| v.as_str()) {
        if let Some(path) = uri.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
    }

    if let Some(folders) = params.get("workspaceFolders").and_then(|v| v.as_array()) {
        for folder in folders {
            if let Some(uri) = folder.get("uri").and_then(|v| v.as_str()) {
                if let Some(path) = uri.strip_prefix("file://") {
                    return Some(PathBuf::from(path));
                }
            }
        }
    }

    None
}

/// Answer `request`. Tool calls are spawned and answer through `responses`
/// when they finish, so they return `None` here.
fn handle_request(
    request: &JsonRpcRequest,
    runtime: &tokio::runtime::Runtime,
    tools: &TaskTools,
    workspace: &RwLock<Option<String>>,
    responses: &mpsc::Sender<JsonRpcResponse>,
) -> Option<JsonRpcResponse> {
    match request.method.as_str() {
        "initialize" => {
            if let Some(path) = extract_workspace_from_initialize(&request.params) {
                tracing::info!("Workspace: {}", path.display());
                if let Ok(mut guard) = workspace.write() {
                    *guard = Some(path.to_string_lossy().to_string());
                }
            }
            Some(JsonRpcResponse::success(
                request.id.clone(),
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {
                        "name": "task-mcp",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {
                        "tools": {
                            "listChanged": false
                        }
                    }
                }),
            ))
        }
        "notifications/initialized" | "initialized" => None,
        "tools/list" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({ "tools": tool_definitions() }),
        )),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(json!({}));
            // Resolve the caller now, so a later `initialize` cannot change it
            let Some(ctx) = caller_context(&args, workspace) else {
                let result = ToolResult::text(
                    "No calling session: pass session_id or set OPENCODE_SESSION_ID".to_string(),
                    true,
                );
                return Some(JsonRpcResponse::success(request.id.clone(), json!(result)));
            };

            let tools = tools.clone();
            let responses = responses.clone();
            let id = request.id.clone();
            let name = name.to_string();
            runtime.spawn(async move {
                let result = execute_tool(&tools, &ctx, &name, &args).await;
                if responses
                    .send(JsonRpcResponse::success(id, json!(result)))
                    .is_err()
                {
                    tracing::warn!(tool = %name, "Response dropped, writer has stopped");
                }
            });
            None
        }
        _ => Some(JsonRpcResponse::error(
            request.id.clone(),
            -32601,
            format!("Method not found: {}", request.method),
        )),
    }
}

fn write_response(stdout: &mut std::io::Stdout, response: &JsonRpcResponse) {
    if let Ok(resp) = serde_json::to_string(response) {
        let _ = writeln!(stdout, "{}", resp);
        let _ = stdout.flush();
    }
}

fn main() -> anyhow::Result<()> {
    // stdout carries JSON-RPC, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_dir = std::env::var("TASK_CONFIG_DIR").ok().map(PathBuf::from);
    let config = Arc::new(Config::load(config_dir.as_deref()));
    tracing::info!(opencode_url = %config.opencode_url, "Starting task MCP server");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let client = Arc::new(OpenCodeClient::new(config.opencode_url.clone(), None));
    let cache = Arc::new(DeliveryCache::from_config(&config.cache));
    let mut tools = TaskTools::new(client.clone(), config.clone(), cache.clone());

    if config.notify_completion {
        match runtime.block_on(client.subscribe_events()) {
            Ok((events, _stream)) => {
                let notifier = Arc::new(CompletionNotifier::new(
                    client.clone(),
                    cache,
                    tools.registry(),
                    config.cache.capacity,
                ));
                runtime.spawn(notifier.clone().run(events));
                tools = tools.with_notifier(notifier);
            }
            Err(e) => tracing::warn!("Completion notices disabled: {:#}", e),
        }
    }

    let (responses, outbox) = mpsc::channel::<JsonRpcResponse>();
    let writer = std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        for response in outbox {
            write_response(&mut stdout, &response);
        }
    });

    let workspace = RwLock::new(None);
    let stdin = std::io::stdin();
    let reader = BufReader::new(stdin.lock());

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let _ = responses.send(JsonRpcResponse::error(Value::Null, -32700, e.to_string()));
                continue;
            }
        };

        if let Some(response) = handle_request(&request, &runtime, &tools, &workspace, &responses)
        {
            let _ = responses.send(response);
        }
    }

    // Stdin closed: in-flight calls are dropped with the runtime, then the
    // writer drains what was already answered.
    drop(responses);
    drop(runtime);
    if writer.join().is_err() {
        tracing::warn!("Response writer panicked");
    }

    Ok(())
}
