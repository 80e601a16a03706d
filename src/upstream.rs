//! Agent-facing stdio server.
//!
//! Speaks line-delimited MCP-style JSON-RPC and advertises exactly two
//! tools, `get_metadata` and `run_tool`, both backed by the [`Router`].
//! Requests are handled concurrently. `notifications/cancelled` aborts the
//! named request, and end of input aborts everything still in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::{AbortHandle, JoinSet};

use crate::backend::types::{error_codes, JsonRpcError, PROTOCOL_VERSION};
use crate::router::{Router, ToolResult};

pub const GET_METADATA_TOOL: &str = "get_metadata";
pub const RUN_TOOL_TOOL: &str = "run_tool";

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// Any message the agent may send.
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Outgoing {
    jsonrpc: &'static str,
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl Outgoing {
    fn result(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: serde_json::Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RunToolArguments {
    name: String,
    #[serde(default)]
    arguments: Option<serde_json::Value>,
}

/// Definitions returned by `tools/list`.
pub fn tool_definitions() -> serde_json::Value {
    serde_json::json!([
        {
            "name": GET_METADATA_TOOL,
            "description": "List every capability exposed through the gateway, with the state of the server that owns it.",
            "inputSchema": { "type": "object", "properties": {} },
        },
        {
            "name": RUN_TOOL_TOOL,
            "description": "Run a capability listed by get_metadata. Requests and responses pass through the configured guardrails.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Capability name from get_metadata" },
                    "arguments": { "type": "object", "description": "Arguments for the capability" },
                },
                "required": ["name"],
            },
        },
    ])
}

// ─── Server ──────────────────────────────────────────────────────────────────

type SharedWriter<W> = Arc<tokio::sync::Mutex<W>>;
type InFlight = Arc<Mutex<HashMap<String, AbortHandle>>>;

/// Serve the agent until its input closes.
///
/// On return every in-flight call has been aborted; the caller is expected
/// to shut the gateway down.
pub async fn serve<R, W>(router: Arc<Router>, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(tokio::sync::Mutex::new(writer));
    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        handle_line(line, &router, &writer, &in_flight, &mut tasks).await?;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read from agent");
                    break;
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    let aborted = tasks.len();
    tasks.shutdown().await;
    if aborted > 0 {
        tracing::info!(aborted, "agent disconnected, aborted in-flight calls");
    } else {
        tracing::info!("agent disconnected");
    }
    Ok(())
}

async fn handle_line<W>(
    line: &str,
    router: &Arc<Router>,
    writer: &SharedWriter<W>,
    in_flight: &InFlight,
    tasks: &mut JoinSet<()>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let message: Incoming = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "malformed message from agent");
            let reply = Outgoing::error(
                serde_json::Value::Null,
                error_codes::PARSE_ERROR,
                format!("parse error: {e}"),
            );
            return write_message(writer, &reply).await;
        }
    };

    let Some(method) = message.method else {
        // A reply to something we never send; nothing to do.
        return Ok(());
    };

    let Some(id) = message.id else {
        handle_notification(&method, message.params, in_flight);
        return Ok(());
    };

    match method.as_str() {
        "initialize" => {
            let requested = message
                .params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(|v| v.as_str())
                .unwrap_or(PROTOCOL_VERSION)
                .to_string();
            let result = serde_json::json!({
                "protocolVersion": requested,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "mcp-gateway",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            write_message(writer, &Outgoing::result(id, result)).await
        }
        "ping" => write_message(writer, &Outgoing::result(id, serde_json::json!({}))).await,
        "tools/list" => {
            let result = serde_json::json!({ "tools": tool_definitions() });
            write_message(writer, &Outgoing::result(id, result)).await
        }
        "tools/call" => {
            spawn_call(router, writer, in_flight, tasks, id, message.params);
            Ok(())
        }
        other => {
            let reply = Outgoing::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            );
            write_message(writer, &reply).await
        }
    }
}

/// Run one `tools/call` on its own task, registered under its request id
/// so it can be cancelled.
fn spawn_call<W>(
    router: &Arc<Router>,
    writer: &SharedWriter<W>,
    in_flight: &InFlight,
    tasks: &mut JoinSet<()>,
    id: serde_json::Value,
    params: Option<serde_json::Value>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let key = id.to_string();
    let router = Arc::clone(router);
    let writer = Arc::clone(writer);
    let registry = Arc::clone(in_flight);
    let task_key = key.clone();

    // Holding the lock across spawn + insert orders the task's own removal
    // after the insert.
    let mut map = lock(in_flight);
    let handle = tasks.spawn(async move {
        let reply = call_tool(&router, id, params).await;
        lock(&registry).remove(&task_key);
        if let Err(e) = write_message(&writer, &reply).await {
            tracing::warn!(error = %e, "failed to write reply to agent");
        }
    });
    map.insert(key, handle);
}

fn handle_notification(method: &str, params: Option<serde_json::Value>, in_flight: &InFlight) {
    match method {
        "notifications/cancelled" => {
            let Some(request_id) = params.as_ref().and_then(|p| p.get("requestId")) else {
                return;
            };
            if let Some(handle) = lock(in_flight).remove(&request_id.to_string()) {
                handle.abort();
                tracing::info!(request_id = %request_id, "call cancelled by agent");
            }
        }
        "notifications/initialized" => tracing::debug!("agent initialized"),
        other => tracing::debug!(method = other, "ignoring notification"),
    }
}

/// Execute one `tools/call` against the gateway's two tools.
async fn call_tool(router: &Router, id: serde_json::Value, params: Option<serde_json::Value>) -> Outgoing {
    let params: ToolCallParams = match params.map(serde_json::from_value).transpose() {
        Ok(Some(params)) => params,
        Ok(None) => {
            return Outgoing::error(id, error_codes::INVALID_PARAMS, "missing params");
        }
        Err(e) => {
            return Outgoing::error(id, error_codes::INVALID_PARAMS, format!("invalid params: {e}"));
        }
    };

    match params.name.as_str() {
        GET_METADATA_TOOL => {
            let metadata = router.get_metadata();
            let value = serde_json::to_value(&metadata).unwrap_or_default();
            Outgoing::result(id, tool_content(value, false))
        }
        RUN_TOOL_TOOL => {
            let arguments = params.arguments.unwrap_or_else(|| serde_json::json!({}));
            let run: RunToolArguments = match serde_json::from_value(arguments) {
                Ok(run) => run,
                Err(e) => {
                    return Outgoing::error(
                        id,
                        error_codes::INVALID_PARAMS,
                        format!("invalid run_tool arguments: {e}"),
                    );
                }
            };
            let arguments = run.arguments.unwrap_or_else(|| serde_json::json!({}));
            let result: ToolResult = router.run_tool(&run.name, arguments).await;
            let is_error = !result.success;
            let value = serde_json::to_value(&result).unwrap_or_default();
            Outgoing::result(id, tool_content(value, is_error))
        }
        other => Outgoing::error(id, error_codes::INVALID_PARAMS, format!("unknown tool: {other}")),
    }
}

/// Wrap a JSON payload as an MCP tool result.
fn tool_content(value: serde_json::Value, is_error: bool) -> serde_json::Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "structuredContent": value,
        "isError": is_error,
    })
}

async fn write_message<W>(writer: &SharedWriter<W>, message: &Outgoing) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(message).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
