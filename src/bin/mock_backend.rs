//! Scriptable stdio MCP server used by the integration tests.
//!
//! Speaks line-delimited JSON-RPC on stdin/stdout and answers requests
//! concurrently unless `MOCK_SEQUENTIAL` is set.
//!
//! # Environment Variables
//!
//! - `MOCK_NAME`: name reported in `serverInfo` (default: `mock`)
//! - `MOCK_TOOLS`: comma-separated tool names (default: `echo`)
//! - `MOCK_PROMPTS`: comma-separated prompt names (default: none)
//! - `MOCK_RESOURCES`: comma-separated resource names, served as `mock://<name>`
//! - `MOCK_FAIL_INIT`: when set, exit with status 3 on `initialize`
//! - `MOCK_SEQUENTIAL`: when set, answer one request at a time, so a
//!   pending `hang` leaves every later request unanswered
//!
//! # Tool behaviour
//!
//! - `hang`: never replies
//! - `crash`: exits the process with status 1
//! - `fail`: replies with a JSON-RPC error
//! - `slow`: echoes after 200ms
//! - `call_count`: replies with the number of earlier `tools/call` requests
//! - anything else: echoes its arguments as text content

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<serde_json::Value>,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

struct Mock {
    name: String,
    tools: Vec<String>,
    prompts: Vec<String>,
    resources: Vec<String>,
    fail_init: bool,
    calls: AtomicUsize,
    stdout: Mutex<tokio::io::Stdout>,
}

fn list_from_env(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mock = Arc::new(Mock {
        name: std::env::var("MOCK_NAME").unwrap_or_else(|_| "mock".to_string()),
        tools: list_from_env("MOCK_TOOLS", "echo"),
        prompts: list_from_env("MOCK_PROMPTS", ""),
        resources: list_from_env("MOCK_RESOURCES", ""),
        fail_init: std::env::var("MOCK_FAIL_INIT").is_ok(),
        calls: AtomicUsize::new(0),
        stdout: Mutex::new(tokio::io::stdout()),
    });
    let sequential = std::env::var("MOCK_SEQUENTIAL").is_ok();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("mock: unparseable line: {e}");
                continue;
            }
        };

        match (request.id, request.method.as_str()) {
            (None, "shutdown") => break,
            (None, _) => {}
            (Some(id), _) if sequential => mock.handle(id, &request.method, request.params).await,
            (Some(id), _) => {
                let mock = Arc::clone(&mock);
                tokio::spawn(async move { mock.handle(id, &request.method, request.params).await });
            }
        }
    }
}

impl Mock {
    async fn handle(&self, id: serde_json::Value, method: &str, params: serde_json::Value) {
        let outcome = match method {
            "initialize" => {
                if self.fail_init {
                    eprintln!("mock: refusing to initialize");
                    std::process::exit(3);
                }
                Ok(serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
                    "serverInfo": { "name": self.name, "version": "0.0.0" },
                }))
            }
            "tools/list" => Ok(serde_json::json!({
                "tools": self.tools.iter().map(|name| serde_json::json!({
                    "name": name,
                    "description": format!("mock tool {name}"),
                    "inputSchema": { "type": "object" },
                })).collect::<Vec<_>>(),
            })),
            "resources/list" => Ok(serde_json::json!({
                "resources": self.resources.iter().map(|name| serde_json::json!({
                    "uri": format!("mock://{name}"),
                    "name": name,
                })).collect::<Vec<_>>(),
            })),
            "prompts/list" => Ok(serde_json::json!({
                "prompts": self.prompts.iter().map(|name| serde_json::json!({
                    "name": name,
                    "arguments": [{ "name": "topic" }],
                })).collect::<Vec<_>>(),
            })),
            "tools/call" => self.call_tool(&params).await,
            "resources/read" => {
                let uri = params["uri"].as_str().unwrap_or_default();
                Ok(serde_json::json!({
                    "contents": [{ "uri": uri, "text": format!("contents of {uri}") }],
                }))
            }
            "prompts/get" => Ok(serde_json::json!({
                "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": params["arguments"].to_string() },
                }],
            })),
            other => Err((-32601, format!("method not found: {other}"))),
        };

        let response = match outcome {
            Ok(result) => Response {
                jsonrpc: "2.0",
                id,
                result: Some(result),
                error: None,
            },
            Err((code, message)) => Response {
                jsonrpc: "2.0",
                id,
                result: None,
                error: Some(serde_json::json!({ "code": code, "message": message })),
            },
        };
        self.write(&response).await;
    }

    async fn call_tool(&self, params: &serde_json::Value) -> Result<serde_json::Value, (i32, String)> {
        let previous = self.calls.fetch_add(1, Ordering::SeqCst);
        let name = params["name"].as_str().unwrap_or_default();
        let arguments = params.get("arguments").cloned().unwrap_or(serde_json::Value::Null);

        match name {
            "hang" => std::future::pending().await,
            "crash" => {
                eprintln!("mock: crashing on request");
                std::process::exit(1);
            }
            "fail" => Err((-32000, "tool failed on purpose".to_string())),
            "call_count" => Ok(text_content(previous.to_string())),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(text_content(arguments.to_string()))
            }
            known if self.tools.iter().any(|t| t == known) => Ok(text_content(arguments.to_string())),
            unknown => Err((-32602, format!("unknown tool: {unknown}"))),
        }
    }

    async fn write(&self, response: &Response) {
        let Ok(mut line) = serde_json::to_string(response) else {
            return;
        };
        line.push('\n');
        let mut stdout = self.stdout.lock().await;
        let _ = stdout.write_all(line.as_bytes()).await;
        let _ = stdout.flush().await;
    }
}

fn text_content(text: String) -> serde_json::Value {
    serde_json::json!({ "content": [{ "type": "text", "text": text }] })
}
