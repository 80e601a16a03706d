//! Server process lifecycle management.
//!
//! Handles spawning, handshaking, introspecting, and shutting down a single
//! backend child process. Each server runs as a separate OS process
//! communicating via JSON-RPC over stdio. The supervisor composes these
//! primitives into monitoring and restart.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use super::errors::BackendError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    InitializeResult, PromptDefinition, PromptsListResult, ResourceDefinition,
    ResourcesListResult, ServerConfig, ServerInfo, ToolDefinition, ToolsListResult,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default maximum restart attempts before giving up on a server.
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Default base delay between restart attempts (doubles each time).
pub const DEFAULT_RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on a single restart delay.
pub const DEFAULT_RESTART_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default uptime after which a crash no longer counts against earlier ones.
pub const DEFAULT_RESTART_RESET_AFTER: Duration = Duration::from_secs(60);

/// How long to wait for a failed child to flush stderr before reporting.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

// ─── Restart Policy ──────────────────────────────────────────────────────────

/// Bounded exponential backoff for restarting crashed servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A server that stayed up this long before exiting starts a fresh
    /// attempt budget.
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            base_delay: DEFAULT_RESTART_BASE_DELAY,
            max_delay: DEFAULT_RESTART_MAX_DELAY,
            reset_after: DEFAULT_RESTART_RESET_AFTER,
        }
    }
}

impl RestartPolicy {
    /// A policy that never restarts.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before restart attempt number `attempt` (0-based): 1s, 2s, 4s, …
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Attempts already spent when a server exits after `uptime` of being Ready.
    pub fn attempts_after_exit(&self, attempts: u32, uptime: Duration) -> u32 {
        if uptime >= self.reset_after {
            0
        } else {
            attempts
        }
    }
}

// ─── Discovered Capabilities ─────────────────────────────────────────────────

/// Everything a backend advertised during introspection.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<ToolDefinition>,
    pub resources: Vec<ResourceDefinition>,
    pub prompts: Vec<PromptDefinition>,
}

impl DiscoveredCapabilities {
    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len() + self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running backend process with its transport, handshake results and the
/// capabilities it advertised at startup.
pub struct ManagedServer {
    /// Human-readable server name (e.g., "filesystem").
    pub name: String,
    /// JSON-RPC transport; owns the child process.
    pub transport: Arc<StdioTransport>,
    /// Server info from the `initialize` reply.
    pub server_info: Option<ServerInfo>,
    /// Listed once after the handshake. Fixed for the life of this process.
    pub capabilities: DiscoveredCapabilities,
}

impl ManagedServer {
    /// Query the server for its tools, resources, and prompts.
    ///
    /// The three list calls run concurrently; a failing call leaves that
    /// kind empty rather than failing the whole introspection. Tools already
    /// inlined in the `initialize` reply are merged in.
    async fn introspect(
        &self,
        inline_tools: Vec<ToolDefinition>,
        timeout: Duration,
    ) -> DiscoveredCapabilities {
        let (tools, resources, prompts) = tokio::join!(
            self.list::<ToolsListResult>("tools/list", timeout),
            self.list::<ResourcesListResult>("resources/list", timeout),
            self.list::<PromptsListResult>("prompts/list", timeout),
        );

        let mut tools = tools.map(|r| r.tools).unwrap_or_default();
        for inline in inline_tools {
            if !tools.iter().any(|t| t.name == inline.name) {
                tools.push(inline);
            }
        }

        let discovered = DiscoveredCapabilities {
            tools,
            resources: resources.map(|r| r.resources).unwrap_or_default(),
            prompts: prompts.map(|r| r.prompts).unwrap_or_default(),
        };

        tracing::info!(
            server = %self.name,
            tools = discovered.tools.len(),
            resources = discovered.resources.len(),
            prompts = discovered.prompts.len(),
            "introspected server capabilities"
        );
        discovered
    }

    async fn list<T>(&self, method: &str, timeout: Duration) -> Option<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let outcome = async {
            let response = self.transport.request(method, None, timeout).await?;
            let value = extract_result(&self.name, response)?;
            serde_json::from_value::<T>(value).map_err(|e| BackendError::Protocol {
                server: self.name.clone(),
                reason: format!("failed to parse {method} result: {e}"),
            })
        }
        .await;

        match outcome {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::debug!(server = %self.name, method, error = %e, "list call failed");
                None
            }
        }
    }

    /// Attempt to gracefully shut down the server, force-killing after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.transport.has_exited() {
            return;
        }

        // Best-effort: ask politely, then close stdin
        let _ = self.transport.notify("shutdown", None).await;
        self.transport.close_stdin().await;

        if tokio::time::timeout(timeout, self.transport.wait_exit())
            .await
            .is_err()
        {
            tracing::warn!(server = %self.name, "graceful shutdown timed out, killing");
            self.transport.kill();
            self.transport.wait_exit().await;
        }
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a single backend process, perform the initialization handshake and
/// introspect its capabilities.
///
/// On any failure the child is killed and a `BackendError::Spawn` carrying
/// the captured stderr tail is returned.
pub async fn spawn_server(
    config: &ServerConfig,
    init_timeout: Duration,
) -> Result<ManagedServer, BackendError> {
    let name = config.name.as_str();

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| BackendError::Spawn {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let transport = Arc::new(StdioTransport::start(name, child)?);

    match initialize(&transport, name, init_timeout).await {
        Ok(init) => {
            tracing::info!(
                server = name,
                server_info = ?init.server_info.as_ref().and_then(|i| i.name.as_deref()),
                "server initialized"
            );
            let mut server = ManagedServer {
                name: name.to_string(),
                transport,
                server_info: init.server_info,
                capabilities: DiscoveredCapabilities::default(),
            };
            server.capabilities = server.introspect(init.tools, init_timeout).await;
            Ok(server)
        }
        Err(e) => {
            transport.kill();
            let _ = tokio::time::timeout(STDERR_SETTLE, transport.wait_exit()).await;
            transport.settle_stderr(STDERR_SETTLE).await;
            let stderr_ctx = transport.stderr_tail();
            if !stderr_ctx.is_empty() {
                tracing::warn!(
                    server = name,
                    stderr = %stderr_ctx,
                    "server stderr captured on failure"
                );
            }
            Err(BackendError::Spawn {
                name: name.to_string(),
                reason: format!("{}{}", handshake_reason(&e), format_stderr_suffix(&stderr_ctx)),
            })
        }
    }
}

fn handshake_reason(err: &BackendError) -> String {
    match err {
        BackendError::Timeout { timeout_ms, .. } => {
            format!("initialization timed out after {timeout_ms}ms")
        }
        other => format!("initialization failed: {other}"),
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

/// Perform the MCP initialization handshake.
async fn initialize(
    transport: &StdioTransport,
    server_name: &str,
    timeout: Duration,
) -> Result<InitializeResult, BackendError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcp-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let response = transport.request("initialize", Some(params), timeout).await?;
    let result = extract_result(server_name, response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| BackendError::Protocol {
            server: server_name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    transport.notify("notifications/initialized", None).await?;
    Ok(init)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_delay_doubles_until_cap() {
        let policy = RestartPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            reset_after: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_restart_policy_defaults() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.reset_after, Duration::from_secs(60));
        assert_eq!(RestartPolicy::disabled().max_attempts, 0);
    }

    #[test]
    fn test_long_uptime_resets_attempts() {
        let policy = RestartPolicy {
            reset_after: Duration::from_secs(10),
            ..RestartPolicy::default()
        };
        assert_eq!(policy.attempts_after_exit(3, Duration::from_secs(2)), 3);
        assert_eq!(policy.attempts_after_exit(3, Duration::from_secs(10)), 0);
        assert_eq!(policy.attempts_after_exit(1, Duration::from_secs(3600)), 0);
    }

    #[test]
    fn test_format_stderr_suffix() {
        assert_eq!(format_stderr_suffix(""), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
    }

    #[tokio::test]
    async fn test_spawn_missing_command_is_spawn_error() {
        let config = ServerConfig::new("ghost", "/definitely/not/a/real/binary", &[]);
        let err = spawn_server(&config, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        match err {
            BackendError::Spawn { name, .. } => assert_eq!(name, "ghost"),
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_reports_stderr_on_handshake_failure() {
        let config = ServerConfig::new("noisy", "sh", &["-c", "echo 'missing dependency' >&2; exit 1"]);
        let err = spawn_server(&config, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        let message = err.to_string();
        assert!(message.contains("noisy"), "{message}");
        assert!(message.contains("missing dependency"), "{message}");
    }

    #[tokio::test]
    async fn test_spawn_records_capabilities_once() {
        let script = r#"
            read init
            printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","tools":[{"name":"inline"}]}}\n'
            read initialized
            for _ in 1 2 3; do
                read request
                id=$(printf '%s' "$request" | sed 's/.*"id":\([0-9]*\).*/\1/')
                case "$request" in
                    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"listed"}]}}\n' "$id" ;;
                    *) printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"no"}}\n' "$id" ;;
                esac
            done
            sleep 30
        "#;
        let config = ServerConfig::new("scripted", "sh", &["-c", script]);
        let server = spawn_server(&config, Duration::from_secs(5)).await.unwrap();

        let mut names: Vec<_> = server.capabilities.tools.iter().map(|t| t.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["inline", "listed"]);
        assert!(server.capabilities.resources.is_empty());
        assert!(server.capabilities.prompts.is_empty());

        server.transport.kill();
        server.transport.wait_exit().await;
    }
}
