//! JSON-RPC over stdio transport.
//!
//! One `StdioTransport` owns one backend child process:
//! - Requests are written to stdin as line-delimited JSON
//! - A reader task demultiplexes stdout replies to waiting callers by `id`
//! - A watcher task owns the `Child`, records its exit, and kills it on demand
//! - A drain task keeps the last stderr lines for diagnostics
//!
//! Any number of requests may be in flight at once; each waits on its own
//! oneshot channel, so a slow call never blocks a fast one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::errors::BackendError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Number of stderr lines retained for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Maximum length of the stderr tail attached to error messages.
const STDERR_TAIL_CHARS: usize = 2000;

type ReplySender = oneshot::Sender<Result<JsonRpcResponse, BackendError>>;
type PendingMap = Mutex<HashMap<u64, ReplySender>>;
type KillSwitch = Mutex<Option<oneshot::Sender<()>>>;

// ─── Exit Info ───────────────────────────────────────────────────────────────

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Arc<KillSwitch>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    reader_task: JoinHandle<()>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Take ownership of a freshly spawned child and start the I/O tasks.
    pub fn start(server_name: &str, mut child: Child) -> Result<Self, BackendError> {
        let stdin = child.stdin.take().ok_or_else(|| BackendError::Spawn {
            name: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BackendError::Spawn {
            name: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let kill_tx = Arc::new(Mutex::new(Some(kill_tx)));

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&closed),
            Arc::clone(&kill_tx),
        ));

        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(drain_stderr(
                server_name.to_string(),
                stderr,
                Arc::clone(&stderr_tail),
            ))
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_process(server_name.to_string(), child, kill_rx, exit_tx));

        Ok(Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(Some(stdin)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            exit_rx,
            kill_tx,
            stderr_tail,
            reader_task,
            stderr_task: Mutex::new(stderr_task),
        })
    }

    /// Name of the server this transport talks to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Send a JSON-RPC request and wait up to `timeout` for the matching reply.
    ///
    /// The pending entry for the request id is released on every exit path,
    /// including timeout and the caller dropping this future.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        let exchange = async {
            self.write_frame(&JsonRpcRequest::new(id, method, params))
                .await?;
            match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(BackendError::Protocol {
                    server: self.server_name.clone(),
                    reason: "reply channel dropped".into(),
                }),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BackendError> {
        self.write_frame(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn write_frame<T: serde::Serialize>(&self, frame: &T) -> Result<(), BackendError> {
        let mut json = serde_json::to_string(frame).map_err(|e| BackendError::Protocol {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| BackendError::Protocol {
            server: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| BackendError::Protocol {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| BackendError::Protocol {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    /// Close the child's stdin, signalling EOF to a well-behaved server.
    pub async fn close_stdin(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut stdin) = guard.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Request a forced kill. Idempotent.
    pub fn kill(&self) {
        trigger_kill(&self.kill_tx);
    }

    /// Whether the child process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait for the child process to exit.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let info = match rx.wait_for(|info| info.is_some()).await {
            Ok(info) => info.clone().unwrap_or_else(unknown_exit),
            Err(_) => unknown_exit(),
        };
        info
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Last lines the child wrote to stderr, truncated for log output.
    pub fn stderr_tail(&self) -> String {
        let lines = lock(&self.stderr_tail);
        let mut joined = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > STDERR_TAIL_CHARS {
            let mut cut = STDERR_TAIL_CHARS;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        joined
    }

    /// Wait, bounded by `timeout`, for stderr to reach EOF so the tail is complete.
    pub async fn settle_stderr(&self, timeout: Duration) {
        let task = lock(&self.stderr_task).take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(timeout, task).await;
        }
    }

    fn closed_error(&self) -> BackendError {
        BackendError::Protocol {
            server: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = lock(&self.stderr_task).take() {
            task.abort();
        }
        self.kill();
    }
}

/// Removes a pending request id when the requesting future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn trigger_kill(kill_tx: &KillSwitch) {
    if let Some(tx) = lock(kill_tx).take() {
        let _ = tx.send(());
    }
}

fn unknown_exit() -> ExitInfo {
    ExitInfo {
        code: None,
        description: "exit status unavailable".into(),
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Read stdout lines and route replies to their waiting callers.
///
/// Lines that are not UTF-8 are skipped like any other noise. On EOF or read
/// error, marks the transport closed and fails every outstanding request
/// with a protocol error, then kills the child so the exit is observed.
async fn read_loop(
    server_name: String,
    stdout: ChildStdout,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    kill_tx: Arc<KillSwitch>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => break,
            Ok(_) => match std::str::from_utf8(&line_buf) {
                Ok(line) => route_line(&server_name, line.trim(), &pending),
                Err(e) => {
                    tracing::debug!(server = %server_name, error = %e, "ignoring non-UTF-8 stdout line");
                }
            },
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read from stdout");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    let drained: Vec<(u64, ReplySender)> = lock(&pending).drain().collect();
    if !drained.is_empty() {
        tracing::warn!(
            server = %server_name,
            count = drained.len(),
            "failing pending requests: server stdout closed"
        );
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(BackendError::Protocol {
            server: server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }));
    }
    trigger_kill(&kill_tx);
}

fn route_line(server_name: &str, line: &str, pending: &PendingMap) {
    if line.is_empty() {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            // Not JSON, most likely log output on the wrong stream.
            tracing::debug!(server = %server_name, line, "ignoring non-JSON stdout line");
            return;
        }
    };

    if value.get("method").is_some() {
        tracing::debug!(
            server = %server_name,
            method = value["method"].as_str().unwrap_or_default(),
            "ignoring server-initiated message"
        );
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(server = %server_name, error = %e, "ignoring malformed reply");
            return;
        }
    };

    match lock(pending).remove(&response.id) {
        Some(tx) => {
            // Receiver may be gone after a timeout; the reply is discarded.
            let _ = tx.send(Ok(response));
        }
        None => {
            tracing::debug!(server = %server_name, id = response.id, "reply for unknown or expired id");
        }
    }
}

async fn drain_stderr(
    server_name: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server_name, stderr = %line, "backend stderr");
        let mut buf = lock(&tail);
        if buf.len() == STDERR_TAIL_LINES {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

/// Own the child process: publish its exit, or kill it when asked (or when
/// the transport is dropped and the kill sender goes away).
async fn watch_process(
    server_name: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %server_name, error = %e, "kill failed (already exited?)");
            }
            child.wait().await
        }
    };

    let info = match status {
        Ok(status) => ExitInfo {
            code: status.code(),
            description: status.to_string(),
        },
        Err(e) => ExitInfo {
            code: None,
            description: format!("failed to wait for process: {e}"),
        },
    };
    tracing::debug!(server = %server_name, exit = %info.description, "backend process exited");
    let _ = exit_tx.send(Some(info));
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `BackendError`.
pub fn extract_result(
    server_name: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, BackendError> {
    if let Some(err) = response.error {
        return Err(BackendError::Remote {
            server: server_name.to_string(),
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| BackendError::Protocol {
        server: server_name.to_string(),
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::JsonRpcError;

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: Some(serde_json::json!({"text": "hello"})),
            error: None,
        };
        let result = extract_result("s", resp).unwrap();
        assert_eq!(result["text"], "hello");
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result("files", resp).unwrap_err() {
            BackendError::Remote {
                server,
                code,
                message,
                ..
            } => {
                assert_eq!(server, "files");
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        let err = extract_result("s", resp).unwrap_err();
        assert!(matches!(err, BackendError::Protocol { .. }));
    }

    #[test]
    fn test_route_line_delivers_matching_reply() {
        let pending: PendingMap = Mutex::new(HashMap::new());
        let (tx, mut rx) = oneshot::channel();
        lock(&pending).insert(7, tx);

        route_line("s", r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#, &pending);

        let reply = rx.try_recv().unwrap().unwrap();
        assert_eq!(reply.id, 7);
        assert!(lock(&pending).is_empty());
    }

    #[test]
    fn test_route_line_ignores_noise_and_server_messages() {
        let pending: PendingMap = Mutex::new(HashMap::new());
        let (tx, mut rx) = oneshot::channel();
        lock(&pending).insert(1, tx);

        route_line("s", "starting server...", &pending);
        route_line("s", r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#, &pending);
        route_line("s", r#"{"jsonrpc":"2.0","id":1,"method":"sampling/createMessage"}"#, &pending);
        route_line("s", r#"{"jsonrpc":"2.0","id":99,"result":{}}"#, &pending);

        assert!(rx.try_recv().is_err());
        assert_eq!(lock(&pending).len(), 1);
    }

    #[tokio::test]
    async fn test_request_fails_when_process_exits() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "read line; exit 3"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().unwrap();
        let transport = StdioTransport::start("short-lived", child).unwrap();

        let err = transport
            .request("tools/call", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transport_failure(), "got {err:?}");
        assert_eq!(transport.pending_count(), 0);

        let exit = transport.wait_exit().await;
        assert_eq!(exit.code, Some(3));
    }

    fn spawn_sh(script: &str) -> tokio::process::Child {
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_non_utf8_stdout_line_is_skipped() {
        let child = spawn_sh(
            r#"read line; printf 'log \377\376\n'; printf '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}\n'; sleep 30"#,
        );
        let transport = StdioTransport::start("binary-noise", child).unwrap();

        let reply = transport
            .request("ping", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(extract_result("binary-noise", reply).unwrap()["ok"], true);
        assert!(!transport.has_exited());

        transport.kill();
        transport.wait_exit().await;
    }

    #[tokio::test]
    async fn test_closed_stdout_kills_the_process() {
        let child = spawn_sh("exec 1>&-; sleep 30");
        let transport = StdioTransport::start("stdout-closed", child).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), transport.wait_exit())
            .await
            .expect("process killed after closing stdout");
        assert_ne!(exit.code, Some(0));

        let err = transport
            .request("ping", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_request_times_out_and_releases_id() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "sleep 30"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn().unwrap();
        let transport = StdioTransport::start("silent", child).unwrap();

        let err = transport
            .request("ping", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { timeout_ms: 100, .. }));
        assert_eq!(transport.pending_count(), 0);

        transport.kill();
        transport.wait_exit().await;
        assert!(transport.has_exited());
    }
}
