//! Router: the agent-facing facade.
//!
//! Exposes exactly two operations: `get_metadata` (a snapshot of the
//! capability registry plus backend status) and `run_tool` (execute one
//! capability through the plugin chains). Every call:
//! resolve → request chain → dispatch → response chain → return → trace.
//!
//! `run_tool` never fails outward: every problem becomes a [`ToolResult`]
//! carrying an [`ErrorKind`].

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::backend::{BackendError, BackendState, CapabilityKind, Supervisor};
use crate::plugins::{
    CallContext, CallOutcome, ErrorKind, PluginManager, RequestOutcome, ResponseOutcome,
};
use crate::registry::{Capability, CapabilityEntry, CapabilityRegistry};

// ─── Result Envelope ─────────────────────────────────────────────────────────

/// Structured error returned to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of `run_tool`, as seen by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(ToolError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// The error kind, if this is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Map a backend failure onto the agent-facing taxonomy.
fn classify(error: &BackendError) -> ErrorKind {
    match error {
        BackendError::Timeout { .. } => ErrorKind::Timeout,
        BackendError::Protocol { .. } => ErrorKind::Protocol,
        BackendError::Remote { .. } => ErrorKind::BackendError,
        BackendError::Unavailable { .. }
        | BackendError::UnknownServer { .. }
        | BackendError::Spawn { .. }
        | BackendError::AlreadyRegistered { .. }
        | BackendError::RestartExhausted { .. } => ErrorKind::Unavailable,
    }
}

/// JSON-RPC method and params that invoke a capability on its backend.
fn invocation(capability: &Capability, arguments: &serde_json::Value) -> (&'static str, serde_json::Value) {
    let params = match capability.kind {
        CapabilityKind::Tool | CapabilityKind::Prompt => serde_json::json!({
            "name": capability.raw_name,
            "arguments": arguments,
        }),
        CapabilityKind::Resource => serde_json::json!({
            "uri": capability.uri.as_deref().unwrap_or(&capability.raw_name),
        }),
    };
    (capability.kind.invoke_method(), params)
}

// ─── Metadata ────────────────────────────────────────────────────────────────

/// Per-backend row of the metadata payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub state: BackendState,
    pub capability_count: usize,
    pub restart_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Payload of `get_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    /// `standalone` (no backends configured), `ok` (all Ready), or `degraded`.
    pub status: &'static str,
    pub servers: Vec<ServerSummary>,
    pub capabilities: Vec<CapabilityEntry>,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct Router {
    supervisor: Arc<Supervisor>,
    plugins: Arc<PluginManager>,
    registry: RwLock<Arc<CapabilityRegistry>>,
}

impl Router {
    pub fn new(supervisor: Arc<Supervisor>, plugins: Arc<PluginManager>) -> Self {
        Self {
            supervisor,
            plugins,
            registry: RwLock::new(Arc::new(CapabilityRegistry::new())),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// Current registry generation.
    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.registry.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// Rebuild the capability registry from the Ready backends.
    ///
    /// The rebuild happens under the write lock so concurrent refreshes
    /// publish in order.
    pub fn refresh(&self) {
        let mut registry = self.registry.write().unwrap_or_else(|p| p.into_inner());
        *registry = Arc::new(CapabilityRegistry::rebuild(&self.supervisor));
    }

    /// Snapshot of every exposed capability and every configured backend.
    ///
    /// Reads only; no plugin involvement.
    pub fn get_metadata(&self) -> Metadata {
        let registry = self.registry();
        let capabilities = registry.snapshot(|server| self.supervisor.state(server));
        let statuses = self.supervisor.statuses();

        let status = if statuses.is_empty() {
            "standalone"
        } else if statuses.iter().all(|s| s.state == BackendState::Ready) {
            "ok"
        } else {
            "degraded"
        };

        let servers = statuses
            .into_iter()
            .map(|s| ServerSummary {
                capability_count: capabilities.iter().filter(|c| c.server == s.name).count(),
                name: s.name,
                state: s.state,
                restart_attempts: s.restart_attempts,
                last_error: s.last_error,
            })
            .collect();

        Metadata {
            status,
            servers,
            capabilities,
        }
    }

    /// Execute one capability on behalf of the agent.
    ///
    /// Unknown names short-circuit before any plugin runs and are not
    /// traced. If this future is dropped mid-call, no further chain stage
    /// runs and nothing is traced; the backend's late reply is discarded.
    pub async fn run_tool(&self, name: &str, arguments: serde_json::Value) -> ToolResult {
        let capability = match self.registry().lookup(name) {
            Ok(capability) => capability.clone(),
            Err(e) => {
                tracing::debug!(capability = %name, "run_tool for unknown capability");
                return ToolResult::err(ErrorKind::NotFound, e.to_string());
            }
        };

        let mut ctx = CallContext::new(name, &capability, arguments);
        tracing::debug!(call_id = %ctx.call_id, server = %capability.server, capability = %name, "call started");

        let (result, outcome) = self.execute(&capability, &mut ctx).await;
        self.trace(ctx, outcome);
        result
    }

    async fn execute(&self, capability: &Capability, ctx: &mut CallContext) -> (ToolResult, CallOutcome) {
        if let RequestOutcome::Blocked { plugin, reason } = self.plugins.run_request_chain(ctx).await {
            let message = format!("blocked by guardrail '{plugin}': {reason}");
            return (
                ToolResult::err(ErrorKind::Blocked, message),
                CallOutcome::Blocked { reason },
            );
        }

        let (method, params) = invocation(capability, &ctx.arguments);
        match self
            .supervisor
            .send(&capability.server, method, Some(params), None)
            .await
        {
            Ok(response) => ctx.response = Some(response),
            Err(e) => {
                let kind = classify(&e);
                let message = e.to_string();
                tracing::warn!(call_id = %ctx.call_id, server = %capability.server, error_kind = %kind, error = %message, "backend call failed");
                return (
                    ToolResult::err(kind, message.clone()),
                    CallOutcome::Failed { kind, message },
                );
            }
        }

        match self.plugins.run_response_chain(ctx).await {
            ResponseOutcome::Delivered => {
                let payload = ctx.response.clone().unwrap_or(serde_json::Value::Null);
                (ToolResult::ok(payload), CallOutcome::Completed)
            }
            ResponseOutcome::Withheld { plugin, reason } => {
                ctx.response = None;
                let message = format!("response withheld: guardrail '{plugin}' failed: {reason}");
                (
                    ToolResult::err(ErrorKind::Blocked, message),
                    CallOutcome::Blocked { reason },
                )
            }
        }
    }

    /// Hand the finished call to the tracers without waiting for them.
    fn trace(&self, ctx: CallContext, outcome: CallOutcome) {
        if self.plugins.tracer_names().is_empty() {
            return;
        }
        let record = ctx.into_record(outcome);
        let plugins = Arc::clone(&self.plugins);
        tokio::spawn(async move {
            plugins.run_tracing(&record).await;
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SupervisorSettings;
    use serde_json::json;

    fn capability(kind: CapabilityKind, raw: &str, uri: Option<&str>) -> Capability {
        Capability {
            server: "files".into(),
            kind,
            raw_name: raw.into(),
            description: None,
            input_schema: None,
            output_schema: None,
            uri: uri.map(str::to_string),
        }
    }

    #[test]
    fn test_invocation_per_kind() {
        let args = json!({"path": "/tmp"});

        let (method, params) = invocation(&capability(CapabilityKind::Tool, "read", None), &args);
        assert_eq!(method, "tools/call");
        assert_eq!(params, json!({"name": "read", "arguments": {"path": "/tmp"}}));

        let (method, params) = invocation(&capability(CapabilityKind::Prompt, "summarize", None), &args);
        assert_eq!(method, "prompts/get");
        assert_eq!(params["name"], "summarize");

        let (method, params) = invocation(
            &capability(CapabilityKind::Resource, "readme", Some("file:///readme")),
            &args,
        );
        assert_eq!(method, "resources/read");
        assert_eq!(params, json!({"uri": "file:///readme"}));
    }

    #[test]
    fn test_classify_backend_errors() {
        let timeout = BackendError::Timeout {
            server: "s".into(),
            method: "tools/call".into(),
            timeout_ms: 10,
        };
        assert_eq!(classify(&timeout), ErrorKind::Timeout);

        let protocol = BackendError::Protocol {
            server: "s".into(),
            reason: "closed".into(),
        };
        assert_eq!(classify(&protocol), ErrorKind::Protocol);

        let remote = BackendError::Remote {
            server: "s".into(),
            code: -32602,
            message: "bad params".into(),
            data: None,
        };
        assert_eq!(classify(&remote), ErrorKind::BackendError);

        let unavailable = BackendError::Unavailable {
            name: "s".into(),
            state: BackendState::Degraded,
        };
        assert_eq!(classify(&unavailable), ErrorKind::Unavailable);
    }

    #[test]
    fn test_tool_result_envelope_shape() {
        let ok = serde_json::to_value(ToolResult::ok(json!({"content": []}))).unwrap();
        assert_eq!(ok, json!({"success": true, "payload": {"content": []}}));

        let err = serde_json::to_value(ToolResult::err(ErrorKind::NotFound, "nope")).unwrap();
        assert_eq!(
            err,
            json!({"success": false, "error": {"kind": "not_found", "message": "nope"}})
        );
    }

    #[tokio::test]
    async fn test_unknown_capability_is_not_found() {
        let router = Router::new(
            Supervisor::new(SupervisorSettings::default()),
            Arc::new(PluginManager::empty()),
        );
        let result = router.run_tool("ghost", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_standalone_metadata() {
        let router = Router::new(
            Supervisor::new(SupervisorSettings::default()),
            Arc::new(PluginManager::empty()),
        );
        router.refresh();
        let metadata = router.get_metadata();
        assert_eq!(metadata.status, "standalone");
        assert!(metadata.servers.is_empty());
        assert!(metadata.capabilities.is_empty());
    }
}
