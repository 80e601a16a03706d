//! Per-call context threaded through the plugin chains, and the read-only
//! record handed to tracing plugins once the call is over.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::backend::CapabilityKind;
use crate::registry::Capability;

// ─── Error Kind ──────────────────────────────────────────────────────────────

/// Classification of a failed call, as reported to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No capability with the requested name.
    NotFound,
    /// A guardrail refused the call (or withheld its response in strict mode).
    Blocked,
    /// The backend did not answer in time.
    Timeout,
    /// Transport failure, including the backend dying mid-call.
    Protocol,
    /// The backend answered with an error.
    BackendError,
    /// The owning backend is not accepting calls.
    Unavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Blocked => "blocked",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::BackendError => "backend_error",
            Self::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Terminal state of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    Blocked { reason: String },
    Failed { kind: ErrorKind, message: String },
}

impl CallOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }
}

// ─── CallContext ─────────────────────────────────────────────────────────────

/// Mutable record for one call. Created when the call begins and consumed
/// into a [`CallRecord`] when it ends; never shared between calls.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: Uuid,
    /// Owning backend.
    pub server: String,
    /// Capability name as the backend knows it.
    pub capability: String,
    /// Name the agent used.
    pub qualified_name: String,
    pub kind: CapabilityKind,
    pub arguments: serde_json::Value,
    /// Backend response, once one has arrived.
    pub response: Option<serde_json::Value>,
    /// Free-form annotations recorded by the gateway during the call.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl CallContext {
    pub fn new(qualified_name: &str, capability: &Capability, arguments: serde_json::Value) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            server: capability.server.clone(),
            capability: capability.raw_name.clone(),
            qualified_name: qualified_name.to_string(),
            kind: capability.kind,
            arguments,
            response: None,
            metadata: serde_json::Map::new(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Append a value to a metadata list, creating it if absent.
    pub fn push_metadata(&mut self, key: &str, value: serde_json::Value) {
        let entry = self
            .metadata
            .entry(key.to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let serde_json::Value::Array(items) = entry {
            items.push(value);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Freeze the context into a tracing record.
    pub fn into_record(self, outcome: CallOutcome) -> CallRecord {
        let duration = self.elapsed();
        CallRecord {
            call_id: self.call_id,
            server: self.server,
            capability: self.capability,
            qualified_name: self.qualified_name,
            kind: self.kind,
            arguments: self.arguments,
            response: self.response,
            metadata: self.metadata,
            outcome,
            started_at: self.started_at,
            duration_ms: duration.as_secs_f64() * 1000.0,
        }
    }
}

// ─── CallRecord ──────────────────────────────────────────────────────────────

/// Read-only snapshot of a finished call plus timing.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub call_id: Uuid,
    pub server: String,
    pub capability: String,
    pub qualified_name: String,
    pub kind: CapabilityKind,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub outcome: CallOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
}
