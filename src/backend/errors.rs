//! Backend error types.

use thiserror::Error;

use super::types::BackendState;

/// Errors that can occur while managing or talking to backend servers.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The process failed to launch or its handshake failed.
    #[error("failed to spawn server '{name}': {reason}")]
    Spawn { name: String, reason: String },

    /// No reply arrived within the call timeout.
    #[error("call '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Transport failure: malformed frame, broken pipe, process exited mid-call.
    #[error("protocol error for server '{server}': {reason}")]
    Protocol { server: String, reason: String },

    /// The backend replied with a JSON-RPC error object.
    #[error("server '{server}' returned error [{code}]: {message}")]
    Remote {
        server: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The backend exists but is not accepting calls.
    #[error("server '{name}' is {state}")]
    Unavailable { name: String, state: BackendState },

    /// No backend with this name is configured.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// A backend with this name is already registered.
    #[error("server '{name}' is already registered")]
    AlreadyRegistered { name: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}

impl BackendError {
    /// Whether this error means the backend connection itself is unusable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_server() {
        let err = BackendError::Timeout {
            server: "files".into(),
            method: "tools/call".into(),
            timeout_ms: 500,
        };
        assert_eq!(
            err.to_string(),
            "call 'tools/call' to server 'files' timed out after 500ms"
        );

        let err = BackendError::Unavailable {
            name: "files".into(),
            state: BackendState::Failed,
        };
        assert_eq!(err.to_string(), "server 'files' is failed");
    }

    #[test]
    fn test_transport_failure_classification() {
        assert!(BackendError::Protocol {
            server: "s".into(),
            reason: "closed".into()
        }
        .is_transport_failure());
        assert!(!BackendError::UnknownServer { name: "s".into() }.is_transport_failure());
    }
}
