//! Plugin contracts, one trait per kind.
//!
//! Instances are shared across concurrent calls once `load` has returned,
//! so hooks take `&self` and any mutable state must be synchronized
//! internally.

use async_trait::async_trait;

use super::context::{CallContext, CallRecord};
use super::errors::PluginError;

/// Verdict of a guardrail on an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestDecision {
    /// Continue with these (possibly rewritten) arguments.
    Allow(serde_json::Value),
    /// Stop the call; the backend is never contacted.
    Block { reason: String },
}

/// A chain stage that may rewrite or block requests and rewrite responses.
///
/// Guardrails run in configured order. Each sees the context as left by
/// the previous one.
#[async_trait]
pub trait GuardrailPlugin: Send + Sync {
    /// One-time setup with the plugin's configuration object (`null` if none).
    fn load(&mut self, _config: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    /// Inspect the request in `ctx.arguments`.
    async fn process_request(&self, ctx: &CallContext) -> Result<RequestDecision, PluginError>;

    /// Transform the response in `ctx.response`. Returns the replacement.
    async fn process_response(&self, ctx: &CallContext) -> Result<serde_json::Value, PluginError>;
}

/// An observer notified once per finished call.
#[async_trait]
pub trait TracingPlugin: Send + Sync {
    fn load(&mut self, _config: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_call(&self, record: &CallRecord) -> Result<(), PluginError>;
}
