//! Emits one structured log line per finished call.

use async_trait::async_trait;

use crate::plugins::context::{CallOutcome, CallRecord};
use crate::plugins::errors::PluginError;
use crate::plugins::traits::TracingPlugin;

#[derive(Debug, Default)]
pub struct LogTracer;

#[async_trait]
impl TracingPlugin for LogTracer {
    async fn on_call(&self, record: &CallRecord) -> Result<(), PluginError> {
        match &record.outcome {
            CallOutcome::Completed => tracing::info!(
                call_id = %record.call_id,
                server = %record.server,
                capability = %record.qualified_name,
                kind = %record.kind,
                duration_ms = record.duration_ms,
                "call completed"
            ),
            CallOutcome::Blocked { reason } => tracing::info!(
                call_id = %record.call_id,
                server = %record.server,
                capability = %record.qualified_name,
                reason = %reason,
                "call blocked"
            ),
            CallOutcome::Failed { kind, message } => tracing::warn!(
                call_id = %record.call_id,
                server = %record.server,
                capability = %record.qualified_name,
                error_kind = %kind,
                error = %message,
                duration_ms = record.duration_ms,
                "call failed"
            ),
        }
        Ok(())
    }
}
