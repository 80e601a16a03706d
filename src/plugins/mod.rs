//! Interception plugins.
//!
//! Two kinds exist: guardrails, which may rewrite or block traffic, and
//! tracers, which observe finished calls. Every plugin is compiled in and
//! listed in [`registry::BUILTIN_PLUGINS`]; there is no runtime discovery.

pub mod context;
pub mod errors;
pub mod guardrails;
pub mod manager;
pub mod registry;
pub mod tracers;
pub mod traits;

// Re-exports for convenience
pub use context::{CallContext, CallOutcome, CallRecord, ErrorKind};
pub use errors::PluginError;
pub use manager::{PluginManager, PluginSelection, RequestOutcome, ResponseOutcome};
pub use registry::{PluginDescriptor, PluginKind, PluginRegistry};
pub use traits::{GuardrailPlugin, RequestDecision, TracingPlugin};
