//! Backend layer: child-process MCP servers spoken to over stdio JSON-RPC.
//!
//! This module handles:
//! - Spawning backend processes and performing the `initialize` handshake
//! - Correlating concurrent requests with replies by id
//! - Introspecting tools, resources, and prompts
//! - Supervision: exit detection, restart with backoff, graceful shutdown

pub mod errors;
pub mod lifecycle;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::BackendError;
pub use lifecycle::{DiscoveredCapabilities, RestartPolicy};
pub use supervisor::{BackendStatus, Supervisor, SupervisorSettings};
pub use types::{BackendState, CapabilityKind, ServerConfig};
