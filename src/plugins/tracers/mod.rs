//! Built-in tracing plugins.

pub mod log;
pub mod timing;

pub use log::LogTracer;
pub use timing::TimingTracer;
