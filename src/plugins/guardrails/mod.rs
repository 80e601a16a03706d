//! Built-in guardrail plugins.

pub mod basic;

pub use basic::BasicGuardrail;
