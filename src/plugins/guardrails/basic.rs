//! Secret-masking guardrail.
//!
//! Replaces credential-shaped substrings in request arguments and backend
//! responses with [`MASK`]. Only string values are rewritten; object keys,
//! numbers, and structure are left alone. Never blocks.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::plugins::context::CallContext;
use crate::plugins::errors::PluginError;
use crate::plugins::traits::{GuardrailPlugin, RequestDecision};

/// Replacement for every masked secret.
pub const MASK: &str = "<REDACTED>";

const PLUGIN_NAME: &str = "basic";

/// Built-in credential patterns.
/// Built-in credential patterns. Fixed-length families match exactly their
/// length so adjacent text is never swallowed; prefixes match anywhere,
/// including after identifier characters (`HF_TOKEN_hf_...`).
const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    ("huggingface", r"hf_[A-Za-z0-9]{34}"),
    ("openai", r"sk-(?:proj-)?[A-Za-z0-9_-]{20,}"),
    ("github", r"gh[pousr]_[A-Za-z0-9]{36}|github_pat_[A-Za-z0-9_]{82}"),
    ("aws_access_key", r"(?:AKIA|ASIA)[0-9A-Z]{16}"),
    ("slack", r"xox[abposr]-[A-Za-z0-9-]{10,}"),
    ("bearer", r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{16,}"),
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BasicGuardrailConfig {
    /// Additional regular expressions to mask.
    extra_patterns: Vec<String>,
}

/// Masks secrets with a fixed set of patterns plus any configured extras.
#[derive(Debug, Default)]
pub struct BasicGuardrail {
    patterns: Vec<Regex>,
}

impl BasicGuardrail {
    /// Mask every secret in `value`, returning the rewritten value and the
    /// number of replacements made.
    pub fn mask_value(&self, value: &serde_json::Value) -> (serde_json::Value, usize) {
        let mut masked = value.clone();
        let count = self.mask_in_place(&mut masked);
        (masked, count)
    }

    fn mask_in_place(&self, value: &mut serde_json::Value) -> usize {
        match value {
            serde_json::Value::String(s) => {
                let (masked, count) = self.mask_str(s);
                if count > 0 {
                    *s = masked;
                }
                count
            }
            serde_json::Value::Array(items) => items.iter_mut().map(|v| self.mask_in_place(v)).sum(),
            serde_json::Value::Object(map) => map.values_mut().map(|v| self.mask_in_place(v)).sum(),
            _ => 0,
        }
    }

    fn mask_str(&self, input: &str) -> (String, usize) {
        let mut text = input.to_string();
        let mut count = 0;
        for pattern in &self.patterns {
            let hits = pattern.find_iter(&text).count();
            if hits > 0 {
                count += hits;
                text = pattern.replace_all(&text, MASK).into_owned();
            }
        }
        (text, count)
    }
}

#[async_trait]
impl GuardrailPlugin for BasicGuardrail {
    fn load(&mut self, config: &serde_json::Value) -> Result<(), PluginError> {
        let config: BasicGuardrailConfig = if config.is_null() {
            BasicGuardrailConfig::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| PluginError::load(PLUGIN_NAME, format!("invalid config: {e}")))?
        };

        let builtin = BUILTIN_PATTERNS.iter().map(|(_, p)| *p);
        let extra = config.extra_patterns.iter().map(String::as_str);
        self.patterns = builtin
            .chain(extra)
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| PluginError::load(PLUGIN_NAME, format!("invalid pattern '{p}': {e}")))
            })
            .collect::<Result<_, _>>()?;

        tracing::debug!(plugin = PLUGIN_NAME, patterns = self.patterns.len(), "secret masking patterns compiled");
        Ok(())
    }

    async fn process_request(&self, ctx: &CallContext) -> Result<RequestDecision, PluginError> {
        let (arguments, count) = self.mask_value(&ctx.arguments);
        if count > 0 {
            tracing::info!(call_id = %ctx.call_id, capability = %ctx.qualified_name, count, "masked secrets in request");
        }
        Ok(RequestDecision::Allow(arguments))
    }

    async fn process_response(&self, ctx: &CallContext) -> Result<serde_json::Value, PluginError> {
        let response = ctx.response.clone().unwrap_or(serde_json::Value::Null);
        let (response, count) = self.mask_value(&response);
        if count > 0 {
            tracing::info!(call_id = %ctx.call_id, capability = %ctx.qualified_name, count, "masked secrets in response");
        }
        Ok(response)
    }
}
