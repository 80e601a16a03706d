//! Gateway configuration loading.
//!
//! Reads a YAML (or JSON) file describing the backend servers, the enabled
//! plugins, and gateway timeouts. `${VAR}` and `${VAR:-default}` are resolved
//! from the environment before parsing.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::lifecycle::{
    DEFAULT_MAX_RESTART_ATTEMPTS, DEFAULT_RESTART_BASE_DELAY, DEFAULT_RESTART_MAX_DELAY,
    DEFAULT_RESTART_RESET_AFTER,
};
use crate::backend::supervisor::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_INIT_TIMEOUT_MS, DEFAULT_SHUTDOWN_TIMEOUT_MS,
};
use crate::backend::{RestartPolicy, ServerConfig, SupervisorSettings};
use crate::plugins::PluginSelection;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `name → launch config`.
    #[serde(rename = "mcpServers", alias = "servers")]
    pub servers: BTreeMap<String, ServerConfig>,
    pub plugins: PluginsConfig,
    pub gateway: GatewaySettings,
}

/// Which plugins to enable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Guardrail identifiers, in execution order.
    pub guardrails: Vec<String>,
    pub tracing: Vec<String>,
    /// Treat guardrail failures as blocks.
    pub strict: bool,
    /// Per-plugin configuration objects, keyed by plugin identifier.
    pub config: HashMap<String, serde_json::Value>,
}

/// Timeouts and restart policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub restart: RestartSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            restart: RestartSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RestartSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_reset_after_ms")]
    pub reset_after_ms: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            reset_after_ms: default_reset_after_ms(),
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}
fn default_init_timeout_ms() -> u64 {
    DEFAULT_INIT_TIMEOUT_MS
}
fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RESTART_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_RESTART_BASE_DELAY.as_millis() as u64
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_RESTART_MAX_DELAY.as_millis() as u64
}
fn default_reset_after_ms() -> u64 {
    DEFAULT_RESTART_RESET_AFTER.as_millis() as u64
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Load, interpolate, parse, and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::parse(&raw)?;
        tracing::info!(
            path = %path.display(),
            servers = config.servers.len(),
            "loaded gateway config"
        );
        Ok(config)
    }

    /// Parse configuration text (YAML or JSON).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, server) in &self.servers {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "server name must not be empty".into(),
                });
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("server '{name}' has an empty command"),
                });
            }
        }
        if self.gateway.restart.base_delay_ms > self.gateway.restart.max_delay_ms {
            return Err(ConfigError::Invalid {
                reason: "restart.base_delay_ms exceeds restart.max_delay_ms".into(),
            });
        }
        Ok(())
    }

    /// Server launch configs ordered by name, with names filled in.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.servers
            .iter()
            .map(|(name, server)| ServerConfig {
                name: name.clone(),
                ..server.clone()
            })
            .collect()
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let g = &self.gateway;
        SupervisorSettings {
            call_timeout: Duration::from_millis(g.call_timeout_ms),
            init_timeout: Duration::from_millis(g.init_timeout_ms),
            shutdown_timeout: Duration::from_millis(g.shutdown_timeout_ms),
            restart: RestartPolicy {
                max_attempts: g.restart.max_attempts,
                base_delay: Duration::from_millis(g.restart.base_delay_ms),
                max_delay: Duration::from_millis(g.restart.max_delay_ms),
                reset_after: Duration::from_millis(g.restart.reset_after_ms),
            },
        }
    }

    pub fn plugin_selection(&self) -> PluginSelection {
        PluginSelection {
            guardrails: self.plugins.guardrails.clone(),
            tracers: self.plugins.tracing.clone(),
            config: self.plugins.config.clone(),
            strict: self.plugins.strict,
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
mcpServers:
  web:
    command: npx
    args: ["-y", "fetch-server"]
  files:
    command: python
    args: ["-m", "files"]
    env:
      ROOT: /tmp
plugins:
  guardrails: [basic]
  tracing: [timing]
  strict: true
  config:
    basic:
      extra_patterns: ["INTERNAL-[0-9]+"]
gateway:
  call_timeout_ms: 1500
  restart:
    max_attempts: 5
"#;
        let config = GatewayConfig::parse(yaml).unwrap();

        let servers = config.server_configs();
        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["files", "web"]);
        assert_eq!(servers[0].env["ROOT"], "/tmp");

        let settings = config.supervisor_settings();
        assert_eq!(settings.call_timeout, Duration::from_millis(1500));
        assert_eq!(settings.init_timeout, Duration::from_millis(DEFAULT_INIT_TIMEOUT_MS));
        assert_eq!(settings.restart.max_attempts, 5);
        assert_eq!(settings.restart.base_delay, Duration::from_secs(1));
        assert_eq!(settings.restart.reset_after, Duration::from_secs(60));

        let selection = config.plugin_selection();
        assert_eq!(selection.guardrails, vec!["basic"]);
        assert_eq!(selection.tracers, vec!["timing"]);
        assert!(selection.strict);
        assert_eq!(
            selection.config["basic"]["extra_patterns"][0],
            "INTERNAL-[0-9]+"
        );
    }

    #[test]
    fn test_parse_json_with_servers_alias() {
        let json = r#"{"servers": {"echo": {"command": "cat"}}}"#;
        let config = GatewayConfig::parse(json).unwrap();
        assert_eq!(config.server_configs()[0].command, "cat");
        assert_eq!(config.gateway, GatewaySettings::default());
    }

    #[test]
    fn test_empty_config_is_standalone() {
        let config = GatewayConfig::parse("  \n").unwrap();
        assert!(config.servers.is_empty());
        assert!(config.plugins.guardrails.is_empty());
    }

    #[test]
    fn test_rejects_empty_command() {
        let err = GatewayConfig::parse("mcpServers:\n  bad:\n    command: ''\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = GatewayConfig::parse("mcpServers: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        std::fs::write(&path, "mcpServers:\n  a:\n    command: cat\n").unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.servers.len(), 1);

        let missing = GatewayConfig::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__GATEWAY_TEST_UNSET__");
        let result = interpolate_env_vars("cmd: ${__GATEWAY_TEST_UNSET__:-/fallback/bin}");
        assert_eq!(result, "cmd: /fallback/bin");
    }

    #[test]
    fn test_interpolate_env_vars_set() {
        std::env::set_var("__GATEWAY_TEST_SET__", "/usr/bin/server");
        let config =
            GatewayConfig::parse("mcpServers:\n  a:\n    command: ${__GATEWAY_TEST_SET__}\n").unwrap();
        assert_eq!(config.servers["a"].command, "/usr/bin/server");
        std::env::remove_var("__GATEWAY_TEST_SET__");
    }
}
