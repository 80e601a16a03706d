//! mcp-gateway CLI entry point.
//!
//! Loads the configuration, starts the backends and plugins, then serves the
//! agent over stdin/stdout until it disconnects or the process is
//! interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use mcp_gateway::config::GatewayConfig;
use mcp_gateway::plugins::PluginRegistry;
use mcp_gateway::{default_log_path, init_tracing, upstream, Gateway};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// Gateway between one agent and many stdio MCP servers.
#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", version)]
struct Cli {
    /// Gateway config file (YAML or JSON).
    #[arg(long, alias = "mcp-json-path")]
    config: Option<PathBuf>,

    /// Enable a plugin by name or alias. Repeatable; `all` enables every plugin.
    #[arg(short = 'p', long = "plugin")]
    plugins: Vec<String>,

    /// Deprecated: use `-p`. Bare flag enables every guardrail.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "all")]
    enable_guardrails: Option<String>,

    /// Deprecated: use `-p`. Bare flag enables every tracer.
    #[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "all")]
    enable_tracing: Option<String>,

    /// Treat guardrail failures as blocks.
    #[arg(long)]
    strict: bool,

    /// Write logs to a file instead of stderr. Bare flag uses the data dir.
    #[arg(long, num_args = 0..=1)]
    log_file: Option<Option<PathBuf>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = cli
        .log_file
        .clone()
        .map(|path| path.unwrap_or_else(default_log_path));
    init_tracing(log_path.as_deref()).context("failed to initialize logging")?;

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => {
            tracing::info!("no config file given, starting without backends");
            GatewayConfig::default()
        }
    };
    apply_cli(&cli, &mut config, PluginRegistry::global());

    let gateway = Gateway::start(&config).await;
    let router = Arc::clone(gateway.router());

    tokio::select! {
        result = upstream::serve(router, tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "agent connection failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }

    gateway.shutdown().await;
    tracing::info!("gateway stopped");
    Ok(())
}

/// Fold CLI plugin flags into the loaded config. CLI ids come after the
/// config file's, without duplicates.
fn apply_cli(cli: &Cli, config: &mut GatewayConfig, registry: &PluginRegistry) {
    if let Some(id) = &cli.enable_guardrails {
        tracing::warn!("--enable-guardrails is deprecated, use -p {id}");
    }
    if let Some(id) = &cli.enable_tracing {
        tracing::warn!("--enable-tracing is deprecated, use -p {id}");
    }

    let partitioned = registry.partition(&cli.plugins);
    for error in &partitioned.unknown {
        tracing::warn!(error = %error, "ignoring plugin flag");
    }

    let mut guardrails = partitioned.guardrails;
    let mut tracers = partitioned.tracers;
    // The deprecated flags name their kind, so `all` stays within it.
    if let Some(id) = cli.enable_guardrails.clone() {
        guardrails.push(id);
    }
    if let Some(id) = cli.enable_tracing.clone() {
        tracers.push(id);
    }

    merge_ids(&mut config.plugins.guardrails, guardrails);
    merge_ids(&mut config.plugins.tracing, tracers);
    config.plugins.strict |= cli.strict;
}

fn merge_ids(target: &mut Vec<String>, extra: Vec<String>) {
    for id in extra {
        if !target.iter().any(|existing| existing.eq_ignore_ascii_case(&id)) {
            target.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mcp-gateway").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_plugin_flags() {
        let cli = parse(&["--config", "gw.yaml", "-p", "basic", "--plugin", "timing", "--strict"]);
        assert_eq!(cli.config, Some(PathBuf::from("gw.yaml")));
        assert_eq!(cli.plugins, vec!["basic", "timing"]);
        assert!(cli.strict);
        assert!(cli.log_file.is_none());
    }

    #[test]
    fn test_mcp_json_path_alias() {
        let cli = parse(&["--mcp-json-path", "servers.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("servers.json")));
    }

    #[test]
    fn test_deprecated_flags_default_to_all() {
        let cli = parse(&["--enable-guardrails", "--enable-tracing=log"]);
        assert_eq!(cli.enable_guardrails.as_deref(), Some("all"));
        assert_eq!(cli.enable_tracing.as_deref(), Some("log"));
    }

    #[test]
    fn test_log_file_optional_value() {
        assert_eq!(parse(&["--log-file"]).log_file, Some(None));
        assert_eq!(
            parse(&["--log-file", "/tmp/gw.log"]).log_file,
            Some(Some(PathBuf::from("/tmp/gw.log")))
        );
    }

    #[test]
    fn test_apply_cli_appends_without_duplicates() {
        let mut config = GatewayConfig::parse(
            "plugins:\n  guardrails: [basic]\n  tracing: [timing]\n",
        )
        .unwrap();
        let cli = parse(&["-p", "BASIC", "-p", "log", "-p", "nope", "--enable-tracing", "--strict"]);

        apply_cli(&cli, &mut config, PluginRegistry::global());

        assert_eq!(config.plugins.guardrails, vec!["basic"]);
        assert_eq!(config.plugins.tracing, vec!["timing", "log", "all"]);
        assert!(config.plugins.strict);
    }
}
