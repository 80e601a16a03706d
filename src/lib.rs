pub mod backend;
pub mod config;
pub mod gateway;
pub mod plugins;
pub mod registry;
pub mod router;
pub mod upstream;

use std::path::{Path, PathBuf};

pub use gateway::Gateway;

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/mcp-gateway/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-gateway\`
/// - Linux: `$XDG_DATA_HOME/mcp-gateway/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-gateway/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-gateway")
}

/// Default log file location used by `--log-file` without a path.
pub fn default_log_path() -> PathBuf {
    data_dir().join("gateway.log")
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr unless `log_file` is given; stdout belongs to the agent
/// protocol. The filter comes from `RUST_LOG`, then `LOGLEVEL`, then
/// `mcp_gateway=info,warn`.
///
/// With a log file, existing logs are rotated (`gateway.log` → `.1` → `.2`
/// → `.3`) and every line is flushed as it is written.
pub fn init_tracing(log_file: Option<&Path>) -> std::io::Result<()> {
    use tracing_subscriber::fmt;

    let filter = env_filter();

    let Some(log_path) = log_file else {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .init();
        return Ok(());
    };

    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    rotate_log_file(log_path, 3);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-gateway starting ==="
    );
    Ok(())
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("LOGLEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("mcp_gateway=info,warn"))
}

/// Rotate log files: `gateway.log` → `gateway.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash of the gateway.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
