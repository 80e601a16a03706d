//! Gateway assembly.
//!
//! Wires configuration into a running gateway: loads plugins, starts the
//! backends, builds the first registry, and keeps the registry in step with
//! backend state changes until shutdown.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{BackendError, ServerConfig, Supervisor, SupervisorSettings};
use crate::config::GatewayConfig;
use crate::plugins::{PluginError, PluginManager, PluginRegistry, PluginSelection};
use crate::router::Router;

/// A running gateway.
pub struct Gateway {
    supervisor: Arc<Supervisor>,
    router: Arc<Router>,
    refresh_task: JoinHandle<()>,
    plugin_errors: Vec<PluginError>,
    spawn_errors: Vec<(String, BackendError)>,
}

impl Gateway {
    /// Start a gateway from a loaded configuration file, using the
    /// compiled-in plugins.
    pub async fn start(config: &GatewayConfig) -> Self {
        Self::start_with(
            config.server_configs(),
            config.supervisor_settings(),
            PluginRegistry::global(),
            &config.plugin_selection(),
        )
        .await
    }

    /// Start a gateway from already-resolved parts.
    ///
    /// Plugin load failures and backend spawn failures are logged and kept
    /// for inspection; the gateway runs with whatever did start.
    pub async fn start_with(
        servers: Vec<ServerConfig>,
        settings: SupervisorSettings,
        registry: &PluginRegistry,
        selection: &PluginSelection,
    ) -> Self {
        let (plugins, plugin_errors) = PluginManager::instantiate(registry, selection);

        let supervisor = Supervisor::new(settings);
        if servers.is_empty() {
            tracing::info!("no backend servers configured, running in standalone mode (plugins still active)");
        }
        let spawn_errors = supervisor.start_all(&servers).await;
        for (name, error) in &spawn_errors {
            tracing::error!(server = %name, error = %error, "server unavailable");
        }

        let router = Arc::new(Router::new(Arc::clone(&supervisor), Arc::new(plugins)));
        let changes = supervisor.subscribe();
        router.refresh();
        let refresh_task = tokio::spawn(refresh_loop(Arc::downgrade(&router), changes));

        let metadata = router.get_metadata();
        tracing::info!(
            status = metadata.status,
            servers = metadata.servers.len(),
            capabilities = metadata.capabilities.len(),
            "gateway ready"
        );

        Self {
            supervisor,
            router,
            refresh_task,
            plugin_errors,
            spawn_errors,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Plugins that failed to resolve or load at startup.
    pub fn plugin_errors(&self) -> &[PluginError] {
        &self.plugin_errors
    }

    /// Backends that failed to start at startup.
    pub fn spawn_errors(&self) -> &[(String, BackendError)] {
        &self.spawn_errors
    }

    /// Add a backend at runtime. Its capabilities appear after the next
    /// registry refresh.
    pub async fn register(&self, config: ServerConfig) -> Result<(), BackendError> {
        self.supervisor.spawn(config).await
    }

    /// Stop refreshing and shut every backend down.
    pub async fn shutdown(&self) {
        self.refresh_task.abort();
        let grace = self.supervisor.settings().shutdown_timeout;
        self.supervisor.shutdown(grace).await;
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

/// Rebuild the registry after every supervisor state change.
///
/// Bursts of changes collapse into one rebuild because `watch` only keeps
/// the latest value.
async fn refresh_loop(router: Weak<Router>, mut changes: watch::Receiver<u64>) {
    while changes.changed().await.is_ok() {
        let Some(router) = router.upgrade() else {
            break;
        };
        router.refresh();
    }
    tracing::debug!("registry refresh loop stopped");
}
