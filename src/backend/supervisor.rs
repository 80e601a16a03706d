//! Server supervisor: owns every backend process.
//!
//! Spawns backends, routes calls to them, watches for unexpected exits,
//! restarts crashed servers with exponential backoff, and shuts everything
//! down. Every state change bumps a `watch` counter so the capability
//! registry can rebuild.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use super::errors::BackendError;
use super::lifecycle::{self, DiscoveredCapabilities, ManagedServer, RestartPolicy};
use super::transport::{extract_result, ExitInfo};
use super::types::{BackendState, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single backend call (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for the initialize handshake.
///
/// Generous to accommodate servers that import large frameworks at startup.
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;

/// Default grace period for shutdown before force-killing.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Poll interval while draining in-flight calls during shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(25);

// ─── Settings ────────────────────────────────────────────────────────────────

/// Timeouts and restart policy applied to every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub call_timeout: Duration,
    pub init_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            init_timeout: Duration::from_millis(DEFAULT_INIT_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            restart: RestartPolicy::default(),
        }
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Externally visible status of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub restart_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct BackendSlot {
    config: ServerConfig,
    state: BackendState,
    server: Option<Arc<ManagedServer>>,
    restart_attempts: u32,
    last_error: Option<String>,
    /// When the current process was installed.
    ready_since: Option<Instant>,
    /// Incremented whenever the slot is (re)installed or intentionally torn
    /// down; a monitor whose generation is stale ignores the exit it sees.
    generation: u64,
}

impl BackendSlot {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: BackendState::Starting,
            server: None,
            restart_attempts: 0,
            last_error: None,
            ready_since: None,
            generation: 0,
        }
    }

    fn status(&self, name: &str) -> BackendStatus {
        BackendStatus {
            name: name.to_string(),
            state: self.state,
            restart_attempts: self.restart_attempts,
            last_error: self.last_error.clone(),
        }
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Owns the set of backend processes. Always used behind an `Arc`.
pub struct Supervisor {
    settings: SupervisorSettings,
    slots: RwLock<BTreeMap<String, BackendSlot>>,
    changes: watch::Sender<u64>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            settings,
            slots: RwLock::new(BTreeMap::new()),
            changes,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Subscribe to the change counter (bumped on every state transition).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, BackendSlot>> {
        self.slots.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, BackendSlot>> {
        self.slots.write().unwrap_or_else(|p| p.into_inner())
    }

    fn notify_change(&self) {
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
    }

    fn set_state(&self, name: &str, state: BackendState) {
        if let Some(slot) = self.write().get_mut(name) {
            slot.state = state;
        }
        self.notify_change();
    }

    // ─── Spawning ────────────────────────────────────────────────────────

    /// Launch a new backend and perform its handshake.
    ///
    /// On failure the backend is recorded as `Failed` (so status reporting
    /// can show it) but holds no process and contributes no capabilities.
    /// Other backends are unaffected.
    pub async fn spawn(self: &Arc<Self>, config: ServerConfig) -> Result<(), BackendError> {
        let name = config.name.clone();
        {
            let mut slots = self.write();
            let mut slot = BackendSlot::new(config.clone());
            if let Some(existing) = slots.get(&name) {
                if existing.state.is_listed() {
                    return Err(BackendError::AlreadyRegistered { name });
                }
                slot.generation = existing.generation + 1;
            }
            slots.insert(name.clone(), slot);
        }
        self.notify_change();
        tracing::info!(server = %name, command = %config.command, "starting backend server");

        match lifecycle::spawn_server(&config, self.settings.init_timeout).await {
            Ok(server) => {
                self.install(&name, server);
                Ok(())
            }
            Err(e) => {
                tracing::error!(server = %name, error = %e, "failed to start server");
                if let Some(slot) = self.write().get_mut(&name) {
                    slot.state = BackendState::Failed;
                    slot.last_error = Some(e.to_string());
                }
                self.notify_change();
                Err(e)
            }
        }
    }

    /// Spawn all configured servers concurrently.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all(self: &Arc<Self>, configs: &[ServerConfig]) -> Vec<(String, BackendError)> {
        let spawns = configs.iter().map(|config| {
            let this = Arc::clone(self);
            let config = config.clone();
            async move {
                let name = config.name.clone();
                this.spawn(config).await.map_err(|e| (name, e))
            }
        });

        futures::future::join_all(spawns)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }

    /// Mark a freshly spawned server Ready and start watching it.
    fn install(self: &Arc<Self>, name: &str, server: ManagedServer) {
        let server = Arc::new(server);
        let generation = {
            let mut slots = self.write();
            let Some(slot) = slots.get_mut(name) else {
                return;
            };
            slot.generation += 1;
            slot.state = BackendState::Ready;
            slot.server = Some(Arc::clone(&server));
            slot.ready_since = Some(Instant::now());
            slot.generation
        };
        self.start_monitor(name.to_string(), server, generation);
        self.notify_change();
        tracing::info!(server = %name, "backend server ready");
    }

    // ─── Monitoring ──────────────────────────────────────────────────────

    fn start_monitor(self: &Arc<Self>, name: String, server: Arc<ManagedServer>, generation: u64) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = server.transport.wait_exit().await;
            drop(server);
            if let Some(this) = weak.upgrade() {
                this.handle_exit(&name, generation, exit).await;
            }
        });
    }

    /// Whether a monitor for `generation` still speaks for the slot.
    fn is_current(&self, name: &str, generation: u64) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        self.read()
            .get(name)
            .map(|slot| slot.generation == generation && slot.state != BackendState::Stopped)
            .unwrap_or(false)
    }

    /// React to a backend process exiting.
    ///
    /// Intentional exits (shutdown, stop, explicit restart) are ignored.
    /// Otherwise the backend is restarted with backoff until the attempt cap,
    /// after which it stays `Failed`. A process that ran longer than the
    /// policy's `reset_after` starts over with a full attempt budget.
    async fn handle_exit(self: &Arc<Self>, name: &str, generation: u64, exit: ExitInfo) {
        if !self.is_current(name, generation) {
            return;
        }

        tracing::warn!(server = %name, exit = %exit.description, "server exited unexpectedly");
        let policy = self.settings.restart;
        let config = {
            let mut slots = self.write();
            let Some(slot) = slots.get_mut(name) else {
                return;
            };
            let uptime = slot
                .ready_since
                .take()
                .map(|since| since.elapsed())
                .unwrap_or_default();
            slot.restart_attempts = policy.attempts_after_exit(slot.restart_attempts, uptime);
            slot.server = None;
            slot.last_error = Some(format!("process exited: {}", exit.description));
            slot.config.clone()
        };

        loop {
            let attempt = self
                .read()
                .get(name)
                .map(|slot| slot.restart_attempts)
                .unwrap_or(policy.max_attempts);

            if attempt >= policy.max_attempts {
                let err = BackendError::RestartExhausted {
                    name: name.to_string(),
                    attempts: attempt,
                };
                tracing::error!(server = %name, error = %err, "giving up on server");
                if let Some(slot) = self.write().get_mut(name) {
                    slot.state = BackendState::Failed;
                    slot.last_error = Some(err.to_string());
                }
                self.notify_change();
                return;
            }

            self.set_state(name, BackendState::Degraded);
            let delay = policy.delay_for(attempt);
            tracing::info!(server = %name, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "restarting server after backoff");
            tokio::time::sleep(delay).await;

            if !self.is_current(name, generation) {
                return;
            }
            if let Some(slot) = self.write().get_mut(name) {
                slot.restart_attempts = attempt + 1;
                slot.state = BackendState::Starting;
            }
            self.notify_change();

            match lifecycle::spawn_server(&config, self.settings.init_timeout).await {
                Ok(server) => {
                    if !self.is_current(name, generation) {
                        server.shutdown(Duration::ZERO).await;
                        return;
                    }
                    self.install(name, server);
                    return;
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "restart attempt failed");
                    if let Some(slot) = self.write().get_mut(name) {
                        slot.last_error = Some(e.to_string());
                    }
                }
            }
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    fn ready_server(&self, name: &str) -> Result<Arc<ManagedServer>, BackendError> {
        let slots = self.read();
        let slot = slots.get(name).ok_or_else(|| BackendError::UnknownServer {
            name: name.to_string(),
        })?;
        match (&slot.server, slot.state) {
            (Some(server), BackendState::Ready) => Ok(Arc::clone(server)),
            (_, state) => Err(BackendError::Unavailable {
                name: name.to_string(),
                state,
            }),
        }
    }

    /// Send a request to a backend and wait for its result.
    ///
    /// `timeout` falls back to the configured call timeout. JSON-RPC error
    /// replies surface as `BackendError::Remote`.
    pub async fn send(
        &self,
        name: &str,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, BackendError> {
        let server = self.ready_server(name)?;
        let timeout = timeout.unwrap_or(self.settings.call_timeout);
        let response = server.transport.request(method, params, timeout).await?;
        extract_result(name, response)
    }

    /// Capabilities a Ready backend advertised when it started.
    ///
    /// Never talks to the process, so a backend busy with long calls still
    /// answers.
    pub fn capabilities(&self, name: &str) -> Result<DiscoveredCapabilities, BackendError> {
        Ok(self.ready_server(name)?.capabilities.clone())
    }

    // ─── Explicit Control ────────────────────────────────────────────────

    /// Restart a backend on request, resetting its retry counter.
    ///
    /// This is the only way out of `Failed`.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<(), BackendError> {
        let (config, old) = self.retire(name, BackendState::Starting)?;
        if let Some(old) = old {
            old.shutdown(self.settings.shutdown_timeout).await;
        }
        if let Some(slot) = self.write().get_mut(name) {
            slot.restart_attempts = 0;
            slot.last_error = None;
            slot.ready_since = None;
        }
        self.notify_change();

        match lifecycle::spawn_server(&config, self.settings.init_timeout).await {
            Ok(server) => {
                self.install(name, server);
                Ok(())
            }
            Err(e) => {
                if let Some(slot) = self.write().get_mut(name) {
                    slot.state = BackendState::Failed;
                    slot.last_error = Some(e.to_string());
                }
                self.notify_change();
                Err(e)
            }
        }
    }

    /// Gracefully stop one backend. It stays listed as `Stopped`.
    pub async fn stop(&self, name: &str) -> Result<(), BackendError> {
        let (_, old) = self.retire(name, BackendState::Stopped)?;
        self.notify_change();
        if let Some(old) = old {
            old.shutdown(self.settings.shutdown_timeout).await;
        }
        tracing::info!(server = %name, "backend server stopped");
        Ok(())
    }

    /// Detach the running process from a slot so its monitor ignores the exit.
    fn retire(
        &self,
        name: &str,
        next: BackendState,
    ) -> Result<(ServerConfig, Option<Arc<ManagedServer>>), BackendError> {
        let mut slots = self.write();
        let slot = slots.get_mut(name).ok_or_else(|| BackendError::UnknownServer {
            name: name.to_string(),
        })?;
        slot.generation += 1;
        slot.state = next;
        Ok((slot.config.clone(), slot.server.take()))
    }

    /// Force-kill a backend process without marking it intentional.
    ///
    /// The monitor sees an unexpected exit and applies the restart policy,
    /// exactly as if the process had crashed.
    pub fn kill(&self, name: &str) -> Result<(), BackendError> {
        let server = self.ready_server(name)?;
        tracing::warn!(server = %name, "force-killing backend process");
        server.transport.kill();
        Ok(())
    }

    /// Request graceful termination of every backend.
    ///
    /// Waits for in-flight calls to drain until `grace` elapses, then
    /// closes each backend and force-kills whatever is still alive at the
    /// deadline. Calls still pending at that point resolve as protocol
    /// errors. Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + grace;

        let servers: Vec<Arc<ManagedServer>> = {
            let mut slots = self.write();
            slots
                .values_mut()
                .filter_map(|slot| {
                    slot.generation += 1;
                    slot.state = BackendState::Stopped;
                    slot.server.take()
                })
                .collect()
        };
        self.notify_change();

        while Instant::now() < deadline
            && servers.iter().any(|s| s.transport.pending_count() > 0)
        {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        futures::future::join_all(servers.iter().map(|s| s.shutdown(remaining))).await;
        tracing::info!(count = servers.len(), "all backend servers stopped");
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Current state of one backend.
    pub fn state(&self, name: &str) -> Option<BackendState> {
        self.read().get(name).map(|slot| slot.state)
    }

    /// Status of every known backend, ordered by name.
    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.read()
            .iter()
            .map(|(name, slot)| slot.status(name))
            .collect()
    }

    /// Names of backends currently accepting calls.
    pub fn ready_servers(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|(_, slot)| slot.state == BackendState::Ready)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Wait until a backend reaches `state`, or `timeout` elapses.
    pub async fn wait_for_state(&self, name: &str, state: BackendState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            loop {
                if self.state(name) == Some(state) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        reached.is_ok() && self.state(name) == Some(state)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
