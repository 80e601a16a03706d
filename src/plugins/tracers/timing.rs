//! Aggregates per-capability call counts and durations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::plugins::context::{CallOutcome, CallRecord};
use crate::plugins::errors::PluginError;
use crate::plugins::traits::TracingPlugin;

const PLUGIN_NAME: &str = "timing";

/// Running totals for one capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub calls: u64,
    pub blocked: u64,
    pub failed: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

impl TimingStats {
    pub fn average_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ms / self.calls as f64
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TimingConfig {
    /// Log a summary line every N calls to the same capability.
    log_every: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { log_every: 1 }
    }
}

#[derive(Debug)]
pub struct TimingTracer {
    log_every: u64,
    stats: Mutex<BTreeMap<String, TimingStats>>,
}

impl Default for TimingTracer {
    fn default() -> Self {
        Self {
            log_every: TimingConfig::default().log_every,
            stats: Mutex::new(BTreeMap::new()),
        }
    }
}

impl TimingTracer {
    /// Copy of the current totals, keyed by exposed capability name.
    pub fn stats(&self) -> BTreeMap<String, TimingStats> {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl TracingPlugin for TimingTracer {
    fn load(&mut self, config: &serde_json::Value) -> Result<(), PluginError> {
        if !config.is_null() {
            let config: TimingConfig = serde_json::from_value(config.clone())
                .map_err(|e| PluginError::load(PLUGIN_NAME, format!("invalid config: {e}")))?;
            self.log_every = config.log_every.max(1);
        }
        Ok(())
    }

    async fn on_call(&self, record: &CallRecord) -> Result<(), PluginError> {
        let snapshot = {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            let entry = stats.entry(record.qualified_name.clone()).or_default();
            entry.calls += 1;
            match record.outcome {
                CallOutcome::Completed => {}
                CallOutcome::Blocked { .. } => entry.blocked += 1,
                CallOutcome::Failed { .. } => entry.failed += 1,
            }
            entry.total_ms += record.duration_ms;
            entry.max_ms = entry.max_ms.max(record.duration_ms);
            entry.clone()
        };

        if snapshot.calls % self.log_every == 0 {
            tracing::info!(
                capability = %record.qualified_name,
                calls = snapshot.calls,
                blocked = snapshot.blocked,
                failed = snapshot.failed,
                avg_ms = snapshot.average_ms(),
                max_ms = snapshot.max_ms,
                "capability timing"
            );
        }
        Ok(())
    }
}
