//! Plugin manager: instantiates the enabled plugins and runs the chains.
//!
//! Chain semantics:
//! - Guardrails run in configured order, each seeing the previous one's output.
//! - A `Block` on the request path stops the chain; no backend call follows.
//! - The response path is transform-only.
//! - A plugin that errors or panics is skipped (context left unchanged)
//!   unless strict mode is on, in which case the failure blocks the call.
//! - Tracers all run, concurrently; their failures are only logged.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::context::{CallContext, CallRecord};
use super::errors::PluginError;
use super::registry::{PluginConstructor, PluginDescriptor, PluginKind, PluginRegistry, ALL_PLUGINS};
use super::traits::{GuardrailPlugin, RequestDecision, TracingPlugin};

/// Which plugins to enable, and how to configure them.
#[derive(Debug, Clone, Default)]
pub struct PluginSelection {
    /// Guardrail identifiers, in execution order.
    pub guardrails: Vec<String>,
    pub tracers: Vec<String>,
    /// Per-plugin configuration, keyed by primary name or alias.
    pub config: HashMap<String, serde_json::Value>,
    /// Treat plugin failures as blocks.
    pub strict: bool,
}

/// Result of the request chain.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Every guardrail passed; `ctx.arguments` holds the final arguments.
    Allowed,
    Blocked { plugin: String, reason: String },
}

/// Result of the response chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// `ctx.response` holds the final response.
    Delivered,
    /// Strict mode only: a guardrail failed and the response must not be returned.
    Withheld { plugin: String, reason: String },
}

struct Loaded<T: ?Sized> {
    name: &'static str,
    instance: Box<T>,
}

/// The loaded plugin instances for one run.
pub struct PluginManager {
    guardrails: Vec<Loaded<dyn GuardrailPlugin>>,
    tracers: Vec<Loaded<dyn TracingPlugin>>,
    strict: bool,
}

impl PluginManager {
    /// A manager with no plugins.
    pub fn empty() -> Self {
        Self {
            guardrails: Vec::new(),
            tracers: Vec::new(),
            strict: false,
        }
    }

    /// Resolve, construct, and load the selected plugins.
    ///
    /// Each failure (unknown identifier, wrong kind, failing `load`) is
    /// scoped to one plugin: it is logged, returned, and the plugin is left
    /// out. Identifiers naming the same plugin twice load it once.
    pub fn instantiate(registry: &PluginRegistry, selection: &PluginSelection) -> (Self, Vec<PluginError>) {
        let mut errors = Vec::new();
        let mut manager = Self {
            strict: selection.strict,
            ..Self::empty()
        };

        for descriptor in resolve(registry, &selection.guardrails, PluginKind::Guardrail, &mut errors) {
            let config = config_for(registry, descriptor, &selection.config);
            if let PluginConstructor::Guardrail(construct) = descriptor.constructor {
                match build(descriptor.name, construct, |p| p.load(&config)) {
                    Ok(instance) => manager.guardrails.push(Loaded {
                        name: descriptor.name,
                        instance,
                    }),
                    Err(e) => errors.push(e),
                }
            }
        }

        for descriptor in resolve(registry, &selection.tracers, PluginKind::Tracing, &mut errors) {
            let config = config_for(registry, descriptor, &selection.config);
            if let PluginConstructor::Tracing(construct) = descriptor.constructor {
                match build(descriptor.name, construct, |p| p.load(&config)) {
                    Ok(instance) => manager.tracers.push(Loaded {
                        name: descriptor.name,
                        instance,
                    }),
                    Err(e) => errors.push(e),
                }
            }
        }

        for error in &errors {
            tracing::error!(error = %error, "plugin not loaded");
        }
        tracing::info!(
            guardrails = ?manager.guardrail_names(),
            tracers = ?manager.tracer_names(),
            strict = manager.strict,
            "plugins loaded"
        );
        (manager, errors)
    }

    pub fn guardrail_names(&self) -> Vec<&'static str> {
        self.guardrails.iter().map(|p| p.name).collect()
    }

    pub fn tracer_names(&self) -> Vec<&'static str> {
        self.tracers.iter().map(|p| p.name).collect()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    // ─── Chains ──────────────────────────────────────────────────────────

    /// Run the request guardrails over `ctx.arguments`.
    pub async fn run_request_chain(&self, ctx: &mut CallContext) -> RequestOutcome {
        for plugin in &self.guardrails {
            match isolate(plugin.name, plugin.instance.process_request(ctx)).await {
                Ok(RequestDecision::Allow(arguments)) => ctx.arguments = arguments,
                Ok(RequestDecision::Block { reason }) => {
                    tracing::info!(call_id = %ctx.call_id, plugin = plugin.name, reason = %reason, "request blocked by guardrail");
                    ctx.metadata
                        .insert("blocked_by".into(), serde_json::Value::from(plugin.name));
                    return RequestOutcome::Blocked {
                        plugin: plugin.name.to_string(),
                        reason,
                    };
                }
                Err(e) => {
                    if let Some((plugin, reason)) = self.on_failure(ctx, plugin.name, e) {
                        return RequestOutcome::Blocked { plugin, reason };
                    }
                }
            }
        }
        RequestOutcome::Allowed
    }

    /// Run the response guardrails over `ctx.response`.
    pub async fn run_response_chain(&self, ctx: &mut CallContext) -> ResponseOutcome {
        for plugin in &self.guardrails {
            match isolate(plugin.name, plugin.instance.process_response(ctx)).await {
                Ok(response) => ctx.response = Some(response),
                Err(e) => {
                    if let Some((plugin, reason)) = self.on_failure(ctx, plugin.name, e) {
                        return ResponseOutcome::Withheld { plugin, reason };
                    }
                }
            }
        }
        ResponseOutcome::Delivered
    }

    /// Record a plugin failure. Returns `(plugin, reason)` if it must block.
    fn on_failure(&self, ctx: &mut CallContext, plugin: &str, error: PluginError) -> Option<(String, String)> {
        tracing::warn!(call_id = %ctx.call_id, plugin, error = %error, strict = self.strict, "guardrail failed");
        ctx.push_metadata("plugin_errors", serde_json::Value::from(error.to_string()));
        self.strict.then(|| {
            ctx.metadata
                .insert("blocked_by".into(), serde_json::Value::from(plugin));
            (plugin.to_string(), error.to_string())
        })
    }

    /// Notify every tracer of a finished call. Never fails.
    pub async fn run_tracing(&self, record: &CallRecord) {
        let calls = self.tracers.iter().map(|plugin| async move {
            if let Err(e) = isolate(plugin.name, plugin.instance.on_call(record)).await {
                tracing::warn!(call_id = %record.call_id, plugin = plugin.name, error = %e, "tracing plugin failed");
            }
        });
        futures::future::join_all(calls).await;
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Expand `all`, resolve identifiers, and drop repeats.
fn resolve<'r>(
    registry: &'r PluginRegistry,
    identifiers: &[String],
    kind: PluginKind,
    errors: &mut Vec<PluginError>,
) -> Vec<&'r PluginDescriptor> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for id in identifiers {
        let matches: Vec<&PluginDescriptor> = if id.eq_ignore_ascii_case(ALL_PLUGINS) {
            registry.of_kind(kind).collect()
        } else {
            match registry.get(id) {
                Some(d) if d.kind() == kind => vec![d],
                Some(d) => {
                    errors.push(PluginError::WrongKind {
                        identifier: id.clone(),
                        expected: kind.to_string(),
                        actual: d.kind().to_string(),
                    });
                    continue;
                }
                None => {
                    errors.push(PluginError::Unknown {
                        identifier: id.clone(),
                    });
                    continue;
                }
            }
        };

        for descriptor in matches {
            if seen.insert(descriptor.name) {
                resolved.push(descriptor);
            }
        }
    }
    resolved
}

/// Find the configuration object for a plugin under any of its identifiers.
fn config_for(
    registry: &PluginRegistry,
    descriptor: &PluginDescriptor,
    config: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    config
        .iter()
        .find(|(key, _)| registry.get(key).map(|d| d.name) == Some(descriptor.name))
        .map(|(_, value)| value.clone())
        .unwrap_or(serde_json::Value::Null)
}

/// Construct and load one plugin, converting panics into load errors.
fn build<T: ?Sized>(
    name: &str,
    construct: fn() -> Box<T>,
    load: impl FnOnce(&mut T) -> Result<(), PluginError>,
) -> Result<Box<T>, PluginError> {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut instance = construct();
        load(instance.as_mut())?;
        Ok(instance)
    }));
    match result {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(PluginError::Load { reason, .. })) => Err(PluginError::load(name, reason)),
        Ok(Err(other)) => Err(PluginError::load(name, other.to_string())),
        Err(panic) => Err(PluginError::load(name, format!("panicked: {}", panic_message(&*panic)))),
    }
}

/// Await a plugin hook, converting panics into execution errors.
async fn isolate<T>(
    plugin: &str,
    hook: impl Future<Output = Result<T, PluginError>>,
) -> Result<T, PluginError> {
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(PluginError::execution(
            plugin,
            format!("panicked: {}", panic_message(&*panic)),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::backend::CapabilityKind;
    use crate::plugins::context::CallOutcome;
    use crate::registry::Capability;

    /// Appends a suffix to `arguments.text` and to the response string.
    struct Append(&'static str);

    #[async_trait]
    impl GuardrailPlugin for Append {
        async fn process_request(&self, ctx: &CallContext) -> Result<RequestDecision, PluginError> {
            let text = ctx.arguments["text"].as_str().unwrap_or_default();
            Ok(RequestDecision::Allow(json!({ "text": format!("{text}{}", self.0) })))
        }

        async fn process_response(&self, ctx: &CallContext) -> Result<serde_json::Value, PluginError> {
            let text = ctx.response.as_ref().and_then(|r| r.as_str()).unwrap_or_default();
            Ok(json!(format!("{text}{}", self.0)))
        }
    }

    struct Blocker;

    #[async_trait]
    impl GuardrailPlugin for Blocker {
        async fn process_request(&self, _ctx: &CallContext) -> Result<RequestDecision, PluginError> {
            Ok(RequestDecision::Block {
                reason: "forbidden".into(),
            })
        }

        async fn process_response(&self, ctx: &CallContext) -> Result<serde_json::Value, PluginError> {
            Ok(ctx.response.clone().unwrap_or_default())
        }
    }

    struct Faulty;

    #[async_trait]
    impl GuardrailPlugin for Faulty {
        async fn process_request(&self, _ctx: &CallContext) -> Result<RequestDecision, PluginError> {
            panic!("faulty guardrail")
        }

        async fn process_response(&self, _ctx: &CallContext) -> Result<serde_json::Value, PluginError> {
            Err(PluginError::execution("faulty", "boom"))
        }
    }

    struct FailsLoad;

    #[async_trait]
    impl GuardrailPlugin for FailsLoad {
        fn load(&mut self, _config: &serde_json::Value) -> Result<(), PluginError> {
            Err(PluginError::load("fails_load", "missing api key"))
        }

        async fn process_request(&self, ctx: &CallContext) -> Result<RequestDecision, PluginError> {
            Ok(RequestDecision::Allow(ctx.arguments.clone()))
        }

        async fn process_response(&self, ctx: &CallContext) -> Result<serde_json::Value, PluginError> {
            Ok(ctx.response.clone().unwrap_or_default())
        }
    }

    static TRACED: AtomicUsize = AtomicUsize::new(0);

    struct Counter;

    #[async_trait]
    impl TracingPlugin for Counter {
        async fn on_call(&self, _record: &CallRecord) -> Result<(), PluginError> {
            TRACED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenTracer;

    #[async_trait]
    impl TracingPlugin for BrokenTracer {
        async fn on_call(&self, _record: &CallRecord) -> Result<(), PluginError> {
            panic!("tracer exploded")
        }
    }

    fn test_registry() -> PluginRegistry {
        PluginRegistry::new([
            PluginDescriptor::guardrail("append1", Some("a"), || Box::new(Append("1"))),
            PluginDescriptor::guardrail("append2", Some("b"), || Box::new(Append("2"))),
            PluginDescriptor::guardrail("blocker", None, || Box::new(Blocker)),
            PluginDescriptor::guardrail("faulty", None, || Box::new(Faulty)),
            PluginDescriptor::guardrail("fails_load", None, || Box::new(FailsLoad)),
            PluginDescriptor::tracing("counter", None, || Box::new(Counter)),
            PluginDescriptor::tracing("broken", None, || Box::new(BrokenTracer)),
        ])
    }

    fn selection(guardrails: &[&str], tracers: &[&str]) -> PluginSelection {
        PluginSelection {
            guardrails: guardrails.iter().map(|s| s.to_string()).collect(),
            tracers: tracers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn context(text: &str) -> CallContext {
        let capability = Capability {
            server: "files".into(),
            kind: CapabilityKind::Tool,
            raw_name: "echo".into(),
            description: None,
            input_schema: None,
            output_schema: None,
            uri: None,
        };
        CallContext::new("echo", &capability, json!({ "text": text }))
    }

    // ─── Instantiation ──────────────────────────────────────────────────

    #[test]
    fn test_instantiate_preserves_configured_order() {
        let (manager, errors) = PluginManager::instantiate(&test_registry(), &selection(&["b", "A"], &[]));
        assert!(errors.is_empty());
        assert_eq!(manager.guardrail_names(), vec!["append2", "append1"]);
    }

    #[test]
    fn test_instantiate_scopes_failures_to_one_plugin() {
        let (manager, errors) = PluginManager::instantiate(
            &test_registry(),
            &selection(&["append1", "nope", "fails_load", "counter"], &["counter", "append2"]),
        );
        assert_eq!(manager.guardrail_names(), vec!["append1"]);
        assert_eq!(manager.tracer_names(), vec!["counter"]);
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&PluginError::Unknown {
            identifier: "nope".into()
        }));
        assert!(errors.contains(&PluginError::Load {
            plugin: "fails_load".into(),
            reason: "missing api key".into()
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, PluginError::WrongKind { identifier, .. } if identifier == "append2")));
    }

    #[test]
    fn test_all_expands_in_registration_order_without_repeats() {
        let (manager, _) = PluginManager::instantiate(&test_registry(), &selection(&["append2", "all"], &["ALL"]));
        assert_eq!(
            manager.guardrail_names(),
            vec!["append2", "append1", "blocker", "faulty"]
        );
        assert_eq!(manager.tracer_names(), vec!["counter", "broken"]);
    }

    #[test]
    fn test_config_is_found_by_alias() {
        let registry = PluginRegistry::global();
        let mut sel = selection(&["basic"], &[]);
        sel.config
            .insert("SECRETS".into(), json!({"extra_patterns": ["("]}));
        let (manager, errors) = PluginManager::instantiate(registry, &sel);
        assert!(manager.guardrail_names().is_empty());
        assert!(matches!(&errors[0], PluginError::Load { plugin, .. } if plugin == "basic"));
    }

    // ─── Request Chain ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_request_chain_applies_in_order() {
        let (manager, _) = PluginManager::instantiate(&test_registry(), &selection(&["append1", "append2"], &[]));
        let mut ctx = context("base");
        assert_eq!(manager.run_request_chain(&mut ctx).await, RequestOutcome::Allowed);
        assert_eq!(ctx.arguments["text"], "base12");
    }

    #[tokio::test]
    async fn test_block_stops_the_chain() {
        let (manager, _) = PluginManager::instantiate(
            &test_registry(),
            &selection(&["append1", "blocker", "append2"], &[]),
        );
        let mut ctx = context("base");
        let outcome = manager.run_request_chain(&mut ctx).await;
        assert_eq!(
            outcome,
            RequestOutcome::Blocked {
                plugin: "blocker".into(),
                reason: "forbidden".into()
            }
        );
        assert_eq!(ctx.arguments["text"], "base1");
        assert_eq!(ctx.metadata["blocked_by"], "blocker");
    }

    #[tokio::test]
    async fn test_panicking_guardrail_is_pass_through() {
        let (manager, _) = PluginManager::instantiate(
            &test_registry(),
            &selection(&["append1", "faulty", "append2"], &[]),
        );
        let mut ctx = context("base");
        assert_eq!(manager.run_request_chain(&mut ctx).await, RequestOutcome::Allowed);
        assert_eq!(ctx.arguments["text"], "base12");
        let errors = ctx.metadata["plugin_errors"].as_array().unwrap();
        assert!(errors[0].as_str().unwrap().contains("faulty guardrail"));
    }

    #[tokio::test]
    async fn test_strict_mode_blocks_on_failure() {
        let mut sel = selection(&["faulty", "append1"], &[]);
        sel.strict = true;
        let (manager, _) = PluginManager::instantiate(&test_registry(), &sel);
        let mut ctx = context("base");
        match manager.run_request_chain(&mut ctx).await {
            RequestOutcome::Blocked { plugin, reason } => {
                assert_eq!(plugin, "faulty");
                assert!(reason.contains("panicked"), "{reason}");
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
        assert_eq!(ctx.arguments["text"], "base");
    }

    // ─── Response Chain ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_response_chain_transforms_in_order_and_isolates_errors() {
        let (manager, _) = PluginManager::instantiate(
            &test_registry(),
            &selection(&["append2", "faulty", "blocker", "append1"], &[]),
        );
        let mut ctx = context("base");
        ctx.response = Some(json!("out"));
        assert_eq!(manager.run_response_chain(&mut ctx).await, ResponseOutcome::Delivered);
        assert_eq!(ctx.response, Some(json!("out21")));
    }

    #[tokio::test]
    async fn test_strict_mode_withholds_response() {
        let mut sel = selection(&["faulty"], &[]);
        sel.strict = true;
        let (manager, _) = PluginManager::instantiate(&test_registry(), &sel);
        let mut ctx = context("base");
        ctx.response = Some(json!("out"));
        assert!(matches!(
            manager.run_response_chain(&mut ctx).await,
            ResponseOutcome::Withheld { .. }
        ));
    }

    // ─── Tracing ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_tracing_survives_a_panicking_tracer() {
        let (manager, _) = PluginManager::instantiate(&test_registry(), &selection(&[], &["broken", "counter"]));
        let before = TRACED.load(Ordering::SeqCst);
        let record = context("base").into_record(CallOutcome::Completed);
        manager.run_tracing(&record).await;
        assert_eq!(TRACED.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_empty_manager_is_a_no_op() {
        let manager = PluginManager::empty();
        let mut ctx = context("base");
        assert_eq!(manager.run_request_chain(&mut ctx).await, RequestOutcome::Allowed);
        ctx.response = Some(json!("out"));
        assert_eq!(manager.run_response_chain(&mut ctx).await, ResponseOutcome::Delivered);
        assert_eq!(ctx.response, Some(json!("out")));
        assert!(!manager.is_strict());
    }
}
