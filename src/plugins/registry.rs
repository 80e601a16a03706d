//! Plugin registry: the static table of compiled-in plugin types.
//!
//! Built once from [`BUILTIN_PLUGINS`] and read-only afterwards. Identifiers
//! (primary names and aliases) are case-insensitive and unique across both
//! kinds, so a bare identifier always resolves to exactly one plugin.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;

use super::errors::PluginError;
use super::guardrails::BasicGuardrail;
use super::tracers::{LogTracer, TimingTracer};
use super::traits::{GuardrailPlugin, TracingPlugin};

/// Identifier that enables every registered plugin of a kind.
pub const ALL_PLUGINS: &str = "all";

// ─── Descriptor ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Guardrail,
    Tracing,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guardrail => f.write_str("guardrail"),
            Self::Tracing => f.write_str("tracing"),
        }
    }
}

/// Constructor of a fresh, unloaded plugin instance.
#[derive(Clone, Copy)]
pub enum PluginConstructor {
    Guardrail(fn() -> Box<dyn GuardrailPlugin>),
    Tracing(fn() -> Box<dyn TracingPlugin>),
}

/// One compiled-in plugin type.
#[derive(Clone, Copy)]
pub struct PluginDescriptor {
    pub name: &'static str,
    pub alias: Option<&'static str>,
    pub constructor: PluginConstructor,
}

impl PluginDescriptor {
    pub const fn guardrail(
        name: &'static str,
        alias: Option<&'static str>,
        constructor: fn() -> Box<dyn GuardrailPlugin>,
    ) -> Self {
        Self {
            name,
            alias,
            constructor: PluginConstructor::Guardrail(constructor),
        }
    }

    pub const fn tracing(
        name: &'static str,
        alias: Option<&'static str>,
        constructor: fn() -> Box<dyn TracingPlugin>,
    ) -> Self {
        Self {
            name,
            alias,
            constructor: PluginConstructor::Tracing(constructor),
        }
    }

    pub fn kind(&self) -> PluginKind {
        match self.constructor {
            PluginConstructor::Guardrail(_) => PluginKind::Guardrail,
            PluginConstructor::Tracing(_) => PluginKind::Tracing,
        }
    }

    fn identifiers(&self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.name).chain(self.alias)
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("kind", &self.kind())
            .finish()
    }
}

fn new_basic_guardrail() -> Box<dyn GuardrailPlugin> {
    Box::new(BasicGuardrail::default())
}

fn new_log_tracer() -> Box<dyn TracingPlugin> {
    Box::new(LogTracer)
}

fn new_timing_tracer() -> Box<dyn TracingPlugin> {
    Box::new(TimingTracer::default())
}

/// Every compiled-in plugin, in registration order.
///
/// Registration order is the order `all` expands to.
pub static BUILTIN_PLUGINS: &[PluginDescriptor] = &[
    PluginDescriptor::guardrail("basic", Some("secrets"), new_basic_guardrail),
    PluginDescriptor::tracing("log", Some("basic_tracing"), new_log_tracer),
    PluginDescriptor::tracing("timing", Some("simple_timing"), new_timing_tracer),
];

// ─── Registry ────────────────────────────────────────────────────────────────

/// Lookup table over a fixed list of plugin descriptors.
#[derive(Debug)]
pub struct PluginRegistry {
    descriptors: Vec<PluginDescriptor>,
    /// `lowercase identifier → index into descriptors`.
    index: HashMap<String, usize>,
    /// Identifiers rejected because an earlier descriptor already claimed them.
    duplicates: Vec<String>,
}

impl PluginRegistry {
    /// Build a registry; the first descriptor to claim an identifier wins.
    pub fn new(descriptors: impl IntoIterator<Item = PluginDescriptor>) -> Self {
        let mut registry = Self {
            descriptors: Vec::new(),
            index: HashMap::new(),
            duplicates: Vec::new(),
        };

        for descriptor in descriptors {
            let ids: Vec<String> = descriptor
                .identifiers()
                .map(|id| id.to_lowercase())
                .collect();
            if let Some(taken) = ids
                .iter()
                .find(|id| registry.index.contains_key(*id) || id.as_str() == ALL_PLUGINS)
            {
                tracing::warn!(plugin = descriptor.name, identifier = %taken, "duplicate plugin identifier, skipping registration");
                registry.duplicates.push(taken.clone());
                continue;
            }

            let position = registry.descriptors.len();
            for id in ids {
                registry.index.insert(id, position);
            }
            tracing::debug!(plugin = descriptor.name, kind = %descriptor.kind(), "registered plugin");
            registry.descriptors.push(descriptor);
        }
        registry
    }

    /// The process-wide registry of compiled-in plugins.
    pub fn global() -> &'static PluginRegistry {
        static REGISTRY: OnceLock<PluginRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| PluginRegistry::new(BUILTIN_PLUGINS.iter().copied()))
    }

    /// Resolve a primary name or alias (case-insensitive).
    pub fn get(&self, identifier: &str) -> Option<&PluginDescriptor> {
        self.index
            .get(&identifier.to_lowercase())
            .map(|&i| &self.descriptors[i])
    }

    pub fn kind_of(&self, identifier: &str) -> Option<PluginKind> {
        self.get(identifier).map(PluginDescriptor::kind)
    }

    /// All descriptors of one kind, in registration order.
    pub fn of_kind(&self, kind: PluginKind) -> impl Iterator<Item = &PluginDescriptor> {
        self.descriptors.iter().filter(move |d| d.kind() == kind)
    }

    pub fn descriptors(&self) -> &[PluginDescriptor] {
        &self.descriptors
    }

    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    /// Split a flat identifier list into guardrail and tracing lists.
    ///
    /// `all` is added to both lists. Unknown identifiers are returned as
    /// errors and left out. Order is preserved and repeats are removed.
    pub fn partition(&self, identifiers: &[String]) -> PartitionedPlugins {
        let mut out = PartitionedPlugins::default();
        for id in identifiers {
            if id.eq_ignore_ascii_case(ALL_PLUGINS) {
                push_unique(&mut out.guardrails, id);
                push_unique(&mut out.tracers, id);
                continue;
            }
            match self.kind_of(id) {
                Some(PluginKind::Guardrail) => push_unique(&mut out.guardrails, id),
                Some(PluginKind::Tracing) => push_unique(&mut out.tracers, id),
                None => out.unknown.push(PluginError::Unknown {
                    identifier: id.clone(),
                }),
            }
        }
        out
    }
}

/// Result of [`PluginRegistry::partition`].
#[derive(Debug, Default, PartialEq)]
pub struct PartitionedPlugins {
    pub guardrails: Vec<String>,
    pub tracers: Vec<String>,
    pub unknown: Vec<PluginError>,
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing.eq_ignore_ascii_case(id)) {
        list.push(id.to_string());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
