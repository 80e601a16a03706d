//! Capability registry: aggregates tools, resources, and prompts across all
//! ready backends into one exposed namespace.
//!
//! Names are exposed raw when globally unique. Colliding entries are
//! qualified with their server name (`server.name`), and if that still
//! collides, with their kind as well (`server.kind.name`). Qualification is
//! recomputed on every rebuild.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;

use crate::backend::types::{PromptDefinition, ResourceDefinition, ToolDefinition};
use crate::backend::{BackendState, CapabilityKind, DiscoveredCapabilities, Supervisor};

/// Highest qualification level: `server.kind.name`.
const MAX_QUALIFICATION: u8 = 2;

// ─── Capability ──────────────────────────────────────────────────────────────

/// One callable operation, readable resource, or prompt owned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub server: String,
    pub kind: CapabilityKind,
    /// Name as advertised by the backend.
    pub raw_name: String,
    pub description: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
    /// Resource URI (resources only); used as the `resources/read` target.
    pub uri: Option<String>,
}

impl Capability {
    pub fn tool(server: &str, def: ToolDefinition) -> Self {
        Self {
            server: server.to_string(),
            kind: CapabilityKind::Tool,
            raw_name: def.name,
            description: def.description,
            input_schema: def.input_schema,
            output_schema: def.output_schema,
            uri: None,
        }
    }

    pub fn resource(server: &str, def: ResourceDefinition) -> Self {
        Self {
            server: server.to_string(),
            kind: CapabilityKind::Resource,
            raw_name: def.name.unwrap_or_else(|| def.uri.clone()),
            description: def.description,
            input_schema: None,
            output_schema: None,
            uri: Some(def.uri),
        }
    }

    pub fn prompt(server: &str, def: PromptDefinition) -> Self {
        let input_schema = (!def.arguments.is_empty())
            .then(|| serde_json::json!({ "arguments": def.arguments }));
        Self {
            server: server.to_string(),
            kind: CapabilityKind::Prompt,
            raw_name: def.name,
            description: def.description,
            input_schema,
            output_schema: None,
            uri: None,
        }
    }

    fn qualified(&self, level: u8) -> String {
        match level {
            0 => self.raw_name.clone(),
            1 => format!("{}.{}", self.server, self.raw_name),
            _ => format!("{}.{}.{}", self.server, self.kind, self.raw_name),
        }
    }
}

/// One row of the metadata snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityEntry {
    pub name: String,
    pub server: String,
    pub kind: CapabilityKind,
    pub raw_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub server_state: BackendState,
}

/// Lookup of a name that is not in the exposed namespace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("capability not found: '{name}'")]
pub struct CapabilityNotFound {
    pub name: String,
}

// ─── CapabilityRegistry ──────────────────────────────────────────────────────

/// Unified name → capability mapping across all ready backends.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    /// `server → capabilities`, replaced wholesale per server.
    by_server: BTreeMap<String, Vec<Capability>>,
    /// `qualified name → capability`.
    exposed: BTreeMap<String, Capability>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the capabilities each Ready backend advertised
    /// at startup.
    ///
    /// Backends in any other state contribute nothing, and no backend is
    /// contacted. A backend that leaves Ready during the rebuild is skipped.
    pub fn rebuild(supervisor: &Supervisor) -> Self {
        let mut registry = Self::new();
        for name in supervisor.ready_servers() {
            match supervisor.capabilities(&name) {
                Ok(discovered) => registry.set_server(&name, discovered),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "skipping server during registry rebuild");
                }
            }
        }
        tracing::debug!(
            servers = registry.by_server.len(),
            capabilities = registry.len(),
            "capability registry rebuilt"
        );
        registry
    }

    /// Replace one server's capability set and requalify the namespace.
    ///
    /// Duplicate advertisements of the same kind and name from one server
    /// are collapsed (first wins).
    pub fn set_server(&mut self, server: &str, discovered: DiscoveredCapabilities) {
        let mut seen = HashSet::new();
        let capabilities: Vec<Capability> = discovered
            .tools
            .into_iter()
            .map(|t| Capability::tool(server, t))
            .chain(discovered.resources.into_iter().map(|r| Capability::resource(server, r)))
            .chain(discovered.prompts.into_iter().map(|p| Capability::prompt(server, p)))
            .filter(|c| seen.insert((c.kind, c.raw_name.clone())))
            .collect();

        self.by_server.insert(server.to_string(), capabilities);
        self.requalify();
    }

    /// Remove all capabilities belonging to a server.
    pub fn remove_server(&mut self, server: &str) {
        if self.by_server.remove(server).is_some() {
            self.requalify();
        }
    }

    fn requalify(&mut self) {
        self.exposed = qualify(self.by_server.values().flatten());
    }

    /// Look up a capability by its exposed name.
    pub fn lookup(&self, name: &str) -> Result<&Capability, CapabilityNotFound> {
        self.exposed.get(name).ok_or_else(|| CapabilityNotFound {
            name: name.to_string(),
        })
    }

    /// Ordered list of exposed capabilities tagged with live backend state.
    ///
    /// Entries whose backend is currently Failed or Stopped (or unknown) are
    /// left out even if the registry has not been rebuilt yet.
    pub fn snapshot<F>(&self, state_of: F) -> Vec<CapabilityEntry>
    where
        F: Fn(&str) -> Option<BackendState>,
    {
        self.exposed
            .iter()
            .filter_map(|(name, cap)| {
                let state = state_of(cap.server.as_str()).filter(|s| s.is_listed())?;
                Some(CapabilityEntry {
                    name: name.clone(),
                    server: cap.server.clone(),
                    kind: cap.kind,
                    raw_name: cap.raw_name.clone(),
                    description: cap.description.clone(),
                    input_schema: cap.input_schema.clone(),
                    output_schema: cap.output_schema.clone(),
                    server_state: state,
                })
            })
            .collect()
    }

    /// Count capabilities belonging to a specific server.
    pub fn capabilities_for_server(&self, server: &str) -> usize {
        self.exposed.values().filter(|c| c.server == server).count()
    }

    /// Return all exposed names, ordered.
    pub fn names(&self) -> Vec<&str> {
        self.exposed.keys().map(|k| k.as_str()).collect()
    }

    /// Number of exposed capabilities.
    pub fn len(&self) -> usize {
        self.exposed.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.exposed.is_empty()
    }
}

/// Assign a unique exposed name to every capability.
///
/// Only entries that collide are escalated to the next qualification
/// level; entries still colliding at the last level are dropped.
fn qualify<'a>(capabilities: impl Iterator<Item = &'a Capability>) -> BTreeMap<String, Capability> {
    let capabilities: Vec<&Capability> = capabilities.collect();
    let mut levels = vec![0u8; capabilities.len()];

    let group = |levels: &[u8]| {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, cap) in capabilities.iter().enumerate() {
            groups.entry(cap.qualified(levels[i])).or_default().push(i);
        }
        groups
    };

    loop {
        let mut escalated = false;
        for indices in group(&levels).into_values().filter(|g| g.len() > 1) {
            for i in indices {
                if levels[i] < MAX_QUALIFICATION {
                    levels[i] += 1;
                    escalated = true;
                }
            }
        }
        if !escalated {
            break;
        }
    }

    let mut exposed = BTreeMap::new();
    for (name, indices) in group(&levels) {
        if let [only] = indices.as_slice() {
            exposed.insert(name, capabilities[*only].clone());
        } else {
            tracing::warn!(name = %name, count = indices.len(), "dropping capabilities with unresolvable name collision");
        }
    }
    exposed
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: Some(format!("{name} tool")),
            input_schema: Some(serde_json::json!({"type": "object"})),
            output_schema: None,
        }
    }

    fn tools(names: &[&str]) -> DiscoveredCapabilities {
        DiscoveredCapabilities {
            tools: names.iter().map(|n| tool(n)).collect(),
            ..Default::default()
        }
    }

    fn all_ready(_: &str) -> Option<BackendState> {
        Some(BackendState::Ready)
    }

    // ─── Qualification ──────────────────────────────────────────────────

    #[test]
    fn test_unique_names_stay_raw() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["read", "write"]));
        reg.set_server("web", tools(&["fetch"]));

        assert_eq!(reg.names(), vec!["fetch", "read", "write"]);
        assert_eq!(reg.lookup("read").unwrap().server, "files");
    }

    #[test]
    fn test_colliding_names_are_qualified() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["read", "write"]));
        reg.set_server("s3", tools(&["read"]));

        assert_eq!(reg.names(), vec!["files.read", "s3.read", "write"]);
        assert!(reg.lookup("read").is_err());
        assert_eq!(reg.lookup("s3.read").unwrap().server, "s3");
        assert_eq!(reg.lookup("s3.read").unwrap().raw_name, "read");
    }

    #[test]
    fn test_overlapping_sets_never_produce_duplicates() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("a", tools(&["x", "y", "b.x"]));
        reg.set_server("b", tools(&["x", "y", "z"]));
        reg.set_server("c", tools(&["z", "a.y"]));

        let names = reg.names();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        // Every advertised capability survives with some exposed name
        assert_eq!(reg.len(), 8);
    }

    #[test]
    fn test_kind_level_qualification() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server(
            "docs",
            DiscoveredCapabilities {
                tools: vec![tool("summary")],
                prompts: vec![PromptDefinition {
                    name: "summary".into(),
                    description: None,
                    arguments: vec![],
                }],
                ..Default::default()
            },
        );

        assert_eq!(reg.names(), vec!["docs.prompt.summary", "docs.tool.summary"]);
        assert_eq!(
            reg.lookup("docs.prompt.summary").unwrap().kind,
            CapabilityKind::Prompt
        );
    }

    #[test]
    fn test_duplicate_advertisement_collapses() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["read", "read"]));
        assert_eq!(reg.names(), vec!["read"]);
    }

    #[test]
    fn test_resources_use_name_or_uri() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server(
            "files",
            DiscoveredCapabilities {
                resources: vec![
                    ResourceDefinition {
                        uri: "file:///readme".into(),
                        name: Some("readme".into()),
                        description: None,
                        mime_type: None,
                    },
                    ResourceDefinition {
                        uri: "file:///license".into(),
                        name: None,
                        description: None,
                        mime_type: None,
                    },
                ],
                ..Default::default()
            },
        );

        let readme = reg.lookup("readme").unwrap();
        assert_eq!(readme.uri.as_deref(), Some("file:///readme"));
        assert!(reg.lookup("file:///license").is_ok());
    }

    // ─── Replacement & Removal ──────────────────────────────────────────

    #[test]
    fn test_set_server_replaces_wholesale_and_requalifies() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["read"]));
        reg.set_server("s3", tools(&["read"]));
        assert!(reg.lookup("read").is_err());

        reg.set_server("s3", tools(&["list"]));
        assert_eq!(reg.names(), vec!["list", "read"]);

        reg.remove_server("files");
        assert_eq!(reg.names(), vec!["list"]);
        assert_eq!(reg.capabilities_for_server("s3"), 1);
    }

    #[test]
    fn test_lookup_not_found() {
        let reg = CapabilityRegistry::new();
        let err = reg.lookup("ghost").unwrap_err();
        assert_eq!(err.to_string(), "capability not found: 'ghost'");
        assert!(reg.is_empty());
    }

    // ─── Snapshot ───────────────────────────────────────────────────────

    #[test]
    fn test_snapshot_is_ordered_and_tagged() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["write", "read"]));

        let snap = reg.snapshot(all_ready);
        let names: Vec<&str> = snap.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["read", "write"]);
        assert!(snap.iter().all(|e| e.server == "files"));
        assert!(snap.iter().all(|e| e.server_state == BackendState::Ready));
        assert_eq!(snap[0].description.as_deref(), Some("read tool"));
    }

    #[test]
    fn test_snapshot_hides_failed_and_keeps_degraded() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["read"]));
        reg.set_server("web", tools(&["fetch"]));
        reg.set_server("db", tools(&["query"]));

        let snap = reg.snapshot(|server| match server {
            "files" => Some(BackendState::Failed),
            "web" => Some(BackendState::Degraded),
            _ => None,
        });

        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].name, "fetch");
        assert_eq!(snap[0].server_state, BackendState::Degraded);
    }

    #[test]
    fn test_snapshot_serializes_kind_and_state() {
        let mut reg = CapabilityRegistry::new();
        reg.set_server("files", tools(&["read"]));
        let json = serde_json::to_value(reg.snapshot(all_ready)).unwrap();
        assert_eq!(json[0]["kind"], "tool");
        assert_eq!(json[0]["server_state"], "ready");
        assert!(json[0].get("output_schema").is_none());
    }
}
