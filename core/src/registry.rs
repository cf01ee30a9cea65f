//! Agent lifecycle and lookup.
//!
//! Tracks every connected agent, assigns stable identifiers, maps
//! connections to agents, and answers catalog and command-ownership
//! queries. State here is process-lifetime only and is never persisted.

use std::collections::BTreeMap as StdBTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::conn::ConnectionHandle;

/// A single command entry in a manifest: either a bare name or a record
/// with a name plus optional description/args.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestCommand {
    Name(String),
    Detailed {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
    },
}

impl ManifestCommand {
    pub fn name(&self) -> &str {
        match self {
            ManifestCommand::Name(n) => n,
            ManifestCommand::Detailed { name, .. } => name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            ManifestCommand::Name(_) => None,
            ManifestCommand::Detailed { description, .. } => description.as_deref(),
        }
    }
}

/// An agent's registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub commands: Vec<ManifestCommand>,
    #[serde(default)]
    pub panels: serde_json::Value,
}

/// Record of one registered agent.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub agent_id: String,
    pub name: String,
    pub manifest: Manifest,
    /// Absent for the in-process admin agent.
    pub connection: Option<ConnectionHandle>,
    pub privileged: bool,
}

impl AgentEntry {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// An entry in the `agent.catalog` response.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub agent_id: String,
    pub name: String,
    pub commands: Vec<ManifestCommand>,
    pub description: Option<String>,
    pub panels: serde_json::Value,
}

/// Tracks connected agents: lifecycle, connection mapping, and lookups.
///
/// ```
/// use mist_core::registry::{AgentRegistry, Manifest};
///
/// let registry = AgentRegistry::new();
/// let manifest = Manifest { name: "mist".into(), description: None, commands: vec![], panels: serde_json::Value::Null };
/// let entry = registry.register(None, manifest, false);
/// assert_eq!(entry.agent_id, "mist-0");
/// ```
pub struct AgentRegistry {
    agents: DashMap<String, AgentEntry>,
    conn_to_agent: DashMap<u64, String>,
    name_counters: DashMap<String, u64>,
    /// Monotonic, used only to pick a tie-break winner deterministically
    /// among same-instant registrations for `find_command_owner`.
    registration_order: AtomicU64,
    order_of: DashMap<String, u64>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry {
            agents: DashMap::new(),
            conn_to_agent: DashMap::new(),
            name_counters: DashMap::new(),
            registration_order: AtomicU64::new(0),
            order_of: DashMap::new(),
        }
    }

    /// Register a new agent, assigning `"<name>-<n>"` with `n` a
    /// per-name counter starting at 0 and never decreasing.
    pub fn register(
        &self,
        connection: Option<ConnectionHandle>,
        manifest: Manifest,
        privileged: bool,
    ) -> AgentEntry {
        let name = manifest.name.clone();
        let mut counter = self.name_counters.entry(name.clone()).or_insert(0);
        let n = *counter;
        *counter += 1;
        drop(counter);

        let agent_id = format!("{name}-{n}");
        let order = self.registration_order.fetch_add(1, Ordering::Relaxed);
        self.order_of.insert(agent_id.clone(), order);

        if let Some(conn) = &connection {
            self.conn_to_agent.insert(conn.id(), agent_id.clone());
        }

        let entry = AgentEntry {
            agent_id: agent_id.clone(),
            name,
            manifest,
            connection,
            privileged,
        };
        self.agents.insert(agent_id, entry.clone());
        entry
    }

    pub fn unregister(&self, agent_id: &str) -> Option<AgentEntry> {
        let (_, entry) = self.agents.remove(agent_id)?;
        if let Some(conn) = &entry.connection {
            self.conn_to_agent.remove(&conn.id());
        }
        self.order_of.remove(agent_id);
        Some(entry)
    }

    pub fn unregister_by_conn(&self, conn: &ConnectionHandle) -> Option<AgentEntry> {
        let agent_id = self.conn_to_agent.get(&conn.id()).map(|e| e.clone())?;
        self.unregister(&agent_id)
    }

    pub fn get_by_id(&self, agent_id: &str) -> Option<AgentEntry> {
        self.agents.get(agent_id).map(|e| e.clone())
    }

    pub fn get_by_conn(&self, conn: &ConnectionHandle) -> Option<AgentEntry> {
        let agent_id = self.conn_to_agent.get(&conn.id())?.clone();
        self.get_by_id(&agent_id)
    }

    pub fn all_agents(&self) -> Vec<AgentEntry> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    /// The first privileged entry, by registration order, if any.
    pub fn get_default_agent(&self) -> Option<AgentEntry> {
        self.all_agents_in_order()
            .into_iter()
            .find(|e| e.privileged)
    }

    /// First entry whose manifest commands include `name`, by
    /// registration order (first registration wins ties).
    pub fn find_command_owner(&self, name: &str) -> Option<AgentEntry> {
        self.all_agents_in_order()
            .into_iter()
            .find(|e| e.manifest.commands.iter().any(|c| c.name() == name))
    }

    pub fn build_catalog(&self) -> Vec<CatalogEntry> {
        self.all_agents_in_order()
            .into_iter()
            .map(|e| CatalogEntry {
                agent_id: e.agent_id,
                name: e.name,
                commands: e.manifest.commands,
                description: e.manifest.description,
                panels: e.manifest.panels,
            })
            .collect()
    }

    fn all_agents_in_order(&self) -> Vec<AgentEntry> {
        let mut ordered: StdBTreeMap<u64, AgentEntry> = StdBTreeMap::new();
        for entry in self.agents.iter() {
            let order = self
                .order_of
                .get(entry.key())
                .map(|o| *o)
                .unwrap_or(u64::MAX);
            ordered.insert(order, entry.value().clone());
        }
        ordered.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(name: &str, commands: &[&str]) -> Manifest {
        Manifest {
            name: name.to_string(),
            description: None,
            commands: commands.iter().map(|c| ManifestCommand::Name(c.to_string())).collect(),
            panels: serde_json::Value::Null,
        }
    }

    #[test]
    fn counters_increment_per_name_and_never_decrement() {
        let registry = AgentRegistry::new();
        let a = registry.register(None, manifest("mist", &[]), false);
        let b = registry.register(None, manifest("mist", &[]), false);
        assert_eq!(a.agent_id, "mist-0");
        assert_eq!(b.agent_id, "mist-1");

        registry.unregister(&a.agent_id);
        let c = registry.register(None, manifest("mist", &[]), false);
        assert_eq!(c.agent_id, "mist-2");
    }

    #[test]
    fn find_command_owner_returns_first_registration_on_tie() {
        let registry = AgentRegistry::new();
        registry.register(None, manifest("echo", &["ping"]), false);
        registry.register(None, manifest("echo2", &["ping"]), false);
        let owner = registry.find_command_owner("ping").unwrap();
        assert_eq!(owner.name, "echo");
    }

    #[test]
    fn unregister_by_conn_removes_mapping() {
        let registry = AgentRegistry::new();
        let (handle, _rx) = ConnectionHandle::new();
        let entry = registry.register(Some(handle.clone()), manifest("ui", &[]), false);
        assert!(registry.get_by_conn(&handle).is_some());
        let removed = registry.unregister_by_conn(&handle).unwrap();
        assert_eq!(removed.agent_id, entry.agent_id);
        assert!(registry.get_by_conn(&handle).is_none());
    }

    #[test]
    fn default_agent_is_first_privileged() {
        let registry = AgentRegistry::new();
        registry.register(None, manifest("notes", &[]), false);
        let admin = registry.register(None, manifest("admin", &[]), true);
        let default = registry.get_default_agent().unwrap();
        assert_eq!(default.agent_id, admin.agent_id);
    }

    #[test]
    fn build_catalog_lists_all_agents() {
        let registry = AgentRegistry::new();
        registry.register(None, manifest("mist", &["help"]), true);
        let catalog = registry.build_catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].agent_id, "mist-0");
    }
}
