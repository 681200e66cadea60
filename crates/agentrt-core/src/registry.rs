//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-memory registry of agents, configurations, links and subscribers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The registry holds no behaviour of its own: callers sequence operations inside the
//! coordination lock and the registry's own mutex only guards individual reads and
//! writes. Operations never fail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use agentrt_model::{Asset, Attribute, AttributeRef, ConnectionStatus};
use agentrt_protocol::ProtocolSession;

use crate::broker::ChildAssetCallback;

/// Token returned by a child-asset subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

/// A registered protocol configuration.
#[derive(Debug, Clone)]
pub struct ConfigurationEntry {
    pub configuration_ref: AttributeRef,
    pub attribute: Attribute,
    pub protocol_name: String,
    pub status: ConnectionStatus,
    /// Absent when no driver could be instantiated.
    pub session: Option<Arc<ProtocolSession>>,
}

#[derive(Debug, Clone)]
struct DeferredLink {
    configuration: AttributeRef,
    attribute: Attribute,
}

#[derive(Default)]
struct RegistryState {
    agents: IndexMap<String, Asset>,
    configurations: IndexMap<AttributeRef, ConfigurationEntry>,
    linked: IndexMap<AttributeRef, Vec<(AttributeRef, Attribute)>>,
    deferred: IndexMap<AttributeRef, DeferredLink>,
    subscribers: IndexMap<String, Vec<(SubscriptionId, ChildAssetCallback)>>,
}

/// Comparable view of the registry: configuration statuses and linked attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub configurations: Vec<(AttributeRef, ConnectionStatus)>,
    pub linked_by_config: Vec<(AttributeRef, Vec<AttributeRef>)>,
    pub deferred: Vec<AttributeRef>,
}

impl RegistrySnapshot {
    pub fn status(&self, configuration: &AttributeRef) -> Option<ConnectionStatus> {
        self.configurations
            .iter()
            .find(|(reference, _)| reference == configuration)
            .map(|(_, status)| *status)
    }

    pub fn linked(&self, configuration: &AttributeRef) -> Option<&[AttributeRef]> {
        self.linked_by_config
            .iter()
            .find(|(reference, _)| reference == configuration)
            .map(|(_, attributes)| attributes.as_slice())
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    next_subscription: AtomicU64,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_agent(&self, agent: &Asset) {
        self.state.lock().agents.insert(agent.id.clone(), agent.clone());
    }

    pub fn remove_agent(&self, agent_id: &str) -> Option<Asset> {
        self.state.lock().agents.shift_remove(agent_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<Asset> {
        self.state.lock().agents.get(agent_id).cloned()
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.state.lock().agents.contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.state.lock().agents.keys().cloned().collect()
    }

    /// Register a configuration in `WAITING` with an empty link list.
    pub fn put_configuration(&self, configuration_ref: &AttributeRef, attribute: &Attribute) {
        let protocol_name = attribute.value.as_str().unwrap_or_default().to_owned();
        let mut state = self.state.lock();
        state.configurations.insert(
            configuration_ref.clone(),
            ConfigurationEntry {
                configuration_ref: configuration_ref.clone(),
                attribute: attribute.clone(),
                protocol_name,
                status: ConnectionStatus::Waiting,
                session: None,
            },
        );
        state
            .linked
            .entry(configuration_ref.clone())
            .or_default();
    }

    pub fn set_session(&self, configuration_ref: &AttributeRef, session: Arc<ProtocolSession>) {
        if let Some(entry) = self.state.lock().configurations.get_mut(configuration_ref) {
            entry.session = Some(session);
        }
    }

    /// Drop a configuration and its links. Child-asset subscribers of the agent go
    /// too once the agent has no configuration left.
    pub fn remove_configuration(&self, configuration_ref: &AttributeRef) -> Option<ConfigurationEntry> {
        let mut state = self.state.lock();
        let removed = state.configurations.shift_remove(configuration_ref);
        state.linked.shift_remove(configuration_ref);
        let agent_id = &configuration_ref.asset_id;
        if !state
            .configurations
            .keys()
            .any(|reference| reference.asset_id == *agent_id)
        {
            state.subscribers.shift_remove(agent_id);
        }
        removed
    }

    pub fn configuration(&self, configuration_ref: &AttributeRef) -> Option<ConfigurationEntry> {
        self.state.lock().configurations.get(configuration_ref).cloned()
    }

    pub fn has_configuration(&self, configuration_ref: &AttributeRef) -> bool {
        self.state.lock().configurations.contains_key(configuration_ref)
    }

    /// Configurations in registration order.
    pub fn configuration_refs(&self) -> Vec<AttributeRef> {
        self.state.lock().configurations.keys().cloned().collect()
    }

    pub fn configurations_of(&self, agent_id: &str) -> Vec<AttributeRef> {
        self.state
            .lock()
            .configurations
            .keys()
            .filter(|reference| reference.asset_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn status(&self, configuration_ref: &AttributeRef) -> Option<ConnectionStatus> {
        self.state
            .lock()
            .configurations
            .get(configuration_ref)
            .map(|entry| entry.status)
    }

    /// Store `status`; returns the previous status only when it changed.
    pub fn set_status(
        &self,
        configuration_ref: &AttributeRef,
        status: ConnectionStatus,
    ) -> Option<ConnectionStatus> {
        let mut state = self.state.lock();
        let entry = state.configurations.get_mut(configuration_ref)?;
        if entry.status == status {
            return None;
        }
        Some(std::mem::replace(&mut entry.status, status))
    }

    /// Add or replace a linked attribute; `true` when it was not linked before.
    pub fn link_attribute(
        &self,
        configuration_ref: &AttributeRef,
        attribute_ref: &AttributeRef,
        attribute: &Attribute,
    ) -> bool {
        let mut state = self.state.lock();
        state.deferred.shift_remove(attribute_ref);
        let linked = state.linked.entry(configuration_ref.clone()).or_default();
        match linked.iter_mut().find(|(reference, _)| reference == attribute_ref) {
            Some(existing) => {
                existing.1 = attribute.clone();
                false
            }
            None => {
                linked.push((attribute_ref.clone(), attribute.clone()));
                true
            }
        }
    }

    pub fn unlink_attribute(
        &self,
        configuration_ref: &AttributeRef,
        attribute_ref: &AttributeRef,
    ) -> Option<Attribute> {
        let mut state = self.state.lock();
        let linked = state.linked.get_mut(configuration_ref)?;
        let index = linked
            .iter()
            .position(|(reference, _)| reference == attribute_ref)?;
        Some(linked.remove(index).1)
    }

    pub fn linked_attributes(&self, configuration_ref: &AttributeRef) -> Vec<(AttributeRef, Attribute)> {
        self.state
            .lock()
            .linked
            .get(configuration_ref)
            .cloned()
            .unwrap_or_default()
    }

    /// Every link of attributes belonging to `asset_id`, as `(configuration, attribute)`.
    pub fn links_of_asset(&self, asset_id: &str) -> Vec<(AttributeRef, AttributeRef, Attribute)> {
        let state = self.state.lock();
        state
            .linked
            .iter()
            .flat_map(|(configuration, attributes)| {
                attributes
                    .iter()
                    .filter(|(reference, _)| reference.asset_id == asset_id)
                    .map(move |(reference, attribute)| {
                        (configuration.clone(), reference.clone(), attribute.clone())
                    })
            })
            .collect()
    }

    pub fn defer(&self, attribute_ref: &AttributeRef, configuration: &AttributeRef, attribute: &Attribute) {
        self.state.lock().deferred.insert(
            attribute_ref.clone(),
            DeferredLink {
                configuration: configuration.clone(),
                attribute: attribute.clone(),
            },
        );
    }

    pub fn remove_deferred(&self, attribute_ref: &AttributeRef) -> bool {
        self.state.lock().deferred.shift_remove(attribute_ref).is_some()
    }

    pub fn remove_deferred_of_asset(&self, asset_id: &str) {
        self.state
            .lock()
            .deferred
            .retain(|reference, _| reference.asset_id != asset_id);
    }

    /// Deferred attributes waiting for `configuration`, as `(attribute_ref, attribute)`.
    pub fn deferred_for(&self, configuration: &AttributeRef) -> Vec<(AttributeRef, Attribute)> {
        self.state
            .lock()
            .deferred
            .iter()
            .filter(|(_, link)| link.configuration == *configuration)
            .map(|(reference, link)| (reference.clone(), link.attribute.clone()))
            .collect()
    }

    pub fn add_subscriber(&self, agent_id: &str, callback: ChildAssetCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.state
            .lock()
            .subscribers
            .entry(agent_id.to_owned())
            .or_default()
            .push((id, callback));
        id
    }

    pub fn remove_subscriber(&self, agent_id: &str, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let Some(subscribers) = state.subscribers.get_mut(agent_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            state.subscribers.shift_remove(agent_id);
        }
        removed
    }

    pub fn subscribers_of(&self, agent_id: &str) -> Vec<ChildAssetCallback> {
        self.state
            .lock()
            .subscribers
            .get(agent_id)
            .map(|subscribers| subscribers.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            configurations: state
                .configurations
                .iter()
                .map(|(reference, entry)| (reference.clone(), entry.status))
                .collect(),
            linked_by_config: state
                .linked
                .iter()
                .map(|(reference, attributes)| {
                    (
                        reference.clone(),
                        attributes.iter().map(|(r, _)| r.clone()).collect(),
                    )
                })
                .collect(),
            deferred: state.deferred.keys().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AgentRegistry")
            .field("agents", &state.agents.len())
            .field("configurations", &state.configurations.len())
            .field("deferred", &state.deferred.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::callback;
    use agentrt_model::{protocol_configuration, ValueType};

    fn cfg() -> AttributeRef {
        AttributeRef::new("A1", "cfg1")
    }

    fn registry_with_config() -> AgentRegistry {
        let registry = AgentRegistry::new();
        registry.put_agent(&Asset::agent("A1", "Agent", "master"));
        registry.put_configuration(
            &cfg(),
            &protocol_configuration("cfg1", "urn:openremote:protocol:simulator").unwrap(),
        );
        registry
    }

    #[test]
    fn status_changes_are_reported_once() {
        let registry = registry_with_config();
        assert_eq!(registry.status(&cfg()), Some(ConnectionStatus::Waiting));
        assert_eq!(
            registry.set_status(&cfg(), ConnectionStatus::Connected),
            Some(ConnectionStatus::Waiting)
        );
        assert_eq!(registry.set_status(&cfg(), ConnectionStatus::Connected), None);
        assert_eq!(
            registry.set_status(&AttributeRef::new("A9", "cfg"), ConnectionStatus::Connected),
            None
        );
    }

    #[test]
    fn link_then_unlink_restores_snapshot() {
        let registry = registry_with_config();
        let before = serde_json::to_string(&registry.snapshot()).unwrap();

        let temp = AttributeRef::new("S1", "temp");
        let attribute = Attribute::new("temp", ValueType::Number);
        assert!(registry.link_attribute(&cfg(), &temp, &attribute));
        assert!(!registry.link_attribute(&cfg(), &temp, &attribute));
        assert_eq!(registry.linked_attributes(&cfg()).len(), 1);
        assert!(registry.unlink_attribute(&cfg(), &temp).is_some());

        let after = serde_json::to_string(&registry.snapshot()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn linking_clears_deferred_entry() {
        let registry = registry_with_config();
        let temp = AttributeRef::new("S1", "temp");
        let attribute = Attribute::new("temp", ValueType::Number);
        registry.defer(&temp, &cfg(), &attribute);
        assert_eq!(registry.deferred_for(&cfg()).len(), 1);
        registry.link_attribute(&cfg(), &temp, &attribute);
        assert!(registry.deferred_for(&cfg()).is_empty());
    }

    #[test]
    fn removing_last_configuration_drops_subscribers() {
        let registry = registry_with_config();
        let id = registry.add_subscriber("A1", callback(|_| Ok(())));
        assert_eq!(registry.subscribers_of("A1").len(), 1);
        registry.remove_configuration(&cfg());
        assert!(registry.subscribers_of("A1").is_empty());
        assert!(!registry.remove_subscriber("A1", id));
        assert_eq!(registry.snapshot(), RegistrySnapshot::default());
    }
}
