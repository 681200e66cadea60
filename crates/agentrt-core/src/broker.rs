//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Child-asset change subscriptions keyed by agent."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{debug, error, warn};

use agentrt_common::Coordinator;

use crate::persistence::PersistenceEvent;
use crate::registry::{AgentRegistry, SubscriptionId};
use crate::RuntimeError;

/// Callback invoked with persistence events of an agent's descendants.
pub type ChildAssetCallback = Arc<dyn Fn(&PersistenceEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`ChildAssetCallback`].
pub fn callback<F>(f: F) -> ChildAssetCallback
where
    F: Fn(&PersistenceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug)]
pub struct ChildAssetBroker {
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
}

impl ChildAssetBroker {
    pub fn new(registry: Arc<AgentRegistry>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            registry,
            coordinator,
        }
    }

    /// Register `callback` for descendants of `agent_id`.
    ///
    /// Refused when the agent has no registered configuration.
    pub fn subscribe(&self, agent_id: &str, callback: ChildAssetCallback) -> Option<SubscriptionId> {
        self.coordinator
            .with_lock_returning("subscribeChildAssetChange", || {
                if self.registry.configurations_of(agent_id).is_empty() {
                    warn!(agent = agent_id, "agent has no active configurations; subscription refused");
                    return None;
                }
                let id = self.registry.add_subscriber(agent_id, callback);
                debug!(agent = agent_id, subscription = ?id, "child asset subscriber added");
                Some(id)
            })
    }

    pub fn unsubscribe(&self, agent_id: &str, id: SubscriptionId) -> bool {
        self.coordinator
            .with_lock_returning("unsubscribeChildAssetChange", || {
                self.registry.remove_subscriber(agent_id, id)
            })
    }

    /// Invoke every callback of `agent_id`; failures are logged and returned.
    pub fn notify(&self, agent_id: &str, event: &PersistenceEvent) -> Vec<RuntimeError> {
        self.coordinator.with_lock_returning("notifyChildAssetChange", || {
            let mut failures = Vec::new();
            for subscriber in self.registry.subscribers_of(agent_id) {
                if let Err(err) = subscriber(event) {
                    error!(
                        agent = agent_id,
                        asset = %event.entity_id,
                        cause = %event.cause,
                        error = %err,
                        "child asset subscriber failed"
                    );
                    failures.push(RuntimeError::SubscriberThrew {
                        agent_id: agent_id.to_owned(),
                        message: err.to_string(),
                    });
                }
            }
            failures
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::{protocol_configuration, Asset, AttributeRef};
    use parking_lot::Mutex;

    fn broker() -> ChildAssetBroker {
        let registry = Arc::new(AgentRegistry::new());
        registry.put_agent(&Asset::agent("A1", "Agent", "master"));
        registry.put_configuration(
            &AttributeRef::new("A1", "cfg1"),
            &protocol_configuration("cfg1", "urn:openremote:protocol:simulator").unwrap(),
        );
        ChildAssetBroker::new(registry, Arc::new(Coordinator::default()))
    }

    #[test]
    fn agent_without_configuration_is_refused() {
        let broker = broker();
        assert!(broker.subscribe("A2", callback(|_| Ok(()))).is_none());
        assert!(broker.subscribe("A1", callback(|_| Ok(()))).is_some());
    }

    #[test]
    fn failing_subscriber_does_not_stop_others() {
        let broker = broker();
        let seen = Arc::new(Mutex::new(Vec::new()));
        broker
            .subscribe("A1", callback(|_| Err(anyhow::anyhow!("boom"))))
            .unwrap();
        let sink = seen.clone();
        broker
            .subscribe(
                "A1",
                callback(move |event| {
                    sink.lock().push(event.entity_id.clone());
                    Ok(())
                }),
            )
            .unwrap();

        let event = PersistenceEvent::create(Asset::new("S1", "Sensor", "Thing", "master"));
        let failures = broker.notify("A1", &event);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], RuntimeError::SubscriberThrew { .. }));
        assert_eq!(*seen.lock(), vec!["S1".to_owned()]);
    }

    #[test]
    fn unsubscribe_removes_callback() {
        let broker = broker();
        let id = broker.subscribe("A1", callback(|_| Ok(()))).unwrap();
        assert!(broker.unsubscribe("A1", id));
        assert!(!broker.unsubscribe("A1", id));
    }
}
