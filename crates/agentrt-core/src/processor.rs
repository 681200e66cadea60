//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Routes platform writes on linked attributes to the actuator channel."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Platform writes are requests and device reports are facts: an event on a linked
//! attribute is consumed here and never stored directly. The driver is expected to
//! answer with a sensor update once the device accepted the value.

use std::sync::Arc;

use tracing::{debug, warn};

use agentrt_common::Coordinator;
use agentrt_model::{AttributeEvent, EventSource};
use agentrt_msg::{ActuatorMessage, MessageRouter};

use crate::registry::AgentRegistry;
use crate::store::AssetStore;
use crate::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not a driver concern; continue with regular storage.
    PassThrough,
    /// Handed to a driver; must not be stored.
    Consumed,
}

#[derive(Debug)]
pub struct AttributeProcessor {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn AssetStore>,
    router: Arc<MessageRouter>,
    coordinator: Arc<Coordinator>,
}

impl AttributeProcessor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn AssetStore>,
        router: Arc<MessageRouter>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        Self {
            registry,
            store,
            router,
            coordinator,
        }
    }

    pub fn process(&self, event: &AttributeEvent) -> Result<ProcessOutcome> {
        if matches!(event.source, EventSource::Sensor | EventSource::Gateway) {
            return Ok(ProcessOutcome::PassThrough);
        }

        let Some(configuration) = self
            .store
            .find(&event.attribute_ref.asset_id)
            .and_then(|asset| {
                asset
                    .attribute(&event.attribute_ref.attribute_name)
                    .and_then(|attribute| attribute.agent_link())
            })
        else {
            return Ok(ProcessOutcome::PassThrough);
        };

        let entry = self
            .coordinator
            .with_lock_returning("processAssetUpdate", || self.registry.configuration(&configuration));
        let Some(entry) = entry else {
            warn!(
                attribute = %event.attribute_ref,
                configuration = %configuration,
                "attribute linked to an unknown protocol configuration"
            );
            return Err(RuntimeError::InvalidAgentLink {
                attribute: event.attribute_ref.clone(),
                configuration,
            });
        };

        debug!(
            attribute = %event.attribute_ref,
            protocol = %entry.protocol_name,
            "sending to actuator channel"
        );
        self.router.actuator().publish(ActuatorMessage {
            target_protocol_urn: entry.protocol_name,
            protocol_configuration: configuration,
            attribute_event: event.clone(),
        })?;
        Ok(ProcessOutcome::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::{
        agent_link_meta, protocol_configuration, Asset, Attribute, AttributeRef, ValueType,
    };
    use crate::store::InMemoryAssetStore;

    const SIMULATOR: &str = "urn:openremote:protocol:simulator";

    fn fixture() -> (AttributeProcessor, Arc<MessageRouter>, Arc<AgentRegistry>) {
        let agent = Asset::agent("A1", "Agent", "master");
        let cfg_ref = agent.attribute_ref("cfg1");
        let mut temp = Attribute::new("temp", ValueType::Number);
        temp.meta.push(agent_link_meta(&cfg_ref));
        let sensor = Asset::new("S1", "Sensor", "Thing", "master")
            .with_parent(&agent)
            .with_attribute(temp)
            .with_attribute(Attribute::new("label", ValueType::String));

        let store = Arc::new(InMemoryAssetStore::new());
        store.merge(agent).unwrap();
        store.merge(sensor).unwrap();

        let registry = Arc::new(AgentRegistry::new());
        let router = Arc::new(MessageRouter::default());
        let processor = AttributeProcessor::new(
            registry.clone(),
            store,
            router.clone(),
            Arc::new(Coordinator::default()),
        );
        (processor, router, registry)
    }

    #[test]
    fn sensor_and_unlinked_events_pass_through() {
        let (processor, router, _registry) = fixture();
        let mut tap = router.actuator().tap();
        let sensor = AttributeEvent::new(AttributeRef::new("S1", "temp"), 1.0, 0, EventSource::Sensor);
        let label = AttributeEvent::new(AttributeRef::new("S1", "label"), "x", 0, EventSource::Client);
        assert_eq!(processor.process(&sensor).unwrap(), ProcessOutcome::PassThrough);
        assert_eq!(processor.process(&label).unwrap(), ProcessOutcome::PassThrough);
        assert!(tap.try_recv().is_none());
    }

    #[test]
    fn link_to_unknown_configuration_is_rejected() {
        let (processor, _router, _registry) = fixture();
        let event = AttributeEvent::new(AttributeRef::new("S1", "temp"), 1.0, 0, EventSource::Client);
        let err = processor.process(&event).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidAgentLink { .. }));
    }

    #[test]
    fn linked_client_write_is_consumed() {
        let (processor, router, registry) = fixture();
        let cfg_ref = AttributeRef::new("A1", "cfg1");
        registry.put_configuration(&cfg_ref, &protocol_configuration("cfg1", SIMULATOR).unwrap());
        let mut receiver = router.actuator().subscribe(SIMULATOR);

        let event = AttributeEvent::new(AttributeRef::new("S1", "temp"), 21.5, 0, EventSource::Client);
        assert_eq!(processor.process(&event).unwrap(), ProcessOutcome::Consumed);
        let message = receiver.try_recv().unwrap();
        assert_eq!(message.protocol_configuration, cfg_ref);
        assert_eq!(message.attribute_event, event);
        assert!(receiver.try_recv().is_none());
    }
}
