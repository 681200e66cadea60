//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "State and platform services shared by every driver instance."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentrt_common::{Clock, Coordinator};
use agentrt_model::{
    has_dynamic_write_value, process_inbound, Asset, AssetQuery, Attribute, AttributeEvent,
    AttributeRef, AttributeState, ConnectionStatus, EventSource, ProcessingOutcome,
};
use agentrt_msg::{SensorMessage, SensorSender};

use crate::{ProtocolError, Result};

/// Receives connection status changes reported by drivers.
pub trait StatusSink: Send + Sync {
    /// Record `status` for `configuration` and notify consoles when it changed.
    fn publish_status(&self, configuration: &AttributeRef, status: ConnectionStatus);
}

/// Asset operations a driver may perform on behalf of its agent.
pub trait ProtocolAssetService: Send + Sync {
    /// Create or replace an asset.
    fn merge_asset(&self, asset: Asset) -> Result<Asset>;

    /// Delete an asset; `false` when it did not exist.
    fn delete_asset(&self, asset_id: &str) -> Result<bool>;

    /// Look up one asset.
    fn find_asset(&self, asset_id: &str) -> Option<Asset>;

    /// Assets below the agent `agent_id` matching `query`.
    fn find_assets(&self, agent_id: &str, query: &AssetQuery) -> Vec<Asset>;

    /// Submit an attribute event as if it came from a client.
    fn send_attribute_event(&self, event: AttributeEvent) -> Result<()>;

    /// Persist a new version of a protocol configuration attribute.
    fn update_protocol_configuration(
        &self,
        configuration: &AttributeRef,
        attribute: Attribute,
    ) -> Result<()>;
}

/// Platform handles injected into every driver instance.
#[derive(Clone)]
pub struct ProtocolServices {
    /// Coordination lock shared with the runtime.
    pub coordinator: Arc<Coordinator>,
    /// Producer end of the sensor channel.
    pub sensor: SensorSender,
    /// Connection status recorder.
    pub status: Arc<dyn StatusSink>,
    /// Asset operations.
    pub assets: Arc<dyn ProtocolAssetService>,
    /// Timestamp source for sensor updates.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ProtocolServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolServices")
            .field("coordinator", &self.coordinator)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Driver state common to all protocols: identity, linked attributes and services.
pub struct ProtocolBase {
    protocol_name: String,
    configuration: AttributeRef,
    services: ProtocolServices,
    linked: Mutex<IndexMap<AttributeRef, Attribute>>,
    dynamic: Mutex<HashSet<AttributeRef>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolBase {
    /// Base for the driver `protocol_name` serving `configuration`.
    pub fn new(
        protocol_name: impl Into<String>,
        configuration: AttributeRef,
        services: ProtocolServices,
    ) -> Self {
        Self {
            protocol_name: protocol_name.into(),
            configuration,
            services,
            linked: Mutex::new(IndexMap::new()),
            dynamic: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Driver URN.
    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Configuration this instance serves.
    pub fn configuration_ref(&self) -> &AttributeRef {
        &self.configuration
    }

    /// Injected platform services.
    pub fn services(&self) -> &ProtocolServices {
        &self.services
    }

    /// Current time from the injected clock.
    pub fn now_millis(&self) -> i64 {
        self.services.clock.now_millis()
    }

    /// Run `f` inside the coordination lock.
    pub fn with_lock<F>(&self, label: &str, f: F)
    where
        F: FnOnce(),
    {
        self.services.coordinator.with_lock(label, f)
    }

    /// Run `f` inside the coordination lock and return its result.
    pub fn with_lock_returning<R, F>(&self, label: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.services.coordinator.with_lock_returning(label, f)
    }

    /// Report the connection status of this configuration.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        self.with_lock("setConnectionStatus", || {
            self.services.status.publish_status(&self.configuration, status)
        })
    }

    /// Linked attribute by reference.
    pub fn linked_attribute(&self, attribute_ref: &AttributeRef) -> Option<Attribute> {
        self.linked.lock().get(attribute_ref).cloned()
    }

    /// Every linked attribute in link order.
    pub fn linked_attributes(&self) -> Vec<(AttributeRef, Attribute)> {
        self.linked
            .lock()
            .iter()
            .map(|(attribute_ref, attribute)| (attribute_ref.clone(), attribute.clone()))
            .collect()
    }

    /// Whether `attribute_ref` is linked.
    pub fn is_linked(&self, attribute_ref: &AttributeRef) -> bool {
        self.linked.lock().contains_key(attribute_ref)
    }

    /// Whether `attribute_ref` has a `{$value}` write template.
    pub fn is_dynamic(&self, attribute_ref: &AttributeRef) -> bool {
        self.dynamic.lock().contains(attribute_ref)
    }

    /// Record a link; `false` when the reference was already linked.
    pub(crate) fn track_link(&self, attribute_ref: &AttributeRef, attribute: &Attribute) -> bool {
        let mut linked = self.linked.lock();
        if linked.contains_key(attribute_ref) {
            return false;
        }
        linked.insert(attribute_ref.clone(), attribute.clone());
        if has_dynamic_write_value(attribute) {
            self.dynamic.lock().insert(attribute_ref.clone());
        }
        true
    }

    /// Forget a link, returning the attribute that was linked.
    pub(crate) fn forget_link(&self, attribute_ref: &AttributeRef) -> Option<Attribute> {
        self.dynamic.lock().remove(attribute_ref);
        self.linked.lock().shift_remove(attribute_ref)
    }

    /// Push a device reading for a linked attribute, stamped with the current time.
    pub fn update_linked_attribute(&self, state: AttributeState) -> Result<()> {
        let timestamp = self.now_millis();
        self.update_linked_attribute_at(state, timestamp)
    }

    /// Push a device reading for a linked attribute with an explicit timestamp.
    ///
    /// The reading passes through the attribute's inbound processing; an ignored
    /// reading is dropped without error.
    pub fn update_linked_attribute_at(&self, state: AttributeState, timestamp: i64) -> Result<()> {
        self.with_lock_returning("updateLinkedAttribute", || {
            let attribute = match self.linked_attribute(&state.attribute_ref) {
                Some(attribute) => attribute,
                None => {
                    warn!(
                        protocol = %self.protocol_name,
                        attribute = %state.attribute_ref,
                        "sensor update for an attribute that is not linked"
                    );
                    return Err(ProtocolError::NotLinked(state.attribute_ref));
                }
            };
            let value = match process_inbound(&state.attribute_ref.asset_id, &attribute, &state.value)
            {
                ProcessingOutcome::Value(value) => value,
                ProcessingOutcome::Ignored => return Ok(()),
            };
            let event = AttributeEvent::new(state.attribute_ref, value, timestamp, EventSource::Sensor);
            debug!(
                protocol = %self.protocol_name,
                attribute = %event.attribute_ref,
                "sensor update queued"
            );
            self.services.sensor.send(SensorMessage {
                source_protocol_urn: self.protocol_name.clone(),
                attribute_event: event,
            })?;
            Ok(())
        })
    }

    /// Submit a client-style write for an attribute this driver does not serve.
    pub fn send_attribute_event(&self, event: AttributeEvent) -> Result<()> {
        if self.is_linked(&event.attribute_ref) {
            warn!(
                protocol = %self.protocol_name,
                attribute = %event.attribute_ref,
                "refusing attribute event for a linked attribute; use update_linked_attribute"
            );
            return Err(ProtocolError::AssetService(format!(
                "attribute {} is linked to this protocol",
                event.attribute_ref
            )));
        }
        self.services.assets.send_attribute_event(event)
    }

    /// Persist a new version of this instance's configuration attribute.
    pub fn update_protocol_configuration(&self, attribute: Attribute) -> Result<()> {
        info!(
            protocol = %self.protocol_name,
            configuration = %self.configuration,
            "updating protocol configuration"
        );
        self.services
            .assets
            .update_protocol_configuration(&self.configuration, attribute)
    }

    /// Assets below this instance's agent matching `query`.
    pub fn find_assets(&self, query: &AssetQuery) -> Vec<Asset> {
        self.services
            .assets
            .find_assets(&self.configuration.asset_id, query)
    }

    /// Run `future` on the ambient tokio runtime; tracked until the session closes.
    ///
    /// Returns `false` when no runtime is available.
    pub fn spawn<F>(&self, label: &'static str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => {
                let mut tasks = self.tasks.lock();
                tasks.retain(|task| !task.is_finished());
                tasks.push(handle.spawn(future));
                debug!(protocol = %self.protocol_name, task = label, "driver task spawned");
                true
            }
            Err(_) => {
                warn!(
                    protocol = %self.protocol_name,
                    task = label,
                    "no async runtime available; driver task not started"
                );
                false
            }
        }
    }

    /// Drain the handles of tasks still running.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        std::mem::take(&mut *tasks)
    }
}

impl std::fmt::Debug for ProtocolBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolBase")
            .field("protocol_name", &self.protocol_name)
            .field("configuration", &self.configuration)
            .field("linked", &self.linked.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestServices;
    use agentrt_model::{meta, Value, ValueType};

    fn base(services: &TestServices) -> ProtocolBase {
        ProtocolBase::new(
            "urn:openremote:protocol:simulator",
            AttributeRef::new("A1", "cfg1"),
            services.services(),
        )
    }

    #[test]
    fn sensor_updates_need_a_link() {
        let services = TestServices::new();
        let base = base(&services);
        let temp = AttributeRef::new("S1", "temp");
        assert!(matches!(
            base.update_linked_attribute(AttributeState::new(temp.clone(), 1.0)),
            Err(ProtocolError::NotLinked(_))
        ));

        assert!(base.track_link(&temp, &Attribute::new("temp", ValueType::Number)));
        base.update_linked_attribute_at(AttributeState::new(temp.clone(), 21.5), 42)
            .unwrap();
        let message = services.sensor_messages().pop().unwrap();
        assert_eq!(message.source_protocol_urn, "urn:openremote:protocol:simulator");
        assert_eq!(message.attribute_event.value, Value::Number(21.5));
        assert_eq!(message.attribute_event.timestamp, 42);
        assert_eq!(message.attribute_event.source, EventSource::Sensor);
    }

    #[test]
    fn inbound_processing_applies_before_queueing() {
        let services = TestServices::new();
        let base = base(&services);
        let power = AttributeRef::new("S1", "power");
        let attribute = Attribute::new("power", ValueType::Boolean).with_meta(
            meta::READ_VALUE_CONVERTER,
            Value::parse_json(r#"{"ON": true, "OFF": false, "@DEFAULT": "@IGNORE"}"#)
                .unwrap(),
        );
        base.track_link(&power, &attribute);

        base.update_linked_attribute(AttributeState::new(power.clone(), "on")).unwrap();
        base.update_linked_attribute(AttributeState::new(power.clone(), "dimmed")).unwrap();
        let values: Vec<Value> = services
            .sensor_messages()
            .into_iter()
            .map(|m| m.attribute_event.value)
            .collect();
        assert_eq!(values, vec![Value::Bool(true)]);
    }

    #[test]
    fn duplicate_link_is_refused_and_dynamic_tracked() {
        let services = TestServices::new();
        let base = base(&services);
        let level = AttributeRef::new("S1", "level");
        let attribute = Attribute::new("level", ValueType::Number)
            .with_meta(meta::WRITE_VALUE, "SET {$value}");
        assert!(base.track_link(&level, &attribute));
        assert!(!base.track_link(&level, &attribute));
        assert!(base.is_dynamic(&level));
        base.forget_link(&level);
        assert!(!base.is_linked(&level));
        assert!(!base.is_dynamic(&level));
    }

    #[test]
    fn linked_attributes_cannot_be_sent_as_client_events() {
        let services = TestServices::new();
        let base = base(&services);
        let temp = AttributeRef::new("S1", "temp");
        base.track_link(&temp, &Attribute::new("temp", ValueType::Number));
        let event = AttributeEvent::new(temp, 1.0, 0, EventSource::Client);
        assert!(base.send_attribute_event(event).is_err());

        let other = AttributeEvent::new(AttributeRef::new("S2", "mode"), "eco", 0, EventSource::Client);
        base.send_attribute_event(other.clone()).unwrap();
        assert_eq!(services.assets().sent_events(), vec![other]);
    }

    #[test]
    fn status_goes_through_sink() {
        let services = TestServices::new();
        let base = base(&services);
        base.set_connection_status(ConnectionStatus::Connected);
        assert_eq!(
            services.statuses(),
            vec![(AttributeRef::new("A1", "cfg1"), ConnectionStatus::Connected)]
        );
    }
}
