//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "Recording driver and in-memory services for driver and runtime tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Test doubles.
//!
//! [`RecordingFactory`] builds drivers that log every hook invocation into a shared
//! [`CallLog`] and can be told to fail. [`TestServices`] wires a driver base to
//! in-memory collaborators.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use agentrt_common::{Coordinator, ManualClock};
use agentrt_model::{
    Asset, AssetQuery, Attribute, AttributeEvent, AttributeRef, ConnectionStatus,
    ValidationResult, Value,
};
use agentrt_msg::{SensorChannel, SensorMessage, SensorReceiver};

use crate::base::{ProtocolAssetService, ProtocolBase, ProtocolServices, StatusSink};
use crate::driver::{Protocol, ProtocolDescriptor};
use crate::registry::ProtocolFactory;
use crate::validation::{validate_protocol_configuration, validate_socket_configuration};
use crate::{ProtocolError, Result};

/// One observed driver hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    /// `connect` for a configuration.
    Connect(AttributeRef),
    /// `disconnect` for a configuration.
    Disconnect(AttributeRef),
    /// `link_attribute` for an attribute.
    Link(AttributeRef),
    /// `unlink_attribute` for an attribute.
    Unlink(AttributeRef),
    /// `on_actuator_write` with the processed value.
    Write(AttributeRef, Value),
    /// The task started by `connect` ended or was aborted.
    TaskEnded(AttributeRef),
}

/// Shared, ordered record of driver hook calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<DriverCall>>>,
}

impl CallLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }

    /// Snapshot of every call so far.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Position of the first call equal to `call`.
    pub fn position(&self, call: &DriverCall) -> Option<usize> {
        self.calls.lock().iter().position(|recorded| recorded == call)
    }
}

/// Failure switches for [`RecordingProtocol`].
#[derive(Debug, Clone, Default)]
pub struct RecordingBehaviour {
    /// Require `host` and `port` meta items on the configuration.
    pub require_socket: bool,
    /// Fail every `connect`.
    pub fail_connect: bool,
    /// Attribute names whose link fails.
    pub fail_link: HashSet<String>,
    /// Status reported from `connect`; `Connected` when unset.
    pub connect_status: Option<ConnectionStatus>,
    /// Start a task from `connect` that never finishes on its own.
    pub hold_task: bool,
}

/// Factory for recording drivers under an arbitrary URN.
#[derive(Debug, Clone)]
pub struct RecordingFactory {
    name: String,
    log: CallLog,
    behaviour: Arc<Mutex<RecordingBehaviour>>,
}

impl RecordingFactory {
    /// Factory registering under `name`, logging into `log`.
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            behaviour: Arc::new(Mutex::new(RecordingBehaviour::default())),
        }
    }

    /// Replace the failure switches used by drivers created from now on.
    pub fn with_behaviour(self, behaviour: RecordingBehaviour) -> Self {
        *self.behaviour.lock() = behaviour;
        self
    }

    /// Shared call log.
    pub fn log(&self) -> &CallLog {
        &self.log
    }
}

impl ProtocolFactory for RecordingFactory {
    fn protocol_name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new(&self.name, "Recording")
    }

    fn create(&self, _configuration: &Attribute, base: ProtocolBase) -> Result<Box<dyn Protocol>> {
        Ok(Box::new(RecordingProtocol {
            base,
            log: self.log.clone(),
            behaviour: self.behaviour.lock().clone(),
        }))
    }
}

/// Driver that records hook calls and otherwise behaves like a perfect device.
#[derive(Debug)]
pub struct RecordingProtocol {
    base: ProtocolBase,
    log: CallLog,
    behaviour: RecordingBehaviour,
}

impl Protocol for RecordingProtocol {
    fn base(&self) -> &ProtocolBase {
        &self.base
    }

    fn validate_configuration(&self, configuration: &Attribute) -> ValidationResult {
        let mut result = validate_protocol_configuration(configuration, self.name());
        if self.behaviour.require_socket {
            validate_socket_configuration(configuration, &mut result);
        }
        result
    }

    fn connect(&self, _configuration: &Attribute) -> Result<()> {
        self.log.push(DriverCall::Connect(self.base.configuration_ref().clone()));
        if self.behaviour.fail_connect {
            return Err(ProtocolError::Connection("refused by test".into()));
        }
        if self.behaviour.hold_task {
            let guard = TaskEndGuard {
                log: self.log.clone(),
                configuration: self.base.configuration_ref().clone(),
            };
            self.base.spawn("hold", async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            });
        }
        self.base.set_connection_status(
            self.behaviour
                .connect_status
                .unwrap_or(ConnectionStatus::Connected),
        );
        Ok(())
    }

    fn disconnect(&self, _configuration: &Attribute) -> Result<()> {
        self.log
            .push(DriverCall::Disconnect(self.base.configuration_ref().clone()));
        self.base.set_connection_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    fn link_attribute(
        &self,
        _configuration: &Attribute,
        attribute_ref: &AttributeRef,
        attribute: &Attribute,
    ) -> Result<()> {
        self.log.push(DriverCall::Link(attribute_ref.clone()));
        if self.behaviour.fail_link.contains(&attribute.name) {
            return Err(ProtocolError::Link {
                attribute: attribute_ref.clone(),
                reason: "refused by test".into(),
            });
        }
        Ok(())
    }

    fn unlink_attribute(
        &self,
        _configuration: &Attribute,
        attribute_ref: &AttributeRef,
        _attribute: &Attribute,
    ) -> Result<()> {
        self.log.push(DriverCall::Unlink(attribute_ref.clone()));
        Ok(())
    }

    fn on_actuator_write(
        &self,
        _configuration: &Attribute,
        _attribute: &Attribute,
        event: &AttributeEvent,
        value: Value,
    ) -> Result<()> {
        self.log
            .push(DriverCall::Write(event.attribute_ref.clone(), value));
        Ok(())
    }
}

/// Records [`DriverCall::TaskEnded`] when the owning task is dropped.
struct TaskEndGuard {
    log: CallLog,
    configuration: AttributeRef,
}

impl Drop for TaskEndGuard {
    fn drop(&mut self) {
        self.log.push(DriverCall::TaskEnded(self.configuration.clone()));
    }
}

/// Status sink remembering every reported status.
#[derive(Debug, Default)]
pub struct RecordingStatusSink {
    statuses: Mutex<Vec<(AttributeRef, ConnectionStatus)>>,
}

impl StatusSink for RecordingStatusSink {
    fn publish_status(&self, configuration: &AttributeRef, status: ConnectionStatus) {
        self.statuses.lock().push((configuration.clone(), status));
    }
}

/// Asset service backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryAssetService {
    assets: Mutex<IndexMap<String, Asset>>,
    events: Mutex<Vec<AttributeEvent>>,
}

impl InMemoryAssetService {
    /// Client events submitted by drivers.
    pub fn sent_events(&self) -> Vec<AttributeEvent> {
        self.events.lock().clone()
    }
}

impl ProtocolAssetService for InMemoryAssetService {
    fn merge_asset(&self, asset: Asset) -> Result<Asset> {
        self.assets.lock().insert(asset.id.clone(), asset.clone());
        Ok(asset)
    }

    fn delete_asset(&self, asset_id: &str) -> Result<bool> {
        Ok(self.assets.lock().shift_remove(asset_id).is_some())
    }

    fn find_asset(&self, asset_id: &str) -> Option<Asset> {
        self.assets.lock().get(asset_id).cloned()
    }

    fn find_assets(&self, agent_id: &str, query: &AssetQuery) -> Vec<Asset> {
        self.assets
            .lock()
            .values()
            .filter(|asset| asset.ancestor_ids().any(|id| id == agent_id))
            .filter(|asset| query.matches(asset))
            .cloned()
            .collect()
    }

    fn send_attribute_event(&self, event: AttributeEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    fn update_protocol_configuration(
        &self,
        configuration: &AttributeRef,
        attribute: Attribute,
    ) -> Result<()> {
        let mut assets = self.assets.lock();
        let agent = assets.get_mut(&configuration.asset_id).ok_or_else(|| {
            ProtocolError::AssetService(format!("agent {} not found", configuration.asset_id))
        })?;
        agent.set_attribute(attribute);
        Ok(())
    }
}

/// In-memory collaborators for a driver base.
#[derive(Debug)]
pub struct TestServices {
    coordinator: Arc<Coordinator>,
    sensor: SensorChannel,
    receiver: Mutex<Option<SensorReceiver>>,
    status: Arc<RecordingStatusSink>,
    assets: Arc<InMemoryAssetService>,
    clock: Arc<ManualClock>,
}

impl TestServices {
    /// Fresh services with an empty sensor queue and a clock at zero.
    pub fn new() -> Self {
        let sensor = SensorChannel::new(64);
        let receiver = sensor.take_receiver();
        Self {
            coordinator: Arc::new(Coordinator::default()),
            sensor,
            receiver: Mutex::new(receiver),
            status: Arc::new(RecordingStatusSink::default()),
            assets: Arc::new(InMemoryAssetService::default()),
            clock: Arc::new(ManualClock::new(0)),
        }
    }

    /// Service bundle for a new driver base.
    pub fn services(&self) -> ProtocolServices {
        ProtocolServices {
            coordinator: self.coordinator.clone(),
            sensor: self.sensor.sender(),
            status: self.status.clone(),
            assets: self.assets.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Sensor messages queued since the last call.
    pub fn sensor_messages(&self) -> Vec<SensorMessage> {
        let mut receiver = self.receiver.lock();
        match receiver.as_mut() {
            Some(receiver) => std::iter::from_fn(|| receiver.try_recv()).collect(),
            None => Vec::new(),
        }
    }

    /// Every status reported so far.
    pub fn statuses(&self) -> Vec<(AttributeRef, ConnectionStatus)> {
        self.status.statuses.lock().clone()
    }

    /// Backing asset service.
    pub fn assets(&self) -> &InMemoryAssetService {
        &self.assets
    }

    /// Clock handed to driver bases.
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }
}

impl Default for TestServices {
    fn default() -> Self {
        Self::new()
    }
}
