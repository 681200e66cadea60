//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulator driver echoing actuator writes back as sensor updates."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use agentrt_model::{
    Attribute, AttributeEvent, AttributeRef, AttributeState, ConnectionStatus, Value,
};

use crate::base::ProtocolBase;
use crate::driver::{Protocol, ProtocolDescriptor};
use crate::registry::ProtocolFactory;
use crate::{ProtocolError, Result};

/// URN of the bundled simulator.
pub const SIMULATOR_PROTOCOL_URN: &str = "urn:openremote:protocol:simulator";
/// Lower bound for numeric writes.
pub const META_SIMULATOR_MIN: &str = "simulator:min";
/// Upper bound for numeric writes.
pub const META_SIMULATOR_MAX: &str = "simulator:max";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Bounds {
    min: Option<f64>,
    max: Option<f64>,
}

impl Bounds {
    fn of(attribute: &Attribute) -> Self {
        Self {
            min: attribute.meta(META_SIMULATOR_MIN).and_then(Value::as_f64),
            max: attribute.meta(META_SIMULATOR_MAX).and_then(Value::as_f64),
        }
    }

    fn is_bounded(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    fn admits(&self, value: &Value) -> bool {
        if !self.is_bounded() {
            return true;
        }
        let Some(number) = value.as_f64() else {
            return false;
        };
        self.min.map_or(true, |min| number >= min) && self.max.map_or(true, |max| number <= max)
    }
}

/// Builds [`SimulatorProtocol`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatorFactory;

impl ProtocolFactory for SimulatorFactory {
    fn protocol_name(&self) -> &str {
        SIMULATOR_PROTOCOL_URN
    }

    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new(SIMULATOR_PROTOCOL_URN, "Simulator")
    }

    fn create(&self, _configuration: &Attribute, base: ProtocolBase) -> Result<Box<dyn Protocol>> {
        Ok(Box::new(SimulatorProtocol::new(base)))
    }
}

/// In-process device: every accepted write becomes the attribute's new reading.
#[derive(Debug)]
pub struct SimulatorProtocol {
    base: ProtocolBase,
    bounds: Mutex<HashMap<AttributeRef, Bounds>>,
}

impl SimulatorProtocol {
    /// Simulator around `base`.
    pub fn new(base: ProtocolBase) -> Self {
        Self {
            base,
            bounds: Mutex::new(HashMap::new()),
        }
    }
}

impl Protocol for SimulatorProtocol {
    fn base(&self) -> &ProtocolBase {
        &self.base
    }

    fn connect(&self, _configuration: &Attribute) -> Result<()> {
        self.base.set_connection_status(ConnectionStatus::Connected);
        Ok(())
    }

    fn disconnect(&self, _configuration: &Attribute) -> Result<()> {
        self.bounds.lock().clear();
        self.base.set_connection_status(ConnectionStatus::Disconnected);
        Ok(())
    }

    fn link_attribute(
        &self,
        _configuration: &Attribute,
        attribute_ref: &AttributeRef,
        attribute: &Attribute,
    ) -> Result<()> {
        let bounds = Bounds::of(attribute);
        if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
            if min > max {
                return Err(ProtocolError::Link {
                    attribute: attribute_ref.clone(),
                    reason: format!("{META_SIMULATOR_MIN} {min} exceeds {META_SIMULATOR_MAX} {max}"),
                });
            }
        }
        self.bounds.lock().insert(attribute_ref.clone(), bounds);
        Ok(())
    }

    fn unlink_attribute(
        &self,
        _configuration: &Attribute,
        attribute_ref: &AttributeRef,
        _attribute: &Attribute,
    ) -> Result<()> {
        self.bounds.lock().remove(attribute_ref);
        Ok(())
    }

    fn on_actuator_write(
        &self,
        _configuration: &Attribute,
        _attribute: &Attribute,
        event: &AttributeEvent,
        value: Value,
    ) -> Result<()> {
        let bounds = self
            .bounds
            .lock()
            .get(&event.attribute_ref)
            .copied()
            .unwrap_or_default();
        if !bounds.admits(&value) {
            warn!(
                attribute = %event.attribute_ref,
                value = %value.to_display_string(),
                min = ?bounds.min,
                max = ?bounds.max,
                "simulator rejected out of range value"
            );
            return Ok(());
        }
        debug!(attribute = %event.attribute_ref, "simulator echoing write");
        self.base
            .update_linked_attribute(AttributeState::new(event.attribute_ref.clone(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ProtocolSession;
    use crate::testing::TestServices;
    use agentrt_model::{protocol_configuration, EventSource, ValueType};
    use agentrt_msg::ActuatorMessage;

    fn session(services: &TestServices) -> ProtocolSession {
        let configuration = protocol_configuration("sim", SIMULATOR_PROTOCOL_URN).unwrap();
        let base = ProtocolBase::new(
            SIMULATOR_PROTOCOL_URN,
            AttributeRef::new("A1", "sim"),
            services.services(),
        );
        let driver = SimulatorFactory.create(&configuration, base).unwrap();
        ProtocolSession::new(driver, configuration)
    }

    fn write(value: f64) -> ActuatorMessage {
        ActuatorMessage {
            target_protocol_urn: SIMULATOR_PROTOCOL_URN.into(),
            protocol_configuration: AttributeRef::new("A1", "sim"),
            attribute_event: AttributeEvent::new(
                AttributeRef::new("S1", "level"),
                value,
                0,
                EventSource::Client,
            ),
        }
    }

    #[test]
    fn connect_and_disconnect_report_status() {
        let services = TestServices::new();
        let session = session(&services);
        session.connect().unwrap();
        session.disconnect().unwrap();
        let statuses: Vec<_> = services.statuses().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
        );
    }

    #[test]
    fn writes_within_bounds_are_echoed() {
        let services = TestServices::new();
        services.clock().set(1_000);
        let session = session(&services);
        session.connect().unwrap();
        session
            .link_attribute(
                &AttributeRef::new("S1", "level"),
                &Attribute::new("level", ValueType::Number)
                    .with_meta(META_SIMULATOR_MIN, 0.0)
                    .with_meta(META_SIMULATOR_MAX, 100.0),
            )
            .unwrap();

        session.write(&write(40.0)).unwrap();
        session.write(&write(140.0)).unwrap();

        let messages = services.sensor_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].attribute_event.value, Value::Number(40.0));
        assert_eq!(messages[0].attribute_event.timestamp, 1_000);
    }

    #[test]
    fn inverted_bounds_refuse_the_link() {
        let services = TestServices::new();
        let session = session(&services);
        let level = AttributeRef::new("S1", "level");
        let err = session
            .link_attribute(
                &level,
                &Attribute::new("level", ValueType::Number)
                    .with_meta(META_SIMULATOR_MIN, 10.0)
                    .with_meta(META_SIMULATOR_MAX, 1.0),
            )
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Link { .. }));
        assert!(!session.driver().base().is_linked(&level));
    }
}
