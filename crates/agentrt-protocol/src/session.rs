//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Driver session applying the shared link and write template around driver hooks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentrt_model::{process_outbound, Attribute, AttributeRef, ProcessingOutcome};
use agentrt_msg::ActuatorMessage;

use crate::driver::{FileInfo, Protocol};
use crate::{ProtocolError, Result};

/// What happened to an actuator message handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The driver received the processed value.
    Written,
    /// Outbound processing discarded the value.
    Ignored,
    /// The message was not for this session or targeted a read-only or unlinked attribute.
    Dropped,
}

/// One driver instance bound to one protocol configuration.
pub struct ProtocolSession {
    driver: Box<dyn Protocol>,
    configuration: Attribute,
}

impl ProtocolSession {
    /// Bind `driver` to the configuration attribute it was created for.
    pub fn new(driver: Box<dyn Protocol>, configuration: Attribute) -> Self {
        Self {
            driver,
            configuration,
        }
    }

    /// Driver URN.
    pub fn protocol_name(&self) -> &str {
        self.driver.name()
    }

    /// Configuration reference this session serves.
    pub fn configuration_ref(&self) -> &AttributeRef {
        self.driver.base().configuration_ref()
    }

    /// Configuration attribute this session was created from.
    pub fn configuration(&self) -> &Attribute {
        &self.configuration
    }

    /// Underlying driver.
    pub fn driver(&self) -> &dyn Protocol {
        self.driver.as_ref()
    }

    /// Validate the configuration, then ask the driver to connect.
    pub fn connect(&self) -> Result<()> {
        let base = self.driver.base();
        base.with_lock_returning("connect", || {
            let result = self.driver.validate_configuration(&self.configuration);
            if !result.is_valid() {
                warn!(
                    protocol = %self.protocol_name(),
                    configuration = %self.configuration_ref(),
                    failures = %result.summary(),
                    "protocol configuration rejected"
                );
                return Err(ProtocolError::InvalidConfiguration {
                    configuration: self.configuration_ref().clone(),
                    result,
                });
            }
            info!(
                protocol = %self.protocol_name(),
                configuration = %self.configuration_ref(),
                "connecting protocol configuration"
            );
            self.driver.connect(&self.configuration)
        })
    }

    /// Ask the driver to disconnect.
    pub fn disconnect(&self) -> Result<()> {
        self.driver.base().with_lock_returning("disconnect", || {
            info!(
                protocol = %self.protocol_name(),
                configuration = %self.configuration_ref(),
                "disconnecting protocol configuration"
            );
            self.driver.disconnect(&self.configuration)
        })
    }

    /// Link one attribute.
    ///
    /// A reference that is already linked is ignored. When the driver refuses the link
    /// the attribute is forgotten again and the driver error is returned.
    pub fn link_attribute(&self, attribute_ref: &AttributeRef, attribute: &Attribute) -> Result<()> {
        let base = self.driver.base();
        base.with_lock_returning("linkAttribute", || {
            if !base.track_link(attribute_ref, attribute) {
                warn!(
                    protocol = %self.protocol_name(),
                    attribute = %attribute_ref,
                    "attribute already linked; ignoring"
                );
                return Ok(());
            }
            debug!(
                protocol = %self.protocol_name(),
                attribute = %attribute_ref,
                dynamic = base.is_dynamic(attribute_ref),
                "linking attribute"
            );
            if let Err(err) = self
                .driver
                .link_attribute(&self.configuration, attribute_ref, attribute)
            {
                base.forget_link(attribute_ref);
                return Err(err);
            }
            Ok(())
        })
    }

    /// Unlink one attribute. Unknown references are ignored.
    pub fn unlink_attribute(&self, attribute_ref: &AttributeRef) -> Result<()> {
        let base = self.driver.base();
        base.with_lock_returning("unlinkAttribute", || {
            let Some(attribute) = base.forget_link(attribute_ref) else {
                debug!(
                    protocol = %self.protocol_name(),
                    attribute = %attribute_ref,
                    "attribute not linked; nothing to unlink"
                );
                return Ok(());
            };
            debug!(
                protocol = %self.protocol_name(),
                attribute = %attribute_ref,
                "unlinking attribute"
            );
            self.driver
                .unlink_attribute(&self.configuration, attribute_ref, &attribute)
        })
    }

    /// Handle an actuator message addressed to this session's configuration.
    pub fn write(&self, message: &ActuatorMessage) -> Result<WriteOutcome> {
        let base = self.driver.base();
        base.with_lock_returning("processLinkedAttributeWrite", || {
            if message.protocol_configuration != *self.configuration_ref()
                || message.target_protocol_urn != self.protocol_name()
            {
                return Ok(WriteOutcome::Dropped);
            }
            let event = &message.attribute_event;
            let Some(attribute) = base.linked_attribute(&event.attribute_ref) else {
                warn!(
                    protocol = %self.protocol_name(),
                    attribute = %event.attribute_ref,
                    "actuator write for an attribute that is not linked; dropping"
                );
                return Ok(WriteOutcome::Dropped);
            };
            if attribute.is_read_only() {
                warn!(
                    protocol = %self.protocol_name(),
                    attribute = %event.attribute_ref,
                    "actuator write for a read-only attribute; dropping"
                );
                return Ok(WriteOutcome::Dropped);
            }

            let dynamic = base.is_dynamic(&event.attribute_ref);
            let value = match process_outbound(
                &event.attribute_ref.asset_id,
                &attribute,
                &event.value,
                dynamic,
            ) {
                ProcessingOutcome::Value(value) => value,
                ProcessingOutcome::Ignored => return Ok(WriteOutcome::Ignored),
            };
            self.driver
                .on_actuator_write(&self.configuration, &attribute, event, value)?;
            Ok(WriteOutcome::Written)
        })
    }

    /// Ask the driver for further configurations.
    pub fn discover_instances(&self) -> Result<Vec<Attribute>> {
        self.driver.base().with_lock_returning("discoverInstances", || {
            self.driver.discover_instances(&self.configuration)
        })
    }

    /// Ask the driver to build assets from an uploaded file.
    pub fn discover_linked_attributes(
        &self,
        file: &FileInfo,
    ) -> Result<Vec<agentrt_model::Asset>> {
        self.driver
            .base()
            .with_lock_returning("discoverLinkedAttributes", || {
                self.driver
                    .discover_linked_attributes(&self.configuration, file)
            })
    }

    /// Handles of driver tasks still running.
    pub fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        self.driver.base().take_tasks()
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("protocol", &self.protocol_name())
            .field("configuration", self.configuration_ref())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::ProtocolBase;
    use crate::registry::ProtocolFactory;
    use crate::testing::{CallLog, DriverCall, RecordingBehaviour, RecordingFactory, TestServices};
    use agentrt_model::{
        meta, protocol_configuration, AttributeEvent, EventSource, Value, ValueType,
    };

    const URN: &str = "urn:openremote:protocol:recording";

    fn session(services: &TestServices, behaviour: RecordingBehaviour) -> (ProtocolSession, CallLog) {
        let log = CallLog::new();
        let factory = RecordingFactory::new(URN, log.clone()).with_behaviour(behaviour);
        let configuration = protocol_configuration("cfg1", URN).unwrap();
        let base = ProtocolBase::new(URN, AttributeRef::new("A1", "cfg1"), services.services());
        let driver = factory.create(&configuration, base).unwrap();
        (ProtocolSession::new(driver, configuration), log)
    }

    fn write(attribute: &str, value: impl Into<Value>) -> ActuatorMessage {
        ActuatorMessage {
            target_protocol_urn: URN.into(),
            protocol_configuration: AttributeRef::new("A1", "cfg1"),
            attribute_event: AttributeEvent::new(
                AttributeRef::new("S1", attribute),
                value,
                0,
                EventSource::Client,
            ),
        }
    }

    #[test]
    fn invalid_configuration_never_reaches_connect() {
        let services = TestServices::new();
        let (session, log) = session(
            &services,
            RecordingBehaviour {
                require_socket: true,
                ..Default::default()
            },
        );
        let err = session.connect().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidConfiguration { .. }));
        assert!(log.calls().is_empty());
    }

    #[test]
    fn failed_link_rolls_back() {
        let services = TestServices::new();
        let (session, log) = session(
            &services,
            RecordingBehaviour {
                fail_link: ["humidity".to_owned()].into_iter().collect(),
                ..Default::default()
            },
        );
        let humidity = AttributeRef::new("S1", "humidity");
        assert!(session
            .link_attribute(&humidity, &Attribute::new("humidity", ValueType::Number))
            .is_err());
        assert!(!session.driver().base().is_linked(&humidity));

        session.unlink_attribute(&humidity).unwrap();
        assert_eq!(log.calls(), vec![DriverCall::Link(humidity)]);
    }

    #[test]
    fn duplicate_link_calls_driver_once() {
        let services = TestServices::new();
        let (session, log) = session(&services, RecordingBehaviour::default());
        let temp = AttributeRef::new("S1", "temp");
        let attribute = Attribute::new("temp", ValueType::Number);
        session.link_attribute(&temp, &attribute).unwrap();
        session.link_attribute(&temp, &attribute).unwrap();
        assert_eq!(log.calls(), vec![DriverCall::Link(temp)]);
    }

    #[test]
    fn writes_are_filtered_and_processed() {
        let services = TestServices::new();
        let (session, log) = session(&services, RecordingBehaviour::default());
        session
            .link_attribute(
                &AttributeRef::new("S1", "setpoint"),
                &Attribute::new("setpoint", ValueType::Number)
                    .with_meta(meta::WRITE_VALUE, "SET {$value}"),
            )
            .unwrap();
        session
            .link_attribute(
                &AttributeRef::new("S1", "serial"),
                &Attribute::new("serial", ValueType::String).with_meta(meta::READ_ONLY, true),
            )
            .unwrap();
        log.clear();

        assert_eq!(session.write(&write("setpoint", 21.0)).unwrap(), WriteOutcome::Written);
        assert_eq!(session.write(&write("serial", "x")).unwrap(), WriteOutcome::Dropped);
        assert_eq!(session.write(&write("unknown", 1.0)).unwrap(), WriteOutcome::Dropped);

        let mut foreign = write("setpoint", 1.0);
        foreign.protocol_configuration = AttributeRef::new("A1", "cfg2");
        assert_eq!(session.write(&foreign).unwrap(), WriteOutcome::Dropped);

        assert_eq!(
            log.calls(),
            vec![DriverCall::Write(
                AttributeRef::new("S1", "setpoint"),
                Value::from("SET 21")
            )]
        );
    }

    #[test]
    fn ignored_write_skips_driver() {
        let services = TestServices::new();
        let (session, log) = session(&services, RecordingBehaviour::default());
        let converter = Value::parse_json(r#"{"@DEFAULT": "@IGNORE"}"#).unwrap();
        session
            .link_attribute(
                &AttributeRef::new("S1", "mode"),
                &Attribute::new("mode", ValueType::String)
                    .with_meta(meta::WRITE_VALUE_CONVERTER, converter),
            )
            .unwrap();
        log.clear();
        assert_eq!(session.write(&write("mode", "eco")).unwrap(), WriteOutcome::Ignored);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn discovery_defaults_to_unsupported() {
        let services = TestServices::new();
        let (session, _log) = session(&services, RecordingBehaviour::default());
        assert!(matches!(
            session.discover_instances(),
            Err(ProtocolError::Unsupported(_))
        ));
    }
}
