//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Driver registry keyed by protocol URN."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{info, warn};

use agentrt_model::{is_valid_urn, protocol_name, Attribute, AttributeRef};

use crate::base::{ProtocolBase, ProtocolServices};
use crate::driver::{Protocol, ProtocolDescriptor};
use crate::session::ProtocolSession;
use crate::simulator::SimulatorFactory;
use crate::{ProtocolError, Result};

/// Builds driver instances for one protocol URN.
pub trait ProtocolFactory: Send + Sync {
    /// URN the drivers answer to.
    fn protocol_name(&self) -> &str;

    /// Capabilities of the drivers this factory builds.
    fn descriptor(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new(self.protocol_name(), self.protocol_name())
    }

    /// Build a driver for `configuration` around the prepared `base`.
    fn create(&self, configuration: &Attribute, base: ProtocolBase) -> Result<Box<dyn Protocol>>;
}

/// Known drivers, in registration order.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: IndexMap<String, Arc<dyn ProtocolFactory>>,
}

impl ProtocolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled drivers.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(SimulatorFactory))?;
        Ok(registry)
    }

    /// Add a driver factory. Names must be URNs and unique.
    pub fn register(&mut self, factory: Arc<dyn ProtocolFactory>) -> Result<()> {
        let name = factory.protocol_name().to_owned();
        if !is_valid_urn(&name) {
            warn!(protocol = %name, "refusing protocol with an invalid name");
            return Err(ProtocolError::InvalidProtocolName(name));
        }
        if self.factories.contains_key(&name) {
            warn!(protocol = %name, "refusing duplicate protocol");
            return Err(ProtocolError::DuplicateProtocol(name));
        }
        info!(protocol = %name, "protocol registered");
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Factory for `protocol_name`.
    pub fn get(&self, protocol_name: &str) -> Option<Arc<dyn ProtocolFactory>> {
        self.factories.get(protocol_name).cloned()
    }

    /// Registered URNs.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Descriptors of every registered driver.
    pub fn descriptors(&self) -> Vec<ProtocolDescriptor> {
        self.factories
            .values()
            .map(|factory| factory.descriptor())
            .collect()
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no driver is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiate the driver named by `configuration` and wrap it in a session.
    pub fn create_session(
        &self,
        configuration_ref: &AttributeRef,
        configuration: &Attribute,
        services: ProtocolServices,
    ) -> Result<ProtocolSession> {
        let name = protocol_name(configuration).unwrap_or_default();
        let factory = self
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownProtocol(name.to_owned()))?;
        let base = ProtocolBase::new(name, configuration_ref.clone(), services);
        let driver = factory.create(configuration, base)?;
        Ok(ProtocolSession::new(driver, configuration.clone()))
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SIMULATOR_PROTOCOL_URN;
    use crate::testing::{CallLog, RecordingFactory, TestServices};
    use agentrt_model::protocol_configuration;

    #[test]
    fn builtin_registry_has_simulator() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![SIMULATOR_PROTOCOL_URN]);
        assert_eq!(registry.descriptors()[0].display_name, "Simulator");
    }

    #[test]
    fn rejects_invalid_and_duplicate_names() {
        let mut registry = ProtocolRegistry::new();
        assert!(matches!(
            registry.register(Arc::new(RecordingFactory::new("not a urn", CallLog::new()))),
            Err(ProtocolError::InvalidProtocolName(_))
        ));
        let factory = Arc::new(RecordingFactory::new(
            "urn:openremote:protocol:recording",
            CallLog::new(),
        ));
        registry.register(factory.clone()).unwrap();
        assert!(matches!(
            registry.register(factory),
            Err(ProtocolError::DuplicateProtocol(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_protocol_cannot_start_a_session() {
        let registry = ProtocolRegistry::with_builtin().unwrap();
        let services = TestServices::new();
        let configuration = protocol_configuration("cfg1", "urn:openremote:protocol:knx").unwrap();
        let err = registry
            .create_session(&AttributeRef::new("A1", "cfg1"), &configuration, services.services())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownProtocol(name) if name == "urn:openremote:protocol:knx"));
    }
}
