//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Driver hooks implemented by every protocol."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;

use agentrt_model::{Asset, Attribute, AttributeEvent, AttributeRef, ValidationResult, Value};

use crate::base::ProtocolBase;
use crate::validation::validate_protocol_configuration;
use crate::{ProtocolError, Result};

/// Capabilities a driver advertises to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolDescriptor {
    /// Driver URN.
    pub name: String,
    /// Human readable name.
    pub display_name: String,
    /// Supports [`Protocol::discover_instances`].
    pub instance_discovery: bool,
    /// Supports [`Protocol::discover_linked_attributes`].
    pub asset_import: bool,
}

impl ProtocolDescriptor {
    /// Descriptor without optional capabilities.
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            instance_discovery: false,
            asset_import: false,
        }
    }
}

/// Uploaded file handed to [`Protocol::discover_linked_attributes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Original file name.
    pub name: String,
    /// File contents; base64 when `binary`.
    pub contents: String,
    /// Whether `contents` is encoded binary data.
    pub binary: bool,
}

/// Hooks of one protocol driver instance.
///
/// One instance serves exactly one protocol configuration. All hooks run inside the
/// coordination lock and must return promptly: I/O belongs on tasks spawned through
/// [`ProtocolBase::spawn`], which re-enter the lock only to publish results.
pub trait Protocol: Send + Sync {
    /// Shared driver state.
    fn base(&self) -> &ProtocolBase;

    /// Driver URN.
    fn name(&self) -> &str {
        self.base().protocol_name()
    }

    /// Check a configuration before [`Protocol::connect`].
    ///
    /// The default only checks that the configuration names this driver; drivers with
    /// connection parameters extend it.
    fn validate_configuration(&self, configuration: &Attribute) -> ValidationResult {
        validate_protocol_configuration(configuration, self.name())
    }

    /// Begin connecting; report progress with [`ProtocolBase::set_connection_status`].
    fn connect(&self, configuration: &Attribute) -> Result<()>;

    /// Release every resource acquired by [`Protocol::connect`].
    fn disconnect(&self, configuration: &Attribute) -> Result<()>;

    /// Start serving `attribute`. On error the attribute is not considered linked.
    fn link_attribute(
        &self,
        configuration: &Attribute,
        attribute_ref: &AttributeRef,
        attribute: &Attribute,
    ) -> Result<()>;

    /// Stop serving `attribute`.
    fn unlink_attribute(
        &self,
        configuration: &Attribute,
        attribute_ref: &AttributeRef,
        attribute: &Attribute,
    ) -> Result<()>;

    /// Write `value` to the device.
    ///
    /// `value` is the outbound-processed form of `event.value`.
    fn on_actuator_write(
        &self,
        configuration: &Attribute,
        attribute: &Attribute,
        event: &AttributeEvent,
        value: Value,
    ) -> Result<()>;

    /// Find protocol configurations reachable from `configuration`.
    fn discover_instances(&self, _configuration: &Attribute) -> Result<Vec<Attribute>> {
        Err(ProtocolError::Unsupported("instance discovery"))
    }

    /// Build linked assets from an uploaded device description.
    fn discover_linked_attributes(
        &self,
        _configuration: &Attribute,
        _file: &FileInfo,
    ) -> Result<Vec<Asset>> {
        Err(ProtocolError::Unsupported("asset import"))
    }
}
