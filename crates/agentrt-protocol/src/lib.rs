//! ---
//! ems_section: "03-protocol-drivers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Protocol driver contract, driver base and driver registry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Protocol drivers for the agent runtime.
//!
//! A driver implements [`Protocol`] for one protocol URN. The runtime never calls a
//! driver directly: every configuration gets a [`ProtocolSession`] that wraps the
//! driver and applies the shared template (validation, link bookkeeping, value
//! processing, read-only enforcement) around the driver hooks.

pub mod base;
pub mod driver;
pub mod registry;
pub mod session;
pub mod simulator;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod validation;

use agentrt_model::{AttributeRef, ValidationResult};
use agentrt_msg::RouterError;

pub use base::{ProtocolAssetService, ProtocolBase, ProtocolServices, StatusSink};
pub use driver::{FileInfo, Protocol, ProtocolDescriptor};
pub use registry::{ProtocolFactory, ProtocolRegistry};
pub use session::{ProtocolSession, WriteOutcome};
pub use simulator::{SimulatorFactory, SimulatorProtocol, SIMULATOR_PROTOCOL_URN};
pub use validation::{
    validate_protocol_configuration, validate_serial_configuration,
    validate_socket_configuration,
};

/// Shared result type for driver operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failures raised by drivers, driver sessions and the driver registry.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A driver was registered under a name that is not a URN.
    #[error("invalid protocol name '{0}'; expected a URN")]
    InvalidProtocolName(String),
    /// Two drivers claimed the same URN.
    #[error("protocol '{0}' is already registered")]
    DuplicateProtocol(String),
    /// No driver is registered for the URN.
    #[error("no protocol registered for '{0}'")]
    UnknownProtocol(String),
    /// The configuration attribute failed driver validation.
    #[error("protocol configuration {configuration} is invalid: {}", .result.summary())]
    InvalidConfiguration {
        /// Configuration that was rejected.
        configuration: AttributeRef,
        /// Every failure found.
        result: ValidationResult,
    },
    /// The attribute is not linked to this driver session.
    #[error("attribute {0} is not linked")]
    NotLinked(AttributeRef),
    /// The driver rejected an attribute link.
    #[error("cannot link attribute {attribute}: {reason}")]
    Link {
        /// Attribute that was rejected.
        attribute: AttributeRef,
        /// Driver supplied reason.
        reason: String,
    },
    /// The driver could not reach its device.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The driver does not implement an optional capability.
    #[error("{0} is not supported by this protocol")]
    Unsupported(&'static str),
    /// An asset service request was refused.
    #[error("asset service: {0}")]
    AssetService(String),
    /// The message router refused an update.
    #[error(transparent)]
    Router(#[from] RouterError),
    /// Any other driver failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProtocolError {
    /// Whether the failure must stop the runtime.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Router(RouterError::ChannelOverflow { .. })
        )
    }
}
