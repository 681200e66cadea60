//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Agent runtime core: registry, lifecycle, processor, status and broker."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Agent and protocol runtime.
//!
//! The runtime keeps an in-memory [`AgentRegistry`] of agents, their protocol
//! configurations and the attributes linked to each configuration. Persistence events
//! drive the [`LifecycleController`]; platform writes pass through the
//! [`AttributeProcessor`]; drivers report connection status through the
//! [`StatusPublisher`]. Every mutation runs inside the shared coordination lock.

pub mod broker;
pub mod lifecycle;
pub mod persistence;
pub mod processor;
pub mod registry;
pub mod runtime;
pub mod status;
pub mod store;

use agentrt_model::AttributeRef;
use agentrt_msg::{ChannelKind, RouterError};
use agentrt_protocol::ProtocolError;

pub use broker::{ChildAssetBroker, ChildAssetCallback};
pub use lifecycle::LifecycleController;
pub use persistence::{PersistenceCause, PersistenceEvent};
pub use processor::{AttributeProcessor, ProcessOutcome};
pub use registry::{AgentRegistry, ConfigurationEntry, RegistrySnapshot, SubscriptionId};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, RuntimeHandle};
pub use status::StatusPublisher;
pub use store::{
    AssetStore, GatewayResolver, GatewaySet, InMemoryAssetStore, NoGateways, RuntimeAssetService,
};

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("protocol configuration {configuration} is invalid: {reason}")]
    ConfigurationInvalid {
        configuration: AttributeRef,
        reason: String,
    },
    #[error("no protocol driver '{protocol}' for configuration {configuration}")]
    DriverUnknown {
        configuration: AttributeRef,
        protocol: String,
    },
    #[error("driver failed to connect configuration {configuration}: {source}")]
    DriverConnectFailed {
        configuration: AttributeRef,
        source: ProtocolError,
    },
    #[error("driver failed to link {attribute} to {configuration}: {source}")]
    DriverLinkFailed {
        configuration: AttributeRef,
        attribute: AttributeRef,
        source: ProtocolError,
    },
    #[error("attribute {attribute} links to agent {agent_id} which is not registered yet")]
    PersistenceOutOfOrder {
        attribute: AttributeRef,
        agent_id: String,
    },
    #[error("child asset subscriber of agent {agent_id} failed: {message}")]
    SubscriberThrew { agent_id: String, message: String },
    #[error("attribute {attribute} links to unregistered configuration {configuration}")]
    InvalidAgentLink {
        attribute: AttributeRef,
        configuration: AttributeRef,
    },
    #[error("{channel} channel overflow (capacity {capacity})")]
    ChannelOverflow {
        channel: ChannelKind,
        capacity: usize,
    },
    #[error("protocol configuration {0} is not registered")]
    UnknownConfiguration(AttributeRef),
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error(transparent)]
    Router(RouterError),
    #[error("asset store: {0}")]
    Store(String),
}

impl RuntimeError {
    /// Whether the runtime must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::ChannelOverflow { .. })
    }
}

impl From<RouterError> for RuntimeError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::ChannelOverflow { channel, capacity } => {
                RuntimeError::ChannelOverflow { channel, capacity }
            }
            other => RuntimeError::Router(other),
        }
    }
}
