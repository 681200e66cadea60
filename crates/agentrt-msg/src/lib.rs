//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message router separating actuator, sensor and client-event traffic."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Message router of the agent runtime.
//!
//! Three single-process channels with different delivery rules:
//!
//! * actuator: platform to driver, bounded per receiver, FIFO, overflow is fatal;
//! * sensor: driver to platform, bounded, FIFO, overflow is fatal;
//! * client-event: runtime to consoles, lossy, newest status per configuration wins.

pub mod actuator;
pub mod client;
pub mod router;
pub mod sensor;
pub mod types;

pub use actuator::{ActuatorChannel, ActuatorReceiver};
pub use client::{
    require_role, ClientEventChannel, ClientSubscription, SubscriberInfo, READ_ASSETS_ROLE,
};
pub use router::{MessageRouter, RouterConfig};
pub use sensor::{SensorChannel, SensorReceiver, SensorSender};
pub use types::{ActuatorMessage, AgentStatusEvent, ChannelKind, ClientEvent, SensorMessage};

/// Shared result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Failures raised by the router channels.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// An ordered channel reached its bounded capacity.
    #[error("{channel} channel overflow (capacity {capacity})")]
    ChannelOverflow {
        /// Channel that overflowed.
        channel: ChannelKind,
        /// Configured capacity.
        capacity: usize,
    },
    /// Every receiver of the channel has gone away.
    #[error("{0} channel closed")]
    Closed(ChannelKind),
    /// A client-event subscription was refused by an authorisation hook.
    #[error("client event subscription refused: {0}")]
    Unauthorized(String),
}
