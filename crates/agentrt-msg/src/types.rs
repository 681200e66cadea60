//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Channel envelopes and client events."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use agentrt_model::{AttributeEvent, AttributeRef, ConnectionStatus};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Names of the router channels, used in errors and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    /// Platform to driver writes.
    Actuator,
    /// Driver to platform updates.
    Sensor,
    /// Runtime to console notifications.
    ClientEvent,
}

/// Write request addressed to the driver session of one protocol configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorMessage {
    /// URN of the driver kind that must handle the message.
    pub target_protocol_urn: String,
    /// Configuration the written attribute is linked to.
    pub protocol_configuration: AttributeRef,
    /// The unprocessed platform event.
    pub attribute_event: AttributeEvent,
}

/// Update reported by a driver, stamped with the driver's URN by the driver base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorMessage {
    /// URN of the reporting driver kind.
    pub source_protocol_urn: String,
    /// Processed event with `source = SENSOR`.
    pub attribute_event: AttributeEvent,
}

/// Connection status transition of one protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusEvent {
    /// Epoch milliseconds of the transition.
    pub timestamp: i64,
    /// Realm of the owning agent.
    pub realm: String,
    /// Configuration whose status changed.
    pub protocol_configuration: AttributeRef,
    /// New status.
    pub connection_status: ConnectionStatus,
}

/// Event delivered to console subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Connection status change.
    AgentStatus(AgentStatusEvent),
    /// Attribute value applied from a sensor update.
    Attribute {
        /// Realm of the asset owning the attribute.
        realm: String,
        /// The applied event.
        event: AttributeEvent,
    },
}

impl ClientEvent {
    /// Realm the event belongs to.
    pub fn realm(&self) -> &str {
        match self {
            ClientEvent::AgentStatus(status) => &status.realm,
            ClientEvent::Attribute { realm, .. } => realm,
        }
    }
}
