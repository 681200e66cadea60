//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bundle of the three runtime channels."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::actuator::ActuatorChannel;
use crate::client::ClientEventChannel;
use crate::sensor::SensorChannel;

/// Channel capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-receiver actuator queue bound.
    pub actuator_capacity: usize,
    /// Sensor queue bound.
    pub sensor_capacity: usize,
    /// Per-subscriber client-event queue bound.
    pub client_event_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            actuator_capacity: 1024,
            sensor_capacity: 4096,
            client_event_capacity: 256,
        }
    }
}

/// The runtime's three channels, kept semantically separate.
#[derive(Debug)]
pub struct MessageRouter {
    actuator: ActuatorChannel,
    sensor: SensorChannel,
    client: ClientEventChannel,
}

impl MessageRouter {
    /// Build the channels with the given capacities.
    pub fn new(config: RouterConfig) -> Self {
        Self {
            actuator: ActuatorChannel::new(config.actuator_capacity),
            sensor: SensorChannel::new(config.sensor_capacity),
            client: ClientEventChannel::new(config.client_event_capacity),
        }
    }

    /// Platform to driver writes.
    pub fn actuator(&self) -> &ActuatorChannel {
        &self.actuator
    }

    /// Driver to platform updates.
    pub fn sensor(&self) -> &SensorChannel {
        &self.sensor
    }

    /// Runtime to console notifications.
    pub fn client_events(&self) -> &ClientEventChannel {
        &self.client
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}
