//! ---
//! ems_section: "05-observability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Instruments updated by the agent runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};

use crate::SharedRegistry;

#[derive(Clone, Debug)]
pub struct RuntimeMetrics {
    registry: SharedRegistry,
    status_transitions: IntCounterVec,
    actuator_messages: IntCounterVec,
    sensor_messages: IntCounterVec,
    linked_attributes: IntGaugeVec,
    overflows: IntCounterVec,
}

impl RuntimeMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let status_transitions = IntCounterVec::new(
            Opts::new(
                "agentrt_status_transitions_total",
                "Connection status changes by protocol and new status",
            ),
            &["protocol", "status"],
        )?;
        registry.register(Box::new(status_transitions.clone()))?;

        let actuator_messages = IntCounterVec::new(
            Opts::new(
                "agentrt_actuator_messages_total",
                "Actuator messages handled by driver sessions, by outcome",
            ),
            &["protocol", "outcome"],
        )?;
        registry.register(Box::new(actuator_messages.clone()))?;

        let sensor_messages = IntCounterVec::new(
            Opts::new(
                "agentrt_sensor_messages_total",
                "Sensor updates applied to the asset store",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(sensor_messages.clone()))?;

        let linked_attributes = IntGaugeVec::new(
            Opts::new(
                "agentrt_linked_attributes",
                "Attributes currently linked per protocol configuration",
            ),
            &["configuration"],
        )?;
        registry.register(Box::new(linked_attributes.clone()))?;

        let overflows = IntCounterVec::new(
            Opts::new(
                "agentrt_channel_overflows_total",
                "Ordered channel overflows; each one stops the runtime",
            ),
            &["channel"],
        )?;
        registry.register(Box::new(overflows.clone()))?;

        Ok(Self {
            registry,
            status_transitions,
            actuator_messages,
            sensor_messages,
            linked_attributes,
            overflows,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_status(&self, protocol: &str, status: &str) {
        self.status_transitions
            .with_label_values(&[protocol, status])
            .inc();
    }

    pub fn record_actuator(&self, protocol: &str, outcome: &str) {
        self.actuator_messages
            .with_label_values(&[protocol, outcome])
            .inc();
    }

    pub fn record_sensor(&self, protocol: &str) {
        self.sensor_messages.with_label_values(&[protocol]).inc();
    }

    pub fn set_linked(&self, configuration: &str, count: usize) {
        self.linked_attributes
            .with_label_values(&[configuration])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Drop the gauge of a configuration that no longer exists.
    pub fn forget_configuration(&self, configuration: &str) {
        let _ = self.linked_attributes.remove_label_values(&[configuration]);
    }

    pub fn record_overflow(&self, channel: &str) {
        self.overflows.with_label_values(&[channel]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_registry;

    #[test]
    fn linked_gauge_tracks_configurations() {
        let metrics = RuntimeMetrics::new(new_registry()).unwrap();
        metrics.set_linked("A1:cfg1", 3);
        assert_eq!(metrics.linked_attributes.with_label_values(&["A1:cfg1"]).get(), 3);
        metrics.forget_configuration("A1:cfg1");
        let families = metrics.registry().gather();
        let linked = families
            .iter()
            .find(|family| family.get_name() == "agentrt_linked_attributes");
        assert!(linked.map_or(true, |family| family.get_metric().is_empty()));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = new_registry();
        RuntimeMetrics::new(registry.clone()).unwrap();
        assert!(RuntimeMetrics::new(registry).is_err());
    }
}
