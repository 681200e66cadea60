//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Connection status recording and agent status client events."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::{debug, info};

use agentrt_common::{Clock, Coordinator};
use agentrt_metrics::RuntimeMetrics;
use agentrt_model::{AttributeRef, ConnectionStatus};
use agentrt_msg::{AgentStatusEvent, ClientEvent, MessageRouter};
use agentrt_protocol::StatusSink;

use crate::registry::AgentRegistry;

/// Records status transitions and emits one [`AgentStatusEvent`] per real change.
///
/// Statuses of configurations whose agent is gone are still recorded but not published.
#[derive(Debug)]
pub struct StatusPublisher {
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
    router: Arc<MessageRouter>,
    clock: Arc<dyn Clock>,
    metrics: Option<RuntimeMetrics>,
}

impl StatusPublisher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        coordinator: Arc<Coordinator>,
        router: Arc<MessageRouter>,
        clock: Arc<dyn Clock>,
        metrics: Option<RuntimeMetrics>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            router,
            clock,
            metrics,
        }
    }
}

impl StatusSink for StatusPublisher {
    fn publish_status(&self, configuration: &AttributeRef, status: ConnectionStatus) {
        self.coordinator.with_lock("publishProtocolConnectionStatus", || {
            let Some(previous) = self.registry.set_status(configuration, status) else {
                return;
            };
            info!(
                configuration = %configuration,
                from = %previous,
                to = %status,
                "agent protocol status updated"
            );
            let Some(agent) = self.registry.agent(&configuration.asset_id) else {
                debug!(configuration = %configuration, "agent not registered; status not published");
                return;
            };
            if let Some(metrics) = &self.metrics {
                let protocol = self
                    .registry
                    .configuration(configuration)
                    .map(|entry| entry.protocol_name)
                    .unwrap_or_default();
                metrics.record_status(&protocol, &status.to_string());
            }
            self.router
                .client_events()
                .publish(ClientEvent::AgentStatus(AgentStatusEvent {
                    timestamp: self.clock.now_millis(),
                    realm: agent.realm,
                    protocol_configuration: configuration.clone(),
                    connection_status: status,
                }));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_common::ManualClock;
    use agentrt_model::{protocol_configuration, Asset};
    use agentrt_msg::SubscriberInfo;

    #[test]
    fn one_event_per_transition() {
        let registry = Arc::new(AgentRegistry::new());
        let router = Arc::new(MessageRouter::default());
        let publisher = StatusPublisher::new(
            registry.clone(),
            Arc::new(Coordinator::default()),
            router.clone(),
            Arc::new(ManualClock::new(42)),
            None,
        );
        let subscription = router
            .client_events()
            .subscribe(SubscriberInfo::new(["read:assets"], None))
            .unwrap();

        let cfg_ref = AttributeRef::new("A1", "cfg1");
        registry.put_agent(&Asset::agent("A1", "Agent", "tenant"));
        registry.put_configuration(
            &cfg_ref,
            &protocol_configuration("cfg1", "urn:openremote:protocol:simulator").unwrap(),
        );

        publisher.publish_status(&cfg_ref, ConnectionStatus::Connected);
        publisher.publish_status(&cfg_ref, ConnectionStatus::Connected);
        let events = subscription.drain();
        assert_eq!(
            events,
            vec![ClientEvent::AgentStatus(AgentStatusEvent {
                timestamp: 42,
                realm: "tenant".into(),
                protocol_configuration: cfg_ref.clone(),
                connection_status: ConnectionStatus::Connected,
            })]
        );

        registry.remove_agent("A1");
        publisher.publish_status(&cfg_ref, ConnectionStatus::Disconnected);
        assert!(subscription.drain().is_empty());
        assert_eq!(registry.status(&cfg_ref), Some(ConnectionStatus::Disconnected));
    }
}
