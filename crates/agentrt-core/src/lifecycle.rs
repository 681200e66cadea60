//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence-event driven linking of configurations and attributes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Agent and asset events are reconciled against the registry rather than against the
//! event's own previous state, so replaying an event leaves the registry unchanged.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use agentrt_common::Coordinator;
use agentrt_metrics::RuntimeMetrics;
use agentrt_model::{Asset, AssetQuery, Attribute, AttributeRef, ConnectionStatus};
use agentrt_protocol::{ProtocolError, ProtocolRegistry, ProtocolServices, StatusSink};

use crate::broker::ChildAssetBroker;
use crate::persistence::{PersistenceCause, PersistenceEvent};
use crate::registry::AgentRegistry;
use crate::store::{AssetStore, GatewayResolver};
use crate::RuntimeError;

/// Desired link of one attribute: `(configuration, attribute_ref, attribute)`.
type Link = (AttributeRef, AttributeRef, Attribute);

pub struct LifecycleController {
    registry: Arc<AgentRegistry>,
    coordinator: Arc<Coordinator>,
    protocols: Arc<ProtocolRegistry>,
    services: ProtocolServices,
    store: Arc<dyn AssetStore>,
    gateways: Arc<dyn GatewayResolver>,
    status: Arc<dyn StatusSink>,
    broker: Arc<ChildAssetBroker>,
    metrics: Option<RuntimeMetrics>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        coordinator: Arc<Coordinator>,
        protocols: Arc<ProtocolRegistry>,
        services: ProtocolServices,
        store: Arc<dyn AssetStore>,
        gateways: Arc<dyn GatewayResolver>,
        status: Arc<dyn StatusSink>,
        broker: Arc<ChildAssetBroker>,
        metrics: Option<RuntimeMetrics>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            protocols,
            services,
            store,
            gateways,
            status,
            broker,
            metrics,
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Apply one persistence event. Problems are logged and returned; none of them
    /// is fatal for the persistence pipeline.
    pub fn on_persistence_event(&self, event: &PersistenceEvent) -> Vec<RuntimeError> {
        let mut report = Vec::new();
        if !event.is_asset_event() {
            trace!(entity = %event.entity_type, "ignoring non-asset persistence event");
            return report;
        }
        let Some(asset) = event.asset() else {
            warn!(asset = %event.entity_id, cause = %event.cause, "persistence event without asset state");
            return report;
        };
        if self.gateways.is_gateway_asset(asset) {
            trace!(asset = %asset.id, "gateway descendant asset; ignoring");
            return report;
        }

        self.coordinator.with_lock("processPersistenceEvent", || {
            debug!(asset = %asset.id, cause = %event.cause, agent = asset.is_agent(), "processing persistence event");
            match (asset.is_agent(), event.cause) {
                (true, PersistenceCause::Delete) => self.remove_agent(asset),
                (true, _) => self.reconcile_agent(asset, &mut report),
                (false, PersistenceCause::Delete) => self.remove_asset_links(&asset.id),
                (false, _) => self.reconcile_asset(asset, &mut report),
            }

            for agent_id in self.owning_agents(event) {
                report.extend(self.broker.notify(&agent_id, event));
            }
        });
        report
    }

    /// Nearest registered agent above the asset in its current state, then in its
    /// previous state when a move left a different agent behind.
    fn owning_agents(&self, event: &PersistenceEvent) -> Vec<String> {
        let mut agents: Vec<String> = Vec::new();
        for state in event.states() {
            let nearest = state.ancestor_ids().find(|id| self.registry.has_agent(id));
            if let Some(id) = nearest {
                if !agents.iter().any(|known| known == id) {
                    agents.push(id.to_owned());
                }
            }
        }
        agents
    }

    /// Link every configuration of the stored, non-gateway agents.
    pub fn start(&self) -> Vec<RuntimeError> {
        let mut report = Vec::new();
        let agents = self
            .store
            .find_all(&AssetQuery::new().types([agentrt_model::AGENT_TYPE]));
        self.coordinator.with_lock("start", || {
            for agent in agents.iter().filter(|a| !self.gateways.is_gateway_asset(a)) {
                self.reconcile_agent(agent, &mut report);
            }
        });
        info!(
            agents = self.registry.agent_ids().len(),
            configurations = self.registry.configuration_refs().len(),
            "agent runtime started"
        );
        report
    }

    /// Unlink every configuration in reverse registration order.
    ///
    /// Returns driver tasks still to be awaited, including those of earlier unlinks.
    pub fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = std::mem::take(&mut *self.retired.lock());
        for configuration in self.registry.configuration_refs().into_iter().rev() {
            tasks.extend(self.unlink_configuration(&configuration));
        }
        tasks
    }

    /// Drop handles of driver tasks that already finished.
    pub fn reap_retired(&self) {
        self.retired.lock().retain(|task| !task.is_finished());
    }

    fn reconcile_agent(&self, agent: &Asset, report: &mut Vec<RuntimeError>) {
        self.registry.put_agent(agent);
        let desired: Vec<(AttributeRef, &Attribute)> = agent
            .protocol_configurations()
            .map(|attribute| (agent.attribute_ref(&attribute.name), attribute))
            .collect();

        for configuration in self.registry.configurations_of(&agent.id) {
            let unchanged = self.registry.configuration(&configuration).is_some_and(|entry| {
                desired.iter().any(|(reference, attribute)| {
                    *reference == configuration && entry.attribute.same_ignoring_timestamp(attribute)
                })
            });
            if !unchanged {
                let tasks = self.unlink_configuration(&configuration);
                self.retired.lock().extend(tasks);
            }
        }
        for (configuration, attribute) in desired {
            if !self.registry.has_configuration(&configuration) {
                self.link_configuration(&configuration, attribute, report);
            }
        }
    }

    fn remove_agent(&self, agent: &Asset) {
        self.registry.remove_agent(&agent.id);
        for configuration in self.registry.configurations_of(&agent.id) {
            let tasks = self.unlink_configuration(&configuration);
            self.retired.lock().extend(tasks);
        }
    }

    fn reconcile_asset(&self, asset: &Asset, report: &mut Vec<RuntimeError>) {
        let desired: Vec<Link> = asset
            .linked_attributes()
            .map(|(configuration, attribute)| {
                (configuration, asset.attribute_ref(&attribute.name), attribute.clone())
            })
            .collect();
        let current = self.registry.links_of_asset(&asset.id);

        for (configuration, reference, attribute) in &current {
            let kept = desired.iter().any(|(c, r, a)| {
                c == configuration && r == reference && same_link_definition(a, attribute)
            });
            if !kept {
                self.unlink_attribute(configuration, reference);
            }
        }

        self.registry.remove_deferred_of_asset(&asset.id);
        for (configuration, reference, attribute) in &desired {
            let linked = current.iter().any(|(c, r, a)| {
                c == configuration && r == reference && same_link_definition(a, attribute)
            });
            if linked {
                continue;
            }
            if self.registry.has_configuration(configuration) {
                self.link_attribute(configuration, reference, attribute, report);
            } else if !self.registry.has_agent(&configuration.asset_id) {
                let err = RuntimeError::PersistenceOutOfOrder {
                    attribute: reference.clone(),
                    agent_id: configuration.asset_id.clone(),
                };
                warn!(attribute = %reference, configuration = %configuration, "{err}; deferring link");
                self.registry.defer(reference, configuration, attribute);
                report.push(err);
            } else {
                warn!(attribute = %reference, configuration = %configuration, "linked protocol configuration not found");
            }
        }
    }

    fn remove_asset_links(&self, asset_id: &str) {
        for (configuration, reference, _) in self.registry.links_of_asset(asset_id) {
            self.unlink_attribute(&configuration, &reference);
        }
        self.registry.remove_deferred_of_asset(asset_id);
    }

    fn link_configuration(
        &self,
        configuration: &AttributeRef,
        attribute: &Attribute,
        report: &mut Vec<RuntimeError>,
    ) {
        self.coordinator.with_lock("linkProtocolConfiguration", || {
            self.registry.put_configuration(configuration, attribute);
            info!(configuration = %configuration, protocol = ?attribute.value.as_str(), "linking protocol configuration");

            let session = match self.protocols.create_session(
                configuration,
                attribute,
                self.services.clone(),
            ) {
                Ok(session) => Arc::new(session),
                Err(source) => {
                    let err = match source {
                        ProtocolError::UnknownProtocol(protocol) => RuntimeError::DriverUnknown {
                            configuration: configuration.clone(),
                            protocol,
                        },
                        other => RuntimeError::ConfigurationInvalid {
                            configuration: configuration.clone(),
                            reason: other.to_string(),
                        },
                    };
                    error!(configuration = %configuration, error = %err, "cannot create driver session");
                    self.status
                        .publish_status(configuration, ConnectionStatus::ErrorConfiguration);
                    report.push(err);
                    return;
                }
            };
            self.registry.set_session(configuration, session.clone());

            if let Err(source) = session.connect() {
                let err = match source {
                    ProtocolError::InvalidConfiguration { result, .. } => {
                        RuntimeError::ConfigurationInvalid {
                            configuration: configuration.clone(),
                            reason: result.summary(),
                        }
                    }
                    source => RuntimeError::DriverConnectFailed {
                        configuration: configuration.clone(),
                        source,
                    },
                };
                error!(configuration = %configuration, error = %err, "driver failed to connect");
                self.status
                    .publish_status(configuration, ConnectionStatus::ErrorConfiguration);
                report.push(err);
                return;
            }

            if self
                .registry
                .status(configuration)
                .is_some_and(ConnectionStatus::is_error)
            {
                warn!(configuration = %configuration, "protocol connection status is showing error so not linking attributes");
                return;
            }

            let mut links: Vec<(AttributeRef, Attribute)> = self
                .store
                .find_all(&AssetQuery::new().linked_to(configuration.clone()))
                .iter()
                .filter(|asset| !self.gateways.is_gateway_asset(asset))
                .flat_map(|asset| {
                    asset
                        .linked_attributes()
                        .filter(|(link, _)| link == configuration)
                        .map(|(_, attribute)| (asset.attribute_ref(&attribute.name), attribute.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();
            for (reference, attribute) in self.registry.deferred_for(configuration) {
                if !links.iter().any(|(known, _)| *known == reference) {
                    links.push((reference, attribute));
                }
            }
            for (reference, attribute) in &links {
                self.link_attribute(configuration, reference, attribute, report);
            }
        });
    }

    /// Remove the configuration with all its links; returns driver tasks to await.
    fn unlink_configuration(&self, configuration: &AttributeRef) -> Vec<JoinHandle<()>> {
        self.coordinator
            .with_lock_returning("unlinkProtocolConfiguration", || {
                info!(configuration = %configuration, "unlinking protocol configuration");
                for (reference, _) in self.registry.linked_attributes(configuration) {
                    self.unlink_attribute(configuration, &reference);
                }

                let session = self
                    .registry
                    .configuration(configuration)
                    .and_then(|entry| entry.session);
                let tasks = match session {
                    Some(session) => {
                        if let Err(err) = session.disconnect() {
                            error!(configuration = %configuration, error = %err, "driver failed to disconnect");
                        }
                        session.take_tasks()
                    }
                    None => Vec::new(),
                };

                self.registry.remove_configuration(configuration);
                if let Some(metrics) = &self.metrics {
                    metrics.forget_configuration(&configuration.to_string());
                }
                tasks
            })
    }

    fn link_attribute(
        &self,
        configuration: &AttributeRef,
        reference: &AttributeRef,
        attribute: &Attribute,
        report: &mut Vec<RuntimeError>,
    ) {
        self.coordinator.with_lock("linkAttributes", || {
            let Some(entry) = self.registry.configuration(configuration) else {
                warn!(attribute = %reference, configuration = %configuration, "cannot link to unregistered configuration");
                return;
            };
            let Some(session) = entry.session else {
                warn!(attribute = %reference, configuration = %configuration, "configuration has no driver session; not linking");
                return;
            };
            if entry.status == ConnectionStatus::ErrorConfiguration {
                warn!(attribute = %reference, configuration = %configuration, "configuration is misconfigured; not linking");
                return;
            }

            self.registry.link_attribute(configuration, reference, attribute);
            debug!(attribute = %reference, protocol = %entry.protocol_name, "linking attribute");
            if let Err(source) = session.link_attribute(reference, attribute) {
                let err = RuntimeError::DriverLinkFailed {
                    configuration: configuration.clone(),
                    attribute: reference.clone(),
                    source,
                };
                error!(error = %err, "ignoring error on linking attribute to protocol");
                self.status.publish_status(configuration, ConnectionStatus::Error);
                report.push(err);
            }
            self.record_linked(configuration);
        });
    }

    fn unlink_attribute(&self, configuration: &AttributeRef, reference: &AttributeRef) {
        self.coordinator.with_lock("unlinkAttributes", || {
            self.registry.unlink_attribute(configuration, reference);
            let session = self
                .registry
                .configuration(configuration)
                .and_then(|entry| entry.session);
            if let Some(session) = session {
                debug!(attribute = %reference, configuration = %configuration, "unlinking attribute");
                if let Err(err) = session.unlink_attribute(reference) {
                    error!(
                        attribute = %reference,
                        configuration = %configuration,
                        error = %err,
                        "ignoring error on unlinking attribute from protocol"
                    );
                    self.status.publish_status(configuration, ConnectionStatus::Error);
                }
            }
            self.record_linked(configuration);
        });
    }

    fn record_linked(&self, configuration: &AttributeRef) {
        if let Some(metrics) = &self.metrics {
            metrics.set_linked(
                &configuration.to_string(),
                self.registry.linked_attributes(configuration).len(),
            );
        }
    }
}

/// Linked attributes differ only when their definition does; values and timestamps
/// move with sensor updates.
fn same_link_definition(a: &Attribute, b: &Attribute) -> bool {
    a.name == b.name && a.value_type == b.value_type && a.meta == b.meta
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("registry", &self.registry)
            .field("protocols", &self.protocols)
            .field("retired_tasks", &self.retired.lock().len())
            .finish_non_exhaustive()
    }
}
