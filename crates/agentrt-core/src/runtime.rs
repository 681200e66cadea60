//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime assembly, channel pumps and the spawned runtime loop."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use agentrt_common::{Clock, Coordinator, RuntimeConfig, SystemClock};
use agentrt_metrics::RuntimeMetrics;
use agentrt_model::{Asset, Attribute, AttributeEvent, AttributeRef, ConnectionStatus};
use agentrt_msg::{
    ActuatorMessage, ActuatorReceiver, ChannelKind, ClientEvent, ClientSubscription,
    MessageRouter, RouterConfig, RouterError, SensorMessage, SensorReceiver, SubscriberInfo,
};
use agentrt_protocol::{
    FileInfo, ProtocolError, ProtocolRegistry, ProtocolServices, ProtocolSession, WriteOutcome,
};

use crate::broker::{ChildAssetBroker, ChildAssetCallback};
use crate::lifecycle::LifecycleController;
use crate::persistence::PersistenceEvent;
use crate::processor::{AttributeProcessor, ProcessOutcome};
use crate::registry::{AgentRegistry, RegistrySnapshot, SubscriptionId};
use crate::status::StatusPublisher;
use crate::store::{AssetStore, GatewayResolver, InMemoryAssetStore, NoGateways, RuntimeAssetService};
use crate::{Result, RuntimeError};

/// Wires the runtime components together.
pub struct AgentRuntimeBuilder {
    config: RuntimeConfig,
    protocols: ProtocolRegistry,
    store: Option<Arc<dyn AssetStore>>,
    gateways: Arc<dyn GatewayResolver>,
    clock: Arc<dyn Clock>,
    metrics: Option<RuntimeMetrics>,
}

impl AgentRuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            protocols: ProtocolRegistry::new(),
            store: None,
            gateways: Arc::new(NoGateways),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn protocols(mut self, protocols: ProtocolRegistry) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn gateways(mut self, gateways: Arc<dyn GatewayResolver>) -> Self {
        self.gateways = gateways;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: RuntimeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> AgentRuntime {
        let config = self.config;
        let coordinator = Arc::new(Coordinator::new(config.lock_warn_threshold));
        let router = Arc::new(MessageRouter::new(RouterConfig {
            actuator_capacity: config.actuator_capacity,
            sensor_capacity: config.sensor_capacity,
            client_event_capacity: config.client_event_capacity,
        }));
        let registry = Arc::new(AgentRegistry::new());
        let store: Arc<dyn AssetStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryAssetStore::new()),
        };
        let protocols = Arc::new(self.protocols);

        let status = Arc::new(StatusPublisher::new(
            registry.clone(),
            coordinator.clone(),
            router.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        ));
        let processor = Arc::new(AttributeProcessor::new(
            registry.clone(),
            store.clone(),
            router.clone(),
            coordinator.clone(),
        ));
        let services = ProtocolServices {
            coordinator: coordinator.clone(),
            sensor: router.sensor().sender(),
            status: status.clone(),
            assets: Arc::new(RuntimeAssetService::new(store.clone(), processor.clone())),
            clock: self.clock,
        };
        let broker = Arc::new(ChildAssetBroker::new(registry.clone(), coordinator.clone()));
        let lifecycle = LifecycleController::new(
            registry.clone(),
            coordinator.clone(),
            protocols.clone(),
            services,
            store.clone(),
            self.gateways,
            status,
            broker.clone(),
            self.metrics.clone(),
        );

        let actuator_receivers: Vec<ActuatorReceiver> = protocols
            .names()
            .map(|name| router.actuator().subscribe(name))
            .collect();
        let sensor_receiver = router.sensor().take_receiver();

        AgentRuntime {
            config,
            coordinator,
            router,
            registry,
            protocols,
            store,
            processor,
            broker,
            lifecycle,
            metrics: self.metrics,
            actuator_receivers: Mutex::new(actuator_receivers),
            sensor_receiver: Mutex::new(sensor_receiver),
            fatal: Mutex::new(None),
            fatal_raised: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for AgentRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntimeBuilder")
            .field("config", &self.config)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

/// The assembled agent runtime.
///
/// Synchronous entry points may be driven directly (tests, embedding) or through the
/// loop started by [`AgentRuntime::spawn`].
pub struct AgentRuntime {
    config: RuntimeConfig,
    coordinator: Arc<Coordinator>,
    router: Arc<MessageRouter>,
    registry: Arc<AgentRegistry>,
    protocols: Arc<ProtocolRegistry>,
    store: Arc<dyn AssetStore>,
    processor: Arc<AttributeProcessor>,
    broker: Arc<ChildAssetBroker>,
    lifecycle: LifecycleController,
    metrics: Option<RuntimeMetrics>,
    actuator_receivers: Mutex<Vec<ActuatorReceiver>>,
    sensor_receiver: Mutex<Option<SensorReceiver>>,
    fatal: Mutex<Option<(ChannelKind, usize)>>,
    fatal_raised: Notify,
    stopped: AtomicBool,
}

impl AgentRuntime {
    pub fn builder(config: RuntimeConfig) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(config)
    }

    /// Link all agents already present in the asset store.
    pub fn start(&self) -> Vec<RuntimeError> {
        self.lifecycle.start()
    }

    pub fn on_persistence_event(&self, event: &PersistenceEvent) -> Vec<RuntimeError> {
        self.lifecycle.on_persistence_event(event)
    }

    /// Route a platform attribute event; pass-through events are written to the store.
    pub fn process_attribute_event(&self, event: AttributeEvent) -> Result<ProcessOutcome> {
        let outcome = self.processor.process(&event).inspect_err(|err| self.raise(err))?;
        if outcome == ProcessOutcome::PassThrough {
            self.store.apply_attribute_event(&event)?;
        }
        Ok(outcome)
    }

    /// Hand queued actuator messages to their sessions. Only fatal errors are returned.
    pub fn pump_actuator(&self) -> Result<usize> {
        let messages: Vec<ActuatorMessage> = {
            let mut receivers = self.actuator_receivers.lock();
            receivers
                .iter_mut()
                .flat_map(|receiver| std::iter::from_fn(move || receiver.try_recv()))
                .collect()
        };
        let count = messages.len();
        for message in messages {
            let protocol = message.target_protocol_urn.clone();
            let outcome = match self.session(&message.protocol_configuration) {
                Some(session) => session.write(&message),
                None => {
                    warn!(
                        configuration = %message.protocol_configuration,
                        attribute = %message.attribute_event.attribute_ref,
                        "actuator message for a configuration without session; dropping"
                    );
                    Ok(WriteOutcome::Dropped)
                }
            };
            let label = match outcome {
                Ok(WriteOutcome::Written) => "written",
                Ok(WriteOutcome::Ignored) => {
                    info!(attribute = %message.attribute_event.attribute_ref, "outbound value processing ignored the write");
                    "ignored"
                }
                Ok(WriteOutcome::Dropped) => "dropped",
                Err(ProtocolError::Router(err @ RouterError::ChannelOverflow { .. })) => {
                    let err = RuntimeError::from(err);
                    self.raise(&err);
                    return Err(err);
                }
                Err(err) => {
                    error!(
                        protocol = %protocol,
                        attribute = %message.attribute_event.attribute_ref,
                        error = %err,
                        "driver failed to handle actuator write"
                    );
                    "failed"
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_actuator(&protocol, label);
            }
        }
        Ok(count)
    }

    /// Apply queued sensor updates to the store. Only fatal errors are returned.
    pub fn pump_sensor(&self) -> Result<usize> {
        if self.router.sensor().overflowed() {
            let err = RuntimeError::ChannelOverflow {
                channel: ChannelKind::Sensor,
                capacity: self.config.sensor_capacity,
            };
            self.raise(&err);
            return Err(err);
        }
        let messages: Vec<SensorMessage> = {
            let mut receiver = self.sensor_receiver.lock();
            match receiver.as_mut() {
                Some(receiver) => std::iter::from_fn(|| receiver.try_recv()).collect(),
                None => Vec::new(),
            }
        };
        let count = messages.len();
        for message in messages {
            if let Err(err) = self.apply_sensor_update(&message) {
                if err.is_fatal() {
                    self.raise(&err);
                    return Err(err);
                }
                error!(
                    protocol = %message.source_protocol_urn,
                    attribute = %message.attribute_event.attribute_ref,
                    error = %err,
                    "failed to apply sensor update"
                );
            }
        }
        Ok(count)
    }

    fn apply_sensor_update(&self, message: &SensorMessage) -> Result<()> {
        let event = &message.attribute_event;
        if self.processor.process(event)? == ProcessOutcome::Consumed {
            return Ok(());
        }
        if !self.store.apply_attribute_event(event)? {
            return Ok(());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_sensor(&message.source_protocol_urn);
        }
        let realm = self
            .store
            .find(&event.attribute_ref.asset_id)
            .map(|asset| asset.realm)
            .unwrap_or_default();
        self.router.client_events().publish(ClientEvent::Attribute {
            realm,
            event: event.clone(),
        });
        Ok(())
    }

    pub fn subscribe_client_events(
        &self,
        info: SubscriberInfo,
    ) -> std::result::Result<ClientSubscription, RouterError> {
        self.router.client_events().subscribe(info)
    }

    pub fn subscribe_child_assets(
        &self,
        agent_id: &str,
        callback: ChildAssetCallback,
    ) -> Option<SubscriptionId> {
        self.broker.subscribe(agent_id, callback)
    }

    pub fn unsubscribe_child_assets(&self, agent_id: &str, id: SubscriptionId) -> bool {
        self.broker.unsubscribe(agent_id, id)
    }

    /// Ask the driver of `configuration` for further configurations.
    pub fn discover_instances(&self, configuration: &AttributeRef) -> Result<Vec<Attribute>> {
        let session = self
            .session(configuration)
            .ok_or_else(|| RuntimeError::UnknownConfiguration(configuration.clone()))?;
        session.discover_instances().map_err(RuntimeError::Protocol)
    }

    /// Ask the driver of `configuration` to build assets from an uploaded file.
    pub fn discover_linked_attributes(
        &self,
        configuration: &AttributeRef,
        file: &FileInfo,
    ) -> Result<Vec<Asset>> {
        let session = self
            .session(configuration)
            .ok_or_else(|| RuntimeError::UnknownConfiguration(configuration.clone()))?;
        session
            .discover_linked_attributes(file)
            .map_err(RuntimeError::Protocol)
    }

    pub fn status(&self, configuration: &AttributeRef) -> Option<ConnectionStatus> {
        self.coordinator
            .with_lock_returning("getProtocolConnectionStatus", || self.registry.status(configuration))
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.coordinator
            .with_lock_returning("snapshot", || self.registry.snapshot())
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    fn session(&self, configuration: &AttributeRef) -> Option<Arc<ProtocolSession>> {
        self.registry
            .configuration(configuration)
            .and_then(|entry| entry.session)
    }

    fn raise(&self, err: &RuntimeError) {
        if let RuntimeError::ChannelOverflow { channel, capacity } = err {
            *self.fatal.lock() = Some((*channel, *capacity));
            self.fatal_raised.notify_one();
        }
    }

    /// Disconnect every configuration and give driver tasks the quiescence window.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = self.lifecycle.shutdown();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let pending = aborts.len();
        if tokio::time::timeout(
            self.config.shutdown_quiescence,
            futures::future::join_all(tasks),
        )
        .await
        .is_err()
        {
            warn!(
                tasks = pending,
                quiescence_ms = self.config.shutdown_quiescence.as_millis() as u64,
                "driver tasks still running after quiescence window; aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!("agent runtime shut down");
    }

    /// Run the runtime loop on the current tokio runtime.
    pub fn spawn(self: Arc<Self>) -> RuntimeHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(4);
        let (persistence_tx, mut persistence_rx) = mpsc::unbounded_channel();
        let runtime = self.clone();
        let task = tokio::spawn(async move {
            let result = runtime.run(&mut shutdown_rx, &mut persistence_rx).await;
            if let Err(err) = &result {
                error!(error = %err, "agent runtime stopped on fatal error");
                if let (Some(metrics), RuntimeError::ChannelOverflow { channel, .. }) =
                    (&runtime.metrics, err)
                {
                    metrics.record_overflow(&channel.to_string());
                }
            }
            runtime.shutdown().await;
            result
        });
        RuntimeHandle {
            runtime: self,
            shutdown: shutdown_tx,
            persistence: persistence_tx,
            task,
        }
    }

    async fn run(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        persistence: &mut mpsc::UnboundedReceiver<PersistenceEvent>,
    ) -> Result<()> {
        let actuator = self.router.actuator().published();
        let sensor = self.router.sensor().queued();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("runtime shutdown signal received");
                    break;
                }
                _ = self.fatal_raised.notified() => {
                    if let Some((channel, capacity)) = self.fatal.lock().take() {
                        return Err(RuntimeError::ChannelOverflow { channel, capacity });
                    }
                }
                Some(event) = persistence.recv() => {
                    self.on_persistence_event(&event);
                }
                _ = actuator.notified() => {
                    self.pump_actuator()?;
                }
                _ = sensor.notified() => {
                    self.pump_sensor()?;
                }
            }
            self.lifecycle.reap_retired();
        }
        Ok(())
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("protocols", &self.protocols)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned runtime loop.
#[derive(Debug)]
pub struct RuntimeHandle {
    runtime: Arc<AgentRuntime>,
    shutdown: broadcast::Sender<()>,
    persistence: mpsc::UnboundedSender<PersistenceEvent>,
    task: JoinHandle<Result<()>>,
}

impl RuntimeHandle {
    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    /// Sender feeding persistence events to the loop in arrival order.
    pub fn persistence_sender(&self) -> mpsc::UnboundedSender<PersistenceEvent> {
        self.persistence.clone()
    }

    /// Queue one persistence event; `false` once the loop has stopped.
    pub fn submit(&self, event: PersistenceEvent) -> bool {
        self.persistence.send(event).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop, unlink everything and report how the loop ended.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "runtime task join error");
                Ok(())
            }
        }
    }
}
