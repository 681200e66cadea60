//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "test"
//! ems_description: "Channel separation tests for the message router."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use agentrt_model::{AttributeEvent, AttributeRef, ConnectionStatus, EventSource};
use agentrt_msg::{
    ActuatorMessage, AgentStatusEvent, ClientEvent, MessageRouter, RouterConfig, SensorMessage,
    SubscriberInfo,
};

const SIMULATOR: &str = "urn:openremote:protocol:simulator";

fn event(value: f64, source: EventSource) -> AttributeEvent {
    AttributeEvent::new(AttributeRef::new("S1", "temp"), value, 10, source)
}

#[test]
fn channels_do_not_leak_into_each_other() {
    let router = MessageRouter::new(RouterConfig {
        actuator_capacity: 4,
        sensor_capacity: 4,
        client_event_capacity: 4,
    });
    let mut actuator = router.actuator().subscribe(SIMULATOR);
    let mut sensor = router.sensor().take_receiver().expect("sensor receiver");
    let console = router
        .client_events()
        .subscribe(SubscriberInfo::default())
        .expect("subscription");

    router
        .sensor()
        .sender()
        .send(SensorMessage {
            source_protocol_urn: SIMULATOR.into(),
            attribute_event: event(22.0, EventSource::Sensor),
        })
        .expect("sensor send");

    assert!(actuator.try_recv().is_none());
    assert!(console.try_next().is_none());
    let received = sensor.try_recv().expect("sensor message");
    assert_eq!(received.source_protocol_urn, SIMULATOR);

    router
        .actuator()
        .publish(ActuatorMessage {
            target_protocol_urn: SIMULATOR.into(),
            protocol_configuration: AttributeRef::new("A1", "cfg1"),
            attribute_event: event(21.5, EventSource::Client),
        })
        .expect("actuator publish");
    assert!(sensor.try_recv().is_none());
    assert!(actuator.try_recv().is_some());

    router
        .client_events()
        .publish(ClientEvent::AgentStatus(AgentStatusEvent {
            timestamp: 10,
            realm: "master".into(),
            protocol_configuration: AttributeRef::new("A1", "cfg1"),
            connection_status: ConnectionStatus::Connected,
        }));
    assert!(matches!(console.try_next(), Some(ClientEvent::AgentStatus(_))));
}

#[test]
fn client_events_serialise_with_type_tag() {
    let event = ClientEvent::AgentStatus(AgentStatusEvent {
        timestamp: 1,
        realm: "master".into(),
        protocol_configuration: AttributeRef::new("A1", "cfg1"),
        connection_status: ConnectionStatus::ErrorConfiguration,
    });
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["eventType"], "agent-status");
    assert_eq!(json["connectionStatus"], "ERROR_CONFIGURATION");
    assert_eq!(json["protocolConfiguration"]["assetId"], "A1");
}
