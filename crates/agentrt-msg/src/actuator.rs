//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Platform to driver actuator channel."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::types::{ActuatorMessage, ChannelKind};
use crate::{Result, RouterError};

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<ActuatorMessage>,
}

/// Fan-out channel; every receiver sees every message and keeps only its own.
pub struct ActuatorChannel {
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    published: Arc<Notify>,
}

impl ActuatorChannel {
    /// Create a channel whose receivers each buffer up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: Arc::new(Notify::new()),
        }
    }

    /// Register a receiver that keeps messages addressed to `protocol_urn`.
    pub fn subscribe(&self, protocol_urn: impl Into<String>) -> ActuatorReceiver {
        self.register(Some(protocol_urn.into()))
    }

    /// Register an unfiltered receiver that observes all traffic.
    pub fn tap(&self) -> ActuatorReceiver {
        self.register(None)
    }

    fn register(&self, selector: Option<String>) -> ActuatorReceiver {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, sender });
        ActuatorReceiver {
            id,
            selector,
            receiver,
        }
    }

    /// Deliver `message` to every live receiver.
    ///
    /// A full receiver queue is a programming error and yields
    /// [`RouterError::ChannelOverflow`] after the remaining receivers were served.
    pub fn publish(&self, message: ActuatorMessage) -> Result<()> {
        let mut overflow = false;
        {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|subscriber| !subscriber.sender.is_closed());
            for subscriber in subscribers.iter() {
                match subscriber.sender.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflow = true;
                        error!(
                            receiver = subscriber.id,
                            capacity = self.capacity,
                            protocol = %message.target_protocol_urn,
                            attribute = %message.attribute_event.attribute_ref,
                            "actuator channel overflow"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        self.published.notify_one();
        trace!(
            protocol = %message.target_protocol_urn,
            attribute = %message.attribute_event.attribute_ref,
            "actuator message published"
        );
        if overflow {
            return Err(RouterError::ChannelOverflow {
                channel: ChannelKind::Actuator,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Signal fired after each publish; consumers drain their receivers when woken.
    pub fn published(&self) -> Arc<Notify> {
        self.published.clone()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.sender.is_closed());
        subscribers.len()
    }
}

impl std::fmt::Debug for ActuatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuatorChannel")
            .field("capacity", &self.capacity)
            .field("receivers", &self.subscribers.lock().len())
            .finish()
    }
}

/// Receiving end of the actuator channel.
#[derive(Debug)]
pub struct ActuatorReceiver {
    id: u64,
    selector: Option<String>,
    receiver: mpsc::Receiver<ActuatorMessage>,
}

impl ActuatorReceiver {
    /// Protocol URN this receiver accepts, `None` for taps.
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    fn accepts(&self, message: &ActuatorMessage) -> bool {
        match &self.selector {
            Some(selector) => *selector == message.target_protocol_urn,
            None => true,
        }
    }

    /// Next queued message for this receiver without waiting.
    pub fn try_recv(&mut self) -> Option<ActuatorMessage> {
        while let Ok(message) = self.receiver.try_recv() {
            if self.accepts(&message) {
                return Some(message);
            }
            self.drop_foreign(&message);
        }
        None
    }

    /// Wait for the next message for this receiver; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ActuatorMessage> {
        while let Some(message) = self.receiver.recv().await {
            if self.accepts(&message) {
                return Some(message);
            }
            self.drop_foreign(&message);
        }
        None
    }

    fn drop_foreign(&self, message: &ActuatorMessage) {
        trace!(
            receiver = self.id,
            selector = ?self.selector,
            target = %message.target_protocol_urn,
            "dropping actuator message for another protocol"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::{AttributeEvent, AttributeRef, EventSource, Value};

    fn message(urn: &str, value: f64) -> ActuatorMessage {
        ActuatorMessage {
            target_protocol_urn: urn.to_owned(),
            protocol_configuration: AttributeRef::new("A1", "cfg1"),
            attribute_event: AttributeEvent::new(
                AttributeRef::new("S1", "temp"),
                value,
                0,
                EventSource::Client,
            ),
        }
    }

    #[test]
    fn receivers_drop_foreign_targets() {
        let channel = ActuatorChannel::new(8);
        let mut simulator = channel.subscribe("urn:openremote:protocol:simulator");
        let mut http = channel.subscribe("urn:openremote:protocol:http");
        let mut tap = channel.tap();

        channel.publish(message("urn:openremote:protocol:simulator", 1.0)).unwrap();
        channel.publish(message("urn:openremote:protocol:simulator", 2.0)).unwrap();

        assert_eq!(simulator.try_recv().unwrap().attribute_event.value, Value::Number(1.0));
        assert_eq!(simulator.try_recv().unwrap().attribute_event.value, Value::Number(2.0));
        assert!(simulator.try_recv().is_none());
        assert!(http.try_recv().is_none());
        assert!(tap.try_recv().is_some());
        assert!(tap.try_recv().is_some());
    }

    #[test]
    fn overflow_is_reported() {
        let channel = ActuatorChannel::new(1);
        let _receiver = channel.subscribe("urn:openremote:protocol:simulator");
        channel.publish(message("urn:openremote:protocol:simulator", 1.0)).unwrap();
        let err = channel
            .publish(message("urn:openremote:protocol:simulator", 2.0))
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::ChannelOverflow {
                channel: ChannelKind::Actuator,
                capacity: 1
            }
        ));
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let channel = ActuatorChannel::new(4);
        let receiver = channel.subscribe("urn:openremote:protocol:simulator");
        assert_eq!(channel.receiver_count(), 1);
        drop(receiver);
        assert_eq!(channel.receiver_count(), 0);
        channel.publish(message("urn:openremote:protocol:simulator", 1.0)).unwrap();
    }

    #[tokio::test]
    async fn async_receive_skips_foreign_messages() {
        let channel = ActuatorChannel::new(4);
        let mut receiver = channel.subscribe("urn:openremote:protocol:http");
        channel.publish(message("urn:openremote:protocol:simulator", 1.0)).unwrap();
        channel.publish(message("urn:openremote:protocol:http", 5.0)).unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.attribute_event.value, Value::Number(5.0));
    }
}
