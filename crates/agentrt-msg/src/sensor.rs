//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Driver to platform sensor channel."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{error, trace};

use crate::types::{ChannelKind, SensorMessage};
use crate::{Result, RouterError};

/// Bounded many-producer, single-consumer queue of sensor updates.
#[derive(Debug)]
pub struct SensorChannel {
    sender: SensorSender,
    receiver: Mutex<Option<mpsc::Receiver<SensorMessage>>>,
}

impl SensorChannel {
    /// Create a channel buffering up to `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender: SensorSender {
                sender,
                capacity,
                queued: Arc::new(Notify::new()),
                overflowed: Arc::new(AtomicBool::new(false)),
            },
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Producer handle handed to driver bases.
    pub fn sender(&self) -> SensorSender {
        self.sender.clone()
    }

    /// Take the single consumer end. Later calls return `None`.
    pub fn take_receiver(&self) -> Option<SensorReceiver> {
        self.receiver
            .lock()
            .take()
            .map(|receiver| SensorReceiver { receiver })
    }

    /// Signal fired after each queued update.
    pub fn queued(&self) -> Arc<Notify> {
        self.sender.queued.clone()
    }

    /// Whether any producer ever hit a full queue.
    pub fn overflowed(&self) -> bool {
        self.sender.overflowed.load(Ordering::Acquire)
    }
}

/// Cloneable producer end of the sensor channel.
#[derive(Debug, Clone)]
pub struct SensorSender {
    sender: mpsc::Sender<SensorMessage>,
    capacity: usize,
    queued: Arc<Notify>,
    overflowed: Arc<AtomicBool>,
}

impl SensorSender {
    /// Queue `message` without waiting; a full queue is fatal for the runtime.
    pub fn send(&self, message: SensorMessage) -> Result<()> {
        match self.sender.try_send(message) {
            Ok(()) => {
                self.queued.notify_one();
                Ok(())
            }
            Err(TrySendError::Full(message)) => {
                self.overflowed.store(true, Ordering::Release);
                self.queued.notify_one();
                error!(
                    capacity = self.capacity,
                    protocol = %message.source_protocol_urn,
                    attribute = %message.attribute_event.attribute_ref,
                    "sensor channel overflow"
                );
                Err(RouterError::ChannelOverflow {
                    channel: ChannelKind::Sensor,
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(message)) => {
                trace!(
                    attribute = %message.attribute_event.attribute_ref,
                    "sensor channel closed; update discarded"
                );
                Err(RouterError::Closed(ChannelKind::Sensor))
            }
        }
    }
}

/// Consumer end of the sensor channel.
#[derive(Debug)]
pub struct SensorReceiver {
    receiver: mpsc::Receiver<SensorMessage>,
}

impl SensorReceiver {
    /// Next queued update without waiting.
    pub fn try_recv(&mut self) -> Option<SensorMessage> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the next update.
    pub async fn recv(&mut self) -> Option<SensorMessage> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_model::{AttributeEvent, AttributeRef, EventSource, Value};

    fn update(name: &str, value: f64) -> SensorMessage {
        SensorMessage {
            source_protocol_urn: "urn:openremote:protocol:simulator".into(),
            attribute_event: AttributeEvent::new(
                AttributeRef::new("S1", name),
                value,
                0,
                EventSource::Sensor,
            ),
        }
    }

    #[test]
    fn preserves_fifo_order() {
        let channel = SensorChannel::new(4);
        let sender = channel.sender();
        let mut receiver = channel.take_receiver().unwrap();
        assert!(channel.take_receiver().is_none());

        for value in [1.0, 2.0, 3.0] {
            sender.send(update("temp", value)).unwrap();
        }
        let values: Vec<_> = std::iter::from_fn(|| receiver.try_recv())
            .map(|m| m.attribute_event.value)
            .collect();
        assert_eq!(
            values,
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
        );
    }

    #[test]
    fn overflow_is_fatal_error() {
        let channel = SensorChannel::new(1);
        let sender = channel.sender();
        sender.send(update("temp", 1.0)).unwrap();
        assert!(matches!(
            sender.send(update("temp", 2.0)),
            Err(RouterError::ChannelOverflow {
                channel: ChannelKind::Sensor,
                ..
            })
        ));
        assert!(channel.overflowed());
    }
}
