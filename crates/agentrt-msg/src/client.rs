//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Lossy client-event channel with per-configuration status coalescing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::ClientEvent;
use crate::{Result, RouterError};

/// Role a console needs to receive agent status events.
pub const READ_ASSETS_ROLE: &str = "read:assets";

/// Identity presented by a console when subscribing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberInfo {
    /// Roles granted to the console's user.
    pub roles: Vec<String>,
    /// Restrict delivery to one realm; `None` receives every realm.
    pub realm: Option<String>,
}

impl SubscriberInfo {
    /// Subscriber with the given roles and realm filter.
    pub fn new(roles: impl IntoIterator<Item = impl Into<String>>, realm: Option<String>) -> Self {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            realm,
        }
    }

    /// Whether `role` was granted.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|granted| granted == role)
    }
}

type Authorizer = Box<dyn Fn(&SubscriberInfo) -> bool + Send + Sync>;

/// Authorisation hook admitting subscribers holding `role`.
pub fn require_role(role: &'static str) -> impl Fn(&SubscriberInfo) -> bool + Send + Sync {
    move |info: &SubscriberInfo| info.has_role(role)
}

struct SubscriberQueue {
    id: u64,
    realm: Option<String>,
    events: Mutex<VecDeque<ClientEvent>>,
    ready: Notify,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn accepts(&self, event: &ClientEvent) -> bool {
        match &self.realm {
            Some(realm) => realm == event.realm(),
            None => true,
        }
    }
}

/// Runtime to console notifications.
///
/// Each subscriber owns a bounded queue. A status event replaces any queued status of
/// the same configuration; when the queue is full the oldest event is discarded.
pub struct ClientEventChannel {
    capacity: usize,
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    authorizers: Mutex<Vec<Authorizer>>,
    next_id: AtomicU64,
}

impl ClientEventChannel {
    /// Create a channel whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            authorizers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Install a hook every future subscriber must pass.
    pub fn add_authorizer<F>(&self, authorizer: F)
    where
        F: Fn(&SubscriberInfo) -> bool + Send + Sync + 'static,
    {
        self.authorizers.lock().push(Box::new(authorizer));
    }

    /// Register a console.
    pub fn subscribe(&self, info: SubscriberInfo) -> Result<ClientSubscription> {
        if !self.authorizers.lock().iter().all(|allow| allow(&info)) {
            warn!(roles = ?info.roles, realm = ?info.realm, "client event subscription refused");
            return Err(RouterError::Unauthorized(format!(
                "roles {:?} are not sufficient",
                info.roles
            )));
        }
        let queue = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            realm: info.realm,
            events: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        self.subscribers.lock().push(Arc::downgrade(&queue));
        debug!(subscriber = queue.id, "client event subscriber registered");
        Ok(ClientSubscription { queue })
    }

    /// Offer `event` to every subscriber whose realm filter matches. Never fails.
    pub fn publish(&self, event: ClientEvent) {
        let live: Vec<Arc<SubscriberQueue>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        for queue in live.iter().filter(|queue| queue.accepts(&event)) {
            {
                let mut events = queue.events.lock();
                if let ClientEvent::AgentStatus(status) = &event {
                    events.retain(|queued| {
                        !matches!(queued, ClientEvent::AgentStatus(old)
                            if old.protocol_configuration == status.protocol_configuration)
                    });
                }
                events.push_back(event.clone());
                while events.len() > self.capacity {
                    events.pop_front();
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber = queue.id, "client event queue full; oldest event dropped");
                }
            }
            queue.ready.notify_one();
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }
}

impl std::fmt::Debug for ClientEventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEventChannel")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

/// A console's queue. Dropping it unsubscribes.
pub struct ClientSubscription {
    queue: Arc<SubscriberQueue>,
}

impl ClientSubscription {
    /// Next queued event without waiting.
    pub fn try_next(&self) -> Option<ClientEvent> {
        self.queue.events.lock().pop_front()
    }

    /// Wait for the next event.
    pub async fn next(&self) -> ClientEvent {
        loop {
            if let Some(event) = self.try_next() {
                return event;
            }
            self.queue.ready.notified().await;
        }
    }

    /// Take everything currently queued.
    pub fn drain(&self) -> Vec<ClientEvent> {
        self.queue.events.lock().drain(..).collect()
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClientSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSubscription")
            .field("id", &self.queue.id)
            .field("realm", &self.queue.realm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentStatusEvent;
    use agentrt_model::{AttributeRef, ConnectionStatus};

    fn status(realm: &str, cfg: &str, status: ConnectionStatus) -> ClientEvent {
        ClientEvent::AgentStatus(AgentStatusEvent {
            timestamp: 0,
            realm: realm.into(),
            protocol_configuration: AttributeRef::new("A1", cfg),
            connection_status: status,
        })
    }

    #[test]
    fn newest_status_supersedes_queued_one() {
        let channel = ClientEventChannel::new(8);
        let subscription = channel.subscribe(SubscriberInfo::default()).unwrap();
        channel.publish(status("master", "cfg1", ConnectionStatus::Connecting));
        channel.publish(status("master", "cfg2", ConnectionStatus::Connected));
        channel.publish(status("master", "cfg1", ConnectionStatus::Connected));

        let events = subscription.drain();
        assert_eq!(
            events,
            vec![
                status("master", "cfg2", ConnectionStatus::Connected),
                status("master", "cfg1", ConnectionStatus::Connected),
            ]
        );
    }

    #[test]
    fn republishing_is_idempotent() {
        let channel = ClientEventChannel::new(8);
        let subscription = channel.subscribe(SubscriberInfo::default()).unwrap();
        let event = status("master", "cfg1", ConnectionStatus::Error);
        channel.publish(event.clone());
        channel.publish(event.clone());
        assert_eq!(subscription.drain(), vec![event]);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let channel = ClientEventChannel::new(2);
        let subscription = channel.subscribe(SubscriberInfo::default()).unwrap();
        for cfg in ["a", "b", "c"] {
            channel.publish(status("master", cfg, ConnectionStatus::Connected));
        }
        assert_eq!(subscription.dropped(), 1);
        let events = subscription.drain();
        assert_eq!(events[0], status("master", "b", ConnectionStatus::Connected));
    }

    #[test]
    fn realm_filter_and_authorisation() {
        let channel = ClientEventChannel::new(4);
        channel.add_authorizer(require_role(READ_ASSETS_ROLE));
        assert!(matches!(
            channel.subscribe(SubscriberInfo::new(["write:assets"], None)),
            Err(RouterError::Unauthorized(_))
        ));

        let tenant = channel
            .subscribe(SubscriberInfo::new(
                [READ_ASSETS_ROLE],
                Some("tenant".to_owned()),
            ))
            .unwrap();
        channel.publish(status("master", "cfg1", ConnectionStatus::Connected));
        channel.publish(status("tenant", "cfg1", ConnectionStatus::Connected));
        let events = tenant.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].realm(), "tenant");
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let channel = ClientEventChannel::new(4);
        let subscription = channel.subscribe(SubscriberInfo::default()).unwrap();
        assert_eq!(channel.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn next_waits_for_publish() {
        let channel = Arc::new(ClientEventChannel::new(4));
        let subscription = channel.subscribe(SubscriberInfo::default()).unwrap();
        let publisher = channel.clone();
        tokio::spawn(async move {
            publisher.publish(status("master", "cfg1", ConnectionStatus::Connected));
        });
        let event = subscription.next().await;
        assert_eq!(event, status("master", "cfg1", ConnectionStatus::Connected));
    }
}
