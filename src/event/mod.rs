//! Event system for async message handling.
//!
//! Events are grouped into topics. Each topic is a bounded `broadcast`
//! channel, so every subscriber owns its own queue position and a slow
//! subscriber only loses its own oldest events. Producers never block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::protocol::PortNum;
use crate::reconnect::ConnectionState;
use crate::types::{ChatMessage, Node};

/// Default per-topic queue depth.
pub const DEFAULT_CAPACITY: usize = 256;

/// Event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Received text messages.
    Messages,
    /// Node directory updates and the bootstrap signal.
    Nodes,
    /// Connection state changes.
    Connection,
    /// First-sighting announcements.
    Discovery,
    /// Raw routing and traceroute packets.
    Routing,
}

impl Topic {
    /// All topics, in index order.
    pub const ALL: [Self; 5] = [
        Self::Messages,
        Self::Nodes,
        Self::Connection,
        Self::Discovery,
        Self::Routing,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Messages => 0,
            Self::Nodes => 1,
            Self::Connection => 2,
            Self::Discovery => 3,
            Self::Routing => 4,
        }
    }
}

/// What caused a node update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// An in-band node-info packet heard on the mesh.
    NodeInfoPacket,
    /// A node database record sent by the attached radio.
    DeviceNodeDb,
    /// A position packet.
    Position,
    /// A telemetry packet.
    Telemetry,
    /// A text message (sighting only).
    Message,
    /// Any other decoded packet (sighting only).
    Packet,
}

impl UpdateSource {
    /// Whether this update carried identity information.
    #[must_use]
    pub const fn is_node_info(self) -> bool {
        matches!(self, Self::NodeInfoPacket | Self::DeviceNodeDb)
    }

    /// Stable label for logs and discovery events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NodeInfoPacket => "node-info-packet",
            Self::DeviceNodeDb => "device-node-db",
            Self::Position => "position",
            Self::Telemetry => "telemetry",
            Self::Message => "message",
            Self::Packet => "packet",
        }
    }
}

/// Event types that can be dispatched.
#[derive(Debug, Clone)]
pub enum Event {
    /// A text message arrived.
    MessageReceived(Box<ChatMessage>),
    /// A node was created or updated in the directory.
    NodeUpdated {
        node: Box<Node>,
        source: UpdateSource,
    },
    /// The radio finished its startup dump.
    BootstrapComplete {
        config_id: u32,
        /// Node IDs present in the directory when the dump ended.
        known_nodes: Arc<[String]>,
    },
    /// The connection state machine moved.
    ConnectionStateChanged {
        state: ConnectionState,
        status: String,
        error: Option<String>,
    },
    /// A node was seen for the first time this session.
    NodeDiscovered {
        node_id: String,
        source: UpdateSource,
    },
    /// A routing or traceroute packet, forwarded undecoded.
    RoutingPacket {
        from: u32,
        to: u32,
        port: PortNum,
        request_id: u32,
        payload: Vec<u8>,
    },
}

impl Event {
    /// Returns the topic this event is published on.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::MessageReceived(_) => Topic::Messages,
            Self::NodeUpdated { .. } | Self::BootstrapComplete { .. } => Topic::Nodes,
            Self::ConnectionStateChanged { .. } => Topic::Connection,
            Self::NodeDiscovered { .. } => Topic::Discovery,
            Self::RoutingPacket { .. } => Topic::Routing,
        }
    }
}

/// A subscription to one or more topics.
pub struct Subscription {
    receivers: Vec<broadcast::Receiver<Event>>,
    lagged: u64,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once every topic channel is closed.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if self.receivers.is_empty() {
                return None;
            }

            let (result, index) = {
                let pending = self.receivers.iter_mut().map(|rx| Box::pin(rx.recv()));
                let (result, index, _rest) = futures::future::select_all(pending).await;
                (result, index)
            };

            match result {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged, dropped {} oldest events", skipped);
                    self.lagged += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receivers.swap_remove(index);
                }
            }
        }
    }

    /// Returns the next event without waiting, if one is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        let mut index = 0;
        while index < self.receivers.len() {
            match self.receivers[index].try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged, dropped {} oldest events", skipped);
                    self.lagged += skipped;
                }
                Err(broadcast::error::TryRecvError::Empty) => index += 1,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.receivers.swap_remove(index);
                }
            }
        }
        None
    }

    /// Number of events dropped by lag since the last call, resetting it.
    pub fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }
}

struct EventBusInner {
    senders: [broadcast::Sender<Event>; 5],
}

/// Topic-based publish/subscribe bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// Creates a bus whose topic queues hold `capacity` events each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let senders = std::array::from_fn(|_| broadcast::channel(capacity.max(1)).0);
        Self {
            inner: Arc::new(EventBusInner { senders }),
        }
    }

    /// Publishes an event to its topic's subscribers.
    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.inner.senders[event.topic().index()].send(event);
    }

    /// Subscribes to a single topic.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.subscribe_many(&[topic])
    }

    /// Subscribes to several topics at once.
    ///
    /// Ordering is preserved within a topic, not across topics.
    #[must_use]
    pub fn subscribe_many(&self, topics: &[Topic]) -> Subscription {
        let receivers = topics
            .iter()
            .map(|t| self.inner.senders[t.index()].subscribe())
            .collect();
        Subscription {
            receivers,
            lagged: 0,
        }
    }

    /// Subscribes to every topic.
    #[must_use]
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe_many(&Topic::ALL)
    }

    /// Waits for an event on `topic` matching `predicate`.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for<F>(&self, topic: Topic, predicate: F, timeout: Duration) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let mut subscription = self.subscribe(topic);

        tokio::select! {
            biased;
            result = async {
                loop {
                    match subscription.recv().await {
                        Some(event) if predicate(&event) => return Some(event),
                        Some(_) => {}
                        None => return None,
                    }
                }
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(id: &str) -> Event {
        Event::NodeDiscovered {
            node_id: id.into(),
            source: UpdateSource::NodeInfoPacket,
        }
    }

    #[tokio::test]
    async fn test_event_dispatch() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(Topic::Discovery);

        bus.publish(discovered("!00000001"));

        let event = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(Event::NodeDiscovered { .. })));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(Topic::Messages);

        bus.publish(discovered("!00000001"));

        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Topic::Discovery);

        for id in ["!00000001", "!00000002", "!00000003"] {
            bus.publish(discovered(id));
        }

        let Some(Event::NodeDiscovered { node_id, .. }) = sub.recv().await else {
            panic!("expected discovery");
        };
        assert_eq!(node_id, "!00000002");
    }

    #[tokio::test]
    async fn test_lag_is_counted_until_taken() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(Topic::Discovery);
        assert_eq!(sub.take_lagged(), 0);

        for id in ["!00000001", "!00000002", "!00000003", "!00000004"] {
            bus.publish(discovered(id));
        }

        assert!(sub.recv().await.is_some());
        assert_eq!(sub.take_lagged(), 2);
        assert_eq!(sub.take_lagged(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_many_merges_topics() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_many(&[Topic::Discovery, Topic::Connection]);

        bus.publish(Event::ConnectionStateChanged {
            state: ConnectionState::Connecting,
            status: "connecting".into(),
            error: None,
        });
        bus.publish(discovered("!00000001"));

        let mut topics = vec![
            sub.recv().await.unwrap().topic(),
            sub.recv().await.unwrap().topic(),
        ];
        topics.sort_by_key(|t| t.index());
        assert_eq!(topics, vec![Topic::Connection, Topic::Discovery]);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let bus = EventBus::new(4);
        let result = bus
            .wait_for(Topic::Nodes, |_| true, Duration::from_millis(20))
            .await;
        assert!(result.is_none());
    }

    #[test]
    fn test_update_source_labels() {
        assert!(UpdateSource::NodeInfoPacket.is_node_info());
        assert!(UpdateSource::DeviceNodeDb.is_node_info());
        assert!(!UpdateSource::Position.is_node_info());
        assert_eq!(UpdateSource::NodeInfoPacket.as_str(), "node-info-packet");
    }
}
