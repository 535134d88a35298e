//! Node discovery projection.
//!
//! Turns node updates into one-shot [`Event::NodeDiscovered`] announcements.
//! Nothing is announced until the radio finishes its startup dump; the nodes
//! known at that point are remembered and never announced, so only nodes
//! that genuinely appear later in the session are reported.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::directory::NodeDirectory;
use crate::event::{Event, EventBus, Subscription, Topic, UpdateSource};

/// Handshake progress on the current link, as reported by the client.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    /// No client has reported a link; bootstrap events are trusted as-is.
    #[default]
    Untracked,
    /// A link is up and its dump is still playing.
    Pending,
    Complete,
}

#[derive(Debug, Default)]
struct SessionState {
    bootstrapped: bool,
    handshake: Handshake,
    seen_before_bootstrap: HashSet<String>,
    announced: HashSet<String>,
}

/// Bootstrap-gated first-sighting tracker.
#[derive(Debug)]
pub struct DiscoveryProjection {
    directory: Arc<NodeDirectory>,
    state: Mutex<SessionState>,
}

impl DiscoveryProjection {
    /// Creates a projection over the given directory, not yet bootstrapped.
    #[must_use]
    pub fn new(directory: Arc<NodeDirectory>) -> Self {
        Self {
            directory,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Whether the startup dump has completed this session.
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.state.lock().bootstrapped
    }

    /// Marks the startup dump complete; `known` are never announced.
    ///
    /// Ignored while the current link's handshake is pending: the signal is
    /// left over from an earlier link.
    pub fn on_bootstrap_complete<I>(&self, known: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock();
        if state.handshake == Handshake::Pending {
            tracing::debug!("ignoring bootstrap signal from a previous link");
            return;
        }
        state.bootstrapped = true;
        state.seen_before_bootstrap.extend(known);
        tracing::debug!(
            "discovery armed with {} pre-bootstrap nodes",
            state.seen_before_bootstrap.len()
        );
    }

    /// Applies one node update and returns the discovery event, if any.
    #[must_use]
    pub fn on_node_update(&self, node_id: &str, source: UpdateSource) -> Option<Event> {
        if !source.is_node_info() {
            return None;
        }
        let mut state = self.state.lock();
        if !state.bootstrapped || state.seen_before_bootstrap.contains(node_id) {
            return None;
        }
        if !state.announced.insert(node_id.to_string()) {
            return None;
        }
        tracing::info!("discovered node {} via {}", node_id, source.as_str());
        Some(Event::NodeDiscovered {
            node_id: node_id.to_string(),
            source,
        })
    }

    /// Disarms announcements until the next bootstrap signal.
    ///
    /// Called on every new link: the radio replays its node database before
    /// completing the handshake, and those records must not be announced.
    /// Already-announced and pre-bootstrap nodes are kept.
    pub fn rearm(&self) {
        let mut state = self.state.lock();
        state.bootstrapped = false;
        state.handshake = Handshake::Pending;
    }

    /// Records that the radio finished its handshake on the current link.
    ///
    /// Set directly by the client, so a projection that lagged past the
    /// bootstrap event can still arm itself.
    pub fn note_handshake_complete(&self) {
        self.state.lock().handshake = Handshake::Complete;
    }

    /// Arms from the directory after the subscription dropped events.
    ///
    /// Nodes whose updates were lost are treated as pre-bootstrap.
    fn resync_after_lag(&self, skipped: u64) {
        let known = self.directory.ids();
        let mut state = self.state.lock();
        if state.bootstrapped || state.handshake != Handshake::Complete {
            return;
        }
        tracing::warn!(
            "discovery missed {} node events, arming from {} directory nodes",
            skipped,
            known.len()
        );
        state.bootstrapped = true;
        state.seen_before_bootstrap.extend(known);
    }

    /// Forgets the session after a store wipe or transport change.
    ///
    /// The pre-bootstrap set is re-derived from the directory as it is now;
    /// announcements resume after the next bootstrap signal.
    pub fn reset_from_store(&self) {
        let snapshot = self.directory.ids();
        let mut state = self.state.lock();
        state.bootstrapped = false;
        state.announced.clear();
        state.seen_before_bootstrap = snapshot.into_iter().collect();
    }

    /// Dispatches one bus event, returning a discovery event to publish.
    #[must_use]
    pub fn handle(&self, event: &Event) -> Option<Event> {
        match event {
            Event::BootstrapComplete { known_nodes, .. } => {
                self.on_bootstrap_complete(known_nodes.iter().cloned());
                None
            }
            Event::NodeUpdated { node, source } => self.on_node_update(&node.id, *source),
            _ => None,
        }
    }

    /// Subscribes to the node topic now and processes it on a new task.
    ///
    /// Events published after this returns are never missed.
    pub fn spawn(self: Arc<Self>, bus: EventBus, cancel: CancelToken) -> JoinHandle<()> {
        let subscription = bus.subscribe(Topic::Nodes);
        tokio::spawn(async move { self.consume(subscription, bus, cancel).await })
    }

    /// Consumes the node topic until `cancel` fires, publishing discoveries.
    pub async fn run(self: Arc<Self>, bus: EventBus, cancel: CancelToken) {
        let subscription = bus.subscribe(Topic::Nodes);
        self.consume(subscription, bus, cancel).await;
    }

    async fn consume(&self, mut subscription: Subscription, bus: EventBus, cancel: CancelToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = subscription.recv() => event,
            };
            let Some(event) = event else { break };
            let skipped = subscription.take_lagged();
            if skipped > 0 {
                self.resync_after_lag(skipped);
            }
            if let Some(discovered) = self.handle(&event) {
                bus.publish(discovered);
            }
        }
        tracing::debug!("discovery projection stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    fn projection() -> (Arc<NodeDirectory>, DiscoveryProjection) {
        let directory = Arc::new(NodeDirectory::new());
        let projection = DiscoveryProjection::new(Arc::clone(&directory));
        (directory, projection)
    }

    fn bootstrap(projection: &DiscoveryProjection, directory: &NodeDirectory) {
        projection.on_bootstrap_complete(directory.ids());
    }

    #[test]
    fn test_nothing_announced_before_bootstrap() {
        let (_, projection) = projection();
        assert!(
            projection
                .on_node_update("!00000001", UpdateSource::NodeInfoPacket)
                .is_none()
        );
    }

    #[test]
    fn test_pre_bootstrap_node_never_discovers() {
        let (directory, projection) = projection();
        directory.update(1, SystemTime::now(), |_| {});
        bootstrap(&projection, &directory);

        assert!(
            projection
                .on_node_update("!00000001", UpdateSource::NodeInfoPacket)
                .is_none()
        );
        assert!(
            projection
                .on_node_update("!00000001", UpdateSource::DeviceNodeDb)
                .is_none()
        );
    }

    #[test]
    fn test_new_node_discovers_exactly_once() {
        let (directory, projection) = projection();
        bootstrap(&projection, &directory);

        let first = projection.on_node_update("!00000002", UpdateSource::NodeInfoPacket);
        assert!(matches!(
            first,
            Some(Event::NodeDiscovered { ref node_id, source: UpdateSource::NodeInfoPacket })
                if node_id == "!00000002"
        ));
        assert!(
            projection
                .on_node_update("!00000002", UpdateSource::NodeInfoPacket)
                .is_none()
        );
    }

    #[test]
    fn test_non_node_info_sources_never_discover() {
        let (directory, projection) = projection();
        bootstrap(&projection, &directory);

        for source in [
            UpdateSource::Position,
            UpdateSource::Telemetry,
            UpdateSource::Message,
            UpdateSource::Packet,
        ] {
            assert!(projection.on_node_update("!00000003", source).is_none());
        }
        // still eligible for a later node-info sighting
        assert!(
            projection
                .on_node_update("!00000003", UpdateSource::NodeInfoPacket)
                .is_some()
        );
    }

    #[test]
    fn test_reset_then_rebootstrap_rediscovers() {
        let (directory, projection) = projection();
        bootstrap(&projection, &directory);
        assert!(
            projection
                .on_node_update("!00000004", UpdateSource::NodeInfoPacket)
                .is_some()
        );

        directory.clear();
        projection.reset_from_store();
        assert!(!projection.is_bootstrapped());
        assert!(
            projection
                .on_node_update("!00000004", UpdateSource::NodeInfoPacket)
                .is_none()
        );

        bootstrap(&projection, &directory);
        assert!(
            projection
                .on_node_update("!00000004", UpdateSource::NodeInfoPacket)
                .is_some()
        );
    }

    #[test]
    fn test_reset_snapshots_current_directory() {
        let (directory, projection) = projection();
        directory.update(5, SystemTime::now(), |_| {});
        projection.reset_from_store();

        // bootstrap with an empty dump: node 5 was already known at reset time
        projection.on_bootstrap_complete(Vec::new());
        assert!(
            projection
                .on_node_update("!00000005", UpdateSource::NodeInfoPacket)
                .is_none()
        );
    }

    #[test]
    fn test_rearm_waits_for_next_bootstrap() {
        let (directory, projection) = projection();
        bootstrap(&projection, &directory);
        assert!(
            projection
                .on_node_update("!00000006", UpdateSource::NodeInfoPacket)
                .is_some()
        );

        projection.rearm();
        assert!(!projection.is_bootstrapped());
        // replayed during the next dump
        assert!(
            projection
                .on_node_update("!00000007", UpdateSource::DeviceNodeDb)
                .is_none()
        );
        // a stale signal from the previous link does not arm
        bootstrap(&projection, &directory);
        assert!(!projection.is_bootstrapped());

        projection.note_handshake_complete();
        projection.on_bootstrap_complete(vec!["!00000007".to_string()]);
        assert!(projection.is_bootstrapped());
        assert!(
            projection
                .on_node_update("!00000007", UpdateSource::DeviceNodeDb)
                .is_none()
        );
        // announcements survive a rearm
        assert!(
            projection
                .on_node_update("!00000006", UpdateSource::NodeInfoPacket)
                .is_none()
        );
        assert!(
            projection
                .on_node_update("!00000008", UpdateSource::NodeInfoPacket)
                .is_some()
        );
    }

    #[test]
    fn test_lag_resync_needs_handshake() {
        let (directory, projection) = projection();
        directory.update(9, SystemTime::now(), |_| {});

        projection.resync_after_lag(3);
        assert!(!projection.is_bootstrapped());

        projection.note_handshake_complete();
        projection.resync_after_lag(3);
        assert!(projection.is_bootstrapped());
        assert!(
            projection
                .on_node_update("!00000009", UpdateSource::NodeInfoPacket)
                .is_none()
        );

        projection.rearm();
        projection.resync_after_lag(1);
        assert!(!projection.is_bootstrapped());
    }

    #[tokio::test]
    async fn test_lagged_bootstrap_still_arms() {
        let (directory, projection) = projection();
        let projection = Arc::new(projection);
        let bus = EventBus::new(2);
        let cancel = CancelToken::new();
        let mut discoveries = bus.subscribe(Topic::Discovery);

        for num in [1u32, 2] {
            directory.update(num, SystemTime::now(), |_| {});
        }
        projection.note_handshake_complete();
        let task = Arc::clone(&projection).spawn(bus.clone(), cancel.clone());

        // the bootstrap event falls out of the two-slot queue
        bus.publish(Event::BootstrapComplete {
            config_id: 1,
            known_nodes: Arc::from(vec!["!00000001".to_string(), "!00000002".to_string()]),
        });
        for num in [1u32, 2] {
            bus.publish(Event::NodeUpdated {
                node: Box::new(crate::types::Node::new(num, SystemTime::now())),
                source: UpdateSource::DeviceNodeDb,
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(projection.is_bootstrapped());

        bus.publish(Event::NodeUpdated {
            node: Box::new(crate::types::Node::new(3, SystemTime::now())),
            source: UpdateSource::NodeInfoPacket,
        });
        let event = tokio::time::timeout(Duration::from_secs(1), discoveries.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(Event::NodeDiscovered { ref node_id, .. }) if node_id == "!00000003"
        ));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_publishes_from_bus() {
        let (_, projection) = projection();
        let projection = Arc::new(projection);
        let bus = EventBus::new(16);
        let cancel = CancelToken::new();
        let mut discoveries = bus.subscribe(Topic::Discovery);

        let task = tokio::spawn(Arc::clone(&projection).run(bus.clone(), cancel.clone()));
        tokio::task::yield_now().await;
        // let the task subscribe before publishing
        tokio::time::sleep(Duration::from_millis(10)).await;

        bus.publish(Event::BootstrapComplete {
            config_id: 1,
            known_nodes: Arc::from(vec!["!00000001".to_string()]),
        });
        for num in [1u32, 2] {
            let mut node = crate::types::Node::new(num, SystemTime::now());
            node.short_name = format!("N{num}");
            bus.publish(Event::NodeUpdated {
                node: Box::new(node),
                source: UpdateSource::NodeInfoPacket,
            });
        }

        let event = tokio::time::timeout(Duration::from_secs(1), discoveries.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(Event::NodeDiscovered { ref node_id, .. }) if node_id == "!00000002"
        ));

        cancel.cancel();
        task.await.unwrap();
    }
}
