//! Main [`RadioClient`] implementation.
//!
//! The client plugs into a [`ReconnectManager`] as its connection observer.
//! Every time a transport comes up it requests the radio's configuration dump
//! and runs a read loop that decodes each `FromRadio` envelope, folds it into
//! the node directory and message store, and publishes the result on the
//! [`EventBus`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::directory::{DEFAULT_STALE_AFTER, NodeDirectory};
use crate::discovery::DiscoveryProjection;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Event, EventBus, Subscription, Topic, UpdateSource};
use crate::protocol::command::{self, PacketAddress, PacketIdGenerator, WANT_CONFIG_ID};
use crate::protocol::parser;
use crate::protocol::proto::{
    self, Data, MeshPacket, PortNum, ToRadio, User, from_radio, mesh_packet,
};
use crate::reconnect::{ConnectionObserver, ReconnectManager};
use crate::store::{MessageStore, NotificationSink};
use crate::transport::{BoxFuture, Transport};
use crate::types::device::default_channel_name;
use crate::types::{ChannelInfo, ChatMessage, Encryption, Node, chat_id, node_id};

/// Default timeout for a single read attempt.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for writing one frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Gets the current Unix timestamp as a u32.
fn current_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Configuration for [`RadioClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for each read attempt; expiry just retries.
    pub read_timeout: Duration,
    /// Timeout for each outbound frame.
    pub write_timeout: Duration,
    /// ID sent with the configuration request and expected back.
    pub config_id: u32,
    /// Age after which nodes are evicted from the directory.
    pub stale_after: Duration,
}

impl ClientConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            config_id: WANT_CONFIG_ID,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Sets the per-read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the per-write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the configuration request ID.
    #[must_use]
    pub const fn config_id(mut self, id: u32) -> Self {
        self.config_id = id;
        self
    }

    /// Sets the node staleness threshold.
    #[must_use]
    pub const fn stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct RadioState {
    own_num: Option<u32>,
    own_user: Option<User>,
    channels: HashMap<u32, ChannelInfo>,
    configured: bool,
    last_target: Option<String>,
}

/// The live connection: transport, its session token, and the read task.
struct Link {
    transport: Arc<dyn Transport>,
    session: CancelToken,
    reader: JoinHandle<()>,
}

struct ClientInner {
    config: ClientConfig,
    bus: EventBus,
    directory: Arc<NodeDirectory>,
    discovery: Arc<DiscoveryProjection>,
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn NotificationSink>,
    packet_ids: PacketIdGenerator,
    state: Mutex<RadioState>,
    link: Mutex<Option<Link>>,
}

/// Client for a mesh radio.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RadioClient {
    inner: Arc<ClientInner>,
}

impl RadioClient {
    /// Creates a client that is not yet attached to any transport.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        bus: EventBus,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let directory = Arc::new(NodeDirectory::with_stale_after(config.stale_after));
        let discovery = Arc::new(DiscoveryProjection::new(Arc::clone(&directory)));
        Self {
            inner: Arc::new(ClientInner {
                config,
                bus,
                directory,
                discovery,
                store,
                notifier,
                packet_ids: PacketIdGenerator::new(),
                state: Mutex::new(RadioState::default()),
                link: Mutex::new(None),
            }),
        }
    }

    /// Registers this client as the manager's connection observer.
    pub fn attach_to(&self, manager: &ReconnectManager) {
        manager.set_observer(Arc::new(self.clone()));
    }

    /// Starts the discovery projection on this client's bus.
    pub fn spawn_discovery(&self, cancel: CancelToken) -> JoinHandle<()> {
        Arc::clone(&self.inner.discovery).spawn(self.inner.bus.clone(), cancel)
    }

    /// The event bus this client publishes on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribes to one topic of this client's bus.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.inner.bus.subscribe(topic)
    }

    /// The shared node directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<NodeDirectory> {
        &self.inner.directory
    }

    /// The discovery projection fed by this client.
    #[must_use]
    pub fn discovery(&self) -> &Arc<DiscoveryProjection> {
        &self.inner.discovery
    }

    // ========== Queries ==========

    /// Known peers, most recently heard first. The local node is excluded.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        let own = self.own_node_num();
        self.inner
            .directory
            .nodes()
            .into_iter()
            .filter(|n| Some(n.num) != own)
            .collect()
    }

    /// Looks up a node, falling back to the store for evicted ones.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<Node> {
        if let Some(node) = self.inner.directory.get(id) {
            return Some(node);
        }
        match self.inner.store.get_node(id) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!("failed to load node {}: {}", id, e);
                None
            }
        }
    }

    /// Numeric ID of the attached radio, once reported.
    #[must_use]
    pub fn own_node_num(&self) -> Option<u32> {
        self.inner.state.lock().own_num
    }

    /// Node ID of the attached radio, once reported.
    #[must_use]
    pub fn own_node_id(&self) -> Option<String> {
        self.own_node_num().map(node_id)
    }

    /// Display name for a channel slot.
    #[must_use]
    pub fn channel_name(&self, index: u32) -> String {
        self.inner.state.lock().channels.get(&index).map_or_else(
            || default_channel_name(index, ""),
            ChannelInfo::display_name,
        )
    }

    /// Enabled channels, ordered by index.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<_> = self.inner.state.lock().channels.values().cloned().collect();
        channels.sort_by_key(|c| c.index);
        channels
    }

    /// Returns true while a transport is attached and up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| link.transport.is_connected())
    }

    /// Returns true once the radio finished its configuration dump for the
    /// current connection.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.inner.state.lock().configured
    }

    /// Unread message count per chat.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn unread_counts(&self) -> Result<HashMap<String, usize>> {
        self.inner.store.get_unread_counts()
    }

    /// Marks every message in a chat as read.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn mark_read(&self, chat_id: &str) -> Result<()> {
        self.inner.store.mark_read(chat_id)
    }

    /// Forgets in-memory nodes after the backing store was wiped.
    pub fn wipe(&self) {
        self.inner.directory.clear();
        self.inner.discovery.reset_from_store();
        tracing::info!("node directory wiped");
    }

    // ========== Outbound ==========

    /// Sends a text message and records it as a read, outgoing message.
    ///
    /// Use [`BROADCAST_ADDR`](crate::types::BROADCAST_ADDR) as `to` for a
    /// channel message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live transport, a protocol
    /// error for empty or oversized text, or the transport's write error.
    pub async fn send_text(&self, to: u32, channel: u32, text: &str) -> Result<ChatMessage> {
        let (transport, session) = self.live_link()?;
        let addr = self.address(to, channel);
        let request = command::text_message(addr, text)?;
        self.write(&transport, &session, &request).await?;

        let message = ChatMessage {
            packet_id: addr.id,
            chat_id: chat_id(addr.from, to, channel, Some(addr.from)),
            from: node_id(addr.from),
            to: node_id(to),
            channel,
            text: text.to_string(),
            timestamp: current_timestamp(),
            rssi: 0,
            snr: 0.0,
            unread: false,
            outgoing: true,
        };
        if let Err(e) = self.inner.store.save_message(&message) {
            tracing::warn!("failed to save sent message {:#010x}: {}", addr.id, e);
        }
        tracing::debug!("sent text {:#010x} to {}", addr.id, message.chat_id);
        Ok(message)
    }

    /// Sends a traceroute request and returns its packet ID.
    ///
    /// The answer arrives as an [`Event::RoutingPacket`] whose `request_id`
    /// matches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live transport, or the
    /// transport's write error.
    pub async fn send_traceroute(&self, to: u32, channel: u32) -> Result<u32> {
        let (transport, session) = self.live_link()?;
        let addr = self.address(to, channel);
        self.write(&transport, &session, &command::traceroute(addr))
            .await?;
        tracing::debug!("sent traceroute {:#010x} to {}", addr.id, node_id(to));
        Ok(addr.id)
    }

    /// Sends the local identity to a peer, asking for theirs in return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live transport, a protocol
    /// error before the radio has reported its own node, or the transport's
    /// write error.
    pub async fn send_exchange_user_info(&self, to: u32, channel: u32) -> Result<u32> {
        let (transport, session) = self.live_link()?;
        let user = {
            let state = self.inner.state.lock();
            match (&state.own_user, state.own_num) {
                (Some(user), _) => user.clone(),
                (None, Some(num)) => User {
                    id: node_id(num),
                    ..Default::default()
                },
                (None, None) => {
                    return Err(Error::Protocol {
                        message: "local node identity not reported yet".into(),
                    });
                }
            }
        };
        let addr = self.address(to, channel);
        self.write(
            &transport,
            &session,
            &command::exchange_user_info(addr, &user),
        )
        .await?;
        tracing::debug!("sent user info {:#010x} to {}", addr.id, node_id(to));
        Ok(addr.id)
    }

    fn address(&self, to: u32, channel: u32) -> PacketAddress {
        PacketAddress {
            from: self.own_node_num().unwrap_or(0),
            to,
            channel,
            id: self.inner.packet_ids.next_id(),
        }
    }

    fn live_link(&self) -> Result<(Arc<dyn Transport>, CancelToken)> {
        match self.inner.link.lock().as_ref() {
            Some(link) if link.transport.is_connected() && !link.session.is_cancelled() => {
                Ok((Arc::clone(&link.transport), link.session.clone()))
            }
            _ => Err(Error::NotConnected),
        }
    }

    async fn write(
        &self,
        transport: &Arc<dyn Transport>,
        session: &CancelToken,
        request: &ToRadio,
    ) -> Result<()> {
        let cancel = session.with_timeout(self.inner.config.write_timeout);
        let frame = command::encode(request);
        tracing::trace!("writing {} byte frame", frame.len());
        transport.write_frame(&cancel, frame).await
    }

    // ========== Connection lifecycle ==========

    async fn attach(&self, transport: Arc<dyn Transport>, session: CancelToken) -> Result<()> {
        let target = transport.status_target();
        let target_changed = {
            let mut state = self.inner.state.lock();
            state.configured = false;
            let changed = state.last_target.as_deref() != Some(target.as_str());
            state.last_target = Some(target.clone());
            changed
        };
        // the radio replays its node database before completing the handshake
        self.inner.discovery.rearm();
        if target_changed {
            tracing::debug!("new transport {}, resetting discovery session", target);
            self.inner.discovery.reset_from_store();
        }

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&transport),
            session.clone(),
            self.inner.config.read_timeout,
        ));
        let previous = self.inner.link.lock().replace(Link {
            transport: Arc::clone(&transport),
            session: session.clone(),
            reader,
        });
        if let Some(previous) = previous {
            previous.session.cancel();
            previous.reader.abort();
        }

        let config_id = self.inner.config.config_id;
        self.write(&transport, &session, &command::want_config(config_id))
            .await?;
        tracing::debug!("requested configuration from {} (id {:#x})", target, config_id);
        Ok(())
    }

    fn detach(&self) {
        let link = self.inner.link.lock().take();
        self.inner.state.lock().configured = false;
        if let Some(link) = link {
            link.session.cancel();
            link.reader.abort();
            tracing::debug!("detached from {}", link.transport.status_target());
        }
    }
}

impl ConnectionObserver for RadioClient {
    fn on_connected(
        &self,
        transport: Arc<dyn Transport>,
        session: CancelToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.attach(transport, session))
    }

    fn on_disconnected(&self) {
        self.detach();
    }
}

async fn read_loop(
    inner: Weak<ClientInner>,
    transport: Arc<dyn Transport>,
    session: CancelToken,
    read_timeout: Duration,
) {
    let target = transport.status_target();
    let mut failing = false;
    loop {
        let attempt = session.with_timeout(read_timeout);
        let frame = match transport.read_frame(&attempt).await {
            Ok(frame) => frame,
            Err(e) => match e.kind() {
                ErrorKind::Transient | ErrorKind::Benign => continue,
                ErrorKind::Decode => {
                    tracing::warn!("skipping malformed frame from {}: {}", target, e);
                    continue;
                }
                ErrorKind::Cancelled => break,
                ErrorKind::Configuration | ErrorKind::ConnectionFatal => {
                    // The manager's liveness poll ends the session; until then keep trying
                    if failing {
                        tracing::debug!("read from {} still failing: {}", target, e);
                    } else {
                        tracing::warn!("read from {} failed: {}", target, e);
                        failing = true;
                    }
                    tokio::select! {
                        () = session.cancelled() => break,
                        () = tokio::time::sleep(read_timeout) => continue,
                    }
                }
            },
        };
        failing = false;
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_frame(&frame);
    }
    tracing::debug!("read loop for {} stopped", target);
}

/// Hops travelled, when the packet carries its starting hop limit.
fn hops_away(packet: &MeshPacket) -> Option<u32> {
    (packet.hop_start != 0 && packet.hop_start >= packet.hop_limit)
        .then(|| packet.hop_start - packet.hop_limit)
}

fn apply_user(node: &mut Node, user: &User) {
    if !user.long_name.is_empty() {
        node.long_name.clone_from(&user.long_name);
    }
    if !user.short_name.is_empty() {
        node.short_name.clone_from(&user.short_name);
    }
}

impl ClientInner {
    fn handle_frame(&self, payload: &[u8]) {
        tracing::trace!("received frame: {}", hex::encode(payload));
        let message = match parser::decode_from_radio(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("skipping undecodable frame ({} bytes): {}", payload.len(), e);
                return;
            }
        };

        match message.payload_variant {
            Some(from_radio::PayloadVariant::Packet(packet)) => self.handle_packet(&packet),
            Some(from_radio::PayloadVariant::MyInfo(info)) => {
                self.state.lock().own_num = Some(info.my_node_num);
                tracing::info!("local node is {}", node_id(info.my_node_num));
            }
            Some(from_radio::PayloadVariant::NodeInfo(info)) => self.handle_node_info(&info),
            Some(from_radio::PayloadVariant::Channel(channel)) => self.handle_channel(&channel),
            Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
                self.handle_config_complete(id);
            }
            None => tracing::debug!("ignoring envelope {} without a known payload", message.id),
        }
    }

    fn handle_packet(&self, packet: &MeshPacket) {
        let data = match &packet.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => data,
            Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => {
                tracing::debug!(
                    "dropping encrypted packet {:#010x} from {} ({} bytes)",
                    packet.id,
                    node_id(packet.from),
                    bytes.len()
                );
                return;
            }
            None => {
                tracing::debug!("ignoring empty packet from {}", node_id(packet.from));
                return;
            }
        };

        let port = match parser::port_of(data) {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!("packet {:#010x} from {}: {}", packet.id, node_id(packet.from), e);
                self.touch(packet, UpdateSource::Packet, |_| {});
                return;
            }
        };

        match port {
            PortNum::TextMessageApp => self.handle_text(packet, data),
            PortNum::NodeinfoApp => match parser::decode_user(data) {
                Ok(user) => {
                    self.touch(packet, UpdateSource::NodeInfoPacket, |node| {
                        apply_user(node, &user);
                    });
                }
                Err(e) => self.skip_payload(packet, port, &e),
            },
            PortNum::PositionApp => match parser::decode_position(data) {
                Ok(position) => {
                    self.touch(packet, UpdateSource::Position, |node| {
                        if position.is_some() {
                            node.position = position;
                        }
                    });
                }
                Err(e) => self.skip_payload(packet, port, &e),
            },
            PortNum::TelemetryApp => match parser::decode_telemetry(data) {
                Ok(metrics) => {
                    self.touch(packet, UpdateSource::Telemetry, |node| {
                        if metrics.is_some() {
                            node.metrics = metrics;
                        }
                    });
                }
                Err(e) => self.skip_payload(packet, port, &e),
            },
            PortNum::RoutingApp | PortNum::TracerouteApp => {
                self.touch(packet, UpdateSource::Packet, |_| {});
                self.bus.publish(Event::RoutingPacket {
                    from: packet.from,
                    to: packet.to,
                    port,
                    request_id: data.request_id,
                    payload: data.payload.clone(),
                });
            }
            other => {
                tracing::debug!("ignoring {:?} packet from {}", other, node_id(packet.from));
                self.touch(packet, UpdateSource::Packet, |_| {});
            }
        }
    }

    fn skip_payload(&self, packet: &MeshPacket, port: PortNum, error: &Error) {
        tracing::warn!(
            "skipping {:?} packet {:#010x} from {}: {}",
            port,
            packet.id,
            node_id(packet.from),
            error
        );
        self.touch(packet, UpdateSource::Packet, |_| {});
    }

    fn handle_text(&self, packet: &MeshPacket, data: &Data) {
        let text = match parser::decode_text(data) {
            Ok(text) => text,
            Err(e) => {
                self.skip_payload(packet, PortNum::TextMessageApp, &e);
                return;
            }
        };

        let own = self.state.lock().own_num;
        let outgoing = own == Some(packet.from);
        let message = ChatMessage {
            packet_id: packet.id,
            chat_id: chat_id(packet.from, packet.to, packet.channel, own),
            from: node_id(packet.from),
            to: node_id(packet.to),
            channel: packet.channel,
            text,
            timestamp: if packet.rx_time == 0 {
                current_timestamp()
            } else {
                packet.rx_time
            },
            rssi: packet.rx_rssi,
            snr: packet.rx_snr,
            unread: !outgoing,
            outgoing,
        };
        let sender = self.touch(packet, UpdateSource::Message, |_| {});

        if let Err(e) = self.store.save_message(&message) {
            tracing::warn!("failed to save message {:#010x}: {}", message.packet_id, e);
        }
        match &sender {
            Some(node) if node.is_ignored => {
                tracing::debug!("not notifying for ignored node {}", node.id);
            }
            Some(node) => {
                self.notifier.notify(
                    &message.chat_id,
                    node.display_name(),
                    &message.text,
                    message.timestamp,
                );
            }
            None => {}
        }
        tracing::debug!(
            "message {:#010x} in {} from {}",
            message.packet_id,
            message.chat_id,
            message.from
        );
        self.bus.publish(Event::MessageReceived(Box::new(message)));
    }

    fn handle_node_info(&self, info: &proto::NodeInfo) {
        if info.num == 0 {
            tracing::debug!("ignoring node record without a number");
            return;
        }
        {
            let mut state = self.state.lock();
            if state.own_num == Some(info.num) {
                if let Some(user) = &info.user {
                    state.own_user = Some(user.clone());
                }
            }
        }

        let heard = if info.last_heard == 0 {
            SystemTime::now()
        } else {
            UNIX_EPOCH + Duration::from_secs(u64::from(info.last_heard))
        };
        let encryption = self.channel_encryption(info.channel);
        let position = info.position.as_ref().and_then(parser::position_from_proto);
        let metrics = info.device_metrics.as_ref().map(parser::metrics_from_proto);

        self.merge_node(info.num, heard, UpdateSource::DeviceNodeDb, |node| {
            if let Some(user) = &info.user {
                apply_user(node, user);
            }
            if position.is_some() {
                node.position = position;
            }
            if metrics.is_some() {
                node.metrics = metrics;
            }
            if info.snr != 0.0 {
                node.set_signal(node.rssi, info.snr);
            }
            if info.hops_away.is_some() {
                node.hops_away = info.hops_away;
            }
            node.channel = info.channel;
            if let Some(encryption) = encryption {
                node.encryption = encryption;
            }
            node.is_favorite = info.is_favorite;
            node.is_ignored = info.is_ignored;
        });
    }

    fn handle_channel(&self, channel: &proto::Channel) {
        let info = parser::channel_from_proto(channel);
        tracing::debug!(
            "channel {} '{}' ({:?}, enabled: {})",
            info.index,
            info.display_name(),
            info.encryption,
            info.enabled
        );
        let mut state = self.state.lock();
        if info.enabled {
            state.channels.insert(info.index, info);
        } else {
            state.channels.remove(&info.index);
        }
    }

    fn handle_config_complete(&self, id: u32) {
        if id != self.config.config_id {
            tracing::debug!("ignoring configuration completion {:#x} for another client", id);
            return;
        }
        self.state.lock().configured = true;
        self.discovery.note_handshake_complete();
        let known_nodes: Arc<[String]> = self.directory.ids().into();
        tracing::info!("configuration complete, {} nodes known", known_nodes.len());
        self.bus.publish(Event::BootstrapComplete {
            config_id: id,
            known_nodes,
        });
    }

    fn channel_encryption(&self, index: u32) -> Option<Encryption> {
        self.state.lock().channels.get(&index).map(|c| c.encryption)
    }

    /// Refreshes the sender of a decoded packet. The local node is skipped.
    fn touch<F>(&self, packet: &MeshPacket, source: UpdateSource, apply: F) -> Option<Node>
    where
        F: FnOnce(&mut Node),
    {
        if packet.from == 0 || self.state.lock().own_num == Some(packet.from) {
            return None;
        }
        let encryption = self.channel_encryption(packet.channel);
        let hops = hops_away(packet);
        let node = self.merge_node(packet.from, SystemTime::now(), source, |node| {
            // Packets relayed without a radio measurement carry zeros
            if packet.rx_rssi != 0 || packet.rx_snr != 0.0 {
                node.set_signal(packet.rx_rssi, packet.rx_snr);
            }
            if hops.is_some() {
                node.hops_away = hops;
            }
            node.channel = packet.channel;
            if let Some(encryption) = encryption {
                node.encryption = encryption;
            }
            apply(node);
        });
        Some(node)
    }

    fn merge_node<F>(&self, num: u32, heard: SystemTime, source: UpdateSource, apply: F) -> Node
    where
        F: FnOnce(&mut Node),
    {
        let (node, created) = self.directory.update(num, heard, apply);
        if created {
            tracing::debug!("new node {} via {}", node.id, source.as_str());
        }
        if let Err(e) = self.store.save_node(&node) {
            tracing::warn!("failed to save node {}: {}", node.id, e);
        }
        self.bus.publish(Event::NodeUpdated {
            node: Box::new(node.clone()),
            source,
        });
        node
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.session.cancel();
            link.reader.abort();
        }
    }
}
