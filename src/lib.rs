//! # meshlink
//!
//! A Rust client library for Meshtastic mesh radios.
//!
//! This library keeps an async link to a radio over USB/Serial, TCP or
//! Bluetooth LE, reconnects with backoff when the link drops, and turns the
//! radio's protobuf stream into node, message and discovery events.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - One [`Transport`] trait over serial, TCP and BLE links
//! - Automatic reconnection with exponential backoff and jitter
//! - Topic-based event bus for messages, nodes, connection state and discovery
//! - Node discovery that stays quiet during the radio's startup dump
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meshlink::{
//!     BROADCAST_ADDR, ClientConfig, Endpoint, Event, EventBus, LogNotifier, MemoryStore,
//!     RadioClient, ReconnectConfig, ReconnectManager, Topic,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshlink::Error> {
//!     let bus = EventBus::default();
//!     let client = RadioClient::new(
//!         ClientConfig::new(),
//!         bus.clone(),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(LogNotifier),
//!     );
//!     let manager = ReconnectManager::new(ReconnectConfig::new(), bus.clone());
//!     client.attach_to(&manager);
//!
//!     let mut messages = bus.subscribe(Topic::Messages);
//!     manager.start(&Endpoint::serial("/dev/ttyUSB0"))?;
//!
//!     if let Some(Event::MessageReceived(message)) = messages.recv().await {
//!         println!("{}: {}", message.from, message.text);
//!         client.send_text(BROADCAST_ADDR, message.channel, "pong").await?;
//!     }
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Wire format (stream framing, protobuf messages, builders)
//! - [`transport`] - Serial, TCP and BLE links behind one trait
//! - [`reconnect`] - Connection state machine and backoff
//! - [`client`] - High-level [`RadioClient`] that decodes and dispatches
//! - [`directory`] - In-memory node directory with staleness eviction
//! - [`discovery`] - One-shot announcements for newly heard nodes
//! - [`event`] - Topic-based event bus
//! - [`store`] - Persistence and notification collaborators
//! - [`types`] - Data structures (nodes, messages, channels)

pub mod cancel;
pub mod client;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod event;
pub mod protocol;
pub mod reconnect;
pub mod store;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use client::{ClientConfig, RadioClient};
pub use directory::NodeDirectory;
pub use discovery::DiscoveryProjection;
pub use error::{Error, ErrorKind, FrameError, Result};
pub use event::{Event, EventBus, Subscription, Topic, UpdateSource};
pub use protocol::PortNum;
pub use reconnect::{
    ConnectionObserver, ConnectionSnapshot, ConnectionState, ReconnectConfig, ReconnectManager,
    StateChange,
};
pub use store::{LogNotifier, MemoryStore, MessageStore, NotificationSink};
pub use transport::{
    BleTransport, Endpoint, SerialTransport, TcpTransport, Transport, serial::list_ports,
};
pub use types::{
    BROADCAST_ADDR, ChannelInfo, ChatMessage, DeviceMetrics, Encryption, Node, Position,
    SignalQuality, node_id, parse_node_id,
};
