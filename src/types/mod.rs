//! Data types for mesh entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Nodes, link quality and encryption classification
//! - Chat messages and conversation addressing
//! - Channel information

pub mod device;
pub mod message;
pub mod node;

pub use device::ChannelInfo;
pub use message::{ChatMessage, chat_id};
pub use node::{
    BROADCAST_ADDR, DeviceMetrics, Encryption, Node, Position, SignalQuality, node_id,
    parse_node_id,
};
