//! Chat message types.

use crate::types::node::{BROADCAST_ADDR, node_id};

/// Returns the conversation a packet belongs to.
///
/// Broadcasts land in the channel's chat, everything else in a per-peer
/// chat keyed by the other party's node ID.
#[must_use]
pub fn chat_id(from: u32, to: u32, channel: u32, own_num: Option<u32>) -> String {
    if to == BROADCAST_ADDR {
        return format!("channel_{channel}");
    }
    let peer = if Some(from) == own_num { to } else { from };
    node_id(peer)
}

/// A text message, received or sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Mesh packet ID.
    pub packet_id: u32,
    /// Conversation this message belongs to.
    pub chat_id: String,
    /// Sender node ID.
    pub from: String,
    /// Recipient node ID (`!ffffffff` for broadcasts).
    pub to: String,
    /// Channel index.
    pub channel: u32,
    /// Message text.
    pub text: String,
    /// Receive (or send) time, Unix seconds.
    pub timestamp: u32,
    /// RSSI at reception (zero for sent messages).
    pub rssi: i32,
    /// SNR at reception (zero for sent messages).
    pub snr: f32,
    /// Not yet read by the user.
    pub unread: bool,
    /// Sent by this client.
    pub outgoing: bool,
}

impl ChatMessage {
    /// Returns true if this message went to the whole channel.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.chat_id.starts_with("channel_")
    }
}
