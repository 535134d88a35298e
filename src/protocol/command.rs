//! Outbound message builders.
//!
//! Every request to the radio is a [`ToRadio`] envelope. Mesh traffic wraps a
//! [`Data`] payload in a [`MeshPacket`]; the startup handshake is a bare
//! `WantConfigId`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use prost::Message;

use crate::error::{Error, Result};
use crate::protocol::proto::{
    Data, MeshPacket, PortNum, Priority, RouteDiscovery, ToRadio, User, mesh_packet, to_radio,
};

/// Sentinel sent with `WantConfigId`; echoed back in `ConfigCompleteId`.
pub const WANT_CONFIG_ID: u32 = 0x5EED_CAFE;

/// Default hop limit for locally originated packets.
pub const DEFAULT_HOP_LIMIT: u32 = 3;

/// Largest `Data.payload` the firmware accepts.
pub const MAX_DATA_PAYLOAD: usize = 233;

/// Generates packet IDs from the clock plus a wrapping counter.
///
/// The upper 22 bits hold seconds since the epoch, the lower 10 a counter,
/// so IDs stay distinct across restarts within a few weeks. Zero is never
/// returned because the firmware treats it as "no ID".
#[derive(Debug)]
pub struct PacketIdGenerator {
    counter: AtomicU32,
}

impl PacketIdGenerator {
    /// Creates a generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Returns the next packet ID.
    pub fn next_id(&self) -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let id = ((secs as u32 & 0x003F_FFFF) << 10) | (count & 0x3FF);
        if id == 0 { 1 } else { id }
    }
}

impl Default for PacketIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Addressing shared by every outbound mesh packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketAddress {
    /// Own node number.
    pub from: u32,
    /// Destination node number, or the broadcast address.
    pub to: u32,
    /// Channel index.
    pub channel: u32,
    /// Packet ID.
    pub id: u32,
}

/// Builds the handshake request that triggers the configuration dump.
#[must_use]
pub fn want_config(config_id: u32) -> ToRadio {
    ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::WantConfigId(config_id)),
    }
}

fn mesh_packet(addr: PacketAddress, data: Data, want_ack: bool) -> ToRadio {
    let packet = MeshPacket {
        from: addr.from,
        to: addr.to,
        channel: addr.channel,
        id: addr.id,
        hop_limit: DEFAULT_HOP_LIMIT,
        want_ack,
        priority: if want_ack {
            Priority::Reliable as i32
        } else {
            Priority::Default as i32
        },
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(data)),
        ..Default::default()
    };
    ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
    }
}

/// Builds a text message packet with an acknowledgment request.
pub fn text_message(addr: PacketAddress, text: &str) -> Result<ToRadio> {
    if text.is_empty() {
        return Err(Error::Protocol {
            message: "empty text message".into(),
        });
    }
    if text.len() > MAX_DATA_PAYLOAD {
        return Err(Error::Protocol {
            message: format!(
                "text is {} bytes, maximum is {MAX_DATA_PAYLOAD}",
                text.len()
            ),
        });
    }
    let data = Data {
        portnum: PortNum::TextMessageApp as i32,
        payload: text.as_bytes().to_vec(),
        ..Default::default()
    };
    Ok(mesh_packet(addr, data, true))
}

/// Builds a traceroute request toward `addr.to`.
#[must_use]
pub fn traceroute(addr: PacketAddress) -> ToRadio {
    let data = Data {
        portnum: PortNum::TracerouteApp as i32,
        payload: RouteDiscovery::default().encode_to_vec(),
        want_response: true,
        ..Default::default()
    };
    mesh_packet(addr, data, false)
}

/// Builds a node-info packet carrying our identity, asking the peer to
/// answer with theirs.
#[must_use]
pub fn exchange_user_info(addr: PacketAddress, user: &User) -> ToRadio {
    let data = Data {
        portnum: PortNum::NodeinfoApp as i32,
        payload: user.encode_to_vec(),
        want_response: true,
        ..Default::default()
    };
    mesh_packet(addr, data, false)
}

/// Serializes an envelope for the transport.
#[must_use]
pub fn encode(message: &ToRadio) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BROADCAST_ADDR;

    fn addr(to: u32) -> PacketAddress {
        PacketAddress {
            from: 0x1111,
            to,
            channel: 2,
            id: 77,
        }
    }

    fn unwrap_packet(msg: ToRadio) -> (MeshPacket, Data) {
        let Some(to_radio::PayloadVariant::Packet(packet)) = msg.payload_variant else {
            panic!("expected packet");
        };
        let Some(mesh_packet::PayloadVariant::Decoded(data)) = packet.payload_variant.clone()
        else {
            panic!("expected decoded payload");
        };
        (packet, data)
    }

    #[test]
    fn test_want_config() {
        assert_eq!(
            want_config(WANT_CONFIG_ID).payload_variant,
            Some(to_radio::PayloadVariant::WantConfigId(WANT_CONFIG_ID))
        );
    }

    #[test]
    fn test_text_message_fields() {
        let (packet, data) = unwrap_packet(text_message(addr(BROADCAST_ADDR), "hi").unwrap());
        assert_eq!(packet.to, BROADCAST_ADDR);
        assert_eq!(packet.channel, 2);
        assert_eq!(packet.id, 77);
        assert!(packet.want_ack);
        assert_eq!(packet.priority, Priority::Reliable as i32);
        assert_eq!(packet.hop_limit, DEFAULT_HOP_LIMIT);
        assert_eq!(data.portnum, PortNum::TextMessageApp as i32);
        assert_eq!(data.payload, b"hi");
    }

    #[test]
    fn test_text_message_limits() {
        assert!(text_message(addr(1), "").is_err());
        assert!(text_message(addr(1), &"x".repeat(MAX_DATA_PAYLOAD)).is_ok());
        assert!(text_message(addr(1), &"x".repeat(MAX_DATA_PAYLOAD + 1)).is_err());
    }

    #[test]
    fn test_traceroute_requests_response() {
        let (packet, data) = unwrap_packet(traceroute(addr(0x2222)));
        assert!(!packet.want_ack);
        assert_eq!(packet.priority, Priority::Default as i32);
        assert!(data.want_response);
        assert_eq!(data.portnum, PortNum::TracerouteApp as i32);
        assert!(RouteDiscovery::decode(&data.payload[..]).unwrap().route.is_empty());
    }

    #[test]
    fn test_exchange_user_info_carries_identity() {
        let user = User {
            id: "!00001111".into(),
            long_name: "Base Camp".into(),
            short_name: "BC".into(),
            ..Default::default()
        };
        let (_, data) = unwrap_packet(exchange_user_info(addr(0x2222), &user));
        assert_eq!(data.portnum, PortNum::NodeinfoApp as i32);
        assert!(data.want_response);
        assert_eq!(User::decode(&data.payload[..]).unwrap(), user);
    }

    #[test]
    fn test_packet_ids_distinct_and_nonzero() {
        let ids = PacketIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }
}
