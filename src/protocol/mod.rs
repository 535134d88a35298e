//! Protocol definitions for mesh radio communication.
//!
//! This module contains the low-level protocol types including:
//! - Frame encoding/decoding
//! - Protobuf envelope and payload messages
//! - Outbound message builders
//! - Inbound payload decoding

pub mod command;
pub mod frame;
pub mod parser;
pub mod proto;

pub use command::{PacketAddress, PacketIdGenerator, WANT_CONFIG_ID};
pub use frame::{FRAME_HEADER, FrameDecoder, MAX_FRAME_SIZE, encode as encode_frame};
pub use parser::{decode_from_radio, port_of};
pub use proto::{FromRadio, MeshPacket, PortNum, ToRadio};
