//! Inbound payload decoding.
//!
//! Converts the radio's protobuf records into the crate's domain types.
//! Decoding failures are reported as [`Error::Decode`] or
//! [`Error::Protocol`]; the caller skips the frame and keeps reading.

use prost::Message;

use crate::error::{Error, Result};
use crate::protocol::proto::{self, ChannelRole, Data, FromRadio, PortNum, User};
use crate::types::{ChannelInfo, DeviceMetrics, Encryption, Position};

/// Coordinate scaling factor (degrees are stored multiplied by 1e7).
const COORD_SCALE: f64 = 10_000_000.0;

/// Battery levels above this mean the node is on external power.
const BATTERY_POWERED_SENTINEL: u32 = 100;

/// Decodes one inbound envelope.
pub fn decode_from_radio(payload: &[u8]) -> Result<FromRadio> {
    Ok(FromRadio::decode(payload)?)
}

/// Returns the application port of a decoded payload.
pub fn port_of(data: &Data) -> Result<PortNum> {
    PortNum::try_from(data.portnum).map_err(|_| Error::Protocol {
        message: format!("unknown port {}", data.portnum),
    })
}

/// Parses a coordinate scaled by 1e7.
///
/// Returns `None` for 0, which the firmware sends when no fix is set.
fn parse_coord(value: Option<i32>) -> Option<f64> {
    match value {
        None | Some(0) => None,
        Some(raw) => Some(f64::from(raw) / COORD_SCALE),
    }
}

/// Converts a position record, or `None` when it carries no fix.
#[must_use]
pub fn position_from_proto(position: &proto::Position) -> Option<Position> {
    let latitude = parse_coord(position.latitude_i)?;
    let longitude = parse_coord(position.longitude_i)?;
    Some(Position {
        latitude,
        longitude,
        altitude: position.altitude,
        time: position.time,
    })
}

/// Converts device metrics.
///
/// A battery level above 100 means external power: `charging` is set and
/// the percentage is reported as 100.
#[must_use]
pub fn metrics_from_proto(metrics: &proto::DeviceMetrics) -> DeviceMetrics {
    let charging = metrics
        .battery_level
        .is_some_and(|level| level > BATTERY_POWERED_SENTINEL);
    let battery_percent = metrics
        .battery_level
        .map(|level| u8::try_from(level.min(BATTERY_POWERED_SENTINEL)).unwrap_or(100));
    DeviceMetrics {
        battery_percent,
        voltage: metrics.voltage,
        charging,
        channel_utilization: metrics.channel_utilization,
        air_util_tx: metrics.air_util_tx,
        uptime_secs: metrics.uptime_seconds,
    }
}

/// Converts a channel record.
#[must_use]
pub fn channel_from_proto(channel: &proto::Channel) -> ChannelInfo {
    let (name, encryption) = channel.settings.as_ref().map_or_else(
        || (String::new(), Encryption::None),
        |s| (s.name.clone(), Encryption::from_psk(&s.psk)),
    );
    ChannelInfo {
        index: u32::try_from(channel.index).unwrap_or(0),
        name,
        encryption,
        enabled: channel.role != ChannelRole::Disabled as i32,
    }
}

/// Decodes the UTF-8 body of a text message.
pub fn decode_text(data: &Data) -> Result<String> {
    String::from_utf8(data.payload.clone()).map_err(|e| Error::Protocol {
        message: format!("text payload is not UTF-8: {e}"),
    })
}

/// Decodes the identity carried by a node-info packet.
pub fn decode_user(data: &Data) -> Result<User> {
    Ok(User::decode(data.payload.as_slice())?)
}

/// Decodes a position packet.
pub fn decode_position(data: &Data) -> Result<Option<Position>> {
    let position = proto::Position::decode(data.payload.as_slice())?;
    Ok(position_from_proto(&position))
}

/// Decodes a telemetry packet, returning device metrics if present.
pub fn decode_telemetry(data: &Data) -> Result<Option<DeviceMetrics>> {
    let telemetry = proto::Telemetry::decode(data.payload.as_slice())?;
    Ok(match telemetry.variant {
        Some(proto::telemetry::Variant::DeviceMetrics(m)) => Some(metrics_from_proto(&m)),
        None => None,
    })
}
