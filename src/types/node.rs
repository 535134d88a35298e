//! Node data structures.

use std::time::SystemTime;

/// Destination address meaning "every node on the channel".
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Formats a numeric node number as the canonical `!xxxxxxxx` ID.
#[must_use]
pub fn node_id(num: u32) -> String {
    format!("!{num:08x}")
}

/// Parses a `!xxxxxxxx` (or bare hex) node ID back into a node number.
#[must_use]
pub fn parse_node_id(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!').unwrap_or(id);
    if hex.is_empty() || hex.len() > 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Link quality tier derived from RSSI and SNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalQuality {
    /// Strong link.
    Good,
    /// Usable link.
    Fair,
    /// Weak link, or no measurement.
    #[default]
    Bad,
}

impl SignalQuality {
    /// Classifies a link from its last RSSI (dBm) and SNR (dB).
    ///
    /// Zero for both means the radio never measured the link.
    #[must_use]
    pub fn from_signal(rssi: i32, snr: f32) -> Self {
        if rssi == 0 && snr == 0.0 {
            return Self::Bad;
        }
        if rssi >= -95 && snr >= 8.0 {
            return Self::Good;
        }
        let fair = rssi >= -110 && snr >= 2.0;
        let poor = rssi <= -120 || snr <= 1.0;
        if fair && !poor { Self::Fair } else { Self::Bad }
    }

    /// Human-readable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Bad => "bad",
        }
    }
}

/// Channel encryption classification derived from the pre-shared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    /// No key, or a key length the firmware does not accept.
    #[default]
    None,
    /// One of the well-known default keys, selected by a single index byte.
    DefaultKey,
    /// An AES-128 or AES-256 key.
    Custom,
}

impl Encryption {
    /// Classifies a channel pre-shared key.
    #[must_use]
    pub fn from_psk(psk: &[u8]) -> Self {
        match psk {
            [] => Self::None,
            [index] if (1..=10).contains(index) => Self::DefaultKey,
            key if key.len() == 16 || key.len() == 32 => Self::Custom,
            _ => Self::None,
        }
    }
}

/// Last known location of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Altitude in meters, if reported.
    pub altitude: Option<i32>,
    /// Fix time (Unix seconds), zero if unknown.
    pub time: u32,
}

/// Power and airtime metrics of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DeviceMetrics {
    /// Battery level in percent (0-100).
    pub battery_percent: Option<u8>,
    /// Battery voltage.
    pub voltage: Option<f32>,
    /// True when the node reports external power.
    pub charging: bool,
    /// Channel utilization in percent.
    pub channel_utilization: Option<f32>,
    /// Transmit airtime utilization in percent.
    pub air_util_tx: Option<f32>,
    /// Uptime in seconds.
    pub uptime_secs: Option<u32>,
}

/// A mesh node as tracked by the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Canonical `!xxxxxxxx` ID.
    pub id: String,
    /// Numeric node number.
    pub num: u32,
    /// Short display name (up to 4 characters).
    pub short_name: String,
    /// Long display name.
    pub long_name: String,
    /// Marked favorite on the device.
    pub is_favorite: bool,
    /// Marked ignored on the device.
    pub is_ignored: bool,
    /// Encryption of the channel this node was heard on.
    pub encryption: Encryption,
    /// Last RSSI in dBm (zero if unknown).
    pub rssi: i32,
    /// Last SNR in dB (zero if unknown).
    pub snr: f32,
    /// Tier derived from `rssi` and `snr`.
    pub signal: SignalQuality,
    /// Channel index the node was last heard on.
    pub channel: u32,
    /// Hop distance, if known.
    pub hops_away: Option<u32>,
    /// When the node was last heard.
    pub last_heard: SystemTime,
    /// Last reported position.
    pub position: Option<Position>,
    /// Last reported device metrics.
    pub metrics: Option<DeviceMetrics>,
}

impl Node {
    /// Creates an empty record for a first sighting.
    #[must_use]
    pub fn new(num: u32, last_heard: SystemTime) -> Self {
        Self {
            id: node_id(num),
            num,
            short_name: String::new(),
            long_name: String::new(),
            is_favorite: false,
            is_ignored: false,
            encryption: Encryption::None,
            rssi: 0,
            snr: 0.0,
            signal: SignalQuality::Bad,
            channel: 0,
            hops_away: None,
            last_heard,
            position: None,
            metrics: None,
        }
    }

    /// Updates the link measurements and recomputes the tier.
    pub fn set_signal(&mut self, rssi: i32, snr: f32) {
        self.rssi = rssi;
        self.snr = snr;
        self.signal = SignalQuality::from_signal(rssi, snr);
    }

    /// Best display name: long name, short name, then ID.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if !self.long_name.is_empty() {
            &self.long_name
        } else if !self.short_name.is_empty() {
            &self.short_name
        } else {
            &self.id
        }
    }
}
