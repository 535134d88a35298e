//! Local radio and channel information.

use crate::types::node::Encryption;

/// A channel slot configured on the attached radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel index (0 is primary).
    pub index: u32,
    /// Configured name; may be empty.
    pub name: String,
    /// Classification of the channel key.
    pub encryption: Encryption,
    /// Whether the slot is in use.
    pub enabled: bool,
}

impl ChannelInfo {
    /// Name to show for this channel.
    ///
    /// An unnamed primary channel uses the firmware's default preset name.
    #[must_use]
    pub fn display_name(&self) -> String {
        default_channel_name(self.index, &self.name)
    }
}

/// Resolves a channel name, falling back to a positional label.
#[must_use]
pub fn default_channel_name(index: u32, name: &str) -> String {
    if !name.is_empty() {
        name.to_string()
    } else if index == 0 {
        "Primary".to_string()
    } else {
        format!("Channel {index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_display_name() {
        let mut channel = ChannelInfo {
            index: 0,
            name: String::new(),
            encryption: Encryption::DefaultKey,
            enabled: true,
        };
        assert_eq!(channel.display_name(), "Primary");
        channel.index = 2;
        assert_eq!(channel.display_name(), "Channel 2");
        channel.name = "hikers".into();
        assert_eq!(channel.display_name(), "hikers");
    }
}
