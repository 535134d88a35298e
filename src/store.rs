//! Persistence and notification collaborators.
//!
//! The client records messages and nodes through [`MessageStore`] and raises
//! user-facing alerts through [`NotificationSink`]. Both are implemented by
//! the embedding application; [`MemoryStore`] and [`LogNotifier`] cover
//! tests and headless use.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{ChatMessage, Node};

/// Storage for chat history and node records.
pub trait MessageStore: Send + Sync {
    /// Persists a message. Saving the same packet twice keeps one copy.
    fn save_message(&self, message: &ChatMessage) -> Result<()>;

    /// Creates or replaces a node record.
    fn save_node(&self, node: &Node) -> Result<()>;

    /// Looks up a node by ID.
    fn get_node(&self, id: &str) -> Result<Option<Node>>;

    /// Marks every message in a chat as read.
    fn mark_read(&self, chat_id: &str) -> Result<()>;

    /// Unread message count per chat, chats with none omitted.
    fn get_unread_counts(&self) -> Result<HashMap<String, usize>>;
}

/// Receives alerts for incoming messages.
pub trait NotificationSink: Send + Sync {
    /// Raises one alert. `timestamp` is Unix seconds.
    fn notify(&self, chat_id: &str, title: &str, body: &str, timestamp: u32);
}

/// Notification sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, chat_id: &str, title: &str, body: &str, _timestamp: u32) {
        tracing::info!("[{}] {}: {}", chat_id, title, body);
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<ChatMessage>,
    nodes: HashMap<String, Node>,
}

/// In-memory [`MessageStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in a chat, oldest first.
    #[must_use]
    pub fn messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect()
    }

    /// Number of stored nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// Drops all messages and nodes.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.messages.clear();
        state.nodes.clear();
    }
}

impl MessageStore for MemoryStore {
    fn save_message(&self, message: &ChatMessage) -> Result<()> {
        let mut state = self.state.lock();
        let duplicate = state.messages.iter().any(|m| {
            m.packet_id == message.packet_id && m.from == message.from && message.packet_id != 0
        });
        if !duplicate {
            state.messages.push(message.clone());
        }
        Ok(())
    }

    fn save_node(&self, node: &Node) -> Result<()> {
        self.state.lock().nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    fn get_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.state.lock().nodes.get(id).cloned())
    }

    fn mark_read(&self, chat_id: &str) -> Result<()> {
        for message in self
            .state
            .lock()
            .messages
            .iter_mut()
            .filter(|m| m.chat_id == chat_id)
        {
            message.unread = false;
        }
        Ok(())
    }

    fn get_unread_counts(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for message in self.state.lock().messages.iter().filter(|m| m.unread) {
            *counts.entry(message.chat_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn message(packet_id: u32, chat: &str, unread: bool) -> ChatMessage {
        ChatMessage {
            packet_id,
            chat_id: chat.into(),
            from: "!00000001".into(),
            to: "!ffffffff".into(),
            channel: 0,
            text: format!("msg {packet_id}"),
            timestamp: 1_700_000_000,
            rssi: -90,
            snr: 6.5,
            unread,
            outgoing: false,
        }
    }

    #[test]
    fn test_unread_counts_and_mark_read() {
        let store = MemoryStore::new();
        store.save_message(&message(1, "channel_0", true)).unwrap();
        store.save_message(&message(2, "channel_0", true)).unwrap();
        store.save_message(&message(3, "!00000002", true)).unwrap();
        store.save_message(&message(4, "!00000002", false)).unwrap();

        let counts = store.get_unread_counts().unwrap();
        assert_eq!(counts.get("channel_0"), Some(&2));
        assert_eq!(counts.get("!00000002"), Some(&1));

        store.mark_read("channel_0").unwrap();
        let counts = store.get_unread_counts().unwrap();
        assert!(!counts.contains_key("channel_0"));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_duplicate_packet_saved_once() {
        let store = MemoryStore::new();
        store.save_message(&message(7, "channel_0", true)).unwrap();
        store.save_message(&message(7, "channel_0", true)).unwrap();
        assert_eq!(store.messages("channel_0").len(), 1);
    }

    #[test]
    fn test_nodes_round_trip() {
        let store = MemoryStore::new();
        let mut node = Node::new(0x42, SystemTime::now());
        node.long_name = "Relay".into();
        store.save_node(&node).unwrap();
        assert_eq!(store.get_node("!00000042").unwrap(), Some(node));
        assert!(store.get_node("!00000043").unwrap().is_none());

        store.clear();
        assert_eq!(store.node_count(), 0);
    }
}
