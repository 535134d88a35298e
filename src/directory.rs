//! In-memory node directory.
//!
//! One [`NodeDirectory`] is created per client and shared (via `Arc`) with the
//! discovery projection. Nodes are created on first sighting, updated on each
//! later one, and evicted lazily on read once their last-heard time is older
//! than the staleness threshold.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::types::{Node, node_id};

/// Default staleness threshold.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Shared store of known nodes, keyed by node ID.
#[derive(Debug)]
pub struct NodeDirectory {
    nodes: Mutex<HashMap<String, Node>>,
    stale_after: Duration,
}

impl NodeDirectory {
    /// Creates an empty directory with the default staleness threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }

    /// Creates an empty directory with a custom staleness threshold.
    #[must_use]
    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Creates or updates the node `num` and returns the resulting record.
    ///
    /// The boolean is true when the node was newly created.
    pub fn update<F>(&self, num: u32, heard: SystemTime, apply: F) -> (Node, bool)
    where
        F: FnOnce(&mut Node),
    {
        let id = node_id(num);
        let mut nodes = self.nodes.lock();
        let created = !nodes.contains_key(&id);
        let node = nodes.entry(id).or_insert_with(|| Node::new(num, heard));
        if heard > node.last_heard {
            node.last_heard = heard;
        }
        apply(node);
        (node.clone(), created)
    }

    /// Returns a node by ID, evicting it if stale.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Node> {
        self.get_at(id, SystemTime::now())
    }

    /// Like [`get`](Self::get) with an explicit clock.
    #[must_use]
    pub fn get_at(&self, id: &str, now: SystemTime) -> Option<Node> {
        let mut nodes = self.nodes.lock();
        let stale = nodes.get(id).map(|n| self.is_stale(n, now))?;
        if stale {
            nodes.remove(id);
            tracing::debug!("evicted stale node {}", id);
            return None;
        }
        nodes.get(id).cloned()
    }

    /// Returns all fresh nodes, most recently heard first.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes_at(SystemTime::now())
    }

    /// Like [`nodes`](Self::nodes) with an explicit clock.
    #[must_use]
    pub fn nodes_at(&self, now: SystemTime) -> Vec<Node> {
        let mut nodes = self.nodes.lock();
        let before = nodes.len();
        nodes.retain(|_, n| !self.is_stale(n, now));
        if nodes.len() < before {
            tracing::debug!("evicted {} stale nodes", before - nodes.len());
        }
        let mut list: Vec<Node> = nodes.values().cloned().collect();
        drop(nodes);
        list.sort_by(|a, b| b.last_heard.cmp(&a.last_heard).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Snapshot of every ID currently held, without eviction.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    /// Number of nodes held, stale ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Returns true if the directory holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Removes every node.
    pub fn clear(&self) {
        self.nodes.lock().clear();
    }

    fn is_stale(&self, node: &Node, now: SystemTime) -> bool {
        now.duration_since(node.last_heard)
            .is_ok_and(|age| age > self.stale_after)
    }
}

impl Default for NodeDirectory {
    fn default() -> Self {
        Self::new()
    }
}
