//! Node status as seen by the transmission pipeline
//!
//! The pipeline only asks two questions about a node: is it awake right
//! now, and is it a listening (or frequently listening) node. The answers
//! come from the node interview layer; [`NodeStatusTable`] is a simple
//! in-memory implementation for hosts that track status themselves.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::message::NodeId;

/// Source of node status information
pub trait NodeStatusProvider: Send + Sync {
    /// Whether the node can receive frames right now. Unknown nodes count as awake.
    fn is_node_awake(&self, node: NodeId) -> bool;

    /// Whether the node is always or frequently listening. `None` if the node is unknown.
    fn is_node_listening(&self, node: NodeId) -> Option<bool>;

    /// Record that the node went to sleep
    fn mark_node_asleep(&self, node: NodeId) {
        let _ = node;
    }

    /// Record that the node is awake
    fn mark_node_awake(&self, node: NodeId) {
        let _ = node;
    }
}

/// How a node listens for frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListeningMode {
    /// Mains powered, always listening
    Always,
    /// FLiRS device, wakes on a beam
    Frequently,
    /// Battery device that only listens after waking up
    Sleeping,
}

#[derive(Debug, Clone, Copy)]
struct NodeEntry {
    mode: ListeningMode,
    awake: bool,
}

/// In-memory node status store
#[derive(Debug, Default)]
pub struct NodeStatusTable {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
}

impl NodeStatusTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a node. Sleeping nodes start out asleep.
    pub fn insert(&self, node: NodeId, mode: ListeningMode) {
        let awake = mode != ListeningMode::Sleeping;
        self.nodes.write().insert(node, NodeEntry { mode, awake });
    }

    /// Forget a node
    pub fn remove(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    /// Listening mode of a known node
    pub fn mode(&self, node: NodeId) -> Option<ListeningMode> {
        self.nodes.read().get(&node).map(|e| e.mode)
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether no nodes are known
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStatusProvider for NodeStatusTable {
    fn is_node_awake(&self, node: NodeId) -> bool {
        self.nodes.read().get(&node).map(|e| e.awake).unwrap_or(true)
    }

    fn is_node_listening(&self, node: NodeId) -> Option<bool> {
        self.nodes
            .read()
            .get(&node)
            .map(|e| e.mode != ListeningMode::Sleeping)
    }

    fn mark_node_asleep(&self, node: NodeId) {
        if let Some(entry) = self.nodes.write().get_mut(&node) {
            // Listening nodes never sleep
            if entry.mode == ListeningMode::Sleeping && entry.awake {
                debug!(node = %node, "Node is now asleep");
                entry.awake = false;
            }
        }
    }

    fn mark_node_awake(&self, node: NodeId) {
        if let Some(entry) = self.nodes.write().get_mut(&node) {
            if !entry.awake {
                debug!(node = %node, "Node is now awake");
                entry.awake = true;
            }
        }
    }
}
