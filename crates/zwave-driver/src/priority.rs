//! Transaction priorities and the queue ordering
//!
//! The ordering is priority first and creation order second, with two
//! node-aware exceptions:
//!
//! - transactions held back by a sleeping target sort after everything
//!   else; pings and handshakes are never held back
//! - among `NodeQuery` transactions, those for listening nodes come first
//!   and those for non-listening nodes last
//!
//! Together these let the scheduler assume that once the head of the queue
//! is held back by a sleeping node, everything behind it is too.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;

use crate::message::MessageCapabilities;
use crate::node_status::NodeStatusProvider;
use crate::transaction::{Transaction, TransactionId};

/// How urgent a transaction is. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Pings must get through even when other traffic is waiting
    Ping,
    /// Handshake replies to nodes
    Handshake,
    /// Handshakes we start before a secured command
    PreTransmitHandshake,
    /// User-triggered, time-sensitive commands
    Immediate,
    /// Commands for the controller itself
    Controller,
    /// Regular traffic
    Normal,
    /// Interview queries
    NodeQuery,
    /// Traffic held back until a sleeping node wakes up
    WakeUp,
    /// Periodic polling
    Poll,
}

impl Priority {
    /// Priorities that may be sent even if the target node is asleep
    pub fn bypasses_sleep(&self) -> bool {
        matches!(
            self,
            Priority::Ping | Priority::Handshake | Priority::PreTransmitHandshake
        )
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Ping => "ping",
            Priority::Handshake => "handshake",
            Priority::PreTransmitHandshake => "pre-transmit handshake",
            Priority::Immediate => "immediate",
            Priority::Controller => "controller",
            Priority::Normal => "normal",
            Priority::NodeQuery => "node query",
            Priority::WakeUp => "wake up",
            Priority::Poll => "poll",
        };
        f.write_str(s)
    }
}

/// Where a transaction stands in the service order.
///
/// Fields compare in declaration order, so keys taken against one node
/// status snapshot always form a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceKey {
    held_by_sleep: bool,
    priority: Priority,
    listening: ListeningRank,
    created_at: Instant,
    id: TransactionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ListeningRank {
    Listening,
    Unknown,
    NotListening,
    Ignored,
}

/// Service key of `t` under the current node status
pub fn service_key(t: &Transaction, status: &dyn NodeStatusProvider) -> ServiceKey {
    let node = t.message().target_node_id();
    let priority = t.priority();

    // Unknown targets are treated like the controller, which never sleeps
    let asleep = node.map(|n| !status.is_node_awake(n)).unwrap_or(false);

    let listening = if priority == Priority::NodeQuery {
        match node.and_then(|n| status.is_node_listening(n)) {
            Some(true) => ListeningRank::Listening,
            Some(false) => ListeningRank::NotListening,
            None => ListeningRank::Unknown,
        }
    } else {
        ListeningRank::Ignored
    };

    ServiceKey {
        held_by_sleep: asleep && !priority.bypasses_sleep(),
        priority,
        listening,
        created_at: t.created_at(),
        id: t.id(),
    }
}

/// Order two transactions. `Less` means `a` is served before `b`.
pub fn compare_transactions(
    a: &Transaction,
    b: &Transaction,
    status: &dyn NodeStatusProvider,
) -> Ordering {
    service_key(a, status).cmp(&service_key(b, status))
}
