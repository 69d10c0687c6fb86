//! Transactions: one caller request and its result slot

use std::fmt;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::TransmitError;
use crate::frame::Frame;
use crate::message::{InboundCommand, Message, NodeId};
use crate::priority::Priority;

/// Unique, monotonically increasing transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a successful transaction resolves with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitReply {
    /// The controller's final frame (response or callback)
    Controller(Frame),
    /// The report the node sent back
    Node(InboundCommand),
    /// A node information frame proved a pinged node is alive
    NodeInfo(NodeId),
    /// The controller acknowledged a frame that has no response
    Acknowledged,
}

/// Result a transaction settles with
pub type TransmitResult = std::result::Result<TransmitReply, TransmitError>;

/// Receiving half of a transaction's result slot
pub type ResultReceiver = oneshot::Receiver<TransmitResult>;

/// Resolve-once result slot
#[derive(Debug)]
pub struct ResultSlot {
    sender: Option<oneshot::Sender<TransmitResult>>,
}

impl ResultSlot {
    /// Create a slot and the receiver the caller waits on
    pub fn channel() -> (Self, ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self::from_sender(tx), rx)
    }

    /// Wrap an existing sender
    pub fn from_sender(sender: oneshot::Sender<TransmitResult>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Settle the slot. Returns false if it was already settled.
    pub fn settle(&mut self, result: TransmitResult) -> bool {
        match self.sender.take() {
            Some(tx) => {
                // The caller may have stopped waiting
                if tx.send(result).is_err() {
                    trace!("Result receiver dropped before settlement");
                }
                true
            }
            None => false,
        }
    }

    /// Whether the slot has been settled
    pub fn is_settled(&self) -> bool {
        self.sender.is_none()
    }
}

/// One outstanding request to send a message
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    message: Message,
    priority: Priority,
    created_at: Instant,
    tag: Option<String>,
    slot: ResultSlot,
    send_attempts: u8,
    request_seq: u32,
}

impl Transaction {
    /// Create a transaction with a fresh result slot
    pub fn new(id: TransactionId, message: Message, priority: Priority) -> (Self, ResultReceiver) {
        let (slot, rx) = ResultSlot::channel();
        (Self::with_slot(id, message, priority, slot), rx)
    }

    /// Create a transaction around an existing slot
    pub fn with_slot(id: TransactionId, message: Message, priority: Priority, slot: ResultSlot) -> Self {
        Self {
            id,
            message,
            priority,
            created_at: Instant::now(),
            tag: None,
            slot,
            send_attempts: 0,
            request_seq: 0,
        }
    }

    /// Attach a bookkeeping tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Transaction id
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The outbound message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Current priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Creation time, used for FIFO ordering
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Bookkeeping tag
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Node-level send attempts made so far
    pub fn send_attempts(&self) -> u8 {
        self.send_attempts
    }

    /// Whether the result has been settled
    pub fn is_settled(&self) -> bool {
        self.slot.is_settled()
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub(crate) fn record_send_attempt(&mut self) -> u8 {
        self.send_attempts = self.send_attempts.saturating_add(1);
        self.send_attempts
    }

    pub(crate) fn reset_attempts(&mut self) {
        self.send_attempts = 0;
    }

    /// Sequence number for the next command sent on behalf of this
    /// transaction. Never reused, even across requeues.
    pub(crate) fn next_request_seq(&mut self) -> u32 {
        let seq = self.request_seq;
        self.request_seq = self.request_seq.wrapping_add(1);
        seq
    }

    /// Settle the result. Later calls are ignored.
    pub(crate) fn settle(&mut self, result: TransmitResult) -> bool {
        let settled = self.slot.settle(result);
        if !settled {
            trace!(transaction = %self.id, "Ignoring repeated settlement");
        }
        settled
    }
}
