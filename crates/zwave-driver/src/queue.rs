//! Priority queue of pending transactions
//!
//! Node sleep and listening state can change while transactions wait, so
//! the queue does not keep a pre-sorted index. The head is picked by
//! [`service_key`](crate::priority::service_key) every time it is needed,
//! which keeps the order correct against the current node status.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::TransmitError;
use crate::message::{MessageCapabilities, NodeId};
use crate::node_status::NodeStatusProvider;
use crate::priority::{service_key, Priority};
use crate::transaction::{Transaction, TransactionId};

/// What a reduction does with one transaction
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceAction {
    /// Leave it alone
    Keep,
    /// Remove it; the caller sees [`TransmitError::Dropped`]
    Drop,
    /// Remove it and reject it with the given error
    Reject(TransmitError),
    /// Put it (back) into the queue, optionally with a new priority
    Requeue(Option<Priority>),
}

/// Counts of what a reduction did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceSummary {
    /// Transactions removed without an error of their own
    pub dropped: usize,
    /// Transactions rejected
    pub rejected: usize,
    /// Transactions requeued
    pub requeued: usize,
}

impl ReduceSummary {
    /// Add another summary's counts
    pub fn merge(&mut self, other: ReduceSummary) {
        self.dropped += other.dropped;
        self.rejected += other.rejected;
        self.requeued += other.requeued;
    }
}

/// Pending transactions plus the id of the one being executed
pub struct TransactionQueue {
    pending: Vec<Transaction>,
    current: Option<TransactionId>,
    status: Arc<dyn NodeStatusProvider>,
}

impl TransactionQueue {
    /// Create an empty queue ordered against `status`
    pub fn new(status: Arc<dyn NodeStatusProvider>) -> Self {
        Self {
            pending: Vec::new(),
            current: None,
            status,
        }
    }

    /// Number of pending transactions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The transaction being executed, if any
    pub fn current(&self) -> Option<TransactionId> {
        self.current
    }

    /// Add a pending transaction
    pub fn add(&mut self, transaction: Transaction) {
        trace!(
            transaction = %transaction.id(),
            priority = %transaction.priority(),
            pending = self.pending.len() + 1,
            "Queued transaction"
        );
        self.pending.push(transaction);
    }

    fn head_index(&self) -> Option<usize> {
        let status = self.status.as_ref();
        self.pending
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| service_key(t, status))
            .map(|(i, _)| i)
    }

    /// The highest-ranked pending transaction
    pub fn peek(&self) -> Option<&Transaction> {
        self.head_index().map(|i| &self.pending[i])
    }

    /// First pending transaction matching `predicate`
    pub fn find<P>(&self, predicate: P) -> Option<&Transaction>
    where
        P: Fn(&Transaction) -> bool,
    {
        self.pending.iter().find(|t| predicate(t))
    }

    /// Remove the highest-ranked transaction and mark it current
    pub fn start_next(&mut self) -> Option<Transaction> {
        let index = self.head_index()?;
        let transaction = self.pending.swap_remove(index);
        self.current = Some(transaction.id());
        debug!(
            transaction = %transaction.id(),
            priority = %transaction.priority(),
            remaining = self.pending.len(),
            "Starting transaction"
        );
        Some(transaction)
    }

    /// Clear the current marker once its transaction is done
    pub fn finish_current(&mut self, id: TransactionId) {
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Apply `decide` to every pending transaction.
    ///
    /// All decisions are collected before anything changes, so `decide` sees
    /// the queue as it was when the reduction started.
    pub fn reduce<F>(&mut self, decide: F) -> ReduceSummary
    where
        F: Fn(&Transaction) -> ReduceAction,
    {
        let decisions: Vec<ReduceAction> = self.pending.iter().map(&decide).collect();
        let mut summary = ReduceSummary::default();
        let mut kept = Vec::with_capacity(self.pending.len());

        for (mut transaction, action) in self.pending.drain(..).zip(decisions) {
            match action {
                ReduceAction::Keep => kept.push(transaction),
                ReduceAction::Drop => {
                    transaction.settle(Err(TransmitError::Dropped));
                    summary.dropped += 1;
                }
                ReduceAction::Reject(err) => {
                    transaction.settle(Err(err));
                    summary.rejected += 1;
                }
                ReduceAction::Requeue(priority) => {
                    if let Some(priority) = priority {
                        transaction.set_priority(priority);
                    }
                    kept.push(transaction);
                    summary.requeued += 1;
                }
            }
        }

        self.pending = kept;
        if summary != ReduceSummary::default() {
            debug!(
                dropped = summary.dropped,
                rejected = summary.rejected,
                requeued = summary.requeued,
                "Reduced transaction queue"
            );
        }
        summary
    }

    /// Move every pending transaction for `node` to `priority`, except
    /// those whose priority lets them through while the node sleeps
    pub fn requeue_node(&mut self, node: NodeId, priority: Priority) -> usize {
        let summary = self.reduce(|t| {
            if t.message().target_node_id() == Some(node)
                && !t.priority().bypasses_sleep()
                && t.priority() != priority
            {
                ReduceAction::Requeue(Some(priority))
            } else {
                ReduceAction::Keep
            }
        });
        summary.requeued
    }

    /// Remove everything, rejecting each transaction with `error`
    pub fn reject_all(&mut self, error: TransmitError) -> usize {
        let count = self.pending.len();
        for mut transaction in self.pending.drain(..) {
            transaction.settle(Err(error.clone()));
        }
        count
    }

    /// Pending transactions sorted in service order
    pub fn snapshot(&self) -> Vec<(TransactionId, Priority)> {
        let status = self.status.as_ref();
        // Keys are taken once so a status change mid-sort cannot reorder
        let mut order: Vec<&Transaction> = self.pending.iter().collect();
        order.sort_by_cached_key(|t| service_key(t, status));
        order.into_iter().map(|t| (t.id(), t.priority())).collect()
    }
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("pending", &self.pending.len())
            .field("current", &self.current)
            .finish()
    }
}
