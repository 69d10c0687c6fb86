//! TransmitPipeline - the sans-IO core of the driver
//!
//! The pipeline owns the transaction queue, the command sequencer and the
//! send session of the current transaction. It performs no I/O and never
//! looks at a clock: inputs come in through its `on_*` methods and
//! everything it wants done comes out as an [`Effect`] drained with
//! [`TransmitPipeline::poll_effect`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      TransmitPipeline                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  enqueue ──► TransactionQueue ──► SendSession (current)       │
//! │                                      │  ▲                     │
//! │                             Submit   │  │ CommandCompleted    │
//! │                                      ▼  │                     │
//! │  serial events ───────────────► CommandSequencer ──► Write    │
//! │        │                                                      │
//! │        └── unclaimed ──► UnsolicitedRouter ──► Unsolicited    │
//! │                                                               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two timers exist, one per machine layer. Starting a timer replaces a
//! running timer of the same kind.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::command_queue::{CommandSequencer, SequencerOutput};
use crate::config::{DriverConfig, TimeoutConfig};
use crate::error::TransmitError;
use crate::frame::{Frame, SerialEvent};
use crate::message::{Message, MessageCapabilities, NodeId};
use crate::node_status::NodeStatusProvider;
use crate::priority::Priority;
use crate::queue::{ReduceAction, ReduceSummary, TransactionQueue};
use crate::send_thread::{SendInput, SendOutcome, SendOutput, SendSession};
use crate::serial_command::{RetryNotice, SessionInput};
use crate::transaction::{ResultReceiver, ResultSlot, Transaction, TransactionId};
use crate::unsolicited::{InboundFrame, UnsolicitedRouter};

/// The two timers the pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// ACK, response, callback and serial retry waits
    SerialCommand,
    /// Handshake, node reply and send retry waits
    SendSession,
}

/// Something the pipeline wants its owner to do
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write these bytes to the controller
    Write(Bytes),
    /// Arm a timer, replacing a running one of the same kind
    StartTimer {
        /// Which timer
        timer: TimerKind,
        /// When it fires, from now
        duration: Duration,
    },
    /// Disarm a timer
    CancelTimer(TimerKind),
    /// A retry is about to happen
    RetryNotice(RetryNotice),
    /// A frame no session claimed
    Unsolicited(InboundFrame),
}

/// Whether a reduction is looking at a pending or the current transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSource {
    /// Waiting in the queue
    Pending,
    /// Being executed
    Current,
}

/// Pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Transactions enqueued
    pub enqueued: u64,
    /// Transactions settled with success
    pub completed: u64,
    /// Transactions settled with an error
    pub failed: u64,
    /// Transactions dropped by a reduction
    pub dropped: u64,
    /// Transactions deferred until their node wakes up
    pub deferred: u64,
    /// Frames written
    pub writes: u64,
    /// Serial command retries
    pub serial_retries: u64,
    /// Node-level SendData retries
    pub send_data_retries: u64,
    /// SendDataAbort commands issued
    pub aborts: u64,
    /// Frames forwarded as unsolicited
    pub unsolicited_frames: u64,
}

enum Work {
    Sequencer(SequencerOutput),
    Send(SendOutput),
}

/// Sans-IO transmission pipeline
pub struct TransmitPipeline {
    timeouts: TimeoutConfig,
    defer_sleeping: bool,
    status: Arc<dyn NodeStatusProvider>,
    queue: TransactionQueue,
    sequencer: CommandSequencer,
    session: Option<SendSession>,
    effects: VecDeque<Effect>,
    next_id: u64,
    stats: PipelineStats,
    stopped: bool,
}

impl TransmitPipeline {
    /// Create a pipeline
    pub fn new(config: &DriverConfig, status: Arc<dyn NodeStatusProvider>) -> Self {
        Self {
            timeouts: config.timeouts,
            defer_sleeping: config.queue.defer_sleeping_nodes,
            queue: TransactionQueue::new(status.clone()),
            status,
            sequencer: CommandSequencer::new(config.timeouts, config.attempts),
            session: None,
            effects: VecDeque::new(),
            next_id: 1,
            stats: PipelineStats::default(),
            stopped: false,
        }
    }

    /// Next effect to perform
    pub fn poll_effect(&mut self) -> Option<Effect> {
        self.effects.pop_front()
    }

    /// Current statistics
    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        stats.aborts = self.sequencer.aborts();
        stats
    }

    /// Number of transactions waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The transaction being executed
    pub fn current(&self) -> Option<TransactionId> {
        self.session.as_ref().map(|s| s.transaction_id())
    }

    /// Whether nothing is queued or in flight
    pub fn is_idle(&self) -> bool {
        self.session.is_none() && self.queue.is_empty() && self.sequencer.is_idle()
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Queue a message and get the receiver its result is settled into
    pub fn enqueue(&mut self, message: Message, priority: Priority) -> (TransactionId, ResultReceiver) {
        let (slot, rx) = ResultSlot::channel();
        let id = self.enqueue_with_slot(message, priority, slot, None);
        (id, rx)
    }

    /// Queue a message whose result goes into an existing slot
    pub fn enqueue_with_slot(
        &mut self,
        message: Message,
        priority: Priority,
        slot: ResultSlot,
        tag: Option<String>,
    ) -> TransactionId {
        let id = TransactionId(self.next_id);
        self.next_id += 1;

        let priority = match message.target_node_id() {
            Some(node) if !priority.bypasses_sleep() && !self.status.is_node_awake(node) => {
                debug!(transaction = %id, node = %node, "Target is asleep, waiting for wake up");
                Priority::WakeUp.max(priority)
            }
            _ => priority,
        };

        let mut transaction = Transaction::with_slot(id, message, priority, slot);
        if let Some(tag) = tag {
            transaction = transaction.with_tag(tag);
        }

        if self.stopped {
            transaction.settle(Err(TransmitError::DriverStopped));
            return id;
        }
        if let Err(e) = transaction.message().validate() {
            warn!(transaction = %id, error = %e, "Refusing message");
            transaction.settle(Err(TransmitError::Unsupported(e.to_string())));
            return id;
        }

        debug!(
            transaction = %id,
            command = %transaction.message().describe(),
            priority = %priority,
            "Enqueued transaction"
        );
        self.stats.enqueued += 1;
        self.queue.add(transaction);

        let mut work = VecDeque::new();
        self.advance(&mut work);
        self.run(work);
        id
    }

    /// Feed an event read from the controller
    pub fn on_serial_event(&mut self, event: SerialEvent) {
        match event {
            SerialEvent::Ack => self.link_input(SessionInput::Ack),
            SerialEvent::Nak => self.link_input(SessionInput::Nak),
            SerialEvent::Can => self.link_input(SessionInput::Can),
            SerialEvent::Frame(frame) => {
                let mut out = Vec::new();
                let consumed = self.sequencer.on_input(SessionInput::Frame(&frame), &mut out);
                self.run(out.into_iter().map(Work::Sequencer).collect());
                if !consumed {
                    self.on_unsolicited(frame);
                }
            }
        }
    }

    /// Report the result of the last [`Effect::Write`]
    pub fn on_write_result(&mut self, ok: bool) {
        let mut out = Vec::new();
        self.sequencer.on_write_result(ok, &mut out);
        self.run(out.into_iter().map(Work::Sequencer).collect());
    }

    /// A timer fired
    pub fn on_timeout(&mut self, timer: TimerKind) {
        match timer {
            TimerKind::SerialCommand => {
                let mut out = Vec::new();
                self.sequencer.on_timeout(&mut out);
                self.run(out.into_iter().map(Work::Sequencer).collect());
            }
            TimerKind::SendSession => {
                let mut out = Vec::new();
                if let Some(session) = self.session.as_mut() {
                    session.step(SendInput::Timeout, &mut out);
                }
                self.run(out.into_iter().map(Work::Send).collect());
            }
        }
    }

    /// Apply `decide` to every pending transaction and to the current one
    pub fn reduce_all<F>(&mut self, decide: F) -> ReduceSummary
    where
        F: Fn(&Transaction, TransactionSource) -> ReduceAction,
    {
        let mut summary = self.queue.reduce(|t| decide(t, TransactionSource::Pending));
        self.stats.dropped += summary.dropped as u64;
        self.stats.failed += summary.rejected as u64;

        let mut out = Vec::new();
        if let Some(session) = self.session.as_mut() {
            let action = decide(session.transaction(), TransactionSource::Current);
            let current = match &action {
                ReduceAction::Keep => ReduceSummary::default(),
                ReduceAction::Drop => ReduceSummary {
                    dropped: 1,
                    ..Default::default()
                },
                ReduceAction::Reject(_) => ReduceSummary {
                    rejected: 1,
                    ..Default::default()
                },
                ReduceAction::Requeue(_) => ReduceSummary {
                    requeued: 1,
                    ..Default::default()
                },
            };
            summary.merge(current);
            session.force(action, &mut out);
        }

        let mut work: VecDeque<Work> = out.into_iter().map(Work::Send).collect();
        self.advance(&mut work);
        self.run(work);
        summary
    }

    /// A node is awake now
    pub fn on_node_awake(&mut self, node: NodeId) {
        self.status.mark_node_awake(node);
        self.on_node_status_changed();
    }

    /// Node status changed outside the pipeline; re-evaluate the queue head
    pub fn on_node_status_changed(&mut self) {
        let mut work = VecDeque::new();
        self.advance(&mut work);
        self.run(work);
    }

    /// Reject everything with [`TransmitError::DriverStopped`] and stop accepting work
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let mut rejected = self.queue.reject_all(TransmitError::DriverStopped);
        if let Some(mut session) = self.session.take() {
            // The session's own outputs are moot once the link is gone
            let mut discarded = Vec::new();
            session.force(ReduceAction::Reject(TransmitError::DriverStopped), &mut discarded);
            rejected += 1;
        }
        self.stats.failed += rejected as u64;
        self.sequencer.clear();

        self.effects.push_back(Effect::CancelTimer(TimerKind::SerialCommand));
        self.effects.push_back(Effect::CancelTimer(TimerKind::SendSession));
        info!(rejected, "Transmission pipeline stopped");
    }

    fn link_input(&mut self, input: SessionInput<'_>) {
        let mut out = Vec::new();
        if !self.sequencer.on_input(input, &mut out) {
            trace!(?input, "Link event without a waiting command");
        }
        self.run(out.into_iter().map(Work::Sequencer).collect());
    }

    fn on_unsolicited(&mut self, frame: Frame) {
        match UnsolicitedRouter::classify(frame) {
            InboundFrame::NodeCommand(command) => {
                let mut out = Vec::new();
                let claimed = match self.session.as_mut() {
                    Some(session) => session.step(SendInput::NodeCommand(&command), &mut out),
                    None => false,
                };
                self.run(out.into_iter().map(Work::Send).collect());
                if !claimed {
                    self.emit_unsolicited(InboundFrame::NodeCommand(command));
                }
            }
            InboundFrame::NodeInfo { node_id, frame } => {
                self.status.mark_node_awake(node_id);
                let mut out = Vec::new();
                if let Some(session) = self.session.as_mut() {
                    session.step(SendInput::NodeInfo(node_id), &mut out);
                }
                let mut work: VecDeque<Work> = out.into_iter().map(Work::Send).collect();
                self.advance(&mut work);
                self.run(work);
                self.emit_unsolicited(InboundFrame::NodeInfo { node_id, frame });
            }
            other => self.emit_unsolicited(other),
        }
    }

    fn emit_unsolicited(&mut self, frame: InboundFrame) {
        self.stats.unsolicited_frames += 1;
        self.effects.push_back(Effect::Unsolicited(frame));
    }

    fn run(&mut self, mut work: VecDeque<Work>) {
        while let Some(item) = work.pop_front() {
            match item {
                Work::Sequencer(output) => self.on_sequencer_output(output, &mut work),
                Work::Send(output) => self.on_send_output(output, &mut work),
            }
        }
    }

    fn on_sequencer_output(&mut self, output: SequencerOutput, work: &mut VecDeque<Work>) {
        match output {
            SequencerOutput::Write(bytes) => {
                self.stats.writes += 1;
                self.effects.push_back(Effect::Write(bytes));
            }
            SequencerOutput::StartTimer(duration) => self.effects.push_back(Effect::StartTimer {
                timer: TimerKind::SerialCommand,
                duration,
            }),
            SequencerOutput::CancelTimer => {
                self.effects.push_back(Effect::CancelTimer(TimerKind::SerialCommand))
            }
            SequencerOutput::Retry(notice) => {
                self.stats.serial_retries += 1;
                self.effects.push_back(Effect::RetryNotice(notice));
            }
            SequencerOutput::Completed { request, result } => {
                let mut out = Vec::new();
                let claimed = match self.session.as_mut() {
                    Some(session) if session.transaction_id() == request.transaction => session.step(
                        SendInput::CommandCompleted {
                            request,
                            result: &result,
                        },
                        &mut out,
                    ),
                    _ => false,
                };
                if !claimed {
                    trace!(transaction = %request.transaction, "Dropping result of orphaned command");
                }
                work.extend(out.into_iter().map(Work::Send));
            }
        }
    }

    fn on_send_output(&mut self, output: SendOutput, work: &mut VecDeque<Work>) {
        match output {
            SendOutput::Submit(request) => {
                let mut out = Vec::new();
                self.sequencer.submit(request, &mut out);
                work.extend(out.into_iter().map(Work::Sequencer));
            }
            SendOutput::StartTimer(duration) => self.effects.push_back(Effect::StartTimer {
                timer: TimerKind::SendSession,
                duration,
            }),
            SendOutput::CancelTimer => {
                self.effects.push_back(Effect::CancelTimer(TimerKind::SendSession))
            }
            SendOutput::Retry(notice) => {
                self.stats.send_data_retries += 1;
                self.effects.push_back(Effect::RetryNotice(notice));
            }
            SendOutput::Finished(outcome) => {
                self.finish_session(outcome);
                self.advance(work);
            }
        }
    }

    fn finish_session(&mut self, outcome: SendOutcome) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = session.transaction_id();
        self.queue.finish_current(id);
        let cancelled = self.sequencer.cancel_pending(id);
        if cancelled > 0 {
            trace!(transaction = %id, cancelled, "Cancelled waiting commands");
        }
        self.effects.push_back(Effect::CancelTimer(TimerKind::SendSession));

        match outcome {
            SendOutcome::Completed => self.stats.completed += 1,
            SendOutcome::Failed(_) => self.stats.failed += 1,
            SendOutcome::Dropped => self.stats.dropped += 1,
            SendOutcome::Deferred(node) => {
                self.stats.deferred += 1;
                self.status.mark_node_asleep(node);
                let mut transaction = session.into_transaction();
                transaction.set_priority(Priority::WakeUp);
                self.queue.add(transaction);
                let moved = self.queue.requeue_node(node, Priority::WakeUp);
                debug!(node = %node, transaction = %id, moved, "Deferred transactions until wake up");
            }
            SendOutcome::Requeued(_) => {
                self.queue.add(session.into_transaction());
            }
        }
    }

    fn advance(&mut self, work: &mut VecDeque<Work>) {
        if self.stopped || self.session.is_some() {
            return;
        }

        loop {
            let Some(head) = self.queue.peek() else {
                return;
            };
            let node = head.message().target_node_id();
            let priority = head.priority();
            let asleep = node.map(|n| !self.status.is_node_awake(n)).unwrap_or(false);

            if !asleep || priority.bypasses_sleep() {
                break;
            }
            if priority == Priority::WakeUp {
                // Everything behind a sleeping WakeUp head waits as well
                trace!(pending = self.queue.len(), "Queue head is waiting for a sleeping node");
                return;
            }
            if let Some(node) = node {
                // Node fell asleep after these were queued
                self.queue.requeue_node(node, Priority::WakeUp);
            }
        }

        let Some(transaction) = self.queue.start_next() else {
            return;
        };
        let mut session = SendSession::new(
            transaction,
            self.timeouts,
            self.defer_sleeping,
            self.status.clone(),
        );
        let mut out = Vec::new();
        session.step(SendInput::Start, &mut out);
        self.session = Some(session);
        work.extend(out.into_iter().map(Work::Send));
    }
}

impl std::fmt::Debug for TransmitPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitPipeline")
            .field("queue", &self.queue)
            .field("session", &self.session)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FunctionType;
    use crate::message::{GetControllerVersion, NodeCommand, SendDataRequest};
    use crate::node_status::{ListeningMode, NodeStatusTable};
    use crate::transaction::TransmitReply;

    fn pipeline(status: Arc<NodeStatusTable>) -> TransmitPipeline {
        TransmitPipeline::new(&DriverConfig::default(), status)
    }

    fn drain(p: &mut TransmitPipeline) -> Vec<Effect> {
        std::iter::from_fn(|| p.poll_effect()).collect()
    }

    fn writes(effects: &[Effect]) -> usize {
        effects.iter().filter(|e| matches!(e, Effect::Write(_))).count()
    }

    #[tokio::test]
    async fn test_send_data_round_trip() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        let (_, rx) = p.enqueue(Message::ping(NodeId(2)), Priority::Normal);

        let effects = drain(&mut p);
        assert_eq!(writes(&effects), 1);

        p.on_write_result(true);
        assert_eq!(
            drain(&mut p),
            vec![Effect::StartTimer {
                timer: TimerKind::SerialCommand,
                duration: Duration::from_millis(1600)
            }]
        );

        p.on_serial_event(SerialEvent::Ack);
        p.on_serial_event(Frame::response(FunctionType::SEND_DATA, vec![0x01]).into());
        let callback = Frame::request(FunctionType::SEND_DATA, vec![0x01, 0x00]);
        p.on_serial_event(callback.clone().into());

        assert_eq!(rx.await.unwrap(), Ok(TransmitReply::Controller(callback)));
        assert!(p.is_idle());
        let stats = p.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_asleep_target_waits_for_wake_up() {
        let status = Arc::new(NodeStatusTable::new());
        status.insert(NodeId(9), ListeningMode::Sleeping);
        let mut p = pipeline(status);

        let (_, _rx) = p.enqueue(Message::ping(NodeId(9)), Priority::Normal);
        assert_eq!(writes(&drain(&mut p)), 0);
        assert_eq!(p.pending(), 1);

        p.on_node_awake(NodeId(9));
        assert_eq!(writes(&drain(&mut p)), 1);
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn test_unclaimed_frames_are_forwarded() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        p.on_serial_event(
            Frame::request(FunctionType::APPLICATION_COMMAND, vec![0x00, 0x05, 0x02, 0x20, 0x01]).into(),
        );

        let effects = drain(&mut p);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Unsolicited(InboundFrame::NodeCommand(cmd))] if cmd.node_id == NodeId(5)
        ));
        assert_eq!(p.stats().unsolicited_frames, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_everything() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        let (_, current) = p.enqueue(Message::controller(GetControllerVersion), Priority::Controller);
        let (_, pending) = p.enqueue(Message::ping(NodeId(4)), Priority::Normal);

        p.shutdown();
        assert_eq!(current.await.unwrap(), Err(TransmitError::DriverStopped));
        assert_eq!(pending.await.unwrap(), Err(TransmitError::DriverStopped));

        let (_, late) = p.enqueue(Message::ping(NodeId(4)), Priority::Normal);
        assert_eq!(late.await.unwrap(), Err(TransmitError::DriverStopped));
    }

    #[tokio::test]
    async fn test_reduce_all_drops_current_and_starts_next() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        let (first, current) = p.enqueue(Message::ping(NodeId(3)), Priority::Normal);
        let (_, next) = p.enqueue(Message::ping(NodeId(4)), Priority::Normal);
        drain(&mut p);

        let summary = p.reduce_all(|t, source| {
            if t.id() == first {
                assert_eq!(source, TransactionSource::Current);
                ReduceAction::Drop
            } else {
                ReduceAction::Keep
            }
        });
        assert_eq!(summary.dropped, 1);
        assert_eq!(current.await.unwrap(), Err(TransmitError::Dropped));
        assert_eq!(p.current().map(|id| id.0), Some(2));

        // The orphaned session still owns the link until it completes
        p.on_write_result(true);
        p.on_serial_event(SerialEvent::Ack);
        p.on_serial_event(Frame::response(FunctionType::SEND_DATA, vec![0x01]).into());
        p.on_serial_event(Frame::request(FunctionType::SEND_DATA, vec![0x01, 0x00]).into());
        let effects = drain(&mut p);
        assert_eq!(writes(&effects), 1);

        p.on_write_result(true);
        p.on_serial_event(SerialEvent::Ack);
        p.on_serial_event(Frame::response(FunctionType::SEND_DATA, vec![0x01]).into());
        p.on_serial_event(Frame::request(FunctionType::SEND_DATA, vec![0x02, 0x00]).into());
        assert!(next.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_requeued_current_ignores_result_of_old_attempt() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        let (_, mut rx) = p.enqueue(Message::ping(NodeId(3)), Priority::Normal);
        p.on_write_result(true);
        p.on_serial_event(SerialEvent::Ack);
        drain(&mut p);

        let summary = p.reduce_all(|_, _| ReduceAction::Requeue(Some(Priority::Poll)));
        assert_eq!(summary.requeued, 1);
        assert_eq!(writes(&drain(&mut p)), 0);

        // The old attempt finishes on the wire
        p.on_serial_event(Frame::response(FunctionType::SEND_DATA, vec![0x01]).into());
        p.on_serial_event(Frame::request(FunctionType::SEND_DATA, vec![0x01, 0x00]).into());
        assert!(rx.try_recv().is_err());

        let effects = drain(&mut p);
        let written: Vec<&Bytes> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Write(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(written.len(), 1);
        // SOF len type func node cc_len cc tx_options callback_id checksum
        assert_eq!(written[0][written[0].len() - 2], 0x02);

        p.on_write_result(true);
        p.on_serial_event(SerialEvent::Ack);
        p.on_serial_event(Frame::response(FunctionType::SEND_DATA, vec![0x01]).into());
        let callback = Frame::request(FunctionType::SEND_DATA, vec![0x02, 0x00]);
        p.on_serial_event(callback.clone().into());

        assert_eq!(rx.await.unwrap(), Ok(TransmitReply::Controller(callback)));
        let stats = p.stats();
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.completed, 1);
        assert!(p.is_idle());
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        let (_, rx) = p.enqueue(Message::send_data(NodeId(5), Blob(400)), Priority::Normal);

        assert!(matches!(rx.await.unwrap(), Err(TransmitError::Unsupported(_))));
        assert_eq!(writes(&drain(&mut p)), 0);
        assert!(p.is_idle());
    }

    #[tokio::test]
    async fn test_node_info_completes_ping() {
        let mut p = pipeline(Arc::new(NodeStatusTable::new()));
        let (_, rx) = p.enqueue(Message::ping(NodeId(7)), Priority::Ping);
        p.on_write_result(true);
        p.on_serial_event(SerialEvent::Ack);
        drain(&mut p);

        p.on_serial_event(
            Frame::request(FunctionType::APPLICATION_UPDATE, vec![0x84, 0x07, 0x00]).into(),
        );
        assert_eq!(rx.await.unwrap(), Ok(TransmitReply::NodeInfo(NodeId(7))));
        let effects = drain(&mut p);
        assert!(effects.iter().any(|e| matches!(e, Effect::Unsolicited(InboundFrame::NodeInfo { .. }))));
    }

    #[tokio::test]
    async fn test_node_failure_defers_sleeping_target() {
        let status = Arc::new(NodeStatusTable::new());
        status.insert(NodeId(12), ListeningMode::Sleeping);
        status.mark_node_awake(NodeId(12));
        let mut p = pipeline(status.clone());

        let message = Message::SendData(
            SendDataRequest::new(NodeId(12), Arc::new(BasicSet)).with_max_send_attempts(1),
        );
        let (_, mut rx) = p.enqueue(message, Priority::Normal);

        p.on_write_result(true);
        p.on_serial_event(SerialEvent::Ack);
        p.on_serial_event(Frame::response(FunctionType::SEND_DATA, vec![0x01]).into());
        p.on_serial_event(Frame::request(FunctionType::SEND_DATA, vec![0x01, 0x01]).into());

        assert!(!status.is_node_awake(NodeId(12)));
        assert_eq!(p.pending(), 1);
        assert_eq!(p.stats().deferred, 1);
        assert!(rx.try_recv().is_err());

        p.on_node_awake(NodeId(12));
        assert!(drain(&mut p).iter().any(|e| matches!(e, Effect::Write(_))));
    }

    #[derive(Debug)]
    struct Blob(usize);

    impl NodeCommand for Blob {
        fn name(&self) -> &str {
            "Blob"
        }
        fn encode(&self) -> Bytes {
            Bytes::from(vec![0x55; self.0])
        }
    }

    #[derive(Debug)]
    struct BasicSet;

    impl NodeCommand for BasicSet {
        fn name(&self) -> &str {
            "BasicSet"
        }
        fn encode(&self) -> Bytes {
            Bytes::from_static(&[0x20, 0x01, 0xFF])
        }
    }
}
