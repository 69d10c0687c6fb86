//! Command sequencer
//!
//! The only writer to the serial link. Commands submitted by send sessions
//! wait here until the single serial command session slot is free. A
//! SendData-class command whose callback never arrives is followed by exactly
//! one SendDataAbort before its failure is reported back.

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::{AttemptConfig, TimeoutConfig};
use crate::error::FailureReason;
use crate::message::{Message, MessageCapabilities};
use crate::priority::Priority;
use crate::serial_command::{
    CommandFailure, CommandResult, RetryNotice, SerialCommandSession, SessionInput, SessionOutput,
};
use crate::transaction::TransactionId;

/// Identifies one command submitted on behalf of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    /// Owning transaction
    pub transaction: TransactionId,
    /// Sequence number within the transaction
    pub seq: u32,
}

/// A command waiting for the serial link
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Request id
    pub id: RequestId,
    /// Message to send
    pub message: Message,
    /// Ordering among waiting commands
    pub priority: Priority,
}

/// What the sequencer asks its owner to do
#[derive(Debug, Clone, PartialEq)]
pub enum SequencerOutput {
    /// Write these bytes to the port
    Write(Bytes),
    /// Arm the serial command timer
    StartTimer(Duration),
    /// Disarm the serial command timer
    CancelTimer,
    /// A serial retry is about to happen
    Retry(RetryNotice),
    /// A submitted command finished
    Completed {
        /// The request that finished
        request: RequestId,
        /// Its result
        result: CommandResult,
    },
}

#[derive(Debug)]
enum Phase {
    Command,
    Aborting(CommandFailure),
}

#[derive(Debug)]
struct Active {
    request: RequestId,
    session: SerialCommandSession,
    phase: Phase,
}

/// Serializes serial command sessions
#[derive(Debug)]
pub struct CommandSequencer {
    pending: Vec<(u64, CommandRequest)>,
    next_order: u64,
    active: Option<Active>,
    next_callback_id: u8,
    timeouts: TimeoutConfig,
    attempts: AttemptConfig,
    aborts: u64,
}

impl CommandSequencer {
    /// Create an idle sequencer
    pub fn new(timeouts: TimeoutConfig, attempts: AttemptConfig) -> Self {
        Self {
            pending: Vec::new(),
            next_order: 0,
            active: None,
            next_callback_id: 1,
            timeouts,
            attempts,
            aborts: 0,
        }
    }

    /// Whether no session is running and nothing is waiting
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// The request whose session is currently running
    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|a| a.request)
    }

    /// Number of SendDataAbort sessions run so far
    pub fn aborts(&self) -> u64 {
        self.aborts
    }

    /// Queue a command and start it if the link is free
    pub fn submit(&mut self, request: CommandRequest, out: &mut Vec<SequencerOutput>) {
        trace!(
            transaction = %request.id.transaction,
            seq = request.id.seq,
            command = %request.message.describe(),
            "Command submitted"
        );
        let order = self.next_order;
        self.next_order += 1;
        self.pending.push((order, request));
        self.advance(out);
    }

    /// Drop commands of `transaction` that have not started yet
    pub fn cancel_pending(&mut self, transaction: TransactionId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(_, r)| r.id.transaction != transaction);
        before - self.pending.len()
    }

    /// Report the result of the last write
    pub fn on_write_result(&mut self, ok: bool, out: &mut Vec<SequencerOutput>) {
        let input = if ok {
            SessionInput::WriteCompleted
        } else {
            SessionInput::WriteFailed
        };
        self.on_input(input, out);
    }

    /// The serial command timer fired
    pub fn on_timeout(&mut self, out: &mut Vec<SequencerOutput>) {
        self.on_input(SessionInput::Timeout, out);
    }

    /// Offer a link event to the running session. Returns whether it was consumed.
    pub fn on_input(&mut self, input: SessionInput<'_>, out: &mut Vec<SequencerOutput>) -> bool {
        let mut session_out = Vec::new();
        let consumed = match self.active.as_mut() {
            Some(active) => active.session.step(input, &mut session_out),
            None => false,
        };
        self.forward(session_out, out);
        consumed
    }

    /// Forget everything, e.g. when the driver stops
    pub fn clear(&mut self) {
        self.pending.clear();
        self.active = None;
    }

    fn forward(&mut self, session_out: Vec<SessionOutput>, out: &mut Vec<SequencerOutput>) {
        for output in session_out {
            match output {
                SessionOutput::Write(bytes) => out.push(SequencerOutput::Write(bytes)),
                SessionOutput::StartTimer(d) => out.push(SequencerOutput::StartTimer(d)),
                SessionOutput::CancelTimer => out.push(SequencerOutput::CancelTimer),
                SessionOutput::Retry(notice) => out.push(SequencerOutput::Retry(notice)),
                SessionOutput::Completed(result) => self.on_session_completed(result, out),
            }
        }
    }

    fn on_session_completed(&mut self, result: CommandResult, out: &mut Vec<SequencerOutput>) {
        let Some(active) = self.active.take() else {
            return;
        };

        match active.phase {
            Phase::Command => match result {
                Err(failure)
                    if failure.reason == FailureReason::CallbackTimeout
                        && active.session.message().is_send_data_class() =>
                {
                    self.start_abort(active.request, failure, out);
                    return;
                }
                result => out.push(SequencerOutput::Completed {
                    request: active.request,
                    result,
                }),
            },
            Phase::Aborting(failure) => {
                if let Err(abort_failure) = result {
                    warn!(reason = %abort_failure.reason, "SendDataAbort failed");
                }
                out.push(SequencerOutput::Completed {
                    request: active.request,
                    result: Err(failure),
                });
            }
        }

        self.advance(out);
    }

    fn start_abort(&mut self, request: RequestId, mut failure: CommandFailure, out: &mut Vec<SequencerOutput>) {
        info!(transaction = %request.transaction, "Aborting SendData after callback timeout");
        failure.aborted = true;
        self.aborts += 1;
        let session = SerialCommandSession::new(
            Message::SendDataAbort,
            0,
            self.attempts.controller,
            self.timeouts,
        );
        self.run(request, session, Phase::Aborting(failure), out);
    }

    fn advance(&mut self, out: &mut Vec<SequencerOutput>) {
        if self.active.is_some() {
            return;
        }
        let Some(index) = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, (order, r))| (r.priority, *order))
            .map(|(i, _)| i)
        else {
            return;
        };

        let (_, request) = self.pending.remove(index);
        let callback_id = if request.message.expects_callback() {
            self.allocate_callback_id()
        } else {
            0
        };
        let max_attempts = if request.message.is_send_data_class() {
            self.attempts.send_data_serial
        } else {
            self.attempts.controller
        };
        debug!(
            transaction = %request.id.transaction,
            command = %request.message.describe(),
            callback_id,
            "Starting serial command"
        );
        let session = SerialCommandSession::new(request.message, callback_id, max_attempts, self.timeouts);
        self.run(request.id, session, Phase::Command, out);
    }

    fn run(
        &mut self,
        request: RequestId,
        session: SerialCommandSession,
        phase: Phase,
        out: &mut Vec<SequencerOutput>,
    ) {
        self.active = Some(Active {
            request,
            session,
            phase,
        });
        self.on_input(SessionInput::Start, out);
    }

    fn allocate_callback_id(&mut self) -> u8 {
        let id = self.next_callback_id;
        self.next_callback_id = self.next_callback_id.checked_add(1).unwrap_or(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FunctionType, SerialEvent};
    use crate::message::{GetControllerVersion, NodeId};

    fn request(tx: u64, message: Message, priority: Priority) -> CommandRequest {
        CommandRequest {
            id: RequestId {
                transaction: TransactionId(tx),
                seq: 0,
            },
            message,
            priority,
        }
    }

    fn writes(out: &[SequencerOutput]) -> Vec<Bytes> {
        out.iter()
            .filter_map(|o| match o {
                SequencerOutput::Write(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    fn completions(out: &[SequencerOutput]) -> Vec<(RequestId, CommandResult)> {
        out.iter()
            .filter_map(|o| match o {
                SequencerOutput::Completed { request, result } => Some((*request, result.clone())),
                _ => None,
            })
            .collect()
    }

    fn link(seq: &mut CommandSequencer, event: SerialEvent, out: &mut Vec<SequencerOutput>) {
        let input = match &event {
            SerialEvent::Ack => SessionInput::Ack,
            SerialEvent::Nak => SessionInput::Nak,
            SerialEvent::Can => SessionInput::Can,
            SerialEvent::Frame(f) => SessionInput::Frame(f),
        };
        seq.on_input(input, out);
    }

    #[test]
    fn test_callback_timeout_runs_one_abort() {
        let mut seq = CommandSequencer::new(TimeoutConfig::default(), AttemptConfig::default());
        let mut out = Vec::new();

        seq.submit(request(1, Message::ping(NodeId(3)), Priority::Ping), &mut out);
        assert_eq!(writes(&out).len(), 1);

        seq.on_write_result(true, &mut out);
        link(&mut seq, SerialEvent::Ack, &mut out);
        link(
            &mut seq,
            Frame::response(FunctionType::SEND_DATA, vec![0x01]).into(),
            &mut out,
        );
        out.clear();

        seq.on_timeout(&mut out);
        let abort_frame = Message::SendDataAbort.to_frame(0).encode().unwrap();
        assert_eq!(writes(&out), vec![abort_frame]);
        assert!(completions(&out).is_empty());

        seq.on_write_result(true, &mut out);
        link(&mut seq, SerialEvent::Ack, &mut out);

        let done = completions(&out);
        assert_eq!(done.len(), 1);
        let failure = done[0].1.clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::CallbackTimeout);
        assert!(failure.aborted);
        assert_eq!(seq.aborts(), 1);
        assert!(seq.is_idle());
    }

    #[test]
    fn test_abort_failure_still_reports_original() {
        let mut seq = CommandSequencer::new(TimeoutConfig::default(), AttemptConfig::default());
        let mut out = Vec::new();
        seq.submit(request(1, Message::ping(NodeId(3)), Priority::Ping), &mut out);
        seq.on_write_result(true, &mut out);
        link(&mut seq, SerialEvent::Ack, &mut out);
        link(
            &mut seq,
            Frame::response(FunctionType::SEND_DATA, vec![0x01]).into(),
            &mut out,
        );
        seq.on_timeout(&mut out);
        out.clear();

        // Abort never gets written
        for _ in 0..3 {
            seq.on_write_result(false, &mut out);
            seq.on_timeout(&mut out);
        }

        let done = completions(&out);
        assert_eq!(done.len(), 1);
        assert_eq!(
            done[0].1.clone().unwrap_err().reason,
            FailureReason::CallbackTimeout
        );
        assert_eq!(seq.aborts(), 1);
    }

    #[test]
    fn test_one_session_at_a_time() {
        let mut seq = CommandSequencer::new(TimeoutConfig::default(), AttemptConfig::default());
        let mut out = Vec::new();

        seq.submit(request(1, Message::controller(GetControllerVersion), Priority::Controller), &mut out);
        seq.submit(request(2, Message::controller(GetControllerVersion), Priority::Normal), &mut out);
        seq.submit(request(3, Message::controller(GetControllerVersion), Priority::Immediate), &mut out);
        assert_eq!(writes(&out).len(), 1);
        assert_eq!(seq.active_request().map(|r| r.transaction), Some(TransactionId(1)));

        out.clear();
        seq.on_write_result(true, &mut out);
        link(&mut seq, SerialEvent::Ack, &mut out);
        link(
            &mut seq,
            Frame::response(FunctionType::GET_CONTROLLER_VERSION, vec![0x00]).into(),
            &mut out,
        );

        assert_eq!(completions(&out).len(), 1);
        assert_eq!(writes(&out).len(), 1);
        // Immediate outranks Normal
        assert_eq!(seq.active_request().map(|r| r.transaction), Some(TransactionId(3)));
    }

    #[test]
    fn test_callback_ids_wrap_and_skip_zero() {
        let mut seq = CommandSequencer::new(TimeoutConfig::default(), AttemptConfig::default());
        let ids: Vec<u8> = (0..256).map(|_| seq.allocate_callback_id()).collect();
        assert_eq!(ids[0], 1);
        assert_eq!(ids[254], 255);
        assert_eq!(ids[255], 1);
        assert!(!ids.contains(&0));
    }

    #[test]
    fn test_cancel_pending() {
        let mut seq = CommandSequencer::new(TimeoutConfig::default(), AttemptConfig::default());
        let mut out = Vec::new();
        seq.submit(request(1, Message::ping(NodeId(2)), Priority::Normal), &mut out);
        seq.submit(request(2, Message::ping(NodeId(3)), Priority::Normal), &mut out);

        assert_eq!(seq.cancel_pending(TransactionId(2)), 1);
        assert_eq!(seq.cancel_pending(TransactionId(1)), 0);
    }
}
