//! Send session: the top-level machine for one transaction
//!
//! ```text
//! Init -> [Handshake] -> Execute -> [WaitForUpdate] -> Done
//!   ^                       |              |
//!   +------ RetryWait <-----+--------------+
//! ```
//!
//! Only SendData-class messages get node-level retries. Serial commands are
//! handed to the [`CommandSequencer`](crate::command_queue::CommandSequencer)
//! as [`CommandRequest`]s and their results come back through
//! [`SendInput::CommandCompleted`]. The session is the only place a
//! transaction's result is settled.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::command_queue::{CommandRequest, RequestId};
use crate::config::TimeoutConfig;
use crate::error::{FailureReason, TransmitError};
use crate::frame::Frame;
use crate::message::{InboundCommand, Message, MessageCapabilities, NodeCommand, NodeId, SendDataRequest};
use crate::node_status::NodeStatusProvider;
use crate::priority::Priority;
use crate::queue::ReduceAction;
use crate::serial_command::{CommandResult, RetryLayer, RetryNotice};
use crate::transaction::{Transaction, TransactionId, TransmitReply, TransmitResult};

/// Events fed into a send session
#[derive(Debug, Clone, Copy)]
pub enum SendInput<'a> {
    /// Begin the first attempt
    Start,
    /// A submitted command finished
    CommandCompleted {
        /// Which submission finished
        request: RequestId,
        /// Its result
        result: &'a CommandResult,
    },
    /// A command received from a node
    NodeCommand(&'a InboundCommand),
    /// A node information frame was received
    NodeInfo(NodeId),
    /// The session timer fired
    Timeout,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Settled with success
    Completed,
    /// Settled with an error
    Failed(TransmitError),
    /// Settled with [`TransmitError::Dropped`]
    Dropped,
    /// Not settled; the target is asleep and the transaction waits for it
    Deferred(NodeId),
    /// Not settled; the transaction goes back into the queue
    Requeued(Option<Priority>),
}

/// What a send session asks its owner to do
#[derive(Debug, Clone)]
pub enum SendOutput {
    /// Hand a command to the sequencer
    Submit(CommandRequest),
    /// Arm the session timer, replacing any running one
    StartTimer(Duration),
    /// Disarm the session timer
    CancelTimer,
    /// A node-level retry is about to happen
    Retry(RetryNotice),
    /// The session is done
    Finished(SendOutcome),
}

#[derive(Debug)]
enum SendState {
    Init,
    Handshake {
        command: Arc<dyn NodeCommand>,
        node: NodeId,
        sent: bool,
        reply: bool,
    },
    Execute,
    AbortThenRetry {
        reason: FailureReason,
        partial: Option<Frame>,
    },
    WaitForUpdate,
    RetryWait,
    Done,
}

/// Drives one transaction to completion
pub struct SendSession {
    transaction: Transaction,
    state: SendState,
    timeouts: TimeoutConfig,
    defer_sleeping: bool,
    status: Arc<dyn NodeStatusProvider>,
    awaiting: Option<u32>,
    callback_nok_seen: bool,
    early_reply: Option<InboundCommand>,
}

impl SendSession {
    /// Create a session for `transaction`
    pub fn new(
        transaction: Transaction,
        timeouts: TimeoutConfig,
        defer_sleeping: bool,
        status: Arc<dyn NodeStatusProvider>,
    ) -> Self {
        Self {
            transaction,
            state: SendState::Init,
            timeouts,
            defer_sleeping,
            status,
            awaiting: None,
            callback_nok_seen: false,
            early_reply: None,
        }
    }

    /// Id of the transaction being sent
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// The transaction being sent
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Whether the session reached its end
    pub fn is_done(&self) -> bool {
        matches!(self.state, SendState::Done)
    }

    /// Give the transaction back, e.g. to requeue it
    pub fn into_transaction(self) -> Transaction {
        self.transaction
    }

    /// Feed one input. Returns whether the input was claimed by this session.
    pub fn step(&mut self, input: SendInput<'_>, out: &mut Vec<SendOutput>) -> bool {
        if self.is_done() {
            return false;
        }
        match input {
            SendInput::Start => {
                if matches!(self.state, SendState::Init) {
                    self.init(out);
                }
                true
            }
            SendInput::CommandCompleted { request, result } => {
                if request.transaction != self.transaction.id() || self.awaiting != Some(request.seq) {
                    trace!(transaction = %request.transaction, seq = request.seq, "Ignoring stale command result");
                    return false;
                }
                self.awaiting = None;
                self.on_command_completed(result, out);
                true
            }
            SendInput::NodeCommand(command) => self.on_node_command(command, out),
            SendInput::NodeInfo(node) => self.on_node_info(node, out),
            SendInput::Timeout => {
                self.on_timeout(out);
                true
            }
        }
    }

    /// Apply a reduction decision to the running transaction
    pub fn force(&mut self, action: ReduceAction, out: &mut Vec<SendOutput>) {
        if self.is_done() {
            return;
        }
        match action {
            ReduceAction::Keep => {}
            ReduceAction::Drop => {
                self.end(out);
                self.transaction.settle(Err(TransmitError::Dropped));
                out.push(SendOutput::Finished(SendOutcome::Dropped));
            }
            ReduceAction::Reject(err) => {
                self.end(out);
                self.transaction.settle(Err(err.clone()));
                out.push(SendOutput::Finished(SendOutcome::Failed(err)));
            }
            ReduceAction::Requeue(priority) => {
                self.end(out);
                if let Some(priority) = priority {
                    self.transaction.set_priority(priority);
                }
                self.transaction.reset_attempts();
                out.push(SendOutput::Finished(SendOutcome::Requeued(priority)));
            }
        }
    }

    fn init(&mut self, out: &mut Vec<SendOutput>) {
        let message = self.transaction.message().clone();
        if message.is_send_data_class() {
            let attempt = self.transaction.record_send_attempt();
            debug!(
                transaction = %self.transaction.id(),
                attempt,
                max_attempts = message.max_send_attempts(),
                "Send attempt"
            );
        }

        if !message.requires_pre_transmit_handshake() {
            self.execute(out);
            return;
        }
        if message.is_multicast() {
            let err = TransmitError::Unsupported(format!(
                "{} requires a handshake, which multicast cannot perform",
                message.describe()
            ));
            self.reject(err, out);
            return;
        }

        let handshake = message
            .node_command()
            .and_then(|cmd| cmd.pre_transmit_handshake());
        match (handshake, message.target_node_id()) {
            (Some(command), Some(node)) => {
                trace!(transaction = %self.transaction.id(), handshake = command.name(), "Starting handshake");
                let request = Message::SendData(
                    SendDataRequest::new(node, command.clone()).with_max_send_attempts(1),
                );
                self.state = SendState::Handshake {
                    command,
                    node,
                    sent: false,
                    reply: false,
                };
                self.submit(request, Priority::PreTransmitHandshake, out);
            }
            _ => self.execute(out),
        }
    }

    fn execute(&mut self, out: &mut Vec<SendOutput>) {
        self.state = SendState::Execute;
        self.early_reply = None;
        let message = self.transaction.message().clone();
        let priority = self.transaction.priority();
        self.submit(message, priority, out);
    }

    fn submit(&mut self, message: Message, priority: Priority, out: &mut Vec<SendOutput>) {
        let seq = self.transaction.next_request_seq();
        self.awaiting = Some(seq);
        out.push(SendOutput::Submit(CommandRequest {
            id: RequestId {
                transaction: self.transaction.id(),
                seq,
            },
            message,
            priority,
        }));
    }

    fn on_command_completed(&mut self, result: &CommandResult, out: &mut Vec<SendOutput>) {
        let state = std::mem::replace(&mut self.state, SendState::Done);
        match state {
            SendState::Handshake {
                command,
                node,
                reply,
                ..
            } => match result {
                Ok(_) if reply => self.execute(out),
                Ok(_) => {
                    self.state = SendState::Handshake {
                        command,
                        node,
                        sent: true,
                        reply: false,
                    };
                    out.push(SendOutput::StartTimer(self.timeouts.handshake));
                }
                Err(failure) => {
                    self.on_send_data_failure(failure.reason, failure.partial.clone(), failure.aborted, out)
                }
            },
            SendState::Execute => match result {
                Ok(reply) => {
                    let message = self.transaction.message();
                    if let Some(early) = self.early_reply.take() {
                        self.succeed(TransmitReply::Node(early), out);
                    } else if message.expects_node_reply() {
                        self.state = SendState::WaitForUpdate;
                        out.push(SendOutput::StartTimer(self.timeouts.node_update));
                    } else {
                        let value = match reply.final_frame() {
                            Some(frame) => TransmitReply::Controller(frame.clone()),
                            None => TransmitReply::Acknowledged,
                        };
                        self.succeed(value, out);
                    }
                }
                Err(failure) if !self.transaction.message().is_send_data_class() => {
                    let err = TransmitError::from_reason(
                        failure.reason,
                        self.transaction.message().describe(),
                        failure.attempts,
                        failure.partial.clone(),
                    );
                    self.reject(err, out);
                }
                Err(failure) => {
                    if failure.reason == FailureReason::CallbackNok {
                        self.callback_nok_seen = true;
                    }
                    self.on_send_data_failure(failure.reason, failure.partial.clone(), failure.aborted, out)
                }
            },
            SendState::AbortThenRetry { reason, partial } => {
                if let Err(failure) = result {
                    warn!(reason = %failure.reason, "SendDataAbort failed");
                }
                self.retry(reason, partial, out);
            }
            other => {
                trace!(state = ?other, "Command result in unexpected state");
                self.state = other;
            }
        }
    }

    fn on_send_data_failure(
        &mut self,
        reason: FailureReason,
        partial: Option<Frame>,
        aborted: bool,
        out: &mut Vec<SendOutput>,
    ) {
        if reason == FailureReason::CallbackTimeout && !aborted {
            info!(transaction = %self.transaction.id(), "Aborting SendData after callback timeout");
            self.state = SendState::AbortThenRetry { reason, partial };
            self.submit(Message::SendDataAbort, Priority::Immediate, out);
        } else {
            self.retry(reason, partial, out);
        }
    }

    fn on_node_command(&mut self, command: &InboundCommand, out: &mut Vec<SendOutput>) -> bool {
        match &mut self.state {
            SendState::Handshake {
                command: handshake,
                node,
                sent,
                reply,
            } => {
                if command.node_id == *node && handshake.is_expected_reply(command) {
                    trace!(node = %node, "Handshake reply received");
                    if *sent {
                        out.push(SendOutput::CancelTimer);
                        self.execute(out);
                    } else {
                        *reply = true;
                    }
                }
                // Handshake replies are consumed by the security layer too
                false
            }
            SendState::Execute => {
                let message = self.transaction.message();
                if message.expects_node_reply() && message.is_expected_reply(command) {
                    trace!(node = %command.node_id, "Node reply arrived before callback");
                    self.early_reply = Some(command.clone());
                    true
                } else {
                    false
                }
            }
            SendState::WaitForUpdate => {
                if self.transaction.message().is_expected_reply(command) {
                    out.push(SendOutput::CancelTimer);
                    self.succeed(TransmitReply::Node(command.clone()), out);
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    fn on_node_info(&mut self, node: NodeId, out: &mut Vec<SendOutput>) -> bool {
        let message = self.transaction.message();
        let is_ping = message.is_ping() || self.transaction.priority() == Priority::Ping;
        if !is_ping || message.target_node_id() != Some(node) {
            return false;
        }
        debug!(transaction = %self.transaction.id(), node = %node, "Node information received, ping succeeded");
        self.end(out);
        self.succeed(TransmitReply::NodeInfo(node), out);
        true
    }

    fn on_timeout(&mut self, out: &mut Vec<SendOutput>) {
        match self.state {
            SendState::Handshake { sent: true, .. } => {
                debug!(transaction = %self.transaction.id(), "Handshake reply timed out");
                self.retry(FailureReason::NodeTimeout, None, out);
            }
            SendState::WaitForUpdate => {
                debug!(transaction = %self.transaction.id(), "Node reply timed out");
                self.retry(FailureReason::NodeTimeout, None, out);
            }
            SendState::RetryWait => self.init(out),
            _ => trace!(state = ?self.state, "Ignoring send session timeout"),
        }
    }

    fn retry(&mut self, reason: FailureReason, partial: Option<Frame>, out: &mut Vec<SendOutput>) {
        let message = self.transaction.message();
        let attempts = self.transaction.send_attempts();
        let max_attempts = message.max_send_attempts();
        let multicast_nok = message.is_multicast() && self.callback_nok_seen;

        if message.is_send_data_class() && attempts < max_attempts && !multicast_nok {
            let delay = self.timeouts.send_data_retry;
            debug!(
                transaction = %self.transaction.id(),
                attempt = attempts,
                max_attempts,
                %reason,
                "Retrying send"
            );
            out.push(SendOutput::Retry(RetryNotice {
                layer: RetryLayer::Node,
                command: message.describe(),
                attempt: attempts,
                max_attempts,
                delay,
                reason,
            }));
            self.state = SendState::RetryWait;
            out.push(SendOutput::StartTimer(delay));
            return;
        }

        if self.should_defer(reason) {
            if let Some(node) = message.target_node_id() {
                info!(transaction = %self.transaction.id(), node = %node, %reason, "Deferring until node wakes up");
                self.state = SendState::Done;
                self.transaction.reset_attempts();
                out.push(SendOutput::Finished(SendOutcome::Deferred(node)));
                return;
            }
        }

        let err = TransmitError::from_reason(reason, message.describe(), attempts.max(1), partial);
        self.reject(err, out);
    }

    fn should_defer(&self, reason: FailureReason) -> bool {
        let message = self.transaction.message();
        self.defer_sleeping
            && reason.is_node_failure()
            && !message.is_multicast()
            && !message.is_ping()
            && message
                .target_node_id()
                .and_then(|node| self.status.is_node_listening(node))
                == Some(false)
    }

    fn succeed(&mut self, reply: TransmitReply, out: &mut Vec<SendOutput>) {
        self.state = SendState::Done;
        self.settle(Ok(reply));
        out.push(SendOutput::Finished(SendOutcome::Completed));
    }

    fn reject(&mut self, err: TransmitError, out: &mut Vec<SendOutput>) {
        self.state = SendState::Done;
        warn!(transaction = %self.transaction.id(), error = %err, "Transaction failed");
        self.settle(Err(err.clone()));
        out.push(SendOutput::Finished(SendOutcome::Failed(err)));
    }

    fn settle(&mut self, result: TransmitResult) {
        self.transaction.settle(result);
    }

    fn end(&mut self, out: &mut Vec<SendOutput>) {
        self.state = SendState::Done;
        self.awaiting = None;
        out.push(SendOutput::CancelTimer);
    }
}

impl std::fmt::Debug for SendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendSession")
            .field("transaction", &self.transaction.id())
            .field("state", &self.state)
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FunctionType;
    use crate::message::{SendDataMulticastRequest, NoOperation};
    use crate::node_status::{ListeningMode, NodeStatusTable};
    use crate::serial_command::{CommandFailure, CommandReply};
    use crate::transaction::{ResultReceiver, TransactionId};
    use bytes::Bytes;

    #[derive(Debug)]
    struct NonceGet;

    impl NodeCommand for NonceGet {
        fn name(&self) -> &str {
            "NonceGet"
        }
        fn encode(&self) -> Bytes {
            Bytes::from_static(&[0x98, 0x40])
        }
        fn expects_node_reply(&self) -> bool {
            true
        }
        fn is_expected_reply(&self, reply: &InboundCommand) -> bool {
            reply.payload.starts_with(&[0x98, 0x80])
        }
    }

    #[derive(Debug)]
    struct SecureSet;

    impl NodeCommand for SecureSet {
        fn name(&self) -> &str {
            "SecureSet"
        }
        fn encode(&self) -> Bytes {
            Bytes::from_static(&[0x98, 0x81, 0x01])
        }
        fn pre_transmit_handshake(&self) -> Option<Arc<dyn NodeCommand>> {
            Some(Arc::new(NonceGet))
        }
    }

    fn session(message: Message, priority: Priority) -> (SendSession, ResultReceiver) {
        session_with(message, priority, Arc::new(NodeStatusTable::new()))
    }

    fn session_with(
        message: Message,
        priority: Priority,
        status: Arc<NodeStatusTable>,
    ) -> (SendSession, ResultReceiver) {
        let (tx, rx) = Transaction::new(TransactionId(1), message, priority);
        (SendSession::new(tx, TimeoutConfig::default(), true, status), rx)
    }

    fn start(s: &mut SendSession) -> CommandRequest {
        let mut out = Vec::new();
        s.step(SendInput::Start, &mut out);
        submitted(&out).expect("no command submitted")
    }

    fn submitted(out: &[SendOutput]) -> Option<CommandRequest> {
        out.iter().find_map(|o| match o {
            SendOutput::Submit(r) => Some(r.clone()),
            _ => None,
        })
    }

    fn finished(out: &[SendOutput]) -> Option<SendOutcome> {
        out.iter().find_map(|o| match o {
            SendOutput::Finished(outcome) => Some(outcome.clone()),
            _ => None,
        })
    }

    fn complete(s: &mut SendSession, request: &CommandRequest, result: CommandResult) -> Vec<SendOutput> {
        let mut out = Vec::new();
        assert!(s.step(
            SendInput::CommandCompleted {
                request: request.id,
                result: &result,
            },
            &mut out
        ));
        out
    }

    fn fail(reason: FailureReason) -> CommandResult {
        Err(CommandFailure {
            reason,
            partial: None,
            attempts: 1,
            aborted: false,
        })
    }

    fn ok_callback() -> CommandResult {
        Ok(CommandReply {
            response: Some(Frame::response(FunctionType::SEND_DATA, vec![0x01])),
            callback: Some(Frame::request(FunctionType::SEND_DATA, vec![0x01, 0x00])),
        })
    }

    /// Run through a failed attempt and the retry wait, returning the next request
    fn fail_and_retry(s: &mut SendSession, request: &CommandRequest, reason: FailureReason) -> CommandRequest {
        let out = complete(s, request, fail(reason));
        assert!(out.iter().any(|o| matches!(o, SendOutput::Retry(_))));
        let mut out = Vec::new();
        s.step(SendInput::Timeout, &mut out);
        submitted(&out).expect("no retry submitted")
    }

    #[tokio::test]
    async fn test_unicast_callback_nok_is_retried() {
        let message = Message::SendData(
            SendDataRequest::new(NodeId(4), Arc::new(NoOperation)).with_max_send_attempts(3),
        );
        let (mut s, rx) = session(message, Priority::Normal);

        let first = start(&mut s);
        let second = fail_and_retry(&mut s, &first, FailureReason::CallbackNok);
        let third = fail_and_retry(&mut s, &second, FailureReason::CallbackNok);
        let out = complete(&mut s, &third, fail(FailureReason::CallbackNok));

        assert!(matches!(finished(&out), Some(SendOutcome::Failed(_))));
        assert_eq!(s.transaction().send_attempts(), 3);
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.reason(), Some(FailureReason::CallbackNok));
    }

    #[tokio::test]
    async fn test_multicast_callback_nok_is_not_retried() {
        let message = Message::SendDataMulticast(
            SendDataMulticastRequest::new(vec![NodeId(2), NodeId(3)], Arc::new(NoOperation))
                .with_max_send_attempts(3),
        );
        let (mut s, rx) = session(message, Priority::Normal);

        let first = start(&mut s);
        let out = complete(&mut s, &first, fail(FailureReason::CallbackNok));

        assert!(!out.iter().any(|o| matches!(o, SendOutput::Retry(_))));
        assert!(matches!(finished(&out), Some(SendOutcome::Failed(_))));
        assert_eq!(s.transaction().send_attempts(), 1);
        assert_eq!(
            rx.await.unwrap().unwrap_err().reason(),
            Some(FailureReason::CallbackNok)
        );
    }

    #[tokio::test]
    async fn test_controller_failure_not_retried() {
        let (mut s, rx) = session(
            Message::controller(crate::message::GetControllerVersion),
            Priority::Controller,
        );
        let first = start(&mut s);
        let out = complete(&mut s, &first, fail(FailureReason::ResponseTimeout));
        assert!(matches!(finished(&out), Some(SendOutcome::Failed(_))));
        assert!(matches!(
            rx.await.unwrap(),
            Err(TransmitError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_callback_timeout_aborts_once_then_retries() {
        let (mut s, _rx) = session(Message::ping(NodeId(6)), Priority::Normal);
        let first = start(&mut s);

        let out = complete(&mut s, &first, fail(FailureReason::CallbackTimeout));
        let abort = submitted(&out).unwrap();
        assert!(matches!(abort.message, Message::SendDataAbort));

        let out = complete(&mut s, &abort, Ok(CommandReply::default()));
        assert!(out.iter().any(|o| matches!(
            o,
            SendOutput::Retry(RetryNotice {
                layer: RetryLayer::Node,
                reason: FailureReason::CallbackTimeout,
                ..
            })
        )));

        // Already aborted by the sequencer: no second abort
        let mut out = Vec::new();
        s.step(SendInput::Timeout, &mut out);
        let second = submitted(&out).unwrap();
        let out = complete(
            &mut s,
            &second,
            Err(CommandFailure {
                reason: FailureReason::CallbackTimeout,
                partial: None,
                attempts: 1,
                aborted: true,
            }),
        );
        assert!(submitted(&out).is_none());
    }

    #[tokio::test]
    async fn test_wait_for_node_reply() {
        let message = Message::send_data(NodeId(9), NonceGet);
        let (mut s, rx) = session(message, Priority::Normal);
        let first = start(&mut s);

        let out = complete(&mut s, &first, ok_callback());
        assert!(out.iter().any(|o| matches!(o, SendOutput::StartTimer(d) if *d == Duration::from_millis(1600))));

        let wrong_node = InboundCommand {
            node_id: NodeId(8),
            payload: Bytes::from_static(&[0x98, 0x80, 0x01]),
        };
        let mut out = Vec::new();
        assert!(!s.step(SendInput::NodeCommand(&wrong_node), &mut out));

        let reply = InboundCommand {
            node_id: NodeId(9),
            ..wrong_node
        };
        assert!(s.step(SendInput::NodeCommand(&reply), &mut out));
        assert_eq!(finished(&out), Some(SendOutcome::Completed));
        assert_eq!(rx.await.unwrap(), Ok(TransmitReply::Node(reply)));
    }

    #[tokio::test]
    async fn test_handshake_before_execute() {
        let (mut s, rx) = session(Message::send_data(NodeId(5), SecureSet), Priority::Normal);

        let handshake = start(&mut s);
        assert_eq!(handshake.priority, Priority::PreTransmitHandshake);
        assert_eq!(handshake.message.node_command().map(|c| c.name().to_string()), Some("NonceGet".into()));

        let out = complete(&mut s, &handshake, ok_callback());
        assert!(submitted(&out).is_none());

        let nonce = InboundCommand {
            node_id: NodeId(5),
            payload: Bytes::from_static(&[0x98, 0x80, 0xAA]),
        };
        let mut out = Vec::new();
        // Not claimed, the security layer still needs it
        assert!(!s.step(SendInput::NodeCommand(&nonce), &mut out));
        let execute = submitted(&out).unwrap();
        assert_eq!(execute.priority, Priority::Normal);

        let out = complete(&mut s, &execute, ok_callback());
        assert_eq!(finished(&out), Some(SendOutcome::Completed));
        assert!(matches!(rx.await.unwrap(), Ok(TransmitReply::Controller(_))));
    }

    #[tokio::test]
    async fn test_multicast_handshake_is_unsupported() {
        let message = Message::SendDataMulticast(SendDataMulticastRequest::new(
            vec![NodeId(2), NodeId(3)],
            Arc::new(SecureSet),
        ));
        let (mut s, rx) = session(message, Priority::Normal);
        let mut out = Vec::new();
        s.step(SendInput::Start, &mut out);

        assert!(submitted(&out).is_none());
        assert!(matches!(rx.await.unwrap(), Err(TransmitError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_node_info_short_circuits_ping() {
        let (mut s, rx) = session(Message::ping(NodeId(7)), Priority::Ping);
        let _execute = start(&mut s);

        let mut out = Vec::new();
        assert!(!s.step(SendInput::NodeInfo(NodeId(3)), &mut out));
        assert!(s.step(SendInput::NodeInfo(NodeId(7)), &mut out));
        assert_eq!(finished(&out), Some(SendOutcome::Completed));
        assert_eq!(rx.await.unwrap(), Ok(TransmitReply::NodeInfo(NodeId(7))));
    }

    #[test]
    fn test_sleeping_node_is_deferred() {
        let status = Arc::new(NodeStatusTable::new());
        status.insert(NodeId(12), ListeningMode::Sleeping);
        let message = Message::SendData(
            SendDataRequest::new(NodeId(12), Arc::new(NonceGet)).with_max_send_attempts(1),
        );
        let (mut s, _rx) = session_with(message, Priority::Normal, status);

        let first = start(&mut s);
        let out = complete(&mut s, &first, fail(FailureReason::CallbackNok));
        assert_eq!(finished(&out), Some(SendOutcome::Deferred(NodeId(12))));
        assert!(!s.transaction().is_settled());
    }

    #[test]
    fn test_requeued_session_does_not_claim_old_result() {
        let (mut s, _rx) = session(Message::ping(NodeId(2)), Priority::Normal);
        let old = start(&mut s);
        let mut out = Vec::new();
        s.force(ReduceAction::Requeue(Some(Priority::Poll)), &mut out);
        assert_eq!(finished(&out), Some(SendOutcome::Requeued(Some(Priority::Poll))));

        let mut again = SendSession::new(
            s.into_transaction(),
            TimeoutConfig::default(),
            true,
            Arc::new(NodeStatusTable::new()),
        );
        let fresh = start(&mut again);
        assert_ne!(fresh.id, old.id);

        let mut out = Vec::new();
        let stale = ok_callback();
        assert!(!again.step(
            SendInput::CommandCompleted {
                request: old.id,
                result: &stale,
            },
            &mut out
        ));
        assert!(out.is_empty());
        assert!(!again.transaction().is_settled());
    }

    #[tokio::test]
    async fn test_force_drop() {
        let (mut s, rx) = session(Message::ping(NodeId(2)), Priority::Normal);
        let _ = start(&mut s);
        let mut out = Vec::new();
        s.force(ReduceAction::Drop, &mut out);
        assert_eq!(finished(&out), Some(SendOutcome::Dropped));
        assert_eq!(rx.await.unwrap(), Err(TransmitError::Dropped));
    }
}
