//! Serial command session
//!
//! Runs one message through the controller's serial API handshake:
//!
//! ```text
//! Sending -> WaitForAck -> WaitForResponse -> WaitForCallback -> Finished
//!    ^          |               |
//!    +-- RetryWait <------------+   (link failures, response timeout/NOK)
//! ```
//!
//! The session does no I/O. Inputs are fed through [`SerialCommandSession::step`]
//! and the session answers with [`SessionOutput`]s (frames to write, a single
//! timer to arm, retry notices, and finally the result).

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::{serial_retry_delay, TimeoutConfig};
use crate::error::FailureReason;
use crate::frame::Frame;
use crate::message::{CallbackStatus, Message};

/// Which layer is about to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLayer {
    /// The serial command session, with growing backoff
    Serial,
    /// The send session, retrying a whole node round trip
    Node,
}

/// Emitted before every retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    /// Layer that retries
    pub layer: RetryLayer,
    /// Description of the message being retried
    pub command: String,
    /// Attempts made so far
    pub attempt: u8,
    /// Attempt ceiling
    pub max_attempts: u8,
    /// Delay before the next attempt
    pub delay: Duration,
    /// Why the last attempt failed
    pub reason: FailureReason,
}

/// Frames a successful command produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandReply {
    /// The response frame, if one was expected
    pub response: Option<Frame>,
    /// The final callback frame, if one was expected
    pub callback: Option<Frame>,
}

impl CommandReply {
    /// The last frame received for the command
    pub fn final_frame(&self) -> Option<&Frame> {
        self.callback.as_ref().or(self.response.as_ref())
    }
}

/// Why a command failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Last recorded reason
    pub reason: FailureReason,
    /// Frame received before the failure, if any
    pub partial: Option<Frame>,
    /// Serial attempts made
    pub attempts: u8,
    /// Whether a SendData abort already ran for this failure
    pub aborted: bool,
}

/// Outcome of a serial command session
pub type CommandResult = Result<CommandReply, CommandFailure>;

/// Events fed into a session
#[derive(Debug, Clone, Copy)]
pub enum SessionInput<'a> {
    /// Begin the first attempt
    Start,
    /// The frame was written to the port
    WriteCompleted,
    /// Writing the frame failed
    WriteFailed,
    /// Controller ACK
    Ack,
    /// Controller NAK
    Nak,
    /// Controller CAN
    Can,
    /// A data frame from the controller
    Frame(&'a Frame),
    /// The session's timer fired
    Timeout,
}

/// What a session asks its owner to do
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Write these bytes to the port
    Write(Bytes),
    /// Arm the session timer, replacing any running one
    StartTimer(Duration),
    /// Disarm the session timer
    CancelTimer,
    /// A retry is about to happen
    Retry(RetryNotice),
    /// The session is finished
    Completed(CommandResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Sending,
    WaitForAck,
    WaitForResponse,
    WaitForCallback,
    RetryWait,
    Finished,
}

/// State machine for one message on the serial link
#[derive(Debug)]
pub struct SerialCommandSession {
    message: Message,
    callback_id: u8,
    encoded: Option<Bytes>,
    timeouts: TimeoutConfig,
    max_attempts: u8,
    attempts: u8,
    state: State,
    response: Option<Frame>,
    partial: Option<Frame>,
}

impl SerialCommandSession {
    /// Create a session for `message` using `callback_id` in its frame
    pub fn new(message: Message, callback_id: u8, max_attempts: u8, timeouts: TimeoutConfig) -> Self {
        let encoded = match message.to_frame(callback_id).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(command = %message.describe(), error = %e, "Cannot encode serial command");
                None
            }
        };
        Self {
            message,
            callback_id,
            encoded,
            timeouts,
            max_attempts: max_attempts.max(1),
            attempts: 0,
            state: State::Idle,
            response: None,
            partial: None,
        }
    }

    /// The message being sent
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Callback id used in the frame
    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    /// Whether the session has produced its result
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Feed one input. Returns whether the input was meant for this session.
    pub fn step(&mut self, input: SessionInput<'_>, out: &mut Vec<SessionOutput>) -> bool {
        match (self.state, input) {
            (State::Idle, SessionInput::Start) => {
                self.send(out);
                true
            }
            (State::Sending, SessionInput::WriteCompleted) => {
                self.state = State::WaitForAck;
                out.push(SessionOutput::StartTimer(self.timeouts.ack));
                true
            }
            (State::Sending, SessionInput::WriteFailed) => {
                self.retry(FailureReason::SendFailure, out);
                true
            }
            (State::WaitForAck, SessionInput::Ack) => {
                out.push(SessionOutput::CancelTimer);
                self.after_ack(out);
                true
            }
            (State::WaitForAck, SessionInput::Nak) => {
                out.push(SessionOutput::CancelTimer);
                self.retry(FailureReason::Nak, out);
                true
            }
            (State::WaitForAck, SessionInput::Can) => {
                out.push(SessionOutput::CancelTimer);
                self.retry(FailureReason::Can, out);
                true
            }
            (State::WaitForAck, SessionInput::Timeout) => self.timed_out(FailureReason::AckTimeout, out),
            (State::WaitForResponse, SessionInput::Frame(frame)) => self.on_response(frame, out),
            (State::WaitForResponse, SessionInput::Timeout) => {
                self.timed_out(FailureReason::ResponseTimeout, out)
            }
            (State::WaitForCallback, SessionInput::Frame(frame)) => self.on_callback(frame, out),
            (State::WaitForCallback, SessionInput::Timeout) => {
                warn!(
                    command = %self.message.describe(),
                    callback_id = self.callback_id,
                    "Callback timeout"
                );
                let partial = self.response.clone();
                self.finish(Err(self.failure(FailureReason::CallbackTimeout, partial)), out);
                true
            }
            (State::RetryWait, SessionInput::Timeout) => {
                self.send(out);
                true
            }
            (state, input) => {
                trace!(?state, ?input, "Input not handled by serial command session");
                false
            }
        }
    }

    fn send(&mut self, out: &mut Vec<SessionOutput>) {
        let Some(encoded) = self.encoded.clone() else {
            // Retrying cannot make the frame fit
            self.finish(Err(self.failure(FailureReason::SendFailure, None)), out);
            return;
        };
        self.attempts += 1;
        self.state = State::Sending;
        self.response = None;
        self.partial = None;
        debug!(
            command = %self.message.describe(),
            attempt = self.attempts,
            max_attempts = self.max_attempts,
            "Sending serial command"
        );
        out.push(SessionOutput::Write(encoded));
    }

    fn after_ack(&mut self, out: &mut Vec<SessionOutput>) {
        if self.message.expects_response() {
            self.state = State::WaitForResponse;
            out.push(SessionOutput::StartTimer(self.timeouts.response));
        } else if self.message.expects_callback() {
            self.state = State::WaitForCallback;
            out.push(SessionOutput::StartTimer(self.timeouts.callback));
        } else {
            self.finish(Ok(CommandReply::default()), out);
        }
    }

    fn on_response(&mut self, frame: &Frame, out: &mut Vec<SessionOutput>) -> bool {
        match self.message.check_response(frame) {
            None => false,
            Some(true) => {
                out.push(SessionOutput::CancelTimer);
                self.response = Some(frame.clone());
                if self.message.expects_callback() {
                    self.state = State::WaitForCallback;
                    out.push(SessionOutput::StartTimer(self.timeouts.callback));
                } else {
                    let reply = CommandReply {
                        response: self.response.take(),
                        callback: None,
                    };
                    self.finish(Ok(reply), out);
                }
                true
            }
            Some(false) => {
                out.push(SessionOutput::CancelTimer);
                self.partial = Some(frame.clone());
                self.retry(FailureReason::ResponseNok, out);
                true
            }
        }
    }

    fn on_callback(&mut self, frame: &Frame, out: &mut Vec<SessionOutput>) -> bool {
        match self.message.check_callback(frame, self.callback_id) {
            None => false,
            Some(CallbackStatus::Ok { is_final: true }) => {
                out.push(SessionOutput::CancelTimer);
                let reply = CommandReply {
                    response: self.response.take(),
                    callback: Some(frame.clone()),
                };
                self.finish(Ok(reply), out);
                true
            }
            Some(CallbackStatus::Ok { is_final: false }) => {
                trace!(callback_id = self.callback_id, "Intermediate callback");
                out.push(SessionOutput::StartTimer(self.timeouts.callback));
                true
            }
            Some(CallbackStatus::Failed) => {
                out.push(SessionOutput::CancelTimer);
                self.finish(
                    Err(self.failure(FailureReason::CallbackNok, Some(frame.clone()))),
                    out,
                );
                true
            }
        }
    }

    fn timed_out(&mut self, reason: FailureReason, out: &mut Vec<SessionOutput>) -> bool {
        debug!(command = %self.message.describe(), %reason, "Serial command timed out");
        self.retry(reason, out);
        true
    }

    fn retry(&mut self, reason: FailureReason, out: &mut Vec<SessionOutput>) {
        if self.attempts < self.max_attempts {
            let delay = serial_retry_delay(self.attempts);
            self.state = State::RetryWait;
            out.push(SessionOutput::Retry(RetryNotice {
                layer: RetryLayer::Serial,
                command: self.message.describe(),
                attempt: self.attempts,
                max_attempts: self.max_attempts,
                delay,
                reason,
            }));
            out.push(SessionOutput::StartTimer(delay));
        } else {
            let partial = self.partial.take();
            self.finish(Err(self.failure(reason, partial)), out);
        }
    }

    fn failure(&self, reason: FailureReason, partial: Option<Frame>) -> CommandFailure {
        CommandFailure {
            reason,
            partial,
            attempts: self.attempts,
            aborted: false,
        }
    }

    fn finish(&mut self, result: CommandResult, out: &mut Vec<SessionOutput>) {
        self.state = State::Finished;
        match &result {
            Ok(_) => debug!(command = %self.message.describe(), attempts = self.attempts, "Serial command succeeded"),
            Err(failure) => debug!(
                command = %self.message.describe(),
                attempts = self.attempts,
                reason = %failure.reason,
                "Serial command failed"
            ),
        }
        out.push(SessionOutput::Completed(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FunctionType;
    use crate::message::{GetControllerVersion, NodeId};

    fn session(message: Message, max_attempts: u8) -> SerialCommandSession {
        SerialCommandSession::new(message, 1, max_attempts, TimeoutConfig::default())
    }

    fn step(s: &mut SerialCommandSession, input: SessionInput<'_>) -> Vec<SessionOutput> {
        let mut out = Vec::new();
        assert!(s.step(input, &mut out), "input {:?} not consumed", input);
        out
    }

    fn completed(out: &[SessionOutput]) -> Option<&CommandResult> {
        out.iter().find_map(|o| match o {
            SessionOutput::Completed(result) => Some(result),
            _ => None,
        })
    }

    #[derive(Debug)]
    struct Oversized;

    impl crate::message::NodeCommand for Oversized {
        fn name(&self) -> &str {
            "Oversized"
        }
        fn encode(&self) -> Bytes {
            Bytes::from(vec![0x70; 300])
        }
    }

    #[test]
    fn test_unencodable_frame_fails_without_write() {
        let mut s = session(Message::send_data(NodeId(3), Oversized), 3);
        let out = step(&mut s, SessionInput::Start);

        assert!(!out.iter().any(|o| matches!(o, SessionOutput::Write(_))));
        let failure = completed(&out).unwrap().as_ref().unwrap_err();
        assert_eq!(failure.reason, FailureReason::SendFailure);
        assert!(s.is_finished());
    }

    #[test]
    fn test_three_write_failures() {
        let mut s = session(Message::controller(GetControllerVersion), 3);
        let mut notices = Vec::new();

        let out = step(&mut s, SessionInput::Start);
        assert!(matches!(out[0], SessionOutput::Write(_)));

        for _ in 0..2 {
            let out = step(&mut s, SessionInput::WriteFailed);
            for o in &out {
                if let SessionOutput::Retry(notice) = o {
                    notices.push(notice.clone());
                }
            }
            assert!(completed(&out).is_none());
            let out = step(&mut s, SessionInput::Timeout);
            assert!(matches!(out[0], SessionOutput::Write(_)));
        }

        let out = step(&mut s, SessionInput::WriteFailed);
        let failure = completed(&out).unwrap().clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::SendFailure);
        assert_eq!(failure.attempts, 3);
        assert!(s.is_finished());

        let delays: Vec<Duration> = notices.iter().map(|n| n.delay).collect();
        assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(1100)]);
        assert_eq!(notices[1].attempt, 2);
        assert_eq!(notices[1].max_attempts, 3);
    }

    #[test]
    fn test_controller_command_success() {
        let mut s = session(Message::controller(GetControllerVersion), 3);
        step(&mut s, SessionInput::Start);
        let out = step(&mut s, SessionInput::WriteCompleted);
        assert_eq!(out, vec![SessionOutput::StartTimer(Duration::from_millis(1600))]);
        step(&mut s, SessionInput::Ack);

        let unrelated = Frame::response(FunctionType::SEND_DATA, vec![0x01]);
        let mut out = Vec::new();
        assert!(!s.step(SessionInput::Frame(&unrelated), &mut out));

        let response = Frame::response(FunctionType::GET_CONTROLLER_VERSION, b"Z-Wave 7.18\0\x01".to_vec());
        let out = step(&mut s, SessionInput::Frame(&response));
        let reply = completed(&out).unwrap().clone().unwrap();
        assert_eq!(reply.final_frame(), Some(&response));
    }

    #[test]
    fn test_can_and_nak_are_retried() {
        let mut s = session(Message::controller(GetControllerVersion), 3);
        step(&mut s, SessionInput::Start);
        step(&mut s, SessionInput::WriteCompleted);
        let out = step(&mut s, SessionInput::Can);
        assert!(out.iter().any(|o| matches!(
            o,
            SessionOutput::Retry(RetryNotice { reason: FailureReason::Can, .. })
        )));

        step(&mut s, SessionInput::Timeout);
        step(&mut s, SessionInput::WriteCompleted);
        let out = step(&mut s, SessionInput::Nak);
        assert!(out.iter().any(|o| matches!(
            o,
            SessionOutput::Retry(RetryNotice { reason: FailureReason::Nak, attempt: 2, .. })
        )));
    }

    #[test]
    fn test_send_data_callback_timeout_is_terminal() {
        let mut s = session(Message::ping(NodeId(5)), 3);
        step(&mut s, SessionInput::Start);
        step(&mut s, SessionInput::WriteCompleted);
        step(&mut s, SessionInput::Ack);

        let response = Frame::response(FunctionType::SEND_DATA, vec![0x01]);
        let out = step(&mut s, SessionInput::Frame(&response));
        assert!(out.contains(&SessionOutput::StartTimer(Duration::from_millis(65000))));

        let out = step(&mut s, SessionInput::Timeout);
        let failure = completed(&out).unwrap().clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::CallbackTimeout);
        assert_eq!(failure.partial, Some(response));
        assert_eq!(failure.attempts, 1);
    }

    #[test]
    fn test_response_nok_exhausts_attempts() {
        let mut s = session(Message::ping(NodeId(5)), 2);
        let nok = Frame::response(FunctionType::SEND_DATA, vec![0x00]);

        step(&mut s, SessionInput::Start);
        step(&mut s, SessionInput::WriteCompleted);
        step(&mut s, SessionInput::Ack);
        let out = step(&mut s, SessionInput::Frame(&nok));
        assert!(completed(&out).is_none());

        step(&mut s, SessionInput::Timeout);
        step(&mut s, SessionInput::WriteCompleted);
        step(&mut s, SessionInput::Ack);
        let out = step(&mut s, SessionInput::Frame(&nok));
        let failure = completed(&out).unwrap().clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::ResponseNok);
        assert_eq!(failure.partial, Some(nok));
    }

    #[test]
    fn test_callback_nok() {
        let mut s = session(Message::ping(NodeId(5)), 3);
        step(&mut s, SessionInput::Start);
        step(&mut s, SessionInput::WriteCompleted);
        step(&mut s, SessionInput::Ack);
        step(
            &mut s,
            SessionInput::Frame(&Frame::response(FunctionType::SEND_DATA, vec![0x01])),
        );

        // Callback for a different id is ignored
        let stale = Frame::request(FunctionType::SEND_DATA, vec![0x02, 0x00]);
        let mut out = Vec::new();
        assert!(!s.step(SessionInput::Frame(&stale), &mut out));

        let nok = Frame::request(FunctionType::SEND_DATA, vec![0x01, 0x01]);
        let out = step(&mut s, SessionInput::Frame(&nok));
        let failure = completed(&out).unwrap().clone().unwrap_err();
        assert_eq!(failure.reason, FailureReason::CallbackNok);
        assert_eq!(failure.attempts, 1);
    }

    #[test]
    fn test_abort_completes_on_ack() {
        let mut s = session(Message::SendDataAbort, 3);
        step(&mut s, SessionInput::Start);
        step(&mut s, SessionInput::WriteCompleted);
        let out = step(&mut s, SessionInput::Ack);
        assert_eq!(
            completed(&out),
            Some(&Ok(CommandReply::default()))
        );
    }
}
