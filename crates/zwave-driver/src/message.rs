//! Outbound messages
//!
//! A [`Message`] is a closed set of variants. Everything the transmission
//! pipeline needs to know about a message is answered by
//! [`MessageCapabilities`] and a handful of serial-level helpers on
//! [`Message`] itself, so the send and command layers never inspect the
//! payload.
//!
//! Command payloads for nodes come from the command class layer through
//! the [`NodeCommand`] trait; controller-local commands implement
//! [`ControllerCommand`].

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

use crate::config::DEFAULT_SEND_DATA_ATTEMPTS;
use crate::error::Result;
use crate::frame::{Frame, FunctionType};

/// Identifier of a node in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u8);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {:03}", self.0)
    }
}

impl From<u8> for NodeId {
    fn from(id: u8) -> Self {
        NodeId(id)
    }
}

/// A command received from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    /// Node that sent the command
    pub node_id: NodeId,
    /// Raw command class payload
    pub payload: Bytes,
}

/// Transmit options for SendData frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitOptions(pub u8);

impl TransmitOptions {
    /// Request a MAC-level acknowledgement from the node
    pub const ACK: u8 = 0x01;
    /// Allow routing through other nodes
    pub const AUTO_ROUTE: u8 = 0x04;
    /// Allow explorer frames when routing fails
    pub const EXPLORE: u8 = 0x20;
}

impl Default for TransmitOptions {
    fn default() -> Self {
        TransmitOptions(Self::ACK | Self::AUTO_ROUTE | Self::EXPLORE)
    }
}

/// A command class payload addressed to a node
pub trait NodeCommand: Send + Sync + fmt::Debug {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Serialized command class bytes
    fn encode(&self) -> Bytes;

    /// Command that must be exchanged with the node before this one,
    /// e.g. a nonce request for secured commands
    fn pre_transmit_handshake(&self) -> Option<Arc<dyn NodeCommand>> {
        None
    }

    /// Whether the node answers this command with a report
    fn expects_node_reply(&self) -> bool {
        false
    }

    /// Whether `reply` is the report this command is waiting for
    fn is_expected_reply(&self, reply: &InboundCommand) -> bool {
        let _ = reply;
        false
    }
}

/// The built-in command used to ping nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOperation;

impl NoOperation {
    /// Command class identifier
    pub const COMMAND_CLASS: u8 = 0x00;
}

impl NodeCommand for NoOperation {
    fn name(&self) -> &str {
        "NoOperation"
    }

    fn encode(&self) -> Bytes {
        Bytes::from_static(&[Self::COMMAND_CLASS])
    }
}

/// Outcome reported by a callback frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Success; `is_final` is false for intermediate steps
    Ok {
        /// Whether this callback ends the operation
        is_final: bool,
    },
    /// The controller reported failure
    Failed,
}

/// A command handled by the controller itself
pub trait ControllerCommand: Send + Sync + fmt::Debug {
    /// Serial API function
    fn function(&self) -> FunctionType;

    /// Request payload
    fn payload(&self) -> Bytes {
        Bytes::new()
    }

    /// Whether the controller answers with a response frame
    fn expects_response(&self) -> bool {
        true
    }

    /// Whether the controller sends a callback after the response
    fn expects_callback(&self) -> bool {
        false
    }

    /// `None` if `frame` is not the response, otherwise whether it is OK
    fn check_response(&self, frame: &Frame) -> Option<bool> {
        (frame.is_response() && frame.function == self.function()).then_some(true)
    }

    /// `None` if `frame` is not the callback, otherwise its status
    fn check_callback(&self, frame: &Frame, callback_id: u8) -> Option<CallbackStatus> {
        let _ = (frame, callback_id);
        None
    }
}

/// Query the controller's library version
#[derive(Debug, Clone, Copy, Default)]
pub struct GetControllerVersion;

impl GetControllerVersion {
    /// Extract the version string from the response payload
    pub fn parse_version(frame: &Frame) -> Option<String> {
        let end = frame.payload.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&frame.payload[..end])
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl ControllerCommand for GetControllerVersion {
    fn function(&self) -> FunctionType {
        FunctionType::GET_CONTROLLER_VERSION
    }
}

/// Send a command to a single node
#[derive(Debug, Clone)]
pub struct SendDataRequest {
    /// Target node
    pub node_id: NodeId,
    /// Command class payload
    pub command: Arc<dyn NodeCommand>,
    /// Transmit options
    pub transmit_options: TransmitOptions,
    /// Node-level attempts
    pub max_send_attempts: u8,
}

impl SendDataRequest {
    /// Create a request with default options
    pub fn new(node_id: NodeId, command: Arc<dyn NodeCommand>) -> Self {
        Self {
            node_id,
            command,
            transmit_options: TransmitOptions::default(),
            max_send_attempts: DEFAULT_SEND_DATA_ATTEMPTS,
        }
    }

    /// Set the node-level attempt ceiling (at least 1)
    pub fn with_max_send_attempts(mut self, attempts: u8) -> Self {
        self.max_send_attempts = attempts.max(1);
        self
    }

    /// Set transmit options
    pub fn with_transmit_options(mut self, options: TransmitOptions) -> Self {
        self.transmit_options = options;
        self
    }
}

/// Send a command to several nodes at once
#[derive(Debug, Clone)]
pub struct SendDataMulticastRequest {
    /// Target nodes
    pub node_ids: Vec<NodeId>,
    /// Command class payload
    pub command: Arc<dyn NodeCommand>,
    /// Transmit options
    pub transmit_options: TransmitOptions,
    /// Node-level attempts
    pub max_send_attempts: u8,
}

impl SendDataMulticastRequest {
    /// Create a request with default options
    pub fn new(node_ids: Vec<NodeId>, command: Arc<dyn NodeCommand>) -> Self {
        Self {
            node_ids,
            command,
            transmit_options: TransmitOptions::default(),
            max_send_attempts: DEFAULT_SEND_DATA_ATTEMPTS,
        }
    }

    /// Set the node-level attempt ceiling (at least 1)
    pub fn with_max_send_attempts(mut self, attempts: u8) -> Self {
        self.max_send_attempts = attempts.max(1);
        self
    }
}

/// Properties of a message that drive scheduling and retries
pub trait MessageCapabilities {
    /// Whether the message is delivered to remote nodes through the mesh
    fn is_send_data_class(&self) -> bool;

    /// Whether the message addresses several nodes
    fn is_multicast(&self) -> bool;

    /// Node-level attempt ceiling
    fn max_send_attempts(&self) -> u8;

    /// Whether a handshake must be exchanged with the node first
    fn requires_pre_transmit_handshake(&self) -> bool;

    /// Whether the node answers with a report we must wait for
    fn expects_node_reply(&self) -> bool;

    /// Whether `reply` is that report
    fn is_expected_reply(&self, reply: &InboundCommand) -> bool;

    /// The single node this message is addressed to
    fn target_node_id(&self) -> Option<NodeId>;
}

/// An outbound message
#[derive(Debug, Clone)]
pub enum Message {
    /// Command for the controller itself
    Controller(Arc<dyn ControllerCommand>),
    /// Command for one node
    SendData(SendDataRequest),
    /// Command for several nodes
    SendDataMulticast(SendDataMulticastRequest),
    /// Abort the SendData in progress
    SendDataAbort,
}

impl Message {
    /// Wrap a controller command
    pub fn controller(command: impl ControllerCommand + 'static) -> Self {
        Message::Controller(Arc::new(command))
    }

    /// SendData with default options
    pub fn send_data(node_id: NodeId, command: impl NodeCommand + 'static) -> Self {
        Message::SendData(SendDataRequest::new(node_id, Arc::new(command)))
    }

    /// A ping to `node_id`
    pub fn ping(node_id: NodeId) -> Self {
        Self::send_data(node_id, NoOperation)
    }

    /// Serial API function of the frame
    pub fn function(&self) -> FunctionType {
        match self {
            Message::Controller(cmd) => cmd.function(),
            Message::SendData(_) => FunctionType::SEND_DATA,
            Message::SendDataMulticast(_) => FunctionType::SEND_DATA_MULTICAST,
            Message::SendDataAbort => FunctionType::SEND_DATA_ABORT,
        }
    }

    /// Description used in logs and errors
    pub fn describe(&self) -> String {
        match self {
            Message::Controller(cmd) => cmd.function().to_string(),
            Message::SendData(req) => format!("SendData({}) to {}", req.command.name(), req.node_id),
            Message::SendDataMulticast(req) => format!(
                "SendDataMulticast({}) to {} nodes",
                req.command.name(),
                req.node_ids.len()
            ),
            Message::SendDataAbort => "SendDataAbort".to_string(),
        }
    }

    /// Whether the controller answers with a response frame
    pub fn expects_response(&self) -> bool {
        match self {
            Message::Controller(cmd) => cmd.expects_response(),
            Message::SendData(_) | Message::SendDataMulticast(_) => true,
            Message::SendDataAbort => false,
        }
    }

    /// Whether the controller sends a callback
    pub fn expects_callback(&self) -> bool {
        match self {
            Message::Controller(cmd) => cmd.expects_callback(),
            Message::SendData(_) | Message::SendDataMulticast(_) => true,
            Message::SendDataAbort => false,
        }
    }

    /// `None` if `frame` is not this message's response, otherwise whether it is OK
    pub fn check_response(&self, frame: &Frame) -> Option<bool> {
        match self {
            Message::Controller(cmd) => cmd.check_response(frame),
            Message::SendData(_) | Message::SendDataMulticast(_) => {
                if !frame.is_response() || frame.function != self.function() {
                    return None;
                }
                // The controller reports whether it accepted the frame
                Some(frame.payload.first().copied().unwrap_or(0) != 0)
            }
            Message::SendDataAbort => None,
        }
    }

    /// `None` if `frame` is not this message's callback, otherwise its status
    pub fn check_callback(&self, frame: &Frame, callback_id: u8) -> Option<CallbackStatus> {
        match self {
            Message::Controller(cmd) => cmd.check_callback(frame, callback_id),
            Message::SendData(_) | Message::SendDataMulticast(_) => {
                if !frame.is_request() || frame.function != self.function() {
                    return None;
                }
                if frame.payload.first().copied() != Some(callback_id) {
                    return None;
                }
                match frame.payload.get(1).copied() {
                    Some(0) => Some(CallbackStatus::Ok { is_final: true }),
                    _ => Some(CallbackStatus::Failed),
                }
            }
            Message::SendDataAbort => None,
        }
    }

    /// Build the request frame
    pub fn to_frame(&self, callback_id: u8) -> Frame {
        match self {
            Message::Controller(cmd) => Frame::request(cmd.function(), cmd.payload()),
            Message::SendData(req) => {
                let cc = req.command.encode();
                let mut buf = BytesMut::with_capacity(cc.len() + 4);
                buf.put_u8(req.node_id.0);
                buf.put_u8(len_byte(cc.len()));
                buf.extend_from_slice(&cc);
                buf.put_u8(req.transmit_options.0);
                buf.put_u8(callback_id);
                Frame::request(FunctionType::SEND_DATA, buf.freeze())
            }
            Message::SendDataMulticast(req) => {
                let cc = req.command.encode();
                let mut buf = BytesMut::with_capacity(cc.len() + req.node_ids.len() + 4);
                buf.put_u8(len_byte(req.node_ids.len()));
                for node in &req.node_ids {
                    buf.put_u8(node.0);
                }
                buf.put_u8(len_byte(cc.len()));
                buf.extend_from_slice(&cc);
                buf.put_u8(req.transmit_options.0);
                buf.put_u8(callback_id);
                Frame::request(FunctionType::SEND_DATA_MULTICAST, buf.freeze())
            }
            Message::SendDataAbort => Frame::request(FunctionType::SEND_DATA_ABORT, Bytes::new()),
        }
    }

    /// Check that the message fits in a single frame
    pub fn validate(&self) -> Result<()> {
        self.to_frame(0).encode().map(|_| ())
    }

    /// The node command carried by SendData-class messages
    pub fn node_command(&self) -> Option<&Arc<dyn NodeCommand>> {
        match self {
            Message::SendData(req) => Some(&req.command),
            Message::SendDataMulticast(req) => Some(&req.command),
            _ => None,
        }
    }

    /// Whether this is a ping (NoOperation to a single node)
    pub fn is_ping(&self) -> bool {
        match self {
            Message::SendData(req) => {
                req.command.encode()[..] == [NoOperation::COMMAND_CLASS]
            }
            _ => false,
        }
    }
}

// Anything too long for a length byte also overflows the frame, which
// `Frame::encode` refuses
fn len_byte(len: usize) -> u8 {
    u8::try_from(len).unwrap_or(u8::MAX)
}

impl MessageCapabilities for Message {
    fn is_send_data_class(&self) -> bool {
        matches!(self, Message::SendData(_) | Message::SendDataMulticast(_))
    }

    fn is_multicast(&self) -> bool {
        matches!(self, Message::SendDataMulticast(_))
    }

    fn max_send_attempts(&self) -> u8 {
        match self {
            Message::SendData(req) => req.max_send_attempts,
            Message::SendDataMulticast(req) => req.max_send_attempts,
            Message::Controller(_) | Message::SendDataAbort => 1,
        }
    }

    fn requires_pre_transmit_handshake(&self) -> bool {
        self.node_command()
            .map(|cmd| cmd.pre_transmit_handshake().is_some())
            .unwrap_or(false)
    }

    fn expects_node_reply(&self) -> bool {
        // Multicast reports arrive from several nodes and are left to the
        // unsolicited callback
        match self {
            Message::SendData(req) => req.command.expects_node_reply(),
            _ => false,
        }
    }

    fn is_expected_reply(&self, reply: &InboundCommand) -> bool {
        match self {
            Message::SendData(req) => {
                reply.node_id == req.node_id && req.command.is_expected_reply(reply)
            }
            _ => false,
        }
    }

    fn target_node_id(&self) -> Option<NodeId> {
        match self {
            Message::SendData(req) => Some(req.node_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BasicGet;

    impl NodeCommand for BasicGet {
        fn name(&self) -> &str {
            "BasicGet"
        }

        fn encode(&self) -> Bytes {
            Bytes::from_static(&[0x20, 0x02])
        }

        fn expects_node_reply(&self) -> bool {
            true
        }

        fn is_expected_reply(&self, reply: &InboundCommand) -> bool {
            reply.payload.starts_with(&[0x20, 0x03])
        }
    }

    #[test]
    fn test_send_data_frame_layout() {
        let msg = Message::send_data(NodeId(7), BasicGet);
        let frame = msg.to_frame(0x2A);

        assert_eq!(frame.function, FunctionType::SEND_DATA);
        assert_eq!(frame.payload.as_ref(), &[0x07, 0x02, 0x20, 0x02, 0x25, 0x2A]);
    }

    #[test]
    fn test_multicast_frame_layout() {
        let msg = Message::SendDataMulticast(SendDataMulticastRequest::new(
            vec![NodeId(2), NodeId(3)],
            Arc::new(NoOperation),
        ));
        let frame = msg.to_frame(5);

        assert_eq!(frame.payload.as_ref(), &[0x02, 0x02, 0x03, 0x01, 0x00, 0x25, 0x05]);
        assert!(msg.is_multicast());
        assert_eq!(msg.target_node_id(), None);
    }

    #[test]
    fn test_send_data_response_and_callback_checks() {
        let msg = Message::ping(NodeId(4));

        let ok = Frame::response(FunctionType::SEND_DATA, vec![0x01]);
        let nok = Frame::response(FunctionType::SEND_DATA, vec![0x00]);
        let other = Frame::response(FunctionType::GET_CONTROLLER_VERSION, vec![0x01]);
        assert_eq!(msg.check_response(&ok), Some(true));
        assert_eq!(msg.check_response(&nok), Some(false));
        assert_eq!(msg.check_response(&other), None);

        let cb_ok = Frame::request(FunctionType::SEND_DATA, vec![0x09, 0x00]);
        let cb_no_ack = Frame::request(FunctionType::SEND_DATA, vec![0x09, 0x01]);
        let cb_other_id = Frame::request(FunctionType::SEND_DATA, vec![0x0A, 0x00]);
        assert_eq!(
            msg.check_callback(&cb_ok, 9),
            Some(CallbackStatus::Ok { is_final: true })
        );
        assert_eq!(msg.check_callback(&cb_no_ack, 9), Some(CallbackStatus::Failed));
        assert_eq!(msg.check_callback(&cb_other_id, 9), None);
    }

    #[test]
    fn test_capabilities() {
        let get = Message::send_data(NodeId(3), BasicGet);
        assert!(get.is_send_data_class());
        assert!(get.expects_node_reply());
        assert_eq!(get.max_send_attempts(), DEFAULT_SEND_DATA_ATTEMPTS);

        let report = InboundCommand {
            node_id: NodeId(3),
            payload: Bytes::from_static(&[0x20, 0x03, 0xFF]),
        };
        let wrong_node = InboundCommand {
            node_id: NodeId(4),
            ..report.clone()
        };
        assert!(get.is_expected_reply(&report));
        assert!(!get.is_expected_reply(&wrong_node));

        let version = Message::controller(GetControllerVersion);
        assert!(!version.is_send_data_class());
        assert!(version.expects_response());
        assert!(!version.expects_callback());

        let multicast_get = Message::SendDataMulticast(SendDataMulticastRequest::new(
            vec![NodeId(2), NodeId(3)],
            Arc::new(BasicGet),
        ));
        assert!(!multicast_get.expects_node_reply());

        assert!(!Message::SendDataAbort.expects_response());
        assert!(Message::ping(NodeId(1)).is_ping());
        assert!(!get.is_ping());
    }

    #[derive(Debug)]
    struct Configuration(usize);

    impl NodeCommand for Configuration {
        fn name(&self) -> &str {
            "ConfigurationSet"
        }

        fn encode(&self) -> Bytes {
            Bytes::from(vec![0x70; self.0])
        }
    }

    #[test]
    fn test_validate_frame_size() {
        // node, len, cc.., tx_options, callback_id
        assert!(Message::send_data(NodeId(2), Configuration(248)).validate().is_ok());
        assert!(Message::send_data(NodeId(2), Configuration(249)).validate().is_err());
        assert!(Message::send_data(NodeId(2), Configuration(300)).validate().is_err());

        let crowd: Vec<NodeId> = (1..=250).map(NodeId).collect();
        let multicast = Message::SendDataMulticast(SendDataMulticastRequest::new(
            crowd,
            Arc::new(NoOperation),
        ));
        assert!(matches!(
            multicast.validate(),
            Err(crate::error::DriverError::InvalidFrame(_))
        ));
        assert!(Message::ping(NodeId(1)).validate().is_ok());
    }

    #[test]
    fn test_parse_version() {
        let frame = Frame::response(
            FunctionType::GET_CONTROLLER_VERSION,
            b"Z-Wave 7.18\0\x01".to_vec(),
        );
        assert_eq!(
            GetControllerVersion::parse_version(&frame).as_deref(),
            Some("Z-Wave 7.18")
        );
    }
}
