//! Classification of frames no serial command session claimed

use bytes::Bytes;
use tracing::trace;

use crate::frame::{Frame, FunctionType};
use crate::message::{InboundCommand, NodeId};

/// ApplicationUpdate status for a received node information frame
pub const UPDATE_STATE_NODE_INFO_RECEIVED: u8 = 0x84;

/// An inbound frame after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A command sent by a node
    NodeCommand(InboundCommand),
    /// A node announced itself with a node information frame
    NodeInfo {
        /// The announcing node
        node_id: NodeId,
        /// The raw frame
        frame: Frame,
    },
    /// Anything else
    Other(Frame),
}

/// Turns raw frames into [`InboundFrame`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsolicitedRouter;

impl UnsolicitedRouter {
    /// Classify a frame the controller sent on its own
    pub fn classify(frame: Frame) -> InboundFrame {
        if !frame.is_request() {
            return InboundFrame::Other(frame);
        }

        let classified = match frame.function {
            // [rx_status, source, length, command...]
            FunctionType::APPLICATION_COMMAND => command_at(&frame.payload, 1),
            // [rx_status, destination, source, length, command...]
            FunctionType::BRIDGE_APPLICATION_COMMAND => command_at(&frame.payload, 2),
            FunctionType::APPLICATION_UPDATE => {
                let payload = &frame.payload;
                if payload.len() >= 2 && payload[0] == UPDATE_STATE_NODE_INFO_RECEIVED {
                    let node_id = NodeId(payload[1]);
                    trace!(node = %node_id, "Node information frame");
                    return InboundFrame::NodeInfo { node_id, frame };
                }
                None
            }
            _ => None,
        };

        match classified {
            Some(command) => InboundFrame::NodeCommand(command),
            None => InboundFrame::Other(frame),
        }
    }
}

fn command_at(payload: &Bytes, source_index: usize) -> Option<InboundCommand> {
    let node = *payload.get(source_index)?;
    let length = *payload.get(source_index + 1)? as usize;
    let start = source_index + 2;
    if payload.len() < start + length {
        return None;
    }
    Some(InboundCommand {
        node_id: NodeId(node),
        payload: payload.slice(start..start + length),
    })
}
