//! Host-side Z-Wave serial API driver
//!
//! This crate implements the transmission pipeline a host needs to talk to a
//! Z-Wave controller over its serial API: a prioritised transaction queue,
//! the per-frame ACK/response/callback exchange with the controller, and
//! node-level retries, handshakes and sleeping-node handling on top of it.
//!
//! # Architecture
//!
//! The pipeline is built from three nested state machines:
//!
//! 1. **Serial command session** - one frame: write, ACK, response, callback
//! 2. **Command sequencer** - serialises sessions on the link, allocates
//!    callback ids and aborts a SendData whose callback never came
//! 3. **Send session** - one transaction: handshake, execution, node reply
//!    wait, node-level retries and sleeping-node deferral
//!
//! All three are sans-IO and combined by [`TransmitPipeline`]. The async
//! [`Driver`] feeds it from a [`ControllerInterface`] and a timer, and
//! callers talk to it through a [`DriverHandle`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: zwave-driver = { version = "0.1", features = ["serial"] }
//! use std::sync::Arc;
//! use zwave_driver::{
//!     Driver, DriverConfigBuilder, Message, NodeId, NodeStatusTable, SerialInterface,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DriverConfigBuilder::new().serial_port("/dev/ttyACM0").build();
//!     let interface = SerialInterface::new("/dev/ttyACM0");
//!     let (driver, handle) = Driver::new(interface, &config, Arc::new(NodeStatusTable::new()));
//!     tokio::spawn(driver.run());
//!
//!     handle.ping(NodeId(7)).await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port interface (requires `libudev-dev` on Linux)
//!
//! # Protocol Details
//!
//! Data frames on the wire are `SOF len type function payload checksum`
//! where the checksum is `0xFF` XORed with every byte after SOF. The host
//! answers every data frame with ACK (0x06), or NAK (0x15) if it is corrupt;
//! the controller signals collisions with CAN (0x18).

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Transport
pub mod config;
pub mod error;
pub mod frame;
pub mod interface;

// Messages and scheduling
pub mod message;
pub mod node_status;
pub mod priority;
pub mod queue;
pub mod transaction;

// State machines
pub mod command_queue;
pub mod send_thread;
pub mod serial_command;
pub mod unsolicited;

// Runtime
pub mod driver;
pub mod pipeline;

// Testing
pub mod test_utils;

pub use config::{
    AttemptConfig, DriverConfig, DriverConfigBuilder, InterfaceConfig, QueueConfig,
    ReconnectConfig, TimeoutConfig,
};
pub use error::{DriverError, FailureReason, ReplySource, Result, TransmitError};
pub use frame::{Frame, FrameDecoder, FrameType, FunctionType, SerialEvent};
pub use interface::{ConnectionState, ControllerInterface};

#[cfg(feature = "serial")]
pub use interface::SerialInterface;

pub use message::{
    CallbackStatus, ControllerCommand, GetControllerVersion, InboundCommand, Message,
    MessageCapabilities, NoOperation, NodeCommand, NodeId, SendDataMulticastRequest,
    SendDataRequest, TransmitOptions,
};
pub use node_status::{ListeningMode, NodeStatusProvider, NodeStatusTable};
pub use priority::Priority;
pub use queue::{ReduceAction, ReduceSummary, TransactionQueue};
pub use transaction::{Transaction, TransactionId, TransmitReply, TransmitResult};

pub use command_queue::CommandSequencer;
pub use send_thread::SendSession;
pub use serial_command::{RetryLayer, RetryNotice, SerialCommandSession};
pub use unsolicited::{InboundFrame, UnsolicitedRouter};

pub use driver::{
    Driver, DriverHandle, DriverStats, PendingTransmit, RetryCallback, UnsolicitedCallback,
};
pub use pipeline::{Effect, PipelineStats, TimerKind, TransactionSource, TransmitPipeline};

pub use test_utils::{find_controller_device, list_available_devices, DeviceInfo};
pub use test_utils::{MockController, MockHandle};

// Protocol constants re-exports
pub use config::{
    ACK_TIMEOUT_MS, CALLBACK_TIMEOUT_MS, DEFAULT_BAUD_RATE, RESPONSE_TIMEOUT_MS,
    SEND_DATA_RETRY_DELAY_MS,
};
pub use frame::{ACK, CAN, NAK, SOF};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
