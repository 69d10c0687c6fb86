//! Error types for Z-Wave driver operations
//!
//! Two families live here:
//!
//! - [`DriverError`] covers the driver itself: the serial port, framing,
//!   configuration and the command channel between handles and the driver task.
//! - [`TransmitError`] is what a single transaction settles with when it fails.
//!   It always carries a flat [`FailureReason`] when the failure came from the
//!   wire, so callers can tell an ACK timeout from a node that never answered.

use std::fmt;

use thiserror::Error;

use crate::frame::Frame;

/// Main error type for driver operations
#[derive(Error, Debug)]
pub enum DriverError {
    // ===== Serial/Interface Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Serial port disconnected
    #[error("Serial port disconnected")]
    Disconnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Framing Errors =====
    /// Frame checksum did not match
    #[error("Invalid checksum: expected 0x{expected:02X}, got 0x{got:02X}")]
    InvalidChecksum {
        /// Checksum computed over the received bytes
        expected: u8,
        /// Checksum byte that was received
        got: u8,
    },

    /// Invalid frame format
    #[error("Invalid frame format: {0}")]
    InvalidFrame(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Driver Errors =====
    /// Driver task is not running
    #[error("Z-Wave driver is not running")]
    DriverNotRunning,

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionTimeout { .. }
                | DriverError::Disconnected
                | DriverError::ReadError(_)
                | DriverError::WriteError(_)
        )
    }

    /// Check if this is a framing error (bad data from the controller)
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            DriverError::InvalidChecksum { .. } | DriverError::InvalidFrame(_)
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            DriverError::PortNotFound(_) => "PORT_NOT_FOUND",
            DriverError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            DriverError::ReadError(_) => "READ_ERROR",
            DriverError::WriteError(_) => "WRITE_ERROR",
            DriverError::Disconnected => "DISCONNECTED",
            DriverError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            DriverError::InvalidChecksum { .. } => "INVALID_CHECKSUM",
            DriverError::InvalidFrame(_) => "INVALID_FRAME",
            DriverError::InvalidConfig(_) => "INVALID_CONFIG",
            DriverError::DriverNotRunning => "DRIVER_NOT_RUNNING",
            DriverError::ChannelError(_) => "CHANNEL_ERROR",
            DriverError::ChannelClosed => "CHANNEL_CLOSED",
            DriverError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for DriverError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => DriverError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                DriverError::Io(std::io::Error::new(kind, err.description))
            }
            _ => DriverError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for DriverError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        DriverError::ChannelError(err.to_string())
    }
}

/// Why a single transmission failed.
///
/// The same set is used by the serial command layer and the send layer;
/// `NodeTimeout` only ever comes from the send layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The transport write itself failed
    SendFailure,
    /// Controller answered with CAN (collision)
    Can,
    /// Controller answered with NAK
    Nak,
    /// No ACK within the ACK timeout
    AckTimeout,
    /// No response frame within the response timeout
    ResponseTimeout,
    /// Response frame arrived but reported failure
    ResponseNok,
    /// No callback within the callback timeout
    CallbackTimeout,
    /// Callback arrived but reported failure
    CallbackNok,
    /// The target node did not answer in time
    NodeTimeout,
}

impl FailureReason {
    /// Whether the failure concerns the remote node rather than the controller
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            FailureReason::CallbackNok | FailureReason::CallbackTimeout | FailureReason::NodeTimeout
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::SendFailure => "send failure",
            FailureReason::Can => "CAN",
            FailureReason::Nak => "NAK",
            FailureReason::AckTimeout => "ACK timeout",
            FailureReason::ResponseTimeout => "response timeout",
            FailureReason::ResponseNok => "response NOK",
            FailureReason::CallbackTimeout => "callback timeout",
            FailureReason::CallbackNok => "callback NOK",
            FailureReason::NodeTimeout => "node timeout",
        };
        f.write_str(s)
    }
}

/// Which side of the link a reply was expected from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// The local controller (response or callback)
    Controller,
    /// The remote node
    Node,
}

impl fmt::Display for ReplySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplySource::Controller => write!(f, "controller"),
            ReplySource::Node => write!(f, "node"),
        }
    }
}

/// Final failure of a transaction, as seen by the caller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransmitError {
    /// The frame never made it past the controller
    #[error("Failed to send {command} after {attempts} attempts ({reason})")]
    SendFailed {
        /// Command description
        command: String,
        /// Attempts made at the failing layer
        attempts: u8,
        /// Last recorded reason
        reason: FailureReason,
    },

    /// A response, callback or node reply did not arrive in time
    #[error("Timeout waiting for {side} response to {command} ({reason})")]
    Timeout {
        /// Command description
        command: String,
        /// Side that failed to answer
        side: ReplySource,
        /// Last recorded reason
        reason: FailureReason,
        /// Frame received before the timeout, if any
        partial: Option<Frame>,
    },

    /// The controller or node answered with a failure status
    #[error("The {side} reported failure for {command} ({reason})")]
    Reported {
        /// Command description
        command: String,
        /// Who reported the failure
        side: ReplySource,
        /// Last recorded reason
        reason: FailureReason,
        /// The frame carrying the failure status
        partial: Option<Frame>,
    },

    /// Removed from the queue without being sent
    #[error("Transaction was dropped")]
    Dropped,

    /// Rejected by a queue reduction
    #[error("Transaction was rejected: {0}")]
    Rejected(String),

    /// The message cannot be transmitted as requested
    #[error("Unsupported transmission: {0}")]
    Unsupported(String),

    /// The driver stopped before the transaction was settled
    #[error("Z-Wave driver stopped")]
    DriverStopped,
}

impl TransmitError {
    /// Build the caller-facing error for a wire-level failure
    pub fn from_reason(
        reason: FailureReason,
        command: impl Into<String>,
        attempts: u8,
        partial: Option<Frame>,
    ) -> Self {
        let command = command.into();
        match reason {
            FailureReason::SendFailure
            | FailureReason::Can
            | FailureReason::Nak
            | FailureReason::AckTimeout => TransmitError::SendFailed {
                command,
                attempts,
                reason,
            },
            FailureReason::ResponseTimeout | FailureReason::CallbackTimeout => {
                TransmitError::Timeout {
                    command,
                    side: ReplySource::Controller,
                    reason,
                    partial,
                }
            }
            FailureReason::NodeTimeout => TransmitError::Timeout {
                command,
                side: ReplySource::Node,
                reason,
                partial,
            },
            FailureReason::ResponseNok => TransmitError::Reported {
                command,
                side: ReplySource::Controller,
                reason,
                partial,
            },
            FailureReason::CallbackNok => TransmitError::Reported {
                command,
                side: ReplySource::Node,
                reason,
                partial,
            },
        }
    }

    /// The wire-level reason, if this failure came from the wire
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            TransmitError::SendFailed { reason, .. }
            | TransmitError::Timeout { reason, .. }
            | TransmitError::Reported { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Any frame received before the failure was decided
    pub fn partial_reply(&self) -> Option<&Frame> {
        match self {
            TransmitError::Timeout { partial, .. } | TransmitError::Reported { partial, .. } => {
                partial.as_ref()
            }
            _ => None,
        }
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            TransmitError::SendFailed { .. } => "SEND_FAILED",
            TransmitError::Timeout { .. } => "TIMEOUT",
            TransmitError::Reported { .. } => "REPORTED_FAILURE",
            TransmitError::Dropped => "DROPPED",
            TransmitError::Rejected(_) => "REJECTED",
            TransmitError::Unsupported(_) => "UNSUPPORTED",
            TransmitError::DriverStopped => "DRIVER_STOPPED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = DriverError::PortNotFound("/dev/ttyACM0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
    }

    #[test]
    fn test_is_retriable() {
        assert!(DriverError::Disconnected.is_retriable());
        assert!(DriverError::ConnectionTimeout { duration_ms: 5000 }.is_retriable());
        assert!(!DriverError::InvalidChecksum {
            expected: 0x12,
            got: 0x34
        }
        .is_retriable());
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(FailureReason::SendFailure.to_string(), "send failure");
        assert_eq!(FailureReason::AckTimeout.to_string(), "ACK timeout");
        assert_eq!(FailureReason::CallbackTimeout.to_string(), "callback timeout");
        assert_eq!(FailureReason::NodeTimeout.to_string(), "node timeout");
    }

    #[test]
    fn test_classification_by_reason() {
        let err = TransmitError::from_reason(FailureReason::Can, "SendData", 3, None);
        assert!(matches!(err, TransmitError::SendFailed { attempts: 3, .. }));
        assert!(err.to_string().contains("after 3 attempts"));

        let err = TransmitError::from_reason(FailureReason::NodeTimeout, "SendData", 1, None);
        assert!(matches!(
            err,
            TransmitError::Timeout {
                side: ReplySource::Node,
                ..
            }
        ));

        let err = TransmitError::from_reason(FailureReason::ResponseNok, "GetVersion", 1, None);
        assert_eq!(err.reason(), Some(FailureReason::ResponseNok));
        assert!(err.to_string().contains("controller reported failure"));
    }

    #[test]
    fn test_non_wire_errors_have_no_reason() {
        assert_eq!(TransmitError::Dropped.reason(), None);
        assert_eq!(TransmitError::DriverStopped.error_code(), "DRIVER_STOPPED");
    }
}
