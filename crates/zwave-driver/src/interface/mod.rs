//! Controller interfaces
//!
//! - [`SerialInterface`] - USB stick or UART controller (requires `serial` feature)
//! - [`MockController`](crate::test_utils::MockController) - scripted controller for tests
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::SerialInterface;

use crate::error::Result;
use crate::frame::SerialEvent;
use async_trait::async_trait;

/// Link to a Z-Wave controller speaking the serial API
///
/// Implementations deliver decoded [`SerialEvent`]s and write raw frame
/// bytes. `read_event` must be cancel safe: the driver polls it inside
/// `tokio::select!`.
#[async_trait]
pub trait ControllerInterface: Send + Sync {
    /// Open the link
    async fn connect(&mut self) -> Result<()>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read the next event from the controller
    ///
    /// Returns `None` if nothing complete is available yet.
    /// Returns `Err` on connection/read errors.
    async fn read_event(&mut self) -> Result<Option<SerialEvent>>;

    /// Write an encoded frame to the controller
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Get the interface name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, may reconnect
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
