//! Serial port interface for Z-Wave controllers
//!
//! Bytes read from the port go through a [`FrameDecoder`]. Every valid data
//! frame is answered with ACK and every corrupt one with NAK, as the serial
//! API requires of the host.

use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{DriverError, Result};
use crate::frame::{FrameDecoder, SerialEvent, ACK, NAK};
use crate::interface::{ConnectionState, ControllerInterface};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 256;

/// Timeout for blocking port operations
const PORT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Serial interface for a Z-Wave controller
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Decoder holding partial frames
    decoder: FrameDecoder,

    /// Event decoded but not yet returned
    ready: Option<SerialEvent>,

    /// ACK or NAK owed to the controller
    reply: Option<u8>,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            stream: None,
            state: ConnectionState::Disconnected,
            decoder: FrameDecoder::new(),
            ready: None,
            reply: None,
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Decode what is buffered, queueing the ACK/NAK the controller expects
    fn decode_buffered(&mut self) {
        if self.ready.is_some() || self.reply.is_some() {
            return;
        }
        match self.decoder.decode() {
            Ok(Some(event)) => {
                if matches!(event, SerialEvent::Frame(_)) {
                    self.reply = Some(ACK);
                }
                self.ready = Some(event);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Dropping corrupt frame");
                self.reply = Some(NAK);
            }
        }
    }

    async fn send_reply(&mut self) -> Result<()> {
        let Some(byte) = self.reply else {
            return Ok(());
        };
        let stream = self.stream.as_mut().ok_or(DriverError::Disconnected)?;
        stream.write_all(&[byte]).await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            DriverError::WriteError(e.to_string())
        })?;
        trace!(byte, "Sent link reply");
        self.reply = None;
        Ok(())
    }
}

#[async_trait]
impl ControllerInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        if !self.port_path.exists() {
            self.state = ConnectionState::Disconnected;
            return Err(DriverError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(PORT_TIMEOUT)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                DriverError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.decoder.clear();
        self.ready = None;
        self.reply = None;

        // A NAK makes the controller drop anything half-sent from a previous session
        if let Some(stream) = self.stream.as_mut() {
            stream
                .write_all(&[NAK])
                .await
                .map_err(|e| DriverError::WriteError(e.to_string()))?;
        }

        info!(port = %self.port_path.display(), "Connected to Z-Wave controller");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.state = ConnectionState::Disconnected;
        self.decoder.clear();
        self.ready = None;
        self.reply = None;

        info!(port = %self.port_path.display(), "Disconnected from serial port");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read_event(&mut self) -> Result<Option<SerialEvent>> {
        if self.stream.is_none() {
            return Err(DriverError::Disconnected);
        }

        self.decode_buffered();
        if self.ready.is_none() && self.reply.is_none() {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            let stream = self.stream.as_mut().ok_or(DriverError::Disconnected)?;
            match stream.read(&mut buf).await {
                Ok(0) => {
                    // EOF - controller unplugged
                    self.state = ConnectionState::Disconnected;
                    return Err(DriverError::Disconnected);
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from serial port");
                    self.decoder.push(&buf[..n]);
                    self.decode_buffered();
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    return Ok(None);
                }
                Err(e) => {
                    error!(error = %e, "Serial read error");
                    self.state = ConnectionState::Disconnected;
                    return Err(DriverError::ReadError(e.to_string()));
                }
            }
        }

        // The reply goes out before the event is handed over
        self.send_reply().await?;
        Ok(self.ready.take())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(DriverError::Disconnected)?;
        debug!(size = frame.len(), "Writing frame");

        stream.write_all(frame).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            DriverError::WriteError(e.to_string())
        })?;

        stream
            .flush()
            .await
            .map_err(|e| DriverError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .field("buffered", &self.decoder.buffered())
            .finish()
    }
}
