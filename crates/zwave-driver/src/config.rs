//! Configuration types for the Z-Wave driver
//!
//! Every delay the transmission pipeline uses is defined once here. The
//! layers differ on purpose: the serial command layer backs off linearly
//! between attempts, while the send layer waits a fixed delay because it
//! retries a whole round trip to the node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DriverError, Result};

/// Default baud rate for Z-Wave serial API controllers
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// How long the controller has to ACK a frame
pub const ACK_TIMEOUT_MS: u64 = 1600;

/// How long the controller has to send a response frame
pub const RESPONSE_TIMEOUT_MS: u64 = 1600;

/// How long the controller has to send a callback. SendData callbacks
/// cover routing through the mesh, which can take a long time.
pub const CALLBACK_TIMEOUT_MS: u64 = 65000;

/// How long a node has to answer a command that expects a reply
pub const NODE_UPDATE_TIMEOUT_MS: u64 = 1600;

/// How long a node has to answer a pre-transmit handshake
pub const HANDSHAKE_TIMEOUT_MS: u64 = 1600;

/// Fixed delay between node-level SendData attempts
pub const SEND_DATA_RETRY_DELAY_MS: u64 = 500;

/// First serial command retry delay
pub const SERIAL_RETRY_BASE_MS: u64 = 100;

/// Added to the serial command retry delay for every further attempt
pub const SERIAL_RETRY_STEP_MS: u64 = 1000;

/// Default attempts for a serial command sent to the controller
pub const DEFAULT_CONTROLLER_ATTEMPTS: u8 = 3;

/// Serial attempts per node-level attempt for SendData-class messages
pub const DEFAULT_SEND_DATA_SERIAL_ATTEMPTS: u8 = 1;

/// Default node-level attempts for SendData-class messages
pub const DEFAULT_SEND_DATA_ATTEMPTS: u8 = 3;

/// Delay before the serial command layer retries after `attempt` failed
/// attempts: 100 ms, 1100 ms, 2100 ms, ...
pub fn serial_retry_delay(attempt: u8) -> Duration {
    let step = u64::from(attempt.saturating_sub(1));
    Duration::from_millis(SERIAL_RETRY_BASE_MS + SERIAL_RETRY_STEP_MS * step)
}

/// Main configuration for the Z-Wave driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Interface configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Timeouts and retry delays
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Attempt ceilings
    #[serde(default)]
    pub attempts: AttemptConfig,

    /// Queue behavior
    #[serde(default)]
    pub queue: QueueConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl DriverConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.attempts.controller == 0 || self.attempts.send_data_serial == 0 {
            return Err(DriverError::InvalidConfig(
                "attempt ceilings must be at least 1".to_string(),
            ));
        }
        if self.queue.command_channel_size == 0 {
            return Err(DriverError::InvalidConfig(
                "command_channel_size must be at least 1".to_string(),
            ));
        }
        let t = &self.timeouts;
        if [t.ack, t.response, t.callback, t.node_update, t.handshake]
            .iter()
            .any(Duration::is_zero)
        {
            return Err(DriverError::InvalidConfig("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Interface type for connecting to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InterfaceConfig {
    /// Serial port connection
    Serial {
        /// Path to serial port (e.g., /dev/ttyACM0, COM3)
        port: PathBuf,
        /// Baud rate (default: 115200)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        InterfaceConfig::Serial {
            port: PathBuf::from("/dev/ttyACM0"),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Timeouts used by the serial command and send layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Wait for ACK after writing a frame
    #[serde(with = "humantime_serde", default = "default_ack")]
    pub ack: Duration,

    /// Wait for the response frame after ACK
    #[serde(with = "humantime_serde", default = "default_response")]
    pub response: Duration,

    /// Wait for the callback frame
    #[serde(with = "humantime_serde", default = "default_callback")]
    pub callback: Duration,

    /// Wait for a node's reply after the command was delivered
    #[serde(with = "humantime_serde", default = "default_node_update")]
    pub node_update: Duration,

    /// Wait for a node's handshake reply
    #[serde(with = "humantime_serde", default = "default_handshake")]
    pub handshake: Duration,

    /// Delay between node-level SendData attempts
    #[serde(with = "humantime_serde", default = "default_send_data_retry")]
    pub send_data_retry: Duration,
}

fn default_ack() -> Duration {
    Duration::from_millis(ACK_TIMEOUT_MS)
}

fn default_response() -> Duration {
    Duration::from_millis(RESPONSE_TIMEOUT_MS)
}

fn default_callback() -> Duration {
    Duration::from_millis(CALLBACK_TIMEOUT_MS)
}

fn default_node_update() -> Duration {
    Duration::from_millis(NODE_UPDATE_TIMEOUT_MS)
}

fn default_handshake() -> Duration {
    Duration::from_millis(HANDSHAKE_TIMEOUT_MS)
}

fn default_send_data_retry() -> Duration {
    Duration::from_millis(SEND_DATA_RETRY_DELAY_MS)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ack: default_ack(),
            response: default_response(),
            callback: default_callback(),
            node_update: default_node_update(),
            handshake: default_handshake(),
            send_data_retry: default_send_data_retry(),
        }
    }
}

/// Attempt ceilings for the serial command layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptConfig {
    /// Serial attempts for controller commands
    #[serde(default = "default_controller_attempts")]
    pub controller: u8,

    /// Serial attempts per node-level attempt for SendData-class messages
    #[serde(default = "default_send_data_serial_attempts")]
    pub send_data_serial: u8,
}

fn default_controller_attempts() -> u8 {
    DEFAULT_CONTROLLER_ATTEMPTS
}

fn default_send_data_serial_attempts() -> u8 {
    DEFAULT_SEND_DATA_SERIAL_ATTEMPTS
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            controller: DEFAULT_CONTROLLER_ATTEMPTS,
            send_data_serial: DEFAULT_SEND_DATA_SERIAL_ATTEMPTS,
        }
    }
}

/// Transaction queue behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of the channel between handles and the driver task
    #[serde(default = "default_command_channel_size")]
    pub command_channel_size: usize,

    /// Requeue failed transactions for sleeping nodes until they wake up
    #[serde(default = "default_defer_sleeping_nodes")]
    pub defer_sleeping_nodes: bool,
}

fn default_command_channel_size() -> usize {
    256
}

fn default_defer_sleeping_nodes() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            command_channel_size: 256,
            defer_sleeping_nodes: true,
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Delay before reconnecting
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub delay: Duration,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(2),
        }
    }
}

/// Builder for DriverConfig
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.interface = InterfaceConfig::Serial {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        };
        self
    }

    /// Set serial port with baud rate
    pub fn serial_port_with_baud(mut self, port: impl Into<PathBuf>, baud_rate: u32) -> Self {
        self.config.interface = InterfaceConfig::Serial {
            port: port.into(),
            baud_rate,
        };
        self
    }

    /// Override all timeouts
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Set serial attempts for controller commands (at least 1)
    pub fn controller_attempts(mut self, attempts: u8) -> Self {
        self.config.attempts.controller = attempts.max(1);
        self
    }

    /// Set serial attempts per SendData attempt (at least 1)
    pub fn send_data_serial_attempts(mut self, attempts: u8) -> Self {
        self.config.attempts.send_data_serial = attempts.max(1);
        self
    }

    /// Enable or disable sleeping-node deferral
    pub fn defer_sleeping_nodes(mut self, enabled: bool) -> Self {
        self.config.queue.defer_sleeping_nodes = enabled;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.timeouts.ack, Duration::from_millis(1600));
        assert_eq!(config.timeouts.callback, Duration::from_millis(65000));
        assert_eq!(config.attempts.controller, 3);
        assert!(config.queue.defer_sleeping_nodes);
    }

    #[test]
    fn test_serial_retry_delay() {
        assert_eq!(serial_retry_delay(1), Duration::from_millis(100));
        assert_eq!(serial_retry_delay(2), Duration::from_millis(1100));
        assert_eq!(serial_retry_delay(3), Duration::from_millis(2100));
    }

    #[test]
    fn test_config_builder() {
        let config = DriverConfigBuilder::new()
            .serial_port_with_baud("/dev/ttyUSB0", 57600)
            .controller_attempts(0)
            .defer_sleeping_nodes(false)
            .build();

        assert_eq!(config.attempts.controller, 1);
        assert!(!config.queue.defer_sleeping_nodes);
        match config.interface {
            InterfaceConfig::Serial { baud_rate, .. } => assert_eq!(baud_rate, 57600),
        }
    }

    #[test]
    fn test_validate() {
        assert!(DriverConfig::default().validate().is_ok());

        let json = r#"{ "attempts": { "controller": 0 } }"#;
        let config: DriverConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(DriverError::InvalidConfig(_))));

        let json = r#"{ "queue": { "command_channel_size": 0 } }"#;
        let config: DriverConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(DriverError::InvalidConfig(_))));

        let json = r#"{ "timeouts": { "ack": "0s" } }"#;
        let config: DriverConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.validate(), Err(DriverError::InvalidConfig(_))));
    }

    #[test]
    fn test_humantime_timeouts_from_json() {
        let json = r#"{ "timeouts": { "callback": "30s", "ack": "800ms" } }"#;
        let config: DriverConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.timeouts.callback, Duration::from_secs(30));
        assert_eq!(config.timeouts.ack, Duration::from_millis(800));
        assert_eq!(config.timeouts.response, Duration::from_millis(1600));
    }
}
