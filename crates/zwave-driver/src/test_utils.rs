//! Test utilities: a scripted controller and hardware detection
//!
//! [`MockController`] stands in for a Z-Wave stick. Events are injected
//! through a [`MockHandle`] or produced by a responder closure that sees
//! every frame the driver writes. Reads wait on a channel, so tests using
//! paused tokio time advance straight to the next timer.
//!
//! # Example
//!
//! ```rust,ignore
//! use zwave_driver::test_utils::{replies, MockController};
//!
//! let (mock, handle) = MockController::new();
//! let mock = mock.with_responder(replies::send_data_ok);
//! // hand `mock` to a Driver, inspect `handle.written_frames()` afterwards
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{DriverError, Result};
use crate::frame::{Frame, FrameDecoder, FunctionType, SerialEvent};
use crate::interface::ControllerInterface;
use crate::message::NodeId;
use crate::unsolicited::UPDATE_STATE_NODE_INFO_RECEIVED;

/// Serial port paths Z-Wave sticks usually show up under
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/serial/by-id/usb-*Z-Wave*",
    "/dev/serial/by-id/usb-0658_0200*",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    // macOS
    "/dev/cu.usbmodem*",
    "/dev/cu.SLAB_USBtoUART*",
    "/dev/tty.usbserial-*",
];

/// USB vendors of common controllers: Sigma Designs (Aeotec, Zooz), Silicon Labs, WCH
#[cfg(feature = "serial")]
const KNOWN_VENDOR_IDS: &[u16] = &[0x0658, 0x10C4, 0x1A86];

/// Find a connected Z-Wave controller
///
/// USB ports from known vendors win; otherwise the first existing path
/// from a list of common locations is returned.
pub fn find_controller_device() -> Option<String> {
    #[cfg(feature = "serial")]
    {
        if let Ok(ports) = serialport::available_ports() {
            for port in ports {
                if is_likely_controller_port(&port) {
                    tracing::info!(port = %port.port_name, "Found likely Z-Wave controller");
                    return Some(port.port_name);
                }
            }
        }

        for pattern in COMMON_DEVICE_PATHS {
            if let Ok(entries) = glob::glob(pattern) {
                if let Some(entry) = entries.flatten().find(|e| e.exists()) {
                    let path = entry.to_string_lossy().to_string();
                    tracing::debug!(path = %path, "Found serial port");
                    return Some(path);
                }
            }
        }

        None
    }

    #[cfg(not(feature = "serial"))]
    {
        // Without serialport we can still look at the usual paths
        let found = COMMON_DEVICE_PATHS.iter().find_map(|pattern| {
            glob::glob(pattern)
                .ok()?
                .flatten()
                .find(|e| e.exists())
                .map(|e| e.to_string_lossy().to_string())
        });
        if found.is_none() {
            tracing::warn!("Serial feature not enabled and no known device path exists");
        }
        found
    }
}

#[cfg(feature = "serial")]
fn is_likely_controller_port(port: &serialport::SerialPortInfo) -> bool {
    use serialport::SerialPortType;

    match &port.port_type {
        SerialPortType::UsbPort(usb) => {
            if KNOWN_VENDOR_IDS.contains(&usb.vid) {
                tracing::debug!(vid = usb.vid, pid = usb.pid, "USB device matches known vendor");
                return true;
            }
            usb.product
                .as_deref()
                .map(|p| {
                    let p = p.to_lowercase();
                    p.contains("z-wave") || p.contains("zwave") || p.contains("uzb")
                })
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// List the serial ports on this machine
pub fn list_available_devices() -> Vec<DeviceInfo> {
    #[cfg(feature = "serial")]
    {
        serialport::available_ports()
            .map(|ports| ports.iter().map(DeviceInfo::from_serial_port).collect())
            .unwrap_or_default()
    }

    #[cfg(not(feature = "serial"))]
    {
        Vec::new()
    }
}

/// A detected serial device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the device (e.g., /dev/ttyACM0)
    pub path: String,
    /// "USB", "PCI", "Bluetooth" or "Unknown"
    pub device_type: String,
    /// USB vendor ID
    pub vendor_id: Option<u16>,
    /// USB product ID
    pub product_id: Option<u16>,
    /// Product name
    pub product_name: Option<String>,
    /// Manufacturer
    pub manufacturer: Option<String>,
    /// Whether this looks like a Z-Wave controller
    pub is_likely_controller: bool,
}

impl DeviceInfo {
    #[cfg(feature = "serial")]
    fn from_serial_port(port: &serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        let (device_type, vendor_id, product_id, product_name, manufacturer) = match &port.port_type
        {
            SerialPortType::UsbPort(usb) => (
                "USB",
                Some(usb.vid),
                Some(usb.pid),
                usb.product.clone(),
                usb.manufacturer.clone(),
            ),
            SerialPortType::PciPort => ("PCI", None, None, None, None),
            SerialPortType::BluetoothPort => ("Bluetooth", None, None, None, None),
            SerialPortType::Unknown => ("Unknown", None, None, None, None),
        };

        Self {
            path: port.port_name.clone(),
            device_type: device_type.to_string(),
            vendor_id,
            product_id,
            product_name,
            manufacturer,
            is_likely_controller: is_likely_controller_port(port),
        }
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.device_type)?;
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            write!(f, " {:04x}:{:04x}", vid, pid)?;
        }
        if let Some(product) = &self.product_name {
            write!(f, " {}", product)?;
        }
        Ok(())
    }
}

/// Computes the controller's answer to a written frame
pub type Responder = Box<dyn FnMut(&Frame) -> Vec<SerialEvent> + Send>;

#[derive(Debug)]
enum Incoming {
    Event(SerialEvent),
    LinkLost,
}

#[derive(Debug, Default)]
struct MockState {
    written: Vec<Bytes>,
    fail_writes: usize,
    connects: usize,
}

/// Scripted stand-in for a controller
pub struct MockController {
    connected: bool,
    fail_connect: bool,
    _incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming_rx: mpsc::UnboundedReceiver<Incoming>,
    scripted: VecDeque<SerialEvent>,
    responder: Option<Mutex<Responder>>,
    state: Arc<Mutex<MockState>>,
}

impl MockController {
    /// Create a mock and the handle that drives it
    pub fn new() -> (Self, MockHandle) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MockState::default()));
        let handle = MockHandle {
            incoming: incoming_tx.clone(),
            state: state.clone(),
        };
        let mock = Self {
            connected: false,
            fail_connect: false,
            _incoming_tx: incoming_tx,
            incoming_rx,
            scripted: VecDeque::new(),
            responder: None,
            state,
        };
        (mock, handle)
    }

    /// Answer every written frame with what `responder` returns
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Frame) -> Vec<SerialEvent> + Send + 'static,
    {
        self.responder = Some(Mutex::new(Box::new(responder)));
        self
    }

    /// Make `connect` fail
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    fn respond(&mut self, data: &[u8]) {
        let Some(responder) = self.responder.as_ref() else {
            return;
        };
        let Some(frame) = decode_frame(data) else {
            return;
        };
        let events = {
            let mut respond = responder.lock();
            (*respond)(&frame)
        };
        self.scripted.extend(events);
    }
}

impl std::fmt::Debug for MockController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockController")
            .field("connected", &self.connected)
            .field("scripted", &self.scripted.len())
            .field("responder", &self.responder.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl ControllerInterface for MockController {
    async fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            return Err(DriverError::ConnectionTimeout { duration_ms: 1000 });
        }
        self.connected = true;
        self.state.lock().connects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.scripted.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_event(&mut self) -> Result<Option<SerialEvent>> {
        if !self.connected {
            return Err(DriverError::Disconnected);
        }
        if let Some(event) = self.scripted.pop_front() {
            return Ok(Some(event));
        }
        match self.incoming_rx.recv().await {
            Some(Incoming::Event(event)) => Ok(Some(event)),
            Some(Incoming::LinkLost) => {
                self.connected = false;
                Err(DriverError::Disconnected)
            }
            // We hold a sender ourselves, so this never happens
            None => Err(DriverError::ChannelClosed),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(DriverError::Disconnected);
        }
        {
            let mut state = self.state.lock();
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(DriverError::WriteError("Simulated error".to_string()));
            }
            state.written.push(Bytes::copy_from_slice(frame));
        }
        self.respond(frame);
        Ok(())
    }

    fn name(&self) -> &str {
        "MockController"
    }
}

/// Drives a [`MockController`] from the test
#[derive(Clone)]
pub struct MockHandle {
    incoming: mpsc::UnboundedSender<Incoming>,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Deliver an event as if the controller sent it
    pub fn inject(&self, event: impl Into<SerialEvent>) {
        let _ = self.incoming.send(Incoming::Event(event.into()));
    }

    /// Make the next read fail as if the stick was unplugged
    pub fn break_link(&self) {
        let _ = self.incoming.send(Incoming::LinkLost);
    }

    /// Fail the next `n` writes
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().fail_writes = n;
    }

    /// Raw bytes of every successful write
    pub fn written(&self) -> Vec<Bytes> {
        self.state.lock().written.clone()
    }

    /// Every successful write, decoded
    pub fn written_frames(&self) -> Vec<Frame> {
        self.state
            .lock()
            .written
            .iter()
            .filter_map(|b| decode_frame(b))
            .collect()
    }

    /// Number of successful writes
    pub fn write_count(&self) -> usize {
        self.state.lock().written.len()
    }

    /// Number of successful writes of `function`
    pub fn count_function(&self, function: FunctionType) -> usize {
        self.written_frames()
            .iter()
            .filter(|f| f.function == function)
            .count()
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }
}

impl std::fmt::Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHandle")
            .field("written", &self.write_count())
            .finish()
    }
}

fn decode_frame(data: &[u8]) -> Option<Frame> {
    let mut decoder = FrameDecoder::new();
    decoder.push(data);
    match decoder.decode() {
        Ok(Some(SerialEvent::Frame(frame))) => Some(frame),
        _ => None,
    }
}

/// Frames a controller sends back
pub mod replies {
    use super::*;

    /// Callback id of a SendData-class request (its last payload byte)
    pub fn callback_id(frame: &Frame) -> u8 {
        frame.payload.last().copied().unwrap_or(0)
    }

    /// Response frame to a SendData-class request
    pub fn send_data_response(request: &Frame, accepted: bool) -> SerialEvent {
        Frame::response(request.function, vec![u8::from(accepted)]).into()
    }

    /// Callback frame for a SendData-class request; status 0 means delivered
    pub fn send_data_callback(request: &Frame, status: u8) -> SerialEvent {
        Frame::request(request.function, vec![callback_id(request), status]).into()
    }

    /// ACK, response and a successful callback for SendData-class requests.
    /// Other requests only get an ACK.
    pub fn send_data_ok(request: &Frame) -> Vec<SerialEvent> {
        reply_with_status(request, 0x00)
    }

    /// Like [`send_data_ok`] but the callback reports no acknowledgement from the node
    pub fn send_data_no_ack(request: &Frame) -> Vec<SerialEvent> {
        reply_with_status(request, 0x01)
    }

    fn reply_with_status(request: &Frame, status: u8) -> Vec<SerialEvent> {
        if request.function == FunctionType::SEND_DATA
            || request.function == FunctionType::SEND_DATA_MULTICAST
        {
            vec![
                SerialEvent::Ack,
                send_data_response(request, true),
                send_data_callback(request, status),
            ]
        } else {
            vec![SerialEvent::Ack]
        }
    }

    /// A command `node` sends on its own
    pub fn application_command(node: NodeId, command: &[u8]) -> Frame {
        let mut payload = vec![0x00, node.0, command.len() as u8];
        payload.extend_from_slice(command);
        Frame::request(FunctionType::APPLICATION_COMMAND, payload)
    }

    /// A node information frame from `node`
    pub fn node_info(node: NodeId) -> Frame {
        Frame::request(
            FunctionType::APPLICATION_UPDATE,
            vec![UPDATE_STATE_NODE_INFO_RECEIVED, node.0, 0x03, 0x04, 0x10, 0x01],
        )
    }

    /// Response to GetControllerVersion
    pub fn controller_version(version: &str) -> Frame {
        let mut payload = version.as_bytes().to_vec();
        payload.push(0x00);
        payload.push(0x01);
        Frame::response(FunctionType::GET_CONTROLLER_VERSION, payload)
    }
}
