//! Driver - async runtime around the transmission pipeline
//!
//! The [`Driver`] owns a [`ControllerInterface`] and a [`TransmitPipeline`]
//! and runs a single event loop over three sources:
//!
//! - events read from the controller
//! - commands sent through a [`DriverHandle`]
//! - the earliest armed pipeline timer
//!
//! After every input the pipeline's effects are applied in order. Writes are
//! awaited inline and their result fed straight back, so the pipeline always
//! sees a frame's write result before anything the controller sends after it.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use zwave_driver::{Driver, DriverConfig, Message, NodeId, NodeStatusTable, SerialInterface};
//!
//! let config = DriverConfig::default();
//! let interface = SerialInterface::new("/dev/ttyACM0");
//! let (driver, handle) = Driver::new(interface, &config, Arc::new(NodeStatusTable::new()));
//! tokio::spawn(driver.run());
//!
//! let reply = handle.send(Message::ping(NodeId(7))).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DriverConfig, ReconnectConfig};
use crate::error::{DriverError, Result, TransmitError};
use crate::interface::ControllerInterface;
use crate::message::{Message, NodeId};
use crate::node_status::NodeStatusProvider;
use crate::pipeline::{Effect, PipelineStats, TimerKind, TransactionSource, TransmitPipeline};
use crate::priority::Priority;
use crate::queue::{ReduceAction, ReduceSummary};
use crate::serial_command::RetryNotice;
use crate::transaction::{ResultReceiver, ResultSlot, Transaction, TransactionId, TransmitResult};
use crate::unsolicited::InboundFrame;

/// Called before every retry
pub type RetryCallback = Arc<dyn Fn(&RetryNotice) + Send + Sync>;

/// Called for every frame no session claimed
pub type UnsolicitedCallback = Arc<dyn Fn(&InboundFrame) + Send + Sync>;

/// Decision function for [`DriverHandle::reduce_all`]
pub type ReduceFn = Box<dyn Fn(&Transaction, TransactionSource) -> ReduceAction + Send>;

/// Commands that can be sent to the driver task
pub enum DriverCommand {
    /// Queue a message
    Enqueue {
        /// The message
        message: Message,
        /// Requested priority
        priority: Priority,
        /// Optional label for logs and reductions
        tag: Option<String>,
        /// Where the result is settled
        result: oneshot::Sender<TransmitResult>,
        /// Receives the assigned id
        id: oneshot::Sender<TransactionId>,
    },
    /// Apply a decision to every queued and the current transaction
    ReduceAll {
        /// The decision
        decide: ReduceFn,
        /// Receives what happened
        reply: oneshot::Sender<ReduceSummary>,
    },
    /// A node is awake
    NodeAwake(NodeId),
    /// Node status changed; re-evaluate the queue
    NodeStatusChanged,
    /// Get driver statistics
    GetStats(oneshot::Sender<DriverStats>),
    /// Stop the driver
    Shutdown,
}

impl std::fmt::Debug for DriverCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverCommand::Enqueue {
                message, priority, ..
            } => f
                .debug_struct("Enqueue")
                .field("message", &message.describe())
                .field("priority", priority)
                .finish(),
            DriverCommand::ReduceAll { .. } => f.write_str("ReduceAll"),
            DriverCommand::NodeAwake(node) => f.debug_tuple("NodeAwake").field(node).finish(),
            DriverCommand::NodeStatusChanged => f.write_str("NodeStatusChanged"),
            DriverCommand::GetStats(_) => f.write_str("GetStats"),
            DriverCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Driver statistics
#[derive(Debug, Clone, Default)]
pub struct DriverStats {
    /// Pipeline counters
    pub pipeline: PipelineStats,
    /// Transactions waiting in the queue
    pub pending: usize,
    /// Transaction being executed
    pub current: Option<TransactionId>,
    /// Failed reads and writes
    pub interface_errors: u64,
    /// Successful reconnects
    pub reconnects: u64,
}

/// A queued transaction; resolves with its result
#[derive(Debug)]
pub struct PendingTransmit {
    id: TransactionId,
    rx: ResultReceiver,
}

impl PendingTransmit {
    /// Id of the transaction
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

impl Future for PendingTransmit {
    type Output = TransmitResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TransmitError::DriverStopped)))
    }
}

/// Handle for talking to a running [`Driver`]
#[derive(Clone)]
pub struct DriverHandle {
    command_tx: mpsc::Sender<DriverCommand>,
}

impl DriverHandle {
    /// Send a message with normal priority and wait for the result
    pub async fn send(&self, message: Message) -> TransmitResult {
        self.send_with_priority(message, Priority::Normal).await
    }

    /// Send a message and wait for the result
    pub async fn send_with_priority(&self, message: Message, priority: Priority) -> TransmitResult {
        self.enqueue(message, priority).await?.await
    }

    /// Ping a node
    pub async fn ping(&self, node: NodeId) -> TransmitResult {
        self.send_with_priority(Message::ping(node), Priority::Ping).await
    }

    /// Queue a message; the returned future resolves with its result
    pub async fn enqueue(
        &self,
        message: Message,
        priority: Priority,
    ) -> std::result::Result<PendingTransmit, TransmitError> {
        self.enqueue_inner(message, priority, None).await
    }

    /// Queue a message carrying a tag that reductions can match on
    pub async fn enqueue_tagged(
        &self,
        message: Message,
        priority: Priority,
        tag: impl Into<String>,
    ) -> std::result::Result<PendingTransmit, TransmitError> {
        self.enqueue_inner(message, priority, Some(tag.into())).await
    }

    async fn enqueue_inner(
        &self,
        message: Message,
        priority: Priority,
        tag: Option<String>,
    ) -> std::result::Result<PendingTransmit, TransmitError> {
        let (result, rx) = oneshot::channel();
        let (id_tx, id_rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::Enqueue {
                message,
                priority,
                tag,
                result,
                id: id_tx,
            })
            .await
            .map_err(|_| TransmitError::DriverStopped)?;
        let id = id_rx.await.map_err(|_| TransmitError::DriverStopped)?;
        Ok(PendingTransmit { id, rx })
    }

    /// Apply `decide` to every queued transaction and to the current one
    pub async fn reduce_all<F>(&self, decide: F) -> Result<ReduceSummary>
    where
        F: Fn(&Transaction, TransactionSource) -> ReduceAction + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::ReduceAll {
                decide: Box::new(decide),
                reply: tx,
            })
            .await
            .map_err(|_| DriverError::DriverNotRunning)?;
        rx.await.map_err(|_| DriverError::ChannelClosed)
    }

    /// Tell the driver a node woke up
    pub async fn notify_node_awake(&self, node: NodeId) -> Result<()> {
        self.command_tx
            .send(DriverCommand::NodeAwake(node))
            .await
            .map_err(|_| DriverError::DriverNotRunning)
    }

    /// Tell the driver node status changed outside of it
    pub async fn notify_node_status_changed(&self) -> Result<()> {
        self.command_tx
            .send(DriverCommand::NodeStatusChanged)
            .await
            .map_err(|_| DriverError::DriverNotRunning)
    }

    /// Get driver statistics
    pub async fn stats(&self) -> Result<DriverStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::GetStats(tx))
            .await
            .map_err(|_| DriverError::DriverNotRunning)?;
        rx.await.map_err(|_| DriverError::ChannelClosed)
    }

    /// Stop the driver; everything not settled yet fails with `DriverStopped`
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(DriverCommand::Shutdown)
            .await
            .map_err(|_| DriverError::DriverNotRunning)
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("closed", &self.command_tx.is_closed())
            .finish()
    }
}

/// Z-Wave driver task
pub struct Driver<I: ControllerInterface> {
    interface: I,
    pipeline: TransmitPipeline,
    command_rx: mpsc::Receiver<DriverCommand>,
    timers: HashMap<TimerKind, Instant>,
    reconnect: ReconnectConfig,
    retry_callback: Option<RetryCallback>,
    unsolicited_callback: Option<UnsolicitedCallback>,
    interface_errors: u64,
    reconnects: u64,
}

impl<I: ControllerInterface + Send + 'static> Driver<I> {
    /// Create a driver and its handle
    pub fn new(
        interface: I,
        config: &DriverConfig,
        status: Arc<dyn NodeStatusProvider>,
    ) -> (Self, DriverHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.queue.command_channel_size.max(1));
        let handle = DriverHandle { command_tx };

        let driver = Self {
            interface,
            pipeline: TransmitPipeline::new(config, status),
            command_rx,
            timers: HashMap::new(),
            reconnect: config.reconnect.clone(),
            retry_callback: None,
            unsolicited_callback: None,
            interface_errors: 0,
            reconnects: 0,
        };

        (driver, handle)
    }

    /// Call `callback` before every retry
    pub fn with_retry_callback(mut self, callback: RetryCallback) -> Self {
        self.retry_callback = Some(callback);
        self
    }

    /// Call `callback` for every frame no session claimed
    pub fn with_unsolicited_callback(mut self, callback: UnsolicitedCallback) -> Self {
        self.unsolicited_callback = Some(callback);
        self
    }

    /// Run the event loop
    ///
    /// Returns when [`DriverHandle::shutdown`] is called, when every handle
    /// is dropped, or when the link is lost and cannot be re-established.
    pub async fn run(mut self) -> Result<()> {
        info!(interface = %self.interface.name(), "Starting Z-Wave driver");

        if let Err(e) = self.interface.connect().await {
            error!(error = %e, "Failed to connect to controller");
            self.pipeline.shutdown();
            return Err(e);
        }

        loop {
            let deadline = self.timers.values().min().copied();

            tokio::select! {
                read = self.interface.read_event() => {
                    match read {
                        Ok(Some(event)) => {
                            trace!(?event, "Serial event");
                            self.pipeline.on_serial_event(event);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, code = e.error_code(), "Error reading from controller");
                            self.interface_errors += 1;
                            if let Err(reconnect_err) = self.try_reconnect().await {
                                error!(error = %reconnect_err, "Failed to reconnect");
                                break;
                            }
                        }
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(DriverCommand::Shutdown) => {
                            info!("Driver shutdown requested");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("All driver handles dropped");
                            break;
                        }
                    }
                }

                _ = sleep_until(deadline) => self.fire_timers(),
            }

            self.apply_effects().await;
        }

        self.command_rx.close();
        self.pipeline.shutdown();
        self.timers.clear();
        while self.pipeline.poll_effect().is_some() {}

        if let Err(e) = self.interface.disconnect().await {
            warn!(error = %e, "Error disconnecting from controller");
        }

        let stats = self.pipeline.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            writes = stats.writes,
            "Z-Wave driver stopped"
        );
        Ok(())
    }

    fn handle_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Enqueue {
                message,
                priority,
                tag,
                result,
                id,
            } => {
                let assigned = self.pipeline.enqueue_with_slot(
                    message,
                    priority,
                    ResultSlot::from_sender(result),
                    tag,
                );
                let _ = id.send(assigned);
            }
            DriverCommand::ReduceAll { decide, reply } => {
                let summary = self.pipeline.reduce_all(|t, source| decide(t, source));
                debug!(
                    dropped = summary.dropped,
                    rejected = summary.rejected,
                    requeued = summary.requeued,
                    "Reduced transaction queue"
                );
                let _ = reply.send(summary);
            }
            DriverCommand::NodeAwake(node) => {
                debug!(node = %node, "Node is awake");
                self.pipeline.on_node_awake(node);
            }
            DriverCommand::NodeStatusChanged => self.pipeline.on_node_status_changed(),
            DriverCommand::GetStats(tx) => {
                let _ = tx.send(self.stats());
            }
            // Handled by the event loop
            DriverCommand::Shutdown => {}
        }
    }

    fn stats(&self) -> DriverStats {
        DriverStats {
            pipeline: self.pipeline.stats(),
            pending: self.pipeline.pending(),
            current: self.pipeline.current(),
            interface_errors: self.interface_errors,
            reconnects: self.reconnects,
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<TimerKind> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, _)| *kind)
            .collect();

        for kind in due {
            self.timers.remove(&kind);
            trace!(?kind, "Timer fired");
            self.pipeline.on_timeout(kind);
        }
    }

    async fn apply_effects(&mut self) {
        while let Some(effect) = self.pipeline.poll_effect() {
            match effect {
                Effect::Write(bytes) => {
                    let ok = match self.interface.write_frame(&bytes).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(error = %e, "Error writing to controller");
                            self.interface_errors += 1;
                            false
                        }
                    };
                    self.pipeline.on_write_result(ok);
                }
                Effect::StartTimer { timer, duration } => {
                    self.timers.insert(timer, Instant::now() + duration);
                }
                Effect::CancelTimer(timer) => {
                    self.timers.remove(&timer);
                }
                Effect::RetryNotice(notice) => {
                    if let Some(callback) = &self.retry_callback {
                        callback(&notice);
                    }
                }
                Effect::Unsolicited(frame) => {
                    if let Some(callback) = &self.unsolicited_callback {
                        callback(&frame);
                    }
                }
            }
        }
    }

    async fn try_reconnect(&mut self) -> Result<()> {
        if !self.reconnect.enabled {
            return Err(DriverError::Disconnected);
        }
        warn!(interface = %self.interface.name(), "Attempting to reconnect to controller");

        let _ = self.interface.disconnect().await;
        tokio::time::sleep(self.reconnect.delay).await;
        self.interface.connect().await?;

        self.reconnects += 1;
        info!("Reconnected to controller");
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfigBuilder;
    use crate::error::FailureReason;
    use crate::frame::SerialEvent;
    use crate::message::GetControllerVersion;
    use crate::node_status::NodeStatusTable;
    use crate::test_utils::{replies, MockController};
    use crate::transaction::TransmitReply;

    fn spawn_driver(mock: MockController) -> DriverHandle {
        let config = DriverConfigBuilder::new().build();
        let (driver, handle) = Driver::new(mock, &config, Arc::new(NodeStatusTable::new()));
        tokio::spawn(driver.run());
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_command_round_trip() {
        let (mock, mock_handle) = MockController::new();
        let handle = spawn_driver(mock.with_responder(|_| {
            vec![
                SerialEvent::Ack,
                replies::controller_version("Z-Wave 7.18").into(),
            ]
        }));

        let reply = handle
            .send_with_priority(Message::controller(GetControllerVersion), Priority::Controller)
            .await
            .unwrap();
        match reply {
            TransmitReply::Controller(frame) => assert_eq!(
                GetControllerVersion::parse_version(&frame).as_deref(),
                Some("Z-Wave 7.18")
            ),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(mock_handle.write_count(), 1);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.pipeline.completed, 1);
        assert_eq!(stats.pending, 0);
        assert!(stats.current.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_waiting_transactions() {
        // Nothing answers, so the command waits for its ACK
        let (mock, _mock_handle) = MockController::new();
        let handle = spawn_driver(mock);

        let pending = handle
            .enqueue(Message::controller(GetControllerVersion), Priority::Controller)
            .await
            .unwrap();
        handle.shutdown().await.unwrap();

        assert_eq!(pending.await, Err(TransmitError::DriverStopped));
        assert!(matches!(handle.stats().await, Err(DriverError::DriverNotRunning)));
        assert!(matches!(
            handle.notify_node_awake(NodeId(2)).await,
            Err(DriverError::DriverNotRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_command_retries_ack_timeout() {
        let (mock, mock_handle) = MockController::new();
        let handle = spawn_driver(mock);

        let result = handle
            .send_with_priority(Message::controller(GetControllerVersion), Priority::Controller)
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.reason(), Some(FailureReason::AckTimeout));
        assert_eq!(mock_handle.write_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_stops_driver() {
        let (mock, _mock_handle) = MockController::new();
        let config = DriverConfigBuilder::new().build();
        let (driver, handle) =
            Driver::new(mock.failing_connect(), &config, Arc::new(NodeStatusTable::new()));

        assert!(driver.run().await.is_err());
        assert_eq!(
            handle.send(Message::ping(NodeId(2))).await,
            Err(TransmitError::DriverStopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects() {
        let (mock, mock_handle) = MockController::new();
        let handle = spawn_driver(mock.with_responder(replies::send_data_ok));

        mock_handle.break_link();
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        handle.ping(NodeId(4)).await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.interface_errors, 1);
        assert_eq!(mock_handle.connects(), 2);
    }
}
