//! Command execution and decoded-update delivery.
//!
//! A [`FunctionExecutor`] accepts encoded commands in submission order and
//! delivers the decoded values as [`PointUpdate`]s on a single channel. The
//! receiving end must be consumed by exactly one task so that point updates
//! are applied in the order the commands were submitted.

use std::time::Duration;

use bytes::BytesMut;
use modsight_runtime::ShutdownListener;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, EXCEPTION_FLAG, ModbusCodec, ModbusFunction, PointValues};
use crate::params::{MBAP_HEADER_LEN, MbapHeader};
use crate::point::PointType;

/// Largest PDU a Modbus TCP device may send.
const MAX_PDU_LEN: usize = 253;

/// Executor errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Command queue is closed")]
    QueueClosed,

    #[error("Command queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Response transaction id {actual} does not match request {expected}")]
    UnexpectedTransaction { expected: u16, actual: u16 },
}

/// One decoded value for a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointUpdate {
    pub point_type: PointType,
    pub address: u16,
    pub raw: u16,
}

/// Sending half of the update channel, held by an executor.
pub type UpdateSender = mpsc::UnboundedSender<PointUpdate>;

/// Receiving half of the update channel, consumed by the dispatcher.
pub type UpdateReceiver = mpsc::UnboundedReceiver<PointUpdate>;

/// Create the decoded-update channel.
pub fn update_channel() -> (UpdateSender, UpdateReceiver) {
    mpsc::unbounded_channel()
}

/// Send decoded values in address order. Returns how many were delivered.
pub(crate) fn deliver(updates: &UpdateSender, values: PointValues) -> usize {
    let mut sent = 0;
    for (id, raw) in values {
        let update = PointUpdate {
            point_type: id.point_type,
            address: id.address,
            raw,
        };
        if updates.send(update).is_err() {
            debug!(point = %id, "Update receiver dropped, discarding value");
            break;
        }
        sent += 1;
    }
    sent
}

/// Accepts commands for execution against a device.
pub trait FunctionExecutor: Send + Sync {
    /// Submit a command. Commands are executed in submission order.
    fn enqueue(&self, function: ModbusFunction) -> Result<(), ExecutorError>;
}

/// Modbus TCP executor.
///
/// Commands go through a bounded queue to a single consumer task that
/// owns the connection. The connection is opened on the first command and
/// re-opened on the next command after any I/O failure. Failed commands are
/// logged and dropped. When the device stops answering, commands beyond the
/// queue capacity are refused with [`ExecutorError::QueueFull`] instead of
/// piling up.
#[derive(Debug, Clone)]
pub struct TcpExecutor {
    queue: mpsc::Sender<ModbusFunction>,
    capacity: usize,
}

impl TcpExecutor {
    /// Spawn the consumer task.
    ///
    /// On shutdown the task stops accepting commands, finishes everything
    /// already queued, and exits. At most `capacity` commands wait at once,
    /// so the drain takes no longer than `capacity` request timeouts.
    pub fn spawn(
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
        capacity: usize,
        updates: UpdateSender,
        shutdown: ShutdownListener,
    ) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (queue, commands) = mpsc::channel(capacity);
        let connection = TcpConnection {
            host: host.into(),
            port,
            timeout,
            stream: None,
        };
        let handle = tokio::spawn(connection.run(commands, updates, shutdown));
        (Self { queue, capacity }, handle)
    }
}

impl FunctionExecutor for TcpExecutor {
    fn enqueue(&self, function: ModbusFunction) -> Result<(), ExecutorError> {
        self.queue.try_send(function).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ExecutorError::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => ExecutorError::QueueClosed,
        })
    }
}

/// Consumer side of the TCP executor.
struct TcpConnection {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpConnection {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ModbusFunction>,
        updates: UpdateSender,
        mut shutdown: ShutdownListener,
    ) {
        info!("Modbus TCP executor targeting {}:{}", self.host, self.port);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(function) => self.execute(function, &updates).await,
                    None => break,
                },
                _ = shutdown.triggered() => {
                    commands.close();
                    while let Some(function) = commands.recv().await {
                        self.execute(function, &updates).await;
                    }
                    break;
                }
            }
        }

        info!("Modbus TCP executor stopped");
    }

    async fn execute(&mut self, function: ModbusFunction, updates: &UpdateSender) {
        let code = function.function_code();
        let transaction_id = function.transaction_id();

        match tokio::time::timeout(self.timeout, self.transact(&function)).await {
            Ok(Ok(values)) => {
                let count = deliver(updates, values);
                debug!(transaction_id, "{} completed with {} value(s)", code, count);
            }
            Ok(Err(e)) => {
                warn!(transaction_id, error = %e, "{} failed", code);
                if matches!(e, ExecutorError::Io(_) | ExecutorError::UnexpectedTransaction { .. }) {
                    self.stream = None;
                }
            }
            Err(_) => {
                let e = ExecutorError::Timeout(self.timeout);
                warn!(transaction_id, error = %e, "{} failed", code);
                // A late response would desynchronize the stream.
                self.stream = None;
            }
        }
    }

    async fn connect(&mut self) -> Result<&mut TcpStream, ExecutorError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
            stream.set_nodelay(true)?;
            info!("Connected to Modbus device at {}:{}", self.host, self.port);
            self.stream = Some(stream);
        }

        self.stream
            .as_mut()
            .ok_or_else(|| ExecutorError::Io(std::io::ErrorKind::NotConnected.into()))
    }

    async fn transact(&mut self, function: &ModbusFunction) -> Result<PointValues, ExecutorError> {
        let request = function.pack_request()?;
        let stream = self.connect().await?;

        stream.write_all(&request).await?;

        let mut frame = BytesMut::zeroed(MBAP_HEADER_LEN);
        stream.read_exact(&mut frame).await?;
        let header = MbapHeader::decode(&frame)?;

        if header.transaction_id != function.transaction_id() {
            return Err(ExecutorError::UnexpectedTransaction {
                expected: function.transaction_id(),
                actual: header.transaction_id,
            });
        }

        // The length field counts the unit id, already read with the header.
        let pdu_len = usize::from(header.length).saturating_sub(1);
        if pdu_len == 0 || pdu_len > MAX_PDU_LEN {
            return Err(ExecutorError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("response length field {} out of range", header.length),
            )));
        }

        frame.resize(MBAP_HEADER_LEN + pdu_len, 0);
        stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;

        check_exception(&frame)?;
        Ok(function.parse_response(&frame)?)
    }
}

/// Reject a response whose function code carries the exception flag.
pub(crate) fn check_exception(frame: &[u8]) -> Result<(), CodecError> {
    match frame.get(MBAP_HEADER_LEN) {
        Some(function) if function & EXCEPTION_FLAG != 0 => Err(CodecError::Exception {
            function: function & !EXCEPTION_FLAG,
            code: frame.get(MBAP_HEADER_LEN + 1).copied().unwrap_or(0),
        }),
        Some(_) => Ok(()),
        None => {
            error!(len = frame.len(), "Response has no function code");
            Err(CodecError::Truncated {
                expected: MBAP_HEADER_LEN + 1,
                actual: frame.len(),
            })
        }
    }
}
