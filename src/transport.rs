//! Serial byte-stream transport
//!
//! The transport owns the port: it opens it through a [`SerialChannel`],
//! splits the stream, and runs a read loop that forwards every received chunk
//! into a queue. Clients never touch the port directly; they lock the shared
//! [`Link`] through a [`TransportHandle`], write a frame and consume chunks
//! until the response is complete. Holding the link lock for the whole
//! transaction is what keeps a half-duplex RTU line to one frame in flight.
//!
//! ```text
//!            write_frame()                      +-----------+
//!  client ------------------> WriteHalf ------> |           |
//!                                               |  serial   |
//!  client <-- ChunkStream <-- read loop <------ |  channel  |
//!             (mpsc queue)    (tokio task)      +-----------+
//! ```
//!
//! Opening waits a settle delay before reporting ready because many boards
//! reset when DTR toggles on open. Closing releases the write half, cancels
//! the read loop even while it is parked in a read, and only then closes the
//! channel.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{CHUNK_QUEUE_CAPACITY, DEFAULT_SETTLE_DELAY_MS, MAX_RTU_FRAME_SIZE};
use crate::error::{ModbusError, ModbusResult};

// ============================================================================
// Serial configuration
// ============================================================================

/// Standard baud rates
pub const SUPPORTED_BAUD_RATES: [u32; 10] =
    [75, 300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Default baud rate
pub const DEFAULT_BAUD_RATE: u32 = 57600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    None,
    #[default]
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Line settings handed to the channel at open time.
///
/// The engine never interprets these; they are passed through unchanged.
///
/// ```rust
/// use rtu_master::transport::{Parity, SerialConfig};
///
/// let config = SerialConfig::new(9600).with_parity(Parity::None);
/// assert_eq!(config.baud_rate, 9600);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl SerialConfig {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Whether the baud rate is one of [`SUPPORTED_BAUD_RATES`].
    pub fn is_standard_baud_rate(&self) -> bool {
        SUPPORTED_BAUD_RATES.contains(&self.baud_rate)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
        }
    }
}

// ============================================================================
// Channel abstraction
// ============================================================================

/// The platform port object the transport drives.
///
/// `open` yields a duplex byte stream configured per [`SerialConfig`];
/// `close` is called after both halves of that stream have been dropped.
pub trait SerialChannel: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn open(
        &mut self,
        config: &SerialConfig,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        async { Ok(()) }
    }

    /// Port name for logs
    fn name(&self) -> String;
}

/// Channel around a stream that is already open (a pipe, a socket bridge, a
/// test double). It can be opened once.
pub struct StreamChannel<S> {
    name: String,
    stream: Option<S>,
}

impl<S> StreamChannel<S> {
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        Self {
            name: name.into(),
            stream: Some(stream),
        }
    }
}

impl<S> SerialChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Stream = S;

    fn open(&mut self, _config: &SerialConfig) -> impl Future<Output = io::Result<S>> + Send {
        let stream = self.stream.take();
        async move {
            stream.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream already consumed"))
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Real serial port through `tokio-serial`.
#[cfg(feature = "rtu")]
pub struct TokioSerialChannel {
    path: String,
}

#[cfg(feature = "rtu")]
impl TokioSerialChannel {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(feature = "rtu")]
impl SerialChannel for TokioSerialChannel {
    type Stream = tokio_serial::SerialStream;

    fn open(
        &mut self,
        config: &SerialConfig,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let builder = tokio_serial::new(self.path.as_str(), config.baud_rate)
            .data_bits(match config.data_bits {
                DataBits::Seven => tokio_serial::DataBits::Seven,
                DataBits::Eight => tokio_serial::DataBits::Eight,
            })
            .stop_bits(match config.stop_bits {
                StopBits::One => tokio_serial::StopBits::One,
                StopBits::Two => tokio_serial::StopBits::Two,
            })
            .parity(match config.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            })
            .flow_control(match config.flow_control {
                FlowControl::None => tokio_serial::FlowControl::None,
                FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
            });
        async move { tokio_serial::SerialStream::open(&builder).map_err(io::Error::from) }
    }

    fn name(&self) -> String {
        self.path.clone()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ============================================================================
// Link: the write half plus the received-chunk sequence
// ============================================================================

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Received chunks, in arrival order. Ends when the transport closes or the
/// read loop hits EOF / an error. It cannot be restarted.
#[derive(Debug)]
pub struct ChunkStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ChunkStream {
    /// Wait for the next chunk; `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Discard chunks already queued. Returns the number of bytes dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(chunk) = self.rx.try_recv() {
            dropped += chunk.len();
        }
        dropped
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

/// Exclusive access to the line for the duration of one transaction.
pub struct Link {
    writer: Option<BoxedWriter>,
    chunks: ChunkStream,
    stats: Arc<StdMutex<TransportStats>>,
}

impl Link {
    /// Write the whole frame and flush it.
    pub async fn write_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ModbusError::transport("Transport is closed"))?;
        writer
            .write_all(frame)
            .await
            .map_err(|e| ModbusError::transport(format!("Failed to send RTU frame: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ModbusError::transport(format!("Failed to flush RTU frame: {}", e)))?;

        self.record(|stats| {
            stats.requests_sent += 1;
            stats.bytes_sent += frame.len() as u64;
        });
        Ok(())
    }

    pub fn chunks(&mut self) -> &mut ChunkStream {
        &mut self.chunks
    }

    pub fn is_writable(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut TransportStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }
}

/// Cloneable handle to an open transport. Every clone locks the same link.
#[derive(Clone)]
pub struct TransportHandle {
    name: Arc<str>,
    link: Arc<Mutex<Link>>,
    stats: Arc<StdMutex<TransportStats>>,
    open: Arc<AtomicBool>,
}

impl TransportHandle {
    /// Wait for exclusive use of the line.
    pub async fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the transport was closed or its read loop ended.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn get_stats(&self) -> TransportStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Called once when the read loop ends on its own (EOF or read error).
/// Not called for a deliberate [`SerialTransport::close`].
pub type ClosedCallback = Box<dyn FnOnce(ModbusError) + Send>;

struct ReadLoop {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Serial transport over a [`SerialChannel`].
pub struct SerialTransport<C: SerialChannel> {
    channel: C,
    settle_delay: Duration,
    handle: Option<TransportHandle>,
    reader: Option<ReadLoop>,
}

impl<C: SerialChannel> SerialTransport<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            handle: None,
            reader: None,
        }
    }

    /// Grace period between opening the port and reporting ready.
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn handle(&self) -> Option<TransportHandle> {
        self.handle.clone()
    }

    pub fn is_open(&self) -> bool {
        self.handle.as_ref().is_some_and(TransportHandle::is_open)
    }

    /// Open the channel, start the read loop and wait out the settle delay.
    pub async fn open(
        &mut self,
        config: &SerialConfig,
        on_closed: Option<ClosedCallback>,
    ) -> ModbusResult<TransportHandle> {
        if self.handle.is_some() {
            return Err(ModbusError::validation("Transport is already open"));
        }

        let name = self.channel.name();
        let stream = self.channel.open(config).await.map_err(|e| {
            ModbusError::transport(format!("Failed to open serial port {}: {}", name, e))
        })?;
        debug!(
            "Serial port {} opened: {} baud, {:?}, {:?}, parity {:?}, flow {:?}",
            name,
            config.baud_rate,
            config.data_bits,
            config.stop_bits,
            config.parity,
            config.flow_control
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_CAPACITY);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let stats = Arc::new(StdMutex::new(TransportStats::default()));
        let open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(read_loop(
            read_half,
            chunk_tx,
            cancel_rx,
            on_closed,
            name.clone(),
            open.clone(),
            stats.clone(),
        ));

        let handle = TransportHandle {
            name: Arc::from(name.as_str()),
            link: Arc::new(Mutex::new(Link {
                writer: Some(Box::new(write_half)),
                chunks: ChunkStream { rx: chunk_rx },
                stats: stats.clone(),
            })),
            stats,
            open: open.clone(),
        };
        self.handle = Some(handle.clone());
        self.reader = Some(ReadLoop {
            cancel: cancel_tx,
            task,
        });

        if !self.settle_delay.is_zero() {
            debug!("Waiting {:?} for {} to settle", self.settle_delay, name);
            tokio::time::sleep(self.settle_delay).await;
        }

        if task_finished(&self.reader) {
            // EOF or read error during the settle delay
            self.close().await?;
            return Err(ModbusError::transport(format!(
                "Serial port {} closed while settling",
                name
            )));
        }

        open.store(true, Ordering::Release);
        info!("Serial transport {} ready", name);
        Ok(handle)
    }

    /// Release write access, cancel the read loop, then close the channel.
    ///
    /// Waits for an in-flight transaction to finish because it has to take the
    /// link lock first. Closing a transport that is not open is a no-op.
    pub async fn close(&mut self) -> ModbusResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.open.store(false, Ordering::Release);

        {
            let mut link = handle.lock().await;
            if let Some(mut writer) = link.writer.take() {
                if let Err(e) = writer.shutdown().await {
                    debug!("Shutdown of {} write half failed: {}", handle.name(), e);
                }
            }
            link.chunks.close();
        }

        if let Some(reader) = self.reader.take() {
            // The loop may already have ended on its own; a failed send is fine.
            let _ = reader.cancel.send(());
            if let Err(e) = reader.task.await {
                warn!("Read loop of {} ended abnormally: {}", handle.name(), e);
            }
        }

        self.channel.close().await.map_err(|e| {
            ModbusError::transport(format!(
                "Failed to close serial port {}: {}",
                handle.name(),
                e
            ))
        })?;
        info!("Serial transport {} closed", handle.name());
        Ok(())
    }
}

fn task_finished(reader: &Option<ReadLoop>) -> bool {
    reader.as_ref().is_some_and(|r| r.task.is_finished())
}

async fn read_loop<R>(
    mut reader: R,
    chunks: mpsc::Sender<Bytes>,
    mut cancel: oneshot::Receiver<()>,
    on_closed: Option<ClosedCallback>,
    name: String,
    open: Arc<AtomicBool>,
    stats: Arc<StdMutex<TransportStats>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);

    let cause = loop {
        buf.reserve(MAX_RTU_FRAME_SIZE);
        let read = tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!("Read loop of {} cancelled", name);
                return;
            }
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break ModbusError::transport(format!("Serial port {} reached end of stream", name)),
            Ok(n) => {
                stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .bytes_received += n as u64;
                let chunk = buf.split().freeze();
                tokio::select! {
                    biased;
                    _ = &mut cancel => {
                        debug!("Read loop of {} cancelled", name);
                        return;
                    }
                    sent = chunks.send(chunk) => {
                        if sent.is_err() {
                            debug!("Chunk queue of {} closed", name);
                            return;
                        }
                    }
                }
            }
            Err(e) => break ModbusError::transport(format!("Serial read error on {}: {}", name, e)),
        }
    };

    open.store(false, Ordering::Release);
    warn!("{}", cause);
    if let Some(callback) = on_closed {
        callback(cause);
    }
}
