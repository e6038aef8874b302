//! Connection lifecycle and the public face of the engine
//!
//! ```text
//!                connect()                 open ok
//!  Disconnected ----------> Connecting -------------> Connected
//!       ^                       |                         |
//!       |        open failed    |   disconnect(), EOF,    |
//!       +-----------------------+---- read error, or -----+
//!                                     transport error in a cycle
//! ```
//!
//! The master owns the transport, the bound client and the register map.
//! Cycles are serialized by a guard: [`RtuMaster::update`] waits for a cycle
//! in flight, scheduler ticks use [`RtuMaster::try_update`] and are skipped.
//! [`RtuMaster::disconnect`] and [`RtuMaster::connect`] take the same guard
//! before touching the transport, so a cycle never runs into a half-closed
//! port and a cycle that outlives a lost link cannot close its replacement.
//!
//! A link lost through EOF or a read error leaves the port held until the
//! next `update`, `connect` or `disconnect` releases it.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::client::RtuClient;
use crate::config::MasterConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::poll::{self, CycleReport};
use crate::protocol::{validate_slave_id, SlaveId};
use crate::register::{RegisterEntry, RegisterKind, RegisterValue};
use crate::register_map::{read_map, write_map, RegisterMap};
use crate::scheduler::AutoUpdate;
use crate::transport::{ClosedCallback, SerialChannel, SerialConfig, SerialTransport, TransportStats};

/// Link state as observed by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// State touched by the transport's close callback.
struct Link {
    state: watch::Sender<ConnectionState>,
    client: RwLock<Option<RtuClient>>,
    last_error: StdMutex<Option<ModbusError>>,
    slave_id: AtomicU8,
    /// Bumped on every connect and disconnect so a late close callback from a
    /// previous transport is ignored.
    generation: AtomicU64,
}

impl Link {
    fn client(&self) -> Option<RtuClient> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, err: Option<ModbusError>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    fn drop_client(&self) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn on_transport_closed(&self, generation: u64, cause: ModbusError) {
        let mut client = self.client.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            debug!("Ignoring close notification of a previous connection: {}", cause);
            return;
        }
        warn!("Serial link lost: {}", cause);
        *client = None;
        self.set_last_error(Some(cause));
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// Modbus RTU master: register map, poll cycle and connection lifecycle.
///
/// # Example
///
/// ```rust,no_run
/// use rtu_master::{MasterConfig, RegisterKind, RegisterValue, RtuMaster, SerialConfig, StreamChannel};
///
/// # async fn example(stream: tokio::io::DuplexStream) -> rtu_master::ModbusResult<()> {
/// let master = RtuMaster::new(MasterConfig::default())?;
/// master.connect(StreamChannel::new("pipe", stream), &SerialConfig::default()).await?;
///
/// master.set_pending_write(RegisterKind::Coil, 1, RegisterValue::Bit(true))?;
/// let report = master.update().await?;
/// println!("cycle {} done, {} failures", report.cycle, report.failures());
///
/// master.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct RtuMaster<C: SerialChannel> {
    config: MasterConfig,
    link: Arc<Link>,
    transport: Mutex<Option<SerialTransport<C>>>,
    registers: RwLock<RegisterMap>,
    cycles: AtomicU64,
    cycle_guard: Mutex<()>,
    auto_update: StdMutex<Option<AutoUpdate>>,
}

impl<C: SerialChannel> RtuMaster<C> {
    /// Build a disconnected master with `entries_per_kind` entries of each kind.
    pub fn new(config: MasterConfig) -> ModbusResult<Self> {
        config.validate()?;
        let registers = RegisterMap::with_entries(config.entries_per_kind);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            link: Arc::new(Link {
                state,
                client: RwLock::new(None),
                last_error: StdMutex::new(None),
                slave_id: AtomicU8::new(config.slave_id),
                generation: AtomicU64::new(0),
            }),
            config,
            transport: Mutex::new(None),
            registers: RwLock::new(registers),
            cycles: AtomicU64::new(0),
            cycle_guard: Mutex::new(()),
            auto_update: StdMutex::new(None),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    // ===== Connection lifecycle =====

    /// Open `channel` and bind a client for the current slave id.
    ///
    /// Only valid while disconnected. Waits for a cycle in flight first. The
    /// state is `Connecting` until the transport has settled; a failed open
    /// returns to `Disconnected` with the error kept in
    /// [`last_error`](Self::last_error).
    pub async fn connect(&self, channel: C, serial: &SerialConfig) -> ModbusResult<()> {
        // A cycle still running against a lost link must finish before the
        // transport slot is replaced.
        let _cycle = self.cycle_guard.lock().await;

        let mut started = false;
        self.link.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                started = true;
            }
            started
        });
        if !started {
            return Err(ModbusError::validation(format!(
                "Cannot connect while {}",
                self.state()
            )));
        }

        let mut slot = self.transport.lock().await;
        if let Some(mut stale) = slot.take() {
            // Left behind by a link lost without an explicit disconnect
            if let Err(e) = stale.close().await {
                debug!("Closing previous transport failed: {}", e);
            }
        }

        let generation = self.link.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let weak: Weak<Link> = Arc::downgrade(&self.link);
        let on_closed: ClosedCallback = Box::new(move |cause| {
            if let Some(link) = weak.upgrade() {
                link.on_transport_closed(generation, cause);
            }
        });

        let name = channel.name();
        info!("Connecting to {} at {} baud", name, serial.baud_rate);
        let mut transport = SerialTransport::new(channel).with_settle_delay(self.config.settle_delay);

        let handle = match transport.open(serial, Some(on_closed)).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to connect to {}: {}", name, e);
                self.link.set_last_error(Some(e.clone()));
                self.link.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let mut client = match RtuClient::new(handle, self.slave_id()) {
            Ok(client) => client.with_timeout(self.config.response_timeout),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!("Closing {} failed: {}", name, close_err);
                }
                self.link.set_last_error(Some(e.clone()));
                self.link.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        if let Some(logger) = &self.config.packet_logger {
            client = client.with_logger(logger.clone());
        }

        let bound = {
            let mut slot_client = self.link.client.write().unwrap_or_else(PoisonError::into_inner);
            let mut bound = false;
            self.link.state.send_if_modified(|state| {
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Connected;
                    bound = true;
                }
                bound
            });
            if bound {
                *slot_client = Some(client);
            }
            bound
        };

        if !bound {
            // The link dropped while settling; the close callback already recorded why.
            let err = self
                .last_error()
                .unwrap_or_else(|| ModbusError::transport(format!("{} closed while connecting", name)));
            if let Err(e) = transport.close().await {
                debug!("Closing {} failed: {}", name, e);
            }
            return Err(err);
        }

        *slot = Some(transport);
        self.link.set_last_error(None);
        info!("Connected to {} (slave {})", name, self.slave_id());
        Ok(())
    }

    /// Wait for a cycle in flight, close the transport and drop the client.
    pub async fn disconnect(&self) -> ModbusResult<()> {
        let _cycle = self.cycle_guard.lock().await;
        self.disconnect_locked().await
    }

    async fn disconnect_locked(&self) -> ModbusResult<()> {
        let mut slot = self.transport.lock().await;
        self.link.generation.fetch_add(1, Ordering::AcqRel);
        let was = self.state();

        let result = match slot.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        };
        self.link.drop_client();
        self.link.state.send_replace(ConnectionState::Disconnected);

        if was != ConnectionState::Disconnected {
            info!("Disconnected");
        }
        result
    }

    /// Address another slave. Rebinds the client on the open transport;
    /// connection state and register data are untouched.
    ///
    /// A cycle in flight keeps the client it started with.
    pub fn set_slave_id(&self, slave_id: SlaveId) -> ModbusResult<()> {
        let slave_id = validate_slave_id(slave_id)?;
        let mut client = self.link.client.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = client.as_ref() {
            *client = Some(current.with_slave(slave_id)?);
        }
        self.link.slave_id.store(slave_id, Ordering::Release);
        debug!("Slave id set to {}", slave_id);
        Ok(())
    }

    // ===== Poll cycle =====

    /// Run one cycle, waiting for a cycle in flight first.
    ///
    /// Per-entry failures are recorded on the entries; the only error is
    /// [`ModbusError::NotConnected`], in which case no cycle is counted. After
    /// a lost link this also releases the port that is still held.
    pub async fn update(&self) -> ModbusResult<CycleReport> {
        let _cycle = self.cycle_guard.lock().await;
        self.run_cycle().await
    }

    /// Run one cycle unless one is already running (`None`).
    pub async fn try_update(&self) -> Option<ModbusResult<CycleReport>> {
        let Ok(_cycle) = self.cycle_guard.try_lock() else {
            debug!("Cycle in flight, tick skipped");
            return None;
        };
        Some(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> ModbusResult<CycleReport> {
        let Some(mut client) = self.link.client() else {
            self.release_lost_transport().await;
            return Err(ModbusError::NotConnected);
        };
        let report = poll::update(&mut client, &self.registers, &self.cycles).await;

        if let Some(err) = &report.transport_error {
            warn!("Transport failed during cycle {}: {}", report.cycle, err);
            // The close notification may already have recorded the cause.
            let lost_before = !self.is_connected();
            if let Err(e) = self.disconnect_locked().await {
                debug!("Close after transport failure: {}", e);
            }
            if !lost_before {
                self.link.set_last_error(Some(err.clone()));
            }
        }
        Ok(report)
    }

    /// Close a transport whose read loop ended without an explicit disconnect.
    async fn release_lost_transport(&self) {
        let mut slot = self.transport.lock().await;
        if let Some(mut lost) = slot.take() {
            debug!("Releasing transport of a lost connection");
            if let Err(e) = lost.close().await {
                debug!("Closing lost transport failed: {}", e);
            }
        }
    }

    // ===== Register map =====

    pub fn add_entry(&self, kind: RegisterKind, address: u16) -> ModbusResult<()> {
        write_map(&self.registers).add_entry(kind, address)
    }

    pub fn set_pending_write(
        &self,
        kind: RegisterKind,
        address: u16,
        value: RegisterValue,
    ) -> ModbusResult<()> {
        write_map(&self.registers).set_pending_write(kind, address, value)
    }

    /// Point-in-time copy of every entry, address-then-kind.
    pub fn registers(&self) -> Vec<RegisterEntry> {
        read_map(&self.registers).snapshot()
    }

    pub fn entry(&self, kind: RegisterKind, address: u16) -> Option<RegisterEntry> {
        read_map(&self.registers).get(kind, address).cloned()
    }

    // ===== Observers =====

    pub fn state(&self) -> ConnectionState {
        *self.link.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn slave_id(&self) -> SlaveId {
        self.link.slave_id.load(Ordering::Acquire)
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// The connection-level error that ended or prevented the last connection.
    pub fn last_error(&self) -> Option<ModbusError> {
        self.link
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.link.client().map(|client| client.transport().get_stats())
    }

    // ===== Auto-update =====

    /// Poll every `period` until stopped. Replaces a running auto-update.
    ///
    /// A tick that finds a cycle in flight is skipped.
    pub fn start_auto_update(self: &Arc<Self>, period: Duration) -> ModbusResult<()> {
        if period.is_zero() {
            return Err(ModbusError::validation("Auto-update period must be non-zero"));
        }

        let weak = Arc::downgrade(self);
        let handle = AutoUpdate::spawn(period, move || {
            let weak = weak.clone();
            async move {
                let Some(master) = weak.upgrade() else {
                    return false;
                };
                match master.try_update().await {
                    Some(Ok(_)) | None => {}
                    Some(Err(e)) => debug!("Auto-update cycle not run: {}", e),
                }
                true
            }
        });

        let previous = self
            .auto_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        drop(previous);
        Ok(())
    }

    /// [`start_auto_update`](Self::start_auto_update) with the configured
    /// `poll_period`.
    pub fn start_polling(self: &Arc<Self>) -> ModbusResult<()> {
        self.start_auto_update(self.config.poll_period)
    }

    /// Stop auto-update; a cycle in flight completes before this returns.
    pub async fn stop_auto_update(&self) {
        let handle = self
            .auto_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub fn is_auto_updating(&self) -> bool {
        self.auto_update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(AutoUpdate::is_running)
    }
}

impl<C: SerialChannel> fmt::Debug for RtuMaster<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtuMaster")
            .field("state", &self.state())
            .field("slave_id", &self.slave_id())
            .field("cycles", &self.cycle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::StreamChannel;
    use tokio::io::DuplexStream;

    fn master() -> RtuMaster<StreamChannel<DuplexStream>> {
        RtuMaster::new(
            MasterConfig::new()
                .with_entries_per_kind(2)
                .with_settle_delay(Duration::ZERO),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_without_connection() {
        let master = master();
        assert_eq!(master.state(), ConnectionState::Disconnected);
        assert_eq!(master.update().await.unwrap_err(), ModbusError::NotConnected);
        assert_eq!(master.cycle_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let master = master();
        let (ours, _peer) = tokio::io::duplex(64);
        master
            .connect(StreamChannel::new("a", ours), &SerialConfig::default())
            .await
            .unwrap();
        assert!(master.is_connected());

        let (again, _other) = tokio::io::duplex(64);
        let err = master
            .connect(StreamChannel::new("b", again), &SerialConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(master.is_connected());

        master.disconnect().await.unwrap();
        assert_eq!(master.state(), ConnectionState::Disconnected);
        master.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_open_records_error() {
        let master = master();
        let (ours, _peer) = tokio::io::duplex(64);
        let mut channel = StreamChannel::new("used", ours);
        channel.open(&SerialConfig::default()).await.unwrap();

        let err = master
            .connect(channel, &SerialConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(master.state(), ConnectionState::Disconnected);
        assert_eq!(master.last_error(), Some(err));
    }

    #[test]
    fn test_slave_id_validation() {
        let master = master();
        assert_eq!(master.slave_id(), 10);
        assert_eq!(
            master.set_slave_id(0).unwrap_err().kind(),
            ErrorKind::Validation
        );
        master.set_slave_id(247).unwrap();
        assert_eq!(master.slave_id(), 247);
    }

    #[test]
    fn test_pending_write_on_read_only_rejected() {
        let master = master();
        let err = master
            .set_pending_write(RegisterKind::DiscreteInput, 0, RegisterValue::Bit(true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(master.entry(RegisterKind::DiscreteInput, 0).unwrap().pending_write.is_none());
    }
}
