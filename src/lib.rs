//! # rtu_master - Modbus RTU master polling engine
//!
//! Keeps a typed register map (coils, discrete inputs, input registers,
//! output registers) in sync with one slave on a serial line. A cycle writes
//! every queued value, then reads every register, recording value, timestamp
//! and error per entry. Cycles run on demand or from a fixed-period
//! scheduler.
//!
//! ## Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`transport`] | serial channel, read loop, settle delay, ordered close |
//! | [`rtu`], [`pdu`], [`protocol`] | RTU framing, CRC-16, requests and responses |
//! | [`client`] | one transaction per call, fixed response timeout |
//! | [`register`], [`register_map`] | register kinds, capability table, entry arena |
//! | [`poll`], [`scheduler`] | the write-then-read cycle and its timer |
//! | [`master`] | connect / disconnect / slave id, observer API |
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used by the cycle |
//! |------|----------|-------------------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | client only |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | client only |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rtu_master::{MasterConfig, RegisterKind, RegisterValue, RtuMaster, SerialConfig, StreamChannel};
//!
//! # async fn example(stream: tokio::io::DuplexStream) -> rtu_master::ModbusResult<()> {
//! let master = Arc::new(RtuMaster::new(MasterConfig::default())?);
//! master.connect(StreamChannel::new("pipe", stream), &SerialConfig::default()).await?;
//!
//! master.set_pending_write(RegisterKind::OutputRegister, 2, RegisterValue::Word(1500))?;
//! master.start_auto_update(Duration::from_secs(1))?;
//!
//! let mut state = master.subscribe_state();
//! state.changed().await.ok();
//! for entry in master.registers() {
//!     println!("{} {} = {:?}", entry.kind, entry.address, entry.value);
//! }
//!
//! master.stop_auto_update().await;
//! master.disconnect().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants and engine defaults
pub mod constants;

/// Stack-allocated PDU
pub mod pdu;

/// Function codes, exceptions, requests and responses
pub mod protocol;

/// RTU framing and CRC
pub mod rtu;

/// Serial transport
pub mod transport;

/// Modbus RTU client
pub mod client;

/// Packet-level logging
pub mod logging;

// ============================================================================
// Engine modules
// ============================================================================

/// Register kinds, values and entries
pub mod register;

/// Register arena
pub mod register_map;

/// The poll cycle
pub mod poll;

/// Fixed-period auto-update
pub mod scheduler;

/// Engine configuration
pub mod config;

/// Connection lifecycle
pub mod master;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Engine ===
pub use config::MasterConfig;
pub use master::{ConnectionState, RtuMaster};
pub use poll::CycleReport;
pub use register::{EntryError, RegisterEntry, RegisterKey, RegisterKind, RegisterValue};
pub use register_map::RegisterMap;
pub use scheduler::AutoUpdate;

// === Client API ===
pub use client::{ModbusClient, RtuClient};

// === Error handling ===
pub use error::{ErrorKind, ModbusError, ModbusResult};

// === Core types ===
pub use protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};

// === Transport ===
pub use transport::{
    DataBits, FlowControl, Parity, SerialChannel, SerialConfig, SerialTransport, StopBits,
    StreamChannel, TransportHandle, TransportStats,
};

#[cfg(feature = "rtu")]
pub use transport::TokioSerialChannel;

// === Protocol limits ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

// === Logging ===
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
