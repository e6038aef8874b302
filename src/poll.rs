//! One poll cycle: write phase, read phase, count
//!
//! 1. Every writable entry with a queued value is written, one transaction at
//!    a time. The queued value is taken before the transaction is issued and
//!    is not restored if the write fails; the failure is kept in
//!    `write_error`.
//! 2. Every entry is read, address-then-kind. A failure is stored on the
//!    entry and the previous value stays.
//! 3. The cycle counter goes up by one.
//!
//! No single entry can abort the cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::client::ModbusClient;
use crate::error::{ErrorKind, ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;
use crate::register::{RegisterKind, RegisterValue};
use crate::register_map::{read_map, write_map, RegisterMap};

/// Outcome counts of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Counter value after this cycle
    pub cycle: u64,
    pub writes_ok: usize,
    pub writes_failed: usize,
    pub reads_ok: usize,
    pub reads_failed: usize,
    pub elapsed: Duration,
    /// First transport-level failure seen, if any
    pub transport_error: Option<ModbusError>,
}

impl CycleReport {
    pub fn failures(&self) -> usize {
        self.writes_failed + self.reads_failed
    }

    fn note(&mut self, err: &ModbusError) {
        if err.kind() == ErrorKind::Transport && self.transport_error.is_none() {
            self.transport_error = Some(err.clone());
        }
    }
}

/// Run one full cycle against `client`.
pub async fn update<C: ModbusClient>(
    client: &mut C,
    map: &RwLock<RegisterMap>,
    cycles: &AtomicU64,
) -> CycleReport {
    let started = Instant::now();
    let mut report = CycleReport {
        cycle: 0,
        writes_ok: 0,
        writes_failed: 0,
        reads_ok: 0,
        reads_failed: 0,
        elapsed: Duration::ZERO,
        transport_error: None,
    };

    // Write phase
    let pending = read_map(map).pending_writes();
    for key in pending {
        let Some(value) = write_map(map).begin_write(key) else {
            continue;
        };

        let result = write_entry(client, key.kind, key.address, value).await;
        match &result {
            Ok(()) => report.writes_ok += 1,
            Err(err) => {
                warn!(
                    "Write of {} {} = {} failed: {}",
                    key.kind, key.address, value, err
                );
                report.writes_failed += 1;
                report.note(err);
            }
        }
        write_map(map).finish_write(key, &result);
    }

    // Read phase
    let keys = read_map(map).keys();
    for key in keys {
        if !write_map(map).begin_read(key) {
            continue;
        }

        let result = read_entry(client, key.kind, key.address).await;
        match &result {
            Ok(_) => report.reads_ok += 1,
            Err(err) => {
                warn!("Read of {} {} failed: {}", key.kind, key.address, err);
                report.reads_failed += 1;
                report.note(err);
            }
        }
        write_map(map).finish_read(key, &result);
    }

    report.cycle = cycles.fetch_add(1, Ordering::AcqRel) + 1;
    report.elapsed = started.elapsed();
    debug!(
        "Cycle {} finished in {:?}: writes {}/{} ok, reads {}/{} ok",
        report.cycle,
        report.elapsed,
        report.writes_ok,
        report.writes_ok + report.writes_failed,
        report.reads_ok,
        report.reads_ok + report.reads_failed
    );
    report
}

/// Dispatch a write through the kind's capability row.
pub async fn write_entry<C: ModbusClient>(
    client: &mut C,
    kind: RegisterKind,
    address: u16,
    value: RegisterValue,
) -> ModbusResult<()> {
    kind.check_value(value)?;
    match (kind.ensure_writable()?, value) {
        (ModbusFunction::WriteMultipleCoils, RegisterValue::Bit(bit)) => {
            client.write_multiple_coils(address, &[bit]).await
        }
        (ModbusFunction::WriteSingleRegister, RegisterValue::Word(word)) => {
            client.write_single_register(address, word).await
        }
        (function, value) => Err(ModbusError::validation(format!(
            "{} cannot write {:?}",
            function, value
        ))),
    }
}

/// Dispatch a single-register read through the kind's capability row.
pub async fn read_entry<C: ModbusClient>(
    client: &mut C,
    kind: RegisterKind,
    address: u16,
) -> ModbusResult<RegisterValue> {
    match kind.read_function() {
        ModbusFunction::ReadCoils => first(client.read_coils(address, 1).await?).map(RegisterValue::Bit),
        ModbusFunction::ReadDiscreteInputs => {
            first(client.read_discrete_inputs(address, 1).await?).map(RegisterValue::Bit)
        }
        ModbusFunction::ReadHoldingRegisters => {
            first(client.read_holding_registers(address, 1).await?).map(RegisterValue::Word)
        }
        ModbusFunction::ReadInputRegisters => {
            first(client.read_input_registers(address, 1).await?).map(RegisterValue::Word)
        }
        other => Err(ModbusError::invalid_function(other.to_u8())),
    }
}

fn first<T: Copy>(values: Vec<T>) -> ModbusResult<T> {
    values
        .first()
        .copied()
        .ok_or_else(|| ModbusError::protocol("Empty read response"))
}
