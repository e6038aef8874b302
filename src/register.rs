//! Register kinds, values and per-register state
//!
//! What a kind may do on the wire is a row in a static capability table
//! rather than behaviour spread over types:
//!
//! | Kind | readable | writable | read FC | write FC |
//! |------|----------|----------|---------|----------|
//! | Coil | yes | yes | 0x01 | 0x0F (quantity 1) |
//! | DiscreteInput | yes | no | 0x02 | - |
//! | InputRegister | yes | no | 0x04 | - |
//! | OutputRegister | yes | yes | 0x03 | 0x06 |

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{ErrorKind, ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;

/// The four Modbus data tables.
///
/// The declaration order is the tie-breaker when entries of different kinds
/// share an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    OutputRegister,
}

/// Wire capabilities of a register kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub read: ModbusFunction,
    pub write: Option<ModbusFunction>,
    pub is_bit: bool,
}

const CAPABILITIES: [Capabilities; 4] = [
    // Coil
    Capabilities {
        read: ModbusFunction::ReadCoils,
        write: Some(ModbusFunction::WriteMultipleCoils),
        is_bit: true,
    },
    // DiscreteInput
    Capabilities {
        read: ModbusFunction::ReadDiscreteInputs,
        write: None,
        is_bit: true,
    },
    // InputRegister
    Capabilities {
        read: ModbusFunction::ReadInputRegisters,
        write: None,
        is_bit: false,
    },
    // OutputRegister
    Capabilities {
        read: ModbusFunction::ReadHoldingRegisters,
        write: Some(ModbusFunction::WriteSingleRegister),
        is_bit: false,
    },
];

impl RegisterKind {
    pub const ALL: [RegisterKind; 4] = [
        RegisterKind::Coil,
        RegisterKind::DiscreteInput,
        RegisterKind::InputRegister,
        RegisterKind::OutputRegister,
    ];

    #[inline]
    pub fn capabilities(self) -> &'static Capabilities {
        &CAPABILITIES[self as usize]
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        true
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.capabilities().write.is_some()
    }

    pub fn read_function(self) -> ModbusFunction {
        self.capabilities().read
    }

    pub fn write_function(self) -> Option<ModbusFunction> {
        self.capabilities().write
    }

    /// Check that `value` has the width this kind stores.
    pub fn check_value(self, value: RegisterValue) -> ModbusResult<()> {
        if value.is_bit() == self.capabilities().is_bit {
            Ok(())
        } else {
            Err(ModbusError::validation(format!(
                "{} cannot hold {:?}",
                self, value
            )))
        }
    }

    /// Reject writes to read-only kinds before anything reaches the line.
    pub fn ensure_writable(self) -> ModbusResult<ModbusFunction> {
        self.write_function()
            .ok_or_else(|| ModbusError::validation(format!("{} is read-only", self)))
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::Coil => "coil",
            RegisterKind::DiscreteInput => "discrete input",
            RegisterKind::InputRegister => "input register",
            RegisterKind::OutputRegister => "output register",
        };
        f.write_str(name)
    }
}

/// A coil/discrete-input bit or a 16-bit register word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterValue {
    Bit(bool),
    Word(u16),
}

impl RegisterValue {
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterValue::Bit(_))
    }

    pub fn as_bit(self) -> Option<bool> {
        match self {
            RegisterValue::Bit(bit) => Some(bit),
            RegisterValue::Word(_) => None,
        }
    }

    pub fn as_word(self) -> Option<u16> {
        match self {
            RegisterValue::Word(word) => Some(word),
            RegisterValue::Bit(_) => None,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Bit(true) => f.write_str("ON"),
            RegisterValue::Bit(false) => f.write_str("OFF"),
            RegisterValue::Word(word) => write!(f, "{}", word),
        }
    }
}

impl From<bool> for RegisterValue {
    fn from(bit: bool) -> Self {
        RegisterValue::Bit(bit)
    }
}

impl From<u16> for RegisterValue {
    fn from(word: u16) -> Self {
        RegisterValue::Word(word)
    }
}

/// Arena key. Ordering is address first, then kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterKey {
    pub address: u16,
    pub kind: RegisterKind,
}

impl RegisterKey {
    pub fn new(kind: RegisterKind, address: u16) -> Self {
        Self { address, kind }
    }
}

/// Error captured on an entry for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    pub kind: ErrorKind,
    pub message: String,
    /// What the device itself reported, e.g. the exception description
    pub device_message: Option<String>,
}

impl From<&ModbusError> for EntryError {
    fn from(err: &ModbusError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            device_message: err.device_message().map(str::to_string),
        }
    }
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_message {
            Some(device) => write!(f, "{} ({})", self.message, device),
            None => f.write_str(&self.message),
        }
    }
}

/// State of one register as seen by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterEntry {
    pub address: u16,
    pub kind: RegisterKind,
    /// Last successfully read value
    pub value: Option<RegisterValue>,
    /// Value queued for the next write phase
    pub pending_write: Option<RegisterValue>,
    /// Time of the last read attempt, successful or not
    pub last_update: Option<DateTime<Utc>>,
    pub updating: bool,
    /// Outcome of the last read
    pub error: Option<EntryError>,
    /// Outcome of the last write
    pub write_error: Option<EntryError>,
}

impl RegisterEntry {
    pub fn new(kind: RegisterKind, address: u16) -> Self {
        Self {
            address,
            kind,
            value: None,
            pending_write: None,
            last_update: None,
            updating: false,
            error: None,
            write_error: None,
        }
    }

    pub fn key(&self) -> RegisterKey {
        RegisterKey::new(self.kind, self.address)
    }

    pub fn is_writable(&self) -> bool {
        self.kind.is_writable()
    }
}
