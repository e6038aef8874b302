//! Error types for the RTU master
//!
//! Every failure the engine can produce is a [`ModbusError`]. The variants are
//! grouped into four classes through [`ModbusError::kind`]:
//!
//! | Kind | Variants | Effect |
//! |------|----------|--------|
//! | `Transport` | `Transport`, `NotConnected` | fatal to the connection |
//! | `Timeout` | `Timeout` | recorded on the entry, retried next cycle |
//! | `Protocol` | `Protocol`, `Frame`, `Exception`, `InvalidFunction` | recorded on the entry |
//! | `Validation` | `Validation`, `InvalidData` | rejected before reaching the wire |

use std::fmt;

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result alias used across the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the transport, the RTU client and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    /// The serial channel failed to open, write, read or close
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// No client is bound because the master is not connected
    #[error("Not connected")]
    NotConnected,

    /// No complete response arrived inside the response window
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The response was well formed but does not answer the request
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed frame or CRC mismatch
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// The slave answered with a Modbus exception
    #[error("Modbus exception 0x{code:02X} for function 0x{function:02X}")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Unsupported function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request arguments out of range (quantity, value width)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Caller error: read-only write, duplicate address, bad slave id, wrong state
    #[error("Validation error: {message}")]
    Validation { message: String },
}

/// Coarse error classification exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
        };
        f.write_str(name)
    }
}

impl ModbusError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Build an exception error, resolving the code to its standard description.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: ModbusException::from_code(code).description().to_string(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModbusError::Transport { .. } | ModbusError::NotConnected => ErrorKind::Transport,
            ModbusError::Timeout { .. } => ErrorKind::Timeout,
            ModbusError::Protocol { .. }
            | ModbusError::Frame { .. }
            | ModbusError::Exception { .. }
            | ModbusError::InvalidFunction { .. } => ErrorKind::Protocol,
            ModbusError::InvalidData { .. } | ModbusError::Validation { .. } => {
                ErrorKind::Validation
            }
        }
    }

    /// Message reported by the device itself, if any.
    pub fn device_message(&self) -> Option<&str> {
        match self {
            ModbusError::Exception { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Whether the connection can stay up after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Protocol)
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::transport(err.to_string())
    }
}
