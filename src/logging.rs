//! Packet-level logging
//!
//! The crate logs through `tracing` everywhere. On top of that a
//! [`CallbackLogger`] can be attached to a client to see every request and
//! response as it goes over the wire, either as `tracing` events or through a
//! user callback (a UI console, a capture file).

use std::fmt;
use std::sync::Arc;

use crate::pdu::ModbusPdu;

/// Severity attached to a packet log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Receives formatted packet log lines
pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Where packet logs go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    #[default]
    Disabled,
    /// Emit `tracing` events under the `rtu_master::packet` target
    Tracing,
    /// Hand lines to the registered callback
    Callback,
}

/// Packet logger shared by clients on the same transport.
#[derive(Clone, Default)]
pub struct CallbackLogger {
    mode: LoggingMode,
    level: Option<LogLevel>,
    callback: Option<LogCallback>,
}

impl fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("mode", &self.mode)
            .field("level", &self.level)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl CallbackLogger {
    /// Forward lines at or above `level` to `callback`.
    pub fn new(callback: LogCallback, level: LogLevel) -> Self {
        Self {
            mode: LoggingMode::Callback,
            level: Some(level),
            callback: Some(callback),
        }
    }

    /// Log packets as `tracing` events.
    pub fn tracing(level: LogLevel) -> Self {
        Self {
            mode: LoggingMode::Tracing,
            level: Some(level),
            callback: None,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        match (self.mode, self.level) {
            (LoggingMode::Disabled, _) | (_, None) => false,
            (_, Some(max)) => level <= max,
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if !self.is_enabled(level) {
            return;
        }
        match self.mode {
            LoggingMode::Disabled => {}
            LoggingMode::Tracing => match level {
                LogLevel::Error => tracing::error!(target: "rtu_master::packet", "{}", message),
                LogLevel::Warn => tracing::warn!(target: "rtu_master::packet", "{}", message),
                LogLevel::Info => tracing::info!(target: "rtu_master::packet", "{}", message),
                LogLevel::Debug => tracing::debug!(target: "rtu_master::packet", "{}", message),
                LogLevel::Trace => tracing::trace!(target: "rtu_master::packet", "{}", message),
            },
            LoggingMode::Callback => {
                if let Some(callback) = &self.callback {
                    callback(level, message);
                }
            }
        }
    }

    pub fn log_request(&self, slave_id: u8, function: u8, address: u16, quantity: u16, data: &[u8]) {
        if !self.is_enabled(LogLevel::Debug) {
            return;
        }
        let line = format!(
            "request slave={} fc=0x{:02X} ({}) addr={} qty={} data=[{}]",
            slave_id,
            function,
            ModbusPdu::function_code_description(function),
            address,
            quantity,
            format_hex(data)
        );
        self.log(LogLevel::Debug, &line);
    }

    pub fn log_response(&self, slave_id: u8, function: u8, data: &[u8]) {
        if !self.is_enabled(LogLevel::Debug) {
            return;
        }
        let line = format!(
            "response slave={} fc=0x{:02X} data=[{}]",
            slave_id,
            function,
            format_hex(data)
        );
        self.log(LogLevel::Debug, &line);
    }

    /// Raw ADU as sent or received
    pub fn log_frame(&self, direction: &str, frame: &[u8]) {
        if !self.is_enabled(LogLevel::Trace) {
            return;
        }
        self.log(LogLevel::Trace, &format!("{} {}", direction, format_hex(frame)));
    }
}

/// Format bytes as space separated upper-case hex.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
