//! # Master Configuration
//!
//! Engine settings and their defaults:
//!
//! - **Entries per kind**: 16 coils, discrete inputs, input and output registers
//! - **Response timeout**: 50 ms per transaction
//! - **Settle delay**: 1000 ms between opening the port and the first frame
//! - **Slave id**: 10
//! - **Auto-update period**: 1000 ms

use std::time::Duration;

use crate::constants::{
    DEFAULT_ENTRIES_PER_KIND, DEFAULT_POLL_PERIOD_MS, DEFAULT_RESPONSE_TIMEOUT_MS,
    DEFAULT_SETTLE_DELAY_MS, DEFAULT_SLAVE_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{validate_slave_id, SlaveId};

/// Settings for an [`RtuMaster`](crate::RtuMaster).
///
/// # Example
///
/// ```rust
/// use rtu_master::MasterConfig;
/// use std::time::Duration;
///
/// let config = MasterConfig::new()
///     .with_entries_per_kind(8)
///     .with_response_timeout(Duration::from_millis(100))
///     .with_slave_id(3);
///
/// assert_eq!(config.entries_per_kind, 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Entries created per register kind, addressed from 0.
    pub entries_per_kind: u16,
    /// Response window of a single transaction.
    pub response_timeout: Duration,
    /// Wait after opening the port before the first frame.
    pub settle_delay: Duration,
    /// Slave addressed until `set_slave_id` is called.
    pub slave_id: SlaveId,
    /// Default period for auto-update.
    pub poll_period: Duration,
    /// Packet logger handed to every client.
    pub packet_logger: Option<CallbackLogger>,
}

impl MasterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries_per_kind(mut self, count: u16) -> Self {
        self.entries_per_kind = count;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_slave_id(mut self, slave_id: SlaveId) -> Self {
        self.slave_id = slave_id;
        self
    }

    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    pub fn with_packet_logger(mut self, logger: CallbackLogger) -> Self {
        self.packet_logger = Some(logger);
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> ModbusResult<()> {
        validate_slave_id(self.slave_id)?;
        if self.response_timeout.is_zero() {
            return Err(ModbusError::validation("Response timeout must be non-zero"));
        }
        if self.poll_period.is_zero() {
            return Err(ModbusError::validation("Poll period must be non-zero"));
        }
        Ok(())
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            entries_per_kind: DEFAULT_ENTRIES_PER_KIND,
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            slave_id: DEFAULT_SLAVE_ID,
            poll_period: Duration::from_millis(DEFAULT_POLL_PERIOD_MS),
            packet_logger: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MasterConfig::default();
        assert_eq!(config.entries_per_kind, 16);
        assert_eq!(config.response_timeout, Duration::from_millis(50));
        assert_eq!(config.settle_delay, Duration::from_millis(1000));
        assert_eq!(config.slave_id, 10);
        assert!(config.packet_logger.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broadcast_slave() {
        assert!(MasterConfig::new().with_slave_id(0).validate().is_err());
        assert!(MasterConfig::new().with_slave_id(248).validate().is_err());
        assert!(MasterConfig::new()
            .with_response_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
