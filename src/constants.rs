//! Modbus RTU protocol constants and engine defaults
//!
//! Frame limits come from the Modbus over Serial Line specification:
//! - Maximum RTU ADU: 256 bytes (slave address + PDU + CRC)
//! - Maximum PDU: 253 bytes
//! - Register/coil limits are derived from the PDU size

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Maximum RTU ADU (Application Data Unit) size on a serial line
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum PDU (Protocol Data Unit) size
/// RTU ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = MAX_RTU_FRAME_SIZE - 3;

/// Slave address (1) + function code (1) + CRC (2)
pub const RTU_FRAME_OVERHEAD: usize = 4;

/// Exception response: slave (1) + function | 0x80 (1) + exception code (1) + CRC (2)
pub const RTU_EXCEPTION_FRAME_LEN: usize = 5;

/// Echo response of FC05/06/0F/10: slave (1) + fc (1) + address (2) + value/quantity (2) + CRC (2)
pub const RTU_ECHO_FRAME_LEN: usize = 8;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
///
/// Response PDU: 1 (fc) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16
///
/// Request PDU: 1 + 2 + 2 + 1 + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15 (0x7B0)
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Slave Addressing
// ============================================================================

/// Broadcast address, never answered and therefore not pollable
pub const BROADCAST_SLAVE_ID: u8 = 0;

/// Lowest unicast slave address
pub const MIN_SLAVE_ID: u8 = 1;

/// Highest unicast slave address
pub const MAX_SLAVE_ID: u8 = 247;

// ============================================================================
// Engine Defaults
// ============================================================================

/// Response window for a single transaction (milliseconds)
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 50;

/// Grace period after opening the port before the transport reports ready (milliseconds).
/// Many boards reset when the port opens; frames sent earlier are lost.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;

/// Slave id used until a collaborator picks another one
pub const DEFAULT_SLAVE_ID: u8 = 10;

/// Entries created per register kind at start-up
pub const DEFAULT_ENTRIES_PER_KIND: u16 = 16;

/// Auto-update period (milliseconds)
pub const DEFAULT_POLL_PERIOD_MS: u64 = 1000;

/// Capacity of the received-chunk queue between the read loop and the client
pub const CHUNK_QUEUE_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MAX_RTU_FRAME_SIZE, 256);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(RTU_ECHO_FRAME_LEN, RTU_FRAME_OVERHEAD + 4);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);

        let write_coil_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_slave_range() {
        assert!(BROADCAST_SLAVE_ID < MIN_SLAVE_ID);
        assert!((MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&DEFAULT_SLAVE_ID));
    }
}
