//! Modbus application-layer types: function codes, exceptions, requests, responses
//!
//! A [`ModbusRequest`] is what the client wants to send; the RTU codec turns it
//! into a framed ADU. A [`ModbusResponse`] is the decoded answer with the slave
//! id, function and the PDU data that follows the function code.

use std::fmt;

use crate::constants::{
    EXCEPTION_ACKNOWLEDGE, EXCEPTION_GATEWAY_PATH_UNAVAILABLE, EXCEPTION_GATEWAY_TARGET_FAILED,
    EXCEPTION_ILLEGAL_DATA_ADDRESS, EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION,
    EXCEPTION_MEMORY_PARITY_ERROR, EXCEPTION_SERVER_DEVICE_BUSY, EXCEPTION_SERVER_DEVICE_FAILURE,
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_SLAVE_ID, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS, MIN_SLAVE_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ModbusPdu, PduBuilder};

/// Address of a device on the RTU bus
pub type SlaveId = u8;

/// Check that `id` is a pollable unicast address (1-247).
pub fn validate_slave_id(id: SlaveId) -> ModbusResult<SlaveId> {
    if (MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&id) {
        Ok(id)
    } else {
        Err(ModbusError::validation(format!(
            "Invalid slave id {} (must be {}-{})",
            id, MIN_SLAVE_ID, MAX_SLAVE_ID
        )))
    }
}

/// Function codes understood by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code {
            FC_READ_COILS => Ok(Self::ReadCoils),
            FC_READ_DISCRETE_INPUTS => Ok(Self::ReadDiscreteInputs),
            FC_READ_HOLDING_REGISTERS => Ok(Self::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(Self::ReadInputRegisters),
            FC_WRITE_SINGLE_COIL => Ok(Self::WriteSingleCoil),
            FC_WRITE_SINGLE_REGISTER => Ok(Self::WriteSingleRegister),
            FC_WRITE_MULTIPLE_COILS => Ok(Self::WriteMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(Self::WriteMultipleRegisters),
            other => Err(ModbusError::invalid_function(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// FC01-04: the response carries a byte count followed by the data.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }

    /// FC05/06/0F/10: the response echoes address and value/quantity.
    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// Bit-addressed functions (coils and discrete inputs).
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            Self::ReadCoils | Self::ReadDiscreteInputs | Self::WriteSingleCoil | Self::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(ModbusPdu::function_code_description(self.to_u8()))
    }
}

/// Standard Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModbusException {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl ModbusException {
    pub fn from_code(code: u8) -> Self {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Self::IllegalFunction,
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Self::IllegalDataAddress,
            EXCEPTION_ILLEGAL_DATA_VALUE => Self::IllegalDataValue,
            EXCEPTION_SERVER_DEVICE_FAILURE => Self::ServerDeviceFailure,
            EXCEPTION_ACKNOWLEDGE => Self::Acknowledge,
            EXCEPTION_SERVER_DEVICE_BUSY => Self::ServerDeviceBusy,
            EXCEPTION_MEMORY_PARITY_ERROR => Self::MemoryParityError,
            EXCEPTION_GATEWAY_PATH_UNAVAILABLE => Self::GatewayPathUnavailable,
            EXCEPTION_GATEWAY_TARGET_FAILED => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::ServerDeviceFailure => "Server Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailed => "Gateway Target Device Failed to Respond",
            Self::Unknown(_) => "Unknown Exception",
        }
    }
}

/// A request addressed to one slave.
///
/// `data` holds the function-specific payload after address and quantity:
/// - FC05: `[0xFF, 0x00]` or `[0x00, 0x00]`
/// - FC06: the register value, big-endian
/// - FC0F: packed coil bytes (LSB first), byte count is added when framing
/// - FC10: register values, big-endian, byte count is added when framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    pub fn new_read(slave_id: SlaveId, function: ModbusFunction, address: u16, quantity: u16) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Check quantity limits for the function code.
    pub fn validate(&self) -> ModbusResult<()> {
        let qty = self.quantity as usize;
        let max = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => MAX_READ_COILS,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            ModbusFunction::WriteMultipleCoils => MAX_WRITE_COILS,
            ModbusFunction::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if qty == 0 || qty > max {
            return Err(ModbusError::invalid_data(format!(
                "Invalid quantity {} for {} (1-{})",
                qty, self.function, max
            )));
        }

        let expected_data = match self.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => Some(2),
            ModbusFunction::WriteMultipleCoils => Some(qty.div_ceil(8)),
            ModbusFunction::WriteMultipleRegisters => Some(qty * 2),
            _ => None,
        };
        if let Some(expected) = expected_data {
            if self.data.len() != expected {
                return Err(ModbusError::invalid_data(format!(
                    "{} expects {} data bytes, got {}",
                    self.function,
                    expected,
                    self.data.len()
                )));
            }
        }
        Ok(())
    }

    /// Build the PDU (function code onwards) for this request.
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        self.validate()?;
        let fc = self.function.to_u8();
        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                PduBuilder::build_read_request(fc, self.address, self.quantity)
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                Ok(PduBuilder::new()
                    .function_code(fc)?
                    .address(self.address)?
                    .data(&self.data)?
                    .build())
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                Ok(PduBuilder::new()
                    .function_code(fc)?
                    .address(self.address)?
                    .quantity(self.quantity)?
                    .byte(self.data.len() as u8)?
                    .data(&self.data)?
                    .build())
            }
        }
    }
}

/// A decoded, CRC-checked, non-exception response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    data: Vec<u8>,
}

impl ModbusResponse {
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
        }
    }

    /// PDU bytes after the function code.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn payload(&self) -> ModbusResult<&[u8]> {
        let (&byte_count, rest) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty read response"))?;
        if rest.len() != byte_count as usize {
            return Err(ModbusError::frame(format!(
                "Byte count {} does not match payload length {}",
                byte_count,
                rest.len()
            )));
        }
        Ok(rest)
    }

    /// Unpack an FC01/02 payload, LSB of the first byte is the first bit.
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        let payload = self.payload()?;
        Ok(payload
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
            .collect())
    }

    /// Unpack an FC03/04 payload into big-endian registers.
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let payload = self.payload()?;
        if payload.len() % 2 != 0 {
            return Err(ModbusError::frame(format!(
                "Odd register payload length {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Check that a write response echoes the request's address and value/quantity.
    pub fn verify_echo(&self, request: &ModbusRequest) -> ModbusResult<()> {
        let expected: [u8; 4] = match request.function {
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                let addr = request.address.to_be_bytes();
                [addr[0], addr[1], request.data[0], request.data[1]]
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                let addr = request.address.to_be_bytes();
                let qty = request.quantity.to_be_bytes();
                [addr[0], addr[1], qty[0], qty[1]]
            }
            _ => return Ok(()),
        };
        if self.data.as_slice() != expected {
            return Err(ModbusError::protocol(format!(
                "{} echo mismatch: sent {:02X?}, got {:02X?}",
                request.function, expected, self.data
            )));
        }
        Ok(())
    }
}

/// Pack coil states into bytes, first coil in the LSB.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}
