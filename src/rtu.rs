//! Modbus RTU framing
//!
//! ```text
//! +----------+---------------+------------------+-----------+-----------+
//! | slave id | function code | data (N bytes)   | CRC low   | CRC high  |
//! +----------+---------------+------------------+-----------+-----------+
//! ```
//!
//! Multi-byte fields inside the PDU are big-endian; the CRC-16/MODBUS trailer is
//! the only little-endian field. A serial line has no length prefix, so the
//! response length is inferred from the function code (and the byte count for
//! reads) while bytes trickle in. [`ResponseAssembler`] does that bookkeeping.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::constants::{
    EXCEPTION_FLAG, MAX_RTU_FRAME_SIZE, RTU_ECHO_FRAME_LEN, RTU_EXCEPTION_FRAME_LEN,
    RTU_FRAME_OVERHEAD,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Frame a request: slave id, PDU, CRC (low byte first).
pub fn encode_request(request: &ModbusRequest) -> ModbusResult<BytesMut> {
    let pdu = request.to_pdu()?;
    let mut frame = BytesMut::with_capacity(pdu.len() + RTU_FRAME_OVERHEAD);
    frame.put_u8(request.slave_id);
    frame.put_slice(pdu.as_slice());
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    Ok(frame)
}

/// Total length of the frame that starts at `buf[0]`, once enough of it is known.
///
/// Returns `Ok(None)` while the header is still incomplete.
pub fn expected_frame_len(buf: &[u8]) -> ModbusResult<Option<usize>> {
    let Some(&fc) = buf.get(1) else {
        return Ok(None);
    };
    if fc & EXCEPTION_FLAG != 0 {
        return Ok(Some(RTU_EXCEPTION_FRAME_LEN));
    }

    let function = ModbusFunction::from_u8(fc).map_err(|_| {
        ModbusError::frame(format!("Unexpected function code 0x{:02X} in response", fc))
    })?;
    if function.is_write() {
        return Ok(Some(RTU_ECHO_FRAME_LEN));
    }

    // slave + fc + byte count + payload + crc
    Ok(buf
        .get(2)
        .map(|&byte_count| 3 + byte_count as usize + 2))
}

/// A CRC-checked frame split into address and PDU.
#[derive(Debug, Clone)]
pub struct RtuFrame {
    pub slave_id: SlaveId,
    pub pdu: ModbusPdu,
}

/// Verify the CRC of a complete frame and split it.
pub fn decode_frame(frame: &[u8]) -> ModbusResult<RtuFrame> {
    if frame.len() < RTU_FRAME_OVERHEAD {
        return Err(ModbusError::frame(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame.len() > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::frame(format!(
            "RTU frame too large: {} bytes",
            frame.len()
        )));
    }

    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated = crc16(&frame[..body_len]);
    if received != calculated {
        return Err(ModbusError::frame(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            calculated, received
        )));
    }

    Ok(RtuFrame {
        slave_id: frame[0],
        pdu: ModbusPdu::from_slice(&frame[1..body_len])?,
    })
}

impl RtuFrame {
    /// Match the frame against the request it should answer.
    pub fn into_response(self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        if self.slave_id != request.slave_id {
            return Err(ModbusError::protocol(format!(
                "Response slave ID mismatch: expected {}, got {}",
                request.slave_id, self.slave_id
            )));
        }

        let fc = self
            .pdu
            .function_code()
            .ok_or_else(|| ModbusError::frame("Response without function code"))?;
        let requested = request.function.to_u8();

        if let Some(code) = self.pdu.exception_code() {
            if fc & !EXCEPTION_FLAG != requested {
                return Err(ModbusError::protocol(format!(
                    "Exception for function 0x{:02X}, expected 0x{:02X}",
                    fc & !EXCEPTION_FLAG,
                    requested
                )));
            }
            return Err(ModbusError::exception(requested, code));
        }

        if fc != requested {
            return Err(ModbusError::protocol(format!(
                "Response function mismatch: expected 0x{:02X}, got 0x{:02X}",
                requested, fc
            )));
        }

        let response =
            ModbusResponse::new_success(self.slave_id, request.function, self.pdu.body().to_vec());
        response.verify_echo(request)?;
        Ok(response)
    }
}

/// Collects received chunks until one complete response frame is available.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    buf: BytesMut,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_RTU_FRAME_SIZE),
        }
    }

    /// Drop anything received so far.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the first complete frame, if one is buffered.
    ///
    /// Bytes following a complete frame are line noise for a half-duplex master
    /// and are discarded.
    pub fn next_frame(&mut self) -> ModbusResult<Option<BytesMut>> {
        let Some(len) = expected_frame_len(&self.buf)? else {
            return Ok(None);
        };
        if len > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!(
                "Announced frame length {} exceeds {}",
                len, MAX_RTU_FRAME_SIZE
            )));
        }
        if self.buf.len() < len {
            return Ok(None);
        }

        let frame = self.buf.split_to(len);
        self.buf.clear();
        Ok(Some(frame))
    }
}
