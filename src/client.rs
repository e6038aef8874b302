//! Modbus RTU client
//!
//! A client is bound to one slave id and one open transport. Each operation
//! frames a request, writes it, and waits for the matching response or the
//! response timeout. Clients sharing a transport share its link lock, so
//! transactions on one serial line never overlap.
//!
//! # API Naming Convention
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rtu_master::{ModbusClient, RtuClient, SerialConfig, SerialTransport, StreamChannel};
//!
//! # async fn example(stream: tokio::io::DuplexStream) -> rtu_master::ModbusResult<()> {
//! let mut transport = SerialTransport::new(StreamChannel::new("pipe", stream));
//! let handle = transport.open(&SerialConfig::default(), None).await?;
//!
//! let mut client = RtuClient::new(handle, 10)?;
//! let registers = client.read_03(0, 4).await?;
//! client.write_06(1, 0x1234).await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::constants::DEFAULT_RESPONSE_TIMEOUT_MS;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{
    pack_bits, validate_slave_id, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId,
};
use crate::rtu::{decode_frame, encode_request, ResponseAssembler};
use crate::transport::{Link, TransportHandle, TransportStats};

/// Operations a master issues against one slave.
///
/// # Protocol Limits
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Coils (0x01) | 2000 coils |
/// | Read Discrete Inputs (0x02) | 2000 bits |
/// | Read Holding Registers (0x03) | 125 registers |
/// | Read Input Registers (0x04) | 125 registers |
/// | Write Multiple Coils (0x0F) | 1968 coils |
/// | Write Multiple Registers (0x10) | 123 registers |
///
/// Out-of-range quantities fail with a validation-kind error before anything
/// is written to the line.
pub trait ModbusClient: Send + Sync {
    /// The slave every request is addressed to.
    fn slave_id(&self) -> SlaveId;

    /// Read coils (function code 0x01).
    fn read_01(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read discrete inputs (function code 0x02).
    fn read_02(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read holding registers (function code 0x03).
    fn read_03(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Read input registers (function code 0x04).
    fn read_04(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write single coil (function code 0x05). `true` is sent as 0xFF00.
    fn write_05(&mut self, address: u16, value: bool)
        -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(&mut self, address: u16, value: u16)
        -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple coils (function code 0x0F).
    fn write_0f(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Whether the underlying transport is still open.
    fn is_connected(&self) -> bool;

    fn get_stats(&self) -> TransportStats;

    // ===== Semantic name aliases =====

    /// Alias for `read_01` - Read coils
    #[inline]
    fn read_coils(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_01(address, quantity)
    }

    /// Alias for `read_02` - Read discrete inputs
    #[inline]
    fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_02(address, quantity)
    }

    /// Alias for `read_03` - Read holding registers
    #[inline]
    fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_03(address, quantity)
    }

    /// Alias for `read_04` - Read input registers
    #[inline]
    fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_04(address, quantity)
    }

    /// Alias for `write_05` - Write single coil
    #[inline]
    fn write_single_coil(
        &mut self,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_05(address, value)
    }

    /// Alias for `write_06` - Write single register
    #[inline]
    fn write_single_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_06(address, value)
    }

    /// Alias for `write_0f` - Write multiple coils
    #[inline]
    fn write_multiple_coils(
        &mut self,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_0f(address, values)
    }

    /// Alias for `write_10` - Write multiple registers
    #[inline]
    fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_10(address, values)
    }
}

/// RTU client over a shared [`TransportHandle`].
///
/// Cloning is cheap; clones talk to the same slave over the same line.
#[derive(Debug, Clone)]
pub struct RtuClient {
    transport: TransportHandle,
    slave_id: SlaveId,
    response_timeout: Duration,
    logger: Option<CallbackLogger>,
}

impl RtuClient {
    /// Bind a client to `slave_id` (1-247) on an open transport.
    pub fn new(transport: TransportHandle, slave_id: SlaveId) -> ModbusResult<Self> {
        Ok(Self {
            transport,
            slave_id: validate_slave_id(slave_id)?,
            response_timeout: Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            logger: None,
        })
    }

    pub fn with_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// A new client for another slave on the same transport.
    pub fn with_slave(&self, slave_id: SlaveId) -> ModbusResult<Self> {
        Ok(Self {
            slave_id: validate_slave_id(slave_id)?,
            ..self.clone()
        })
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Run one transaction: frame, write, await the response, decode.
    pub async fn execute_request(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let frame = encode_request(request)?;

        if let Some(logger) = &self.logger {
            logger.log_request(
                request.slave_id,
                request.function.to_u8(),
                request.address,
                request.quantity,
                &request.data,
            );
            logger.log_frame("TX", &frame);
        }

        let mut link = self.transport.lock().await;

        let stale = link.chunks().discard_pending();
        if stale > 0 {
            debug!("Discarded {} stale bytes before {}", stale, request.function);
        }

        if let Err(e) = link.write_frame(&frame).await {
            link.record(|stats| stats.errors += 1);
            return Err(e);
        }
        trace!("Sent {} bytes to slave {}", frame.len(), request.slave_id);

        let received =
            tokio::time::timeout(self.response_timeout, await_frame(&mut link)).await;
        let raw = match received {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                link.record(|stats| stats.errors += 1);
                return Err(e);
            }
            Err(_) => {
                link.record(|stats| stats.timeouts += 1);
                return Err(ModbusError::timeout(
                    format!("{} from slave {}", request.function, request.slave_id),
                    self.response_timeout.as_millis() as u64,
                ));
            }
        };

        if let Some(logger) = &self.logger {
            logger.log_frame("RX", &raw);
        }

        match decode_frame(&raw).and_then(|frame| frame.into_response(request)) {
            Ok(response) => {
                link.record(|stats| stats.responses_received += 1);
                drop(link);
                if let Some(logger) = &self.logger {
                    logger.log_response(
                        response.slave_id,
                        response.function.to_u8(),
                        response.data(),
                    );
                }
                Ok(response)
            }
            Err(e) => {
                link.record(|stats| stats.errors += 1);
                Err(e)
            }
        }
    }

    fn request(&self, function: ModbusFunction, address: u16, quantity: u16, data: Vec<u8>) -> ModbusRequest {
        ModbusRequest {
            slave_id: self.slave_id,
            function,
            address,
            quantity,
            data,
        }
    }

    async fn read_bits(
        &self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::new_read(self.slave_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        let mut bits = response.parse_bits()?;
        if bits.len() < quantity as usize {
            return Err(ModbusError::protocol(format!(
                "Expected {} bits, got {}",
                quantity,
                bits.len()
            )));
        }
        bits.truncate(quantity as usize);
        Ok(bits)
    }

    async fn read_registers(
        &self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request = ModbusRequest::new_read(self.slave_id, function, address, quantity);
        let response = self.execute_request(&request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(ModbusError::protocol(format!(
                "Expected {} registers, got {}",
                quantity,
                registers.len()
            )));
        }
        Ok(registers)
    }
}

/// Feed received chunks to an assembler until one complete frame is buffered.
async fn await_frame(link: &mut Link) -> ModbusResult<BytesMut> {
    let mut assembler = ResponseAssembler::new();
    loop {
        let Some(chunk) = link.chunks().next().await else {
            return Err(ModbusError::transport("Transport closed while awaiting response"));
        };
        assembler.push(&chunk);
        if let Some(frame) = assembler.next_frame()? {
            return Ok(frame);
        }
    }
}

impl ModbusClient for RtuClient {
    fn slave_id(&self) -> SlaveId {
        self.slave_id
    }

    async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadCoils, address, quantity)
            .await
    }

    async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(ModbusFunction::ReadDiscreteInputs, address, quantity)
            .await
    }

    async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_registers(ModbusFunction::ReadHoldingRegisters, address, quantity)
            .await
    }

    async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_registers(ModbusFunction::ReadInputRegisters, address, quantity)
            .await
    }

    async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        let data = if value { vec![0xFF, 0x00] } else { vec![0x00, 0x00] };
        let request = self.request(ModbusFunction::WriteSingleCoil, address, 1, data);
        self.execute_request(&request).await?;
        Ok(())
    }

    async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let request = self.request(
            ModbusFunction::WriteSingleRegister,
            address,
            1,
            value.to_be_bytes().to_vec(),
        );
        self.execute_request(&request).await?;
        Ok(())
    }

    async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let quantity = u16::try_from(values.len())
            .map_err(|_| ModbusError::invalid_data(format!("Too many coils: {}", values.len())))?;
        let request = self.request(
            ModbusFunction::WriteMultipleCoils,
            address,
            quantity,
            pack_bits(values),
        );
        self.execute_request(&request).await?;
        Ok(())
    }

    async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let quantity = u16::try_from(values.len()).map_err(|_| {
            ModbusError::invalid_data(format!("Too many registers: {}", values.len()))
        })?;
        let data = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        let request = self.request(ModbusFunction::WriteMultipleRegisters, address, quantity, data);
        self.execute_request(&request).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}
