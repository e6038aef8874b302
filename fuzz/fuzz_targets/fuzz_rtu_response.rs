//! Arbitrary line noise must never panic the response path.
//!
//! The first byte picks the function code of the outstanding request; the rest
//! is fed to the assembler in chunks of varying size, and every complete frame
//! goes through CRC check and request matching.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rtu_master::protocol::{ModbusFunction, ModbusRequest};
use rtu_master::rtu::{decode_frame, ResponseAssembler};

const FUNCTIONS: [ModbusFunction; 4] = [
    ModbusFunction::ReadCoils,
    ModbusFunction::ReadDiscreteInputs,
    ModbusFunction::ReadHoldingRegisters,
    ModbusFunction::ReadInputRegisters,
];

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let function = FUNCTIONS[selector as usize % FUNCTIONS.len()];
    let request = ModbusRequest::new_read(10, function, 0, 1);
    let chunk_size = (selector as usize >> 2) % 16 + 1;

    let mut assembler = ResponseAssembler::new();
    for chunk in rest.chunks(chunk_size) {
        assembler.push(chunk);
        match assembler.next_frame() {
            Ok(Some(frame)) => {
                if let Ok(response) = decode_frame(&frame).and_then(|f| f.into_response(&request)) {
                    let _ = response.parse_bits();
                    let _ = response.parse_registers();
                }
            }
            Ok(None) => {}
            Err(_) => assembler.clear(),
        }
    }
});
