//! In-memory Modbus RTU slave on the far end of a `tokio::io::duplex` pipe.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;

use rtu_master::{MasterConfig, RtuMaster, SerialChannel, SerialConfig, StreamChannel};

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub type TestMaster = RtuMaster<StreamChannel<DuplexStream>>;
pub type LineMaster = RtuMaster<LineChannel>;

/// Register banks of the simulated device.
#[derive(Debug, Default)]
pub struct Bank {
    pub coils: HashMap<u16, bool>,
    pub discrete_inputs: HashMap<u16, bool>,
    pub input_registers: HashMap<u16, u16>,
    pub holding_registers: HashMap<u16, u16>,
    /// Addresses at or above this answer with Illegal Data Address
    pub illegal_from: Option<u16>,
}

pub struct MockSlave {
    pub bank: Arc<Mutex<Bank>>,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    silent: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MockSlave {
    pub fn spawn(stream: DuplexStream, bank: Bank) -> Self {
        let bank = Arc::new(Mutex::new(bank));
        let frames = Arc::new(Mutex::new(Vec::new()));
        let silent = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(serve(stream, bank.clone(), frames.clone(), silent.clone()));
        Self {
            bank,
            frames,
            silent,
            task,
        }
    }

    /// Every request frame received so far, CRC included.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn clear_frames(&self) {
        self.frames.lock().unwrap().clear();
    }

    /// Keep receiving but stop answering.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Drop the slave end of the pipe.
    pub fn hang_up(&self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: DuplexStream,
    bank: Arc<Mutex<Bank>>,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    silent: Arc<AtomicBool>,
) {
    loop {
        let Some(frame) = read_request(&mut stream).await else {
            return;
        };
        frames.lock().unwrap().push(frame.clone());

        let body_len = frame.len() - 2;
        let crc = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
        if CRC.checksum(&frame[..body_len]) != crc || silent.load(Ordering::SeqCst) {
            continue;
        }

        let reply = answer(&frame[..body_len], &mut bank.lock().unwrap());
        if stream.write_all(&with_crc(&reply)).await.is_err() {
            return;
        }
    }
}

/// Read one master request; `None` on EOF.
async fn read_request(stream: &mut DuplexStream) -> Option<Vec<u8>> {
    let mut frame = vec![0u8; 7];
    stream.read_exact(&mut frame).await.ok()?;
    let remaining = match frame[1] {
        0x0F | 0x10 => frame[6] as usize + 2,
        _ => 1,
    };
    let mut rest = vec![0u8; remaining];
    stream.read_exact(&mut rest).await.ok()?;
    frame.extend_from_slice(&rest);
    Some(frame)
}

fn answer(request: &[u8], bank: &mut Bank) -> Vec<u8> {
    let slave = request[0];
    let fc = request[1];
    let address = u16::from_be_bytes([request[2], request[3]]);
    let word = u16::from_be_bytes([request[4], request[5]]);

    if bank.illegal_from.is_some_and(|limit| address >= limit) {
        return vec![slave, fc | 0x80, 0x02];
    }

    match fc {
        0x01 | 0x02 => {
            let source = if fc == 0x01 {
                &bank.coils
            } else {
                &bank.discrete_inputs
            };
            let bits: Vec<bool> = (0..word)
                .map(|i| source.get(&(address + i)).copied().unwrap_or(false))
                .collect();
            let mut packed = vec![0u8; bits.len().div_ceil(8)];
            for (i, bit) in bits.iter().enumerate() {
                if *bit {
                    packed[i / 8] |= 1 << (i % 8);
                }
            }
            let mut reply = vec![slave, fc, packed.len() as u8];
            reply.extend_from_slice(&packed);
            reply
        }
        0x03 | 0x04 => {
            let source = if fc == 0x03 {
                &bank.holding_registers
            } else {
                &bank.input_registers
            };
            let mut reply = vec![slave, fc, (word * 2) as u8];
            for i in 0..word {
                let value = source.get(&(address + i)).copied().unwrap_or(0);
                reply.extend_from_slice(&value.to_be_bytes());
            }
            reply
        }
        0x05 => {
            bank.coils.insert(address, word == 0xFF00);
            request.to_vec()
        }
        0x06 => {
            bank.holding_registers.insert(address, word);
            request.to_vec()
        }
        0x0F => {
            let data = &request[7..];
            for i in 0..word {
                let byte = data[(i / 8) as usize];
                bank.coils.insert(address + i, byte & (1 << (i % 8)) != 0);
            }
            request[..6].to_vec()
        }
        0x10 => {
            let data = &request[7..];
            for i in 0..word as usize {
                let value = u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]);
                bank.holding_registers.insert(address + i as u16, value);
            }
            request[..6].to_vec()
        }
        other => vec![slave, other | 0x80, 0x01],
    }
}

pub fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&CRC.checksum(body).to_le_bytes());
    frame
}

/// Configuration used across the integration tests: no settle delay, a few
/// entries per kind.
pub fn test_config(entries_per_kind: u16) -> MasterConfig {
    MasterConfig::new()
        .with_entries_per_kind(entries_per_kind)
        .with_settle_delay(Duration::ZERO)
        .with_response_timeout(Duration::from_millis(50))
}

/// A connected master talking to a fresh mock slave.
pub async fn connected(config: MasterConfig, bank: Bank) -> (Arc<TestMaster>, MockSlave) {
    let (ours, theirs) = tokio::io::duplex(1024);
    let slave = MockSlave::spawn(theirs, bank);
    let master = Arc::new(RtuMaster::new(config).unwrap());
    master
        .connect(StreamChannel::new("mock", ours), &SerialConfig::default())
        .await
        .unwrap();
    (master, slave)
}

/// Duplex stream whose writes can be made to fail with `BrokenPipe` while
/// reads keep going to the pipe.
pub struct LineStream {
    inner: DuplexStream,
    fail_writes: bool,
}

impl AsyncRead for LineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for LineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.fail_writes {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "line unplugged")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Channel over a [`LineStream`] that counts how often it was closed.
pub struct LineChannel {
    stream: Option<LineStream>,
    closes: Arc<AtomicUsize>,
}

impl LineChannel {
    pub fn new(inner: DuplexStream, fail_writes: bool) -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let channel = Self {
            stream: Some(LineStream { inner, fail_writes }),
            closes: closes.clone(),
        };
        (channel, closes)
    }
}

impl SerialChannel for LineChannel {
    type Stream = LineStream;

    fn open(&mut self, _config: &SerialConfig) -> impl Future<Output = io::Result<LineStream>> + Send {
        let stream = self.stream.take();
        async move { stream.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "line already open")) }
    }

    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send {
        self.closes.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }

    fn name(&self) -> String {
        "line".to_string()
    }
}
