//! L2 frame tunnel over a raw serial line.
//!
//! Complete L2 frames are carried with the `bm-wire` framing (byte
//! stuffing + length prefix + CRC-32C + `0x00` terminator), so the receive
//! side can reassemble frames across arbitrary read boundaries and resume
//! after corruption. No retransmission and no app-layer translation.

use crate::DeviceError;
use async_trait::async_trait;
use bm_wire::{frame, MAX_L2_FRAME, MAX_WIRE_FRAME};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, error, warn};

/// Bit rates the transport accepts.
pub const SUPPORTED_BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 230400];

/// Bytes pulled from the descriptor per read.
const READ_CHUNK: usize = 256;

/// Serial line parameters.
#[derive(Debug, Clone)]
pub struct UartConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub path: String,
    /// Bit rate; must be one of [`SUPPORTED_BAUD_RATES`].
    pub baud: u32,
}

/// Consumer of decoded L2 frames from the serial link.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// A complete, checksum-verified L2 frame arrived.
    async fn deliver(&self, frame: &[u8]);
}

/// Serial transport: mutex-serialized sends plus a background receive
/// worker that reassembles and validates frames.
pub struct UartTransport {
    tx: tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    running: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UartTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UartTransport").finish_non_exhaustive()
    }
}

impl UartTransport {
    /// Open and configure the serial device (raw, 8N1, no flow control)
    /// and start the receive worker.
    pub fn open(cfg: &UartConfig, sink: Arc<dyn FrameSink>) -> Result<Self, DeviceError> {
        if !SUPPORTED_BAUD_RATES.contains(&cfg.baud) {
            return Err(DeviceError::UnsupportedBaud(cfg.baud));
        }

        let port = tokio_serial::new(&cfg.path, cfg.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|err| DeviceError::Serial(err.to_string()))?;

        let (reader, writer) = tokio::io::split(port);
        Ok(Self::from_stream(reader, writer, sink))
    }

    /// Run the transport over an arbitrary byte stream.
    pub(crate) fn from_stream<R, W>(reader: R, writer: W, sink: Arc<dyn FrameSink>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (running_tx, running_rx) = watch::channel(true);
        let worker = tokio::spawn(recv_loop(reader, running_rx, sink));
        Self {
            tx: tokio::sync::Mutex::new(Box::new(writer)),
            running: Mutex::new(Some(running_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Encode and write one L2 frame.
    ///
    /// Concurrent senders are serialized so frames never interleave on the
    /// wire.
    pub async fn send(&self, l2: &[u8]) -> Result<(), DeviceError> {
        let mut wire = [0u8; MAX_WIRE_FRAME];
        let len = frame::encode(&mut wire, l2)?;

        let mut tx = self.tx.lock().await;
        tx.write_all(&wire[..len]).await?;
        tx.flush().await?;
        Ok(())
    }

    /// Stop the receive worker and wait for it to exit.
    pub async fn shutdown(&self) {
        if let Some(running) = self.running.lock().unwrap().take() {
            let _ = running.send(false);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn recv_loop<R>(mut reader: R, mut running: watch::Receiver<bool>, sink: Arc<dyn FrameSink>)
where
    R: AsyncRead + Unpin,
{
    let mut accum = vec![0u8; MAX_WIRE_FRAME];
    let mut accum_len = 0usize;
    // Set while skipping to the next terminator after an overlong frame.
    let mut overrun = false;

    let mut chunk = [0u8; READ_CHUNK];
    let mut l2 = [0u8; MAX_L2_FRAME];

    loop {
        tokio::select! {
            biased;
            changed = running.changed() => {
                if changed.is_err() || !*running.borrow() {
                    break;
                }
            }
            result = reader.read(&mut chunk) => {
                let len = match result {
                    Ok(0) => continue,
                    Ok(len) => len,
                    Err(err) if err.kind() == ErrorKind::Interrupted
                        || err.kind() == ErrorKind::WouldBlock => continue,
                    Err(err) => {
                        error!("uart: read failed: {err}");
                        break;
                    }
                };

                for &byte in &chunk[..len] {
                    if byte == 0x00 {
                        if overrun {
                            overrun = false;
                        } else if accum_len > 0 {
                            match frame::decode(&mut l2, &accum[..accum_len]) {
                                Ok(decoded) => sink.deliver(&l2[..decoded]).await,
                                Err(err) => debug!("uart: dropping frame: {err}"),
                            }
                        }
                        accum_len = 0;
                    } else if overrun {
                        // Keep discarding until the next terminator.
                    } else if accum_len < accum.len() {
                        accum[accum_len] = byte;
                        accum_len += 1;
                    } else {
                        warn!("uart: reassembly overflow, resynchronizing");
                        accum_len = 0;
                        overrun = true;
                    }
                }
            }
        }
    }
}
