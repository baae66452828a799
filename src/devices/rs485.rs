//! RS485 line channel.
//!
//! Requests are single newline-terminated lines. The firmware answers with any
//! number of lines followed by a prompt line; the prompt marks the end of the
//! response. A response whose prompt does not arrive within the timeout is a
//! timeout (`Ok(None)`), distinct from a broken connection (`Err`). The
//! timeout covers writing the command as well as reading the reply.
//!
//! # Cancel Safety
//! Reads go through `LinesCodec` framing, which keeps partial lines buffered
//! across a timed-out read. Whatever arrives late is discarded
//! before the next command is written.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{CommandChannel, DeviceError};
use crate::config::{LineParity, SerialConfig};

/// Longest line accepted from the DUT.
const MAX_LINE: usize = 8 * 1024;

/// Something that yields a byte stream to the DUT.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static;

    async fn open(&mut self) -> io::Result<Self::Io>;

    /// Called after the stream has been dropped.
    async fn release(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Serial device node, e.g. `/dev/ttyUSB0`, opened with explicit line settings.
pub struct TtyTransport {
    path: PathBuf,
    baud_rate: u32,
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
}

impl TtyTransport {
    /// 8N1 at `baud_rate`.
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }

    pub fn from_config(config: &SerialConfig) -> Result<Self, DeviceError> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            n => return Err(DeviceError::Connect(format!("unsupported data bits: {}", n))),
        };
        let stop_bits = match config.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            n => return Err(DeviceError::Connect(format!("unsupported stop bits: {}", n))),
        };
        let parity = match config.parity {
            LineParity::None => Parity::None,
            LineParity::Odd => Parity::Odd,
            LineParity::Even => Parity::Even,
        };
        Ok(Self {
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

#[async_trait::async_trait]
impl Transport for TtyTransport {
    type Io = SerialStream;

    async fn open(&mut self) -> io::Result<SerialStream> {
        let port = tokio_serial::new(self.path.to_string_lossy(), self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .flow_control(FlowControl::None)
            .open_native_async()?;
        Ok(port)
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path.display(), self.baud_rate)
    }
}

pub struct Rs485Channel<T: Transport> {
    transport: T,
    prompt: String,
    conn: Option<Framed<T::Io, LinesCodec>>,
}

impl<T: Transport> Rs485Channel<T> {
    pub fn new(transport: T, prompt: impl Into<String>) -> Self {
        Self {
            transport,
            prompt: prompt.into(),
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

fn codec_error(e: LinesCodecError) -> DeviceError {
    match e {
        LinesCodecError::Io(e) => DeviceError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            DeviceError::Protocol(format!("response line longer than {} bytes", MAX_LINE))
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> CommandChannel for Rs485Channel<T> {
    async fn connect(&mut self) -> Result<(), DeviceError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let io = self
            .transport
            .open()
            .await
            .map_err(|e| DeviceError::Connect(format!("{}: {}", self.transport.describe(), e)))?;
        self.conn = Some(Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE)));
        info!(port = %self.transport.describe(), "RS485 channel open");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        drop(conn);
        self.transport.release().await?;
        info!(port = %self.transport.describe(), "RS485 channel closed");
        Ok(())
    }

    async fn send(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<String>>, DeviceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let conn = self.conn.as_mut().ok_or(DeviceError::NotConnected)?;

        // Drop stale lines from an earlier timed-out exchange.
        while let Some(Some(stale)) = conn.next().now_or_never() {
            let stale = stale.map_err(codec_error)?;
            debug!(line = %stale, "discarding stale RX line");
        }

        debug!(%command, "TX");
        match tokio::time::timeout_at(deadline, conn.send(command)).await {
            Ok(sent) => sent.map_err(codec_error)?,
            Err(_) => {
                warn!(%command, "TX timeout");
                return Ok(None);
            }
        }

        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, conn.next()).await {
                Err(_) => {
                    warn!(%command, received = lines.len(), "RX timeout, no prompt");
                    return Ok(None);
                }
                Ok(None) => {
                    return Err(DeviceError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "DUT link closed",
                    )));
                }
                Ok(Some(line)) => {
                    let line = line.map_err(codec_error)?;
                    let trimmed = line.trim();
                    if trimmed == self.prompt {
                        return Ok(Some(lines));
                    }
                    debug!(line = %trimmed, "RX");
                    lines.push(trimmed.to_string());
                }
            }
        }
    }
}
