use crate::coverage::CoverageBlob;
use crate::failure::RaisedError;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Upper bound on a single frame payload. Checked before allocating.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Errors raised by the control channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The local side already closed this connection.
    #[error("Connection is closed")]
    Closed,
    /// The peer closed the socket cleanly between frames.
    #[error("Peer disconnected")]
    Disconnected,
    /// The deadline passed before a full frame arrived.
    #[error("Timed out waiting for peer")]
    Timeout,
    #[error("Frame of {0} bytes exceeds the 64 MiB limit")]
    FrameTooLarge(usize),
    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Channel encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[error("Channel decoding error: {0}")]
    Decode(#[from] DecodeError),
    /// The payload decoded but did not use every byte of the frame.
    #[error("Frame has {} trailing bytes after the message", .len - .consumed)]
    TrailingBytes { consumed: usize, len: usize },
}

/// Supervisor to worker messages.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Run the target once on the file at this path.
    Input(PathBuf),
    /// No further input; the worker should exit.
    Shutdown,
}

/// First message a worker sends after dialing back.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct WorkerHello {
    pub target: String,
    /// `Err` carries the reason the worker could not load the target.
    pub status: Result<(), String>,
}

/// Worker to supervisor result for one input.
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub coverage: CoverageBlob,
    pub failure: Option<RaisedError>,
}

/// Decoding never claims more memory than one frame may carry.
fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<{ MAX_FRAME_LEN }>()
}

/// A framed, bidirectional message channel over one loopback socket.
///
/// Every frame is a big-endian `u32` payload length followed by a bincode
/// payload. `send` flushes before returning so the peer's next read can
/// always make progress.
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self, ChannelError> {
        stream.set_nodelay(true)?;
        let read_half = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(stream),
            closed: AtomicBool::new(false),
        })
    }

    /// Dials the supervisor's listener on the loopback interface.
    pub fn connect(port: u16) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
        Self::new(stream)
    }

    pub fn send<T: Encode>(&mut self, value: &T) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let payload = bincode::encode_to_vec(value, wire_config())?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(payload.len()));
        }
        let len = payload.len() as u32;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Blocks until one full message arrives.
    pub fn receive<T: Decode<()>>(&mut self) -> Result<T, ChannelError> {
        self.receive_until(None)
    }

    /// Like [`Connection::receive`], but gives up with
    /// [`ChannelError::Timeout`] once `deadline` passes.
    pub fn receive_until<T: Decode<()>>(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<T, ChannelError> {
        self.ensure_open()?;
        let mut header = [0u8; HEADER_LEN];
        self.read_full(&mut header, deadline, true)?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.read_full(&mut payload, deadline, false)?;
        let (value, consumed): (T, usize) = bincode::decode_from_slice(&payload, wire_config())?;
        if consumed != payload.len() {
            return Err(ChannelError::TrailingBytes {
                consumed,
                len: payload.len(),
            });
        }
        Ok(value)
    }

    fn read_full(
        &mut self,
        buf: &mut [u8],
        deadline: Option<Instant>,
        at_frame_boundary: bool,
    ) -> Result<(), ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ChannelError::Timeout);
                    }
                    self.reader.get_ref().set_read_timeout(Some(remaining))?;
                }
                None => self.reader.get_ref().set_read_timeout(None)?,
            }
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 && at_frame_boundary => {
                    return Err(ChannelError::Disconnected);
                }
                Ok(0) => {
                    return Err(ChannelError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "peer closed the connection mid-frame",
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if deadline.is_none() {
                        return Err(ChannelError::Io(e));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.is_closed() {
                        return Err(ChannelError::Closed);
                    }
                    return Err(ChannelError::Io(e));
                }
            }
        }
        Ok(())
    }

    /// Shuts the socket down in both directions. Safe to call repeatedly;
    /// errors during shutdown are ignored.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.writer.get_ref().peer_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}
