//! Transport sockets: a reliable stream (pairing, streaming) and a datagram socket (discovery).
//!
//! Both sit on host-provided non-blocking I/O. Reads poll with a bounded number of consecutive
//! empty polls, sleeping `poll_interval` after each; that bound is the only timeout.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::thread;

use tracing::{debug, warn};

use crate::cipher::{CipherError, SessionKeys};
use crate::config::TransportConfig;
use crate::wire::{self, LEN_SIZE};

/// Non-blocking byte stream. `try_write`/`try_read` return `WouldBlock` (or `Ok(0)` for writes)
/// when no capacity or data is available; `try_read` returning `Ok(0)` means the peer closed.
pub trait StreamIo {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<()>;
    fn is_connected(&self) -> bool;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&mut self);
}

/// Non-blocking datagram endpoint bound to the discovery port.
pub trait DatagramIo {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    /// Next pending datagram, or `None`. Never blocks.
    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
}

/// Per-call capability flags: length-prefix and/or encrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferFlags {
    pub with_size: bool,
    pub encrypt: bool,
}

impl TransferFlags {
    pub const PLAIN: Self = Self {
        with_size: false,
        encrypt: false,
    };
    /// Default for stream messages.
    pub const SIZED: Self = Self {
        with_size: true,
        encrypt: false,
    };
    pub const SIZED_ENCRYPTED: Self = Self {
        with_size: true,
        encrypt: true,
    };
}

/// Framed stream socket. Encrypted transfers use the installed session keys.
pub struct StreamSocket<T: StreamIo> {
    io: T,
    keys: Option<SessionKeys>,
    cfg: TransportConfig,
}

impl<T: StreamIo> StreamSocket<T> {
    pub fn new(io: T, cfg: TransportConfig) -> Self {
        Self {
            io,
            keys: None,
            cfg,
        }
    }

    pub fn io(&self) -> &T {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_connected()
    }

    pub fn set_session_keys(&mut self, keys: SessionKeys) {
        self.keys = Some(keys);
    }

    pub fn clear_session_keys(&mut self) {
        self.keys = None;
    }

    /// Connect unless already connected; an existing connection is never replaced.
    pub fn connect(&mut self, addr: SocketAddrV4) -> Result<(), TransportError> {
        if self.io.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }
        debug!(%addr, "connecting stream");
        self.io.connect(addr).map_err(TransportError::Connect)
    }

    /// Drop the connection, if any.
    pub fn reset(&mut self) {
        self.io.close();
    }

    /// Encrypt (if flagged), then length-prefix (if flagged), then write everything.
    pub fn send(&mut self, payload: &[u8], flags: TransferFlags) -> Result<(), TransportError> {
        let mut data = if flags.encrypt {
            let keys = self.keys.as_ref().ok_or(TransportError::MissingKeys)?;
            keys.encrypt(payload)?
        } else {
            payload.to_vec()
        };
        if flags.with_size {
            data = wire::encode_envelope(&data).map_err(|_| TransportError::FrameTooLarge)?;
        }
        debug!(bytes = data.len(), "sending");
        self.write_all(&data)
    }

    /// Write until done or the connection drops, pausing whenever there is no capacity.
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;
        while written < data.len() {
            if !self.io.is_connected() {
                return Err(TransportError::NotConnected);
            }
            match self.io.try_write(&data[written..]) {
                Ok(0) => self.pause(),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.pause(),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.io.close();
                    return Err(TransportError::Io(e));
                }
            }
        }
        Ok(())
    }

    /// Receive one message. With `with_size` the 4-byte header gives the length and
    /// `buffer_size` is ignored. A plaintext short read returns what arrived; an encrypted
    /// one fails, since a truncated ciphertext cannot be decrypted.
    pub fn recv(&mut self, buffer_size: usize, flags: TransferFlags) -> Result<Vec<u8>, TransportError> {
        if flags.encrypt && self.keys.is_none() {
            return Err(TransportError::MissingKeys);
        }
        let expected = if flags.with_size {
            let header = self.read_up_to(LEN_SIZE)?;
            if header.is_empty() {
                return Err(self.nothing_read());
            }
            if header.len() < LEN_SIZE {
                return Err(TransportError::ShortRead {
                    expected: LEN_SIZE,
                    got: header.len(),
                });
            }
            let len = wire::decode_len(&header).map_err(|_| TransportError::Timeout)?;
            if len > self.cfg.max_frame_len {
                return Err(TransportError::FrameTooLarge);
            }
            debug!(len, "message size from header");
            len
        } else {
            buffer_size
        };

        let raw = self.read_up_to(expected)?;
        if flags.encrypt {
            if flags.with_size && raw.len() != expected {
                warn!(expected, got = raw.len(), "short encrypted read, not decrypting");
                return Err(TransportError::ShortRead {
                    expected,
                    got: raw.len(),
                });
            }
            let keys = self.keys.as_ref().ok_or(TransportError::MissingKeys)?;
            return Ok(keys.decrypt(&raw)?);
        }
        if raw.is_empty() && expected > 0 {
            return Err(self.nothing_read());
        }
        if raw.len() < expected {
            warn!(expected, got = raw.len(), "short read");
        }
        Ok(raw)
    }

    /// Read up to `n` bytes. Stops early after exactly `max_empty_polls` consecutive empty
    /// polls (each followed by one pause), on peer close, or when the connection is gone.
    fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        if !self.io.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut out = vec![0u8; n];
        let mut filled = 0;
        let mut empty_polls = 0u32;
        while filled < n {
            match self.io.try_read(&mut out[filled..]) {
                Ok(0) => {
                    debug!("peer closed stream");
                    self.io.close();
                    break;
                }
                Ok(k) => {
                    filled += k;
                    empty_polls = 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    empty_polls += 1;
                    self.pause();
                    if empty_polls >= self.cfg.max_empty_polls {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.io.close();
                    return Err(TransportError::Io(e));
                }
            }
        }
        out.truncate(filled);
        Ok(out)
    }

    fn nothing_read(&self) -> TransportError {
        if self.io.is_connected() {
            TransportError::Timeout
        } else {
            TransportError::NotConnected
        }
    }

    fn pause(&self) {
        let d = self.cfg.poll_interval();
        if d.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(d);
        }
    }
}

/// A received datagram and its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

/// Unreliable discovery socket. Only `with_size` applies; datagrams are never encrypted.
pub struct DatagramSocket<U: DatagramIo> {
    io: U,
}

impl<U: DatagramIo> DatagramSocket<U> {
    pub fn new(io: U) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &U {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut U {
        &mut self.io
    }

    pub fn send(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        payload: &[u8],
        flags: TransferFlags,
    ) -> Result<(), TransportError> {
        if flags.encrypt {
            return Err(TransportError::Unsupported("encrypted datagrams"));
        }
        let packet = if flags.with_size {
            wire::encode_envelope(payload).map_err(|_| TransportError::FrameTooLarge)?
        } else {
            payload.to_vec()
        };
        self.io
            .send_to(&packet, SocketAddr::V4(SocketAddrV4::new(addr, port)))
            .map(|_| ())
            .map_err(TransportError::Io)
    }

    /// Next pending datagram, or `None`.
    pub fn recv(&mut self, buffer_size: usize) -> Result<Option<Datagram>, TransportError> {
        let mut buf = vec![0u8; buffer_size];
        match self.io.try_recv_from(&mut buf) {
            Ok(Some((n, from))) => {
                buf.truncate(n);
                Ok(Some(Datagram { payload: buf, from }))
            }
            Ok(None) => Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error("i/o error: {0}")]
    Io(io::Error),
    #[error("no data before retry bound")]
    Timeout,
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("frame too large")]
    FrameTooLarge,
    #[error("session keys not set")]
    MissingKeys,
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
