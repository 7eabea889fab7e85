//! Scripted peers and peripherals for driving a `Device` without sockets or hardware.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::rc::Rc;

use hsec_core::protocol;
use hsec_core::wire::{self, FrameDecodeError};
use hsec_core::{
    Config, DatagramIo, DeviceIdentity, EcdhKeypair, FrameSource, MemorySlot, NetworkInterface,
    Peripherals, ResetTrigger, SessionKeys, SessionRecord, SessionStore, StreamIo,
};

pub const MAC: [u8; 6] = [0x12, 0x34, 0x56, 0xF2, 0x1C, 0x84];
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const STREAM_PORT: u16 = 9000;
pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 255);

pub fn identity() -> DeviceIdentity {
    DeviceIdentity::new(MAC)
}

/// Fast-failing transport so scripted gaps do not stall the tests.
pub fn config() -> Config {
    let mut cfg = Config::default();
    cfg.transport.max_empty_polls = 3;
    cfg.transport.poll_interval_ms = 0;
    cfg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitRequest,
    AwaitClientHello,
    AwaitConfirm,
    AwaitRepairAck,
    Streaming,
}

/// Ways the scripted server can misbehave during a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// Server hello tagged `exch/rsa/aes`.
    HelloTags,
    /// Server hello carrying a point that is not on the curve.
    InvalidPublicKey,
    /// Confirmation encrypts something other than `confirm`.
    WrongConfirm,
    /// Confirmation that is not a whole number of cipher blocks.
    UndecryptableConfirm,
    /// Relink answered with a tag other than `repair`.
    RepairTag,
}

/// Server side of the stream connection. Frames written by the device are parsed as they
/// arrive and answered the way a pairing server would.
pub struct ServerStream {
    connected: bool,
    phase: Phase,
    server_key: EcdhKeypair,
    keys: Option<SessionKeys>,
    fault: Fault,
    pending: Vec<u8>,
    outbox: VecDeque<u8>,
    /// Every complete frame the device sent, in order.
    pub received: Vec<Vec<u8>>,
    /// Decrypted frame-data payloads.
    pub frames: Vec<Vec<u8>>,
    pub connects: Vec<SocketAddrV4>,
    pub shared_secret: Option<[u8; 32]>,
    pub repair_acks: usize,
}

impl ServerStream {
    pub fn new() -> Self {
        Self {
            connected: false,
            phase: Phase::AwaitRequest,
            server_key: EcdhKeypair::generate(),
            keys: None,
            fault: Fault::None,
            pending: Vec::new(),
            outbox: VecDeque::new(),
            received: Vec::new(),
            frames: Vec::new(),
            connects: Vec::new(),
            shared_secret: None,
            repair_acks: 0,
        }
    }

    /// A server that already shares `secret` with the device (for relink).
    pub fn with_secret(secret: [u8; 32]) -> Self {
        let mut server = Self::new();
        server.keys = Some(SessionKeys::from_shared_secret(&secret));
        server.shared_secret = Some(secret);
        server
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&mut self) {
        self.close();
    }

    fn reply(&mut self, payload: &[u8]) {
        let framed = wire::encode_envelope(payload).unwrap();
        self.outbox.extend(framed);
    }

    fn handle(&mut self, frame: Vec<u8>) {
        self.received.push(frame.clone());
        let fields = wire::decode_fields(&frame);
        match self.phase {
            Phase::AwaitRequest if fields[0] == protocol::LINK_REQUEST => {
                let hello = match self.fault {
                    Fault::HelloTags => wire::encode_fields(&[
                        &b"exch"[..],
                        &b"rsa"[..],
                        &b"aes"[..],
                        &self.server_key.public_key()[..],
                    ]),
                    Fault::InvalidPublicKey => protocol::hello(&[0x01; 64]),
                    _ => protocol::hello(self.server_key.public_key()),
                };
                self.reply(&hello);
                self.phase = Phase::AwaitClientHello;
            }
            Phase::AwaitRequest if fields[0] == protocol::RELINK_REQUEST => {
                let keys = self.keys.as_ref().unwrap();
                let challenge = keys.encrypt(protocol::CONFIRM_PAIR).unwrap();
                let msg = match self.fault {
                    Fault::RepairTag => wire::encode_fields(&[&b"repaired"[..], &challenge[..]]),
                    _ => protocol::repair(&challenge),
                };
                self.reply(&msg);
                self.phase = Phase::AwaitRepairAck;
            }
            Phase::AwaitClientHello => {
                assert_eq!(&fields[..3], &[b"exch".to_vec(), b"ecdh".to_vec(), b"aes".to_vec()]);
                let device_key = wire::join_fields(&fields, 3);
                let secret = self.server_key.shared_secret(&device_key).unwrap();
                self.keys = Some(SessionKeys::from_shared_secret(&secret));
                self.shared_secret = Some(secret);
                self.phase = Phase::AwaitConfirm;
            }
            Phase::AwaitConfirm => {
                let keys = self.keys.as_ref().unwrap();
                assert_eq!(keys.decrypt(&frame).unwrap(), protocol::CONFIRM);
                let confirm = match self.fault {
                    Fault::WrongConfirm => keys.encrypt(b"denied").unwrap(),
                    Fault::UndecryptableConfirm => vec![0xA5; 15],
                    _ => keys.encrypt(protocol::CONFIRM).unwrap(),
                };
                self.reply(&confirm);
                self.phase = Phase::Streaming;
            }
            Phase::AwaitRepairAck => {
                assert_eq!(fields[0], protocol::REPAIR_ACK);
                let keys = self.keys.as_ref().unwrap();
                let ack = keys.decrypt(&wire::join_fields(&fields, 1)).unwrap();
                assert_eq!(ack, protocol::CONFIRM_PAIR_ACK);
                self.repair_acks += 1;
                self.phase = Phase::Streaming;
            }
            Phase::Streaming => {
                let keys = self.keys.as_ref().unwrap();
                let plain = keys.decrypt(&frame).unwrap();
                let fields = wire::decode_fields(&plain);
                assert_eq!(fields[0], protocol::FRAME_DATA);
                self.frames.push(wire::join_fields(&fields, 1));
            }
            phase => panic!("unexpected frame in {:?}", phase),
        }
    }
}

impl StreamIo for ServerStream {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<()> {
        self.connects.push(addr);
        self.connected = true;
        self.phase = Phase::AwaitRequest;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.connected {
            return Err(io::Error::from(ErrorKind::NotConnected));
        }
        self.pending.extend_from_slice(buf);
        loop {
            match wire::decode_envelope(&self.pending, usize::MAX) {
                Ok((payload, used)) => {
                    let frame = payload.to_vec();
                    self.pending.drain(..used);
                    self.handle(frame);
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => panic!("bad frame from device: {e}"),
            }
        }
        Ok(buf.len())
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbox.is_empty() {
            return Err(io::Error::from(ErrorKind::WouldBlock));
        }
        let n = buf.len().min(self.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.connected = false;
        self.pending.clear();
        self.outbox.clear();
    }
}

/// Discovery socket: records sends, replays queued inbound datagrams.
#[derive(Default)]
pub struct MockDatagram {
    pub sent: Vec<(Vec<u8>, SocketAddr)>,
    pub inbound: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl MockDatagram {
    pub fn push(&mut self, payload: Vec<u8>, from: SocketAddr) {
        self.inbound.push_back((payload, from));
    }

    pub fn sent_with_tag(&self, tag: &[u8]) -> Vec<&(Vec<u8>, SocketAddr)> {
        self.sent
            .iter()
            .filter(|(p, _)| wire::decode_fields(p).first().map(|f| f.as_slice()) == Some(tag))
            .collect()
    }
}

impl DatagramIo for MockDatagram {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.push((buf.to_vec(), target));
        Ok(buf.len())
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some((payload, from)) = self.inbound.pop_front() else {
            return Ok(None);
        };
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(Some((n, from)))
    }
}

pub struct MockCamera {
    pub frame: Vec<u8>,
    pub fail_init: bool,
}

impl FrameSource for MockCamera {
    fn init(&mut self) -> io::Result<()> {
        if self.fail_init {
            return Err(io::Error::new(ErrorKind::Other, "no sensor"));
        }
        Ok(())
    }

    fn capture(&mut self, frame: &mut Vec<u8>) -> bool {
        frame.clear();
        frame.extend_from_slice(&self.frame);
        true
    }
}

pub struct FixedNetwork(pub Ipv4Addr);

impl NetworkInterface for FixedNetwork {
    fn broadcast_address(&self) -> Ipv4Addr {
        self.0
    }
}

/// Momentary reset button shared with the test body.
#[derive(Clone, Default)]
pub struct ResetButton(Rc<Cell<bool>>);

impl ResetButton {
    pub fn press(&self) {
        self.0.set(true);
    }
}

impl ResetTrigger for ResetButton {
    fn is_pressed(&mut self) -> bool {
        self.0.replace(false)
    }
}

/// A JPEG-ish frame that contains the field separator.
pub fn sample_frame() -> Vec<u8> {
    vec![0xFF, 0xD8, 0x00, 0x10, 0x00, 0x4A, 0x46, 0xFF, 0xD9]
}

pub fn peripherals(reset: ResetButton) -> Peripherals {
    Peripherals {
        camera: Box::new(MockCamera {
            frame: sample_frame(),
            fail_init: false,
        }),
        network: Box::new(FixedNetwork(BROADCAST)),
        reset: Box::new(reset),
    }
}

pub fn server_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(SERVER_IP, port))
}

/// A slot already holding a session with `SERVER_IP:STREAM_PORT`.
pub fn stored_slot(secret: [u8; 32]) -> MemorySlot {
    let keys = SessionKeys::from_shared_secret(&secret);
    let record = SessionRecord::new(SocketAddrV4::new(SERVER_IP, STREAM_PORT), secret, *keys.iv());
    let mut store = SessionStore::new(MemorySlot::new());
    store.save(&record).unwrap();
    store.slot().clone()
}
