//! Device state machine. The host calls `tick` once per control-loop iteration; the device
//! decides which tasks are due for its state and runs the protocol handlers to completion.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::cipher::{CipherError, EcdhKeypair, SessionKeys};
use crate::config::Config;
use crate::protocol::{self, Inbound, ProtocolError};
use crate::scheduler::{Scheduler, TaskId};
use crate::session::{SessionRecord, SessionStore, Slot};
use crate::transport::{
    Datagram, DatagramIo, DatagramSocket, StreamIo, StreamSocket, TransferFlags, TransportError,
};

/// Pending datagrams examined per listen tick before giving up until the next one.
const MAX_DATAGRAMS_PER_LISTEN: usize = 16;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Hardware address and its `AA:BB:CC:DD:EE:FF` form, the protocol-level device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
    id: String,
}

impl DeviceIdentity {
    pub fn new(mac: [u8; 6]) -> Self {
        let id = mac
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self { mac, id }
    }

    /// Parse `AA:BB:CC:DD:EE:FF` (either case).
    pub fn parse(s: &str) -> Option<Self> {
        let mut mac = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in mac.iter_mut() {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(mac))
    }

    pub fn mac(&self) -> &[u8; 6] {
        &self.mac
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Exactly one state is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Transient; re-derived from the stored session on the next tick.
    Idle,
    /// No session: broadcasting heartbeats and waiting for a pairing ack.
    Discovering,
    /// Session established; streaming frames and listening for server commands.
    Linked,
    /// Session stored but not connected; one relink attempt per repair tick.
    Repairing,
}

/// Image capture collaborator.
pub trait FrameSource {
    /// Bring the sensor up. Failure at boot is fatal.
    fn init(&mut self) -> io::Result<()>;
    /// Overwrite `frame` with the next image. False when no frame is ready.
    fn capture(&mut self, frame: &mut Vec<u8>) -> bool;
}

/// Network interface collaborator.
pub trait NetworkInterface {
    fn broadcast_address(&self) -> Ipv4Addr;
}

/// Manual reset input, sampled at the top of every tick.
pub trait ResetTrigger {
    fn is_pressed(&mut self) -> bool;
}

/// Injected hardware handles, owned by the device.
pub struct Peripherals {
    pub camera: Box<dyn FrameSource>,
    pub network: Box<dyn NetworkInterface>,
    pub reset: Box<dyn ResetTrigger>,
}

#[derive(Debug, Default)]
struct FrameStats {
    window_start: Option<Instant>,
    frames: u32,
    sent_total: u64,
}

/// The camera control plane.
pub struct Device<T: StreamIo, U: DatagramIo, S: Slot> {
    identity: DeviceIdentity,
    config: Config,
    state: DeviceState,
    session: Option<SessionRecord>,
    store: SessionStore<S>,
    stream: StreamSocket<T>,
    discovery: DatagramSocket<U>,
    scheduler: Scheduler,
    peripherals: Peripherals,
    frame: Vec<u8>,
    stats: FrameStats,
}

impl<T: StreamIo, U: DatagramIo, S: Slot> Device<T, U, S> {
    /// Initialise the camera and load any stored session. Starts `Repairing` with a valid
    /// stored session, otherwise `Discovering`.
    pub fn boot(
        identity: DeviceIdentity,
        config: Config,
        stream_io: T,
        datagram_io: U,
        slot: S,
        mut peripherals: Peripherals,
    ) -> Result<Self, BootError> {
        info!(device = %identity, "starting camera setup");
        peripherals.camera.init().map_err(BootError::Camera)?;

        let mut scheduler = Scheduler::new();
        scheduler.register(TaskId::Heartbeat, config.heartbeat_interval());
        scheduler.register(TaskId::PairListen, config.pair_listen_interval());
        scheduler.register(TaskId::Repair, config.repair_interval());
        scheduler.register(TaskId::CommandListen, config.command_listen_interval());
        scheduler.register(TaskId::Stream, Duration::ZERO);

        let stream = StreamSocket::new(stream_io, config.transport.clone());
        let mut device = Self {
            identity,
            config,
            state: DeviceState::Idle,
            session: None,
            store: SessionStore::new(slot),
            stream,
            discovery: DatagramSocket::new(datagram_io),
            scheduler,
            peripherals,
            frame: Vec::new(),
            stats: FrameStats::default(),
        };
        let initial = if device.load_session() {
            DeviceState::Repairing
        } else {
            DeviceState::Discovering
        };
        device.transition(initial);
        Ok(device)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        self.session.as_ref()
    }

    pub fn store(&self) -> &SessionStore<S> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SessionStore<S> {
        &mut self.store
    }

    pub fn stream_io(&self) -> &T {
        self.stream.io()
    }

    pub fn stream_io_mut(&mut self) -> &mut T {
        self.stream.io_mut()
    }

    pub fn datagram_io(&self) -> &U {
        self.discovery.io()
    }

    pub fn datagram_io_mut(&mut self) -> &mut U {
        self.discovery.io_mut()
    }

    /// Capacity of the frame buffer; zero after a purge.
    pub fn frame_capacity(&self) -> usize {
        self.frame.capacity()
    }

    /// Frames sent since boot.
    pub fn frames_sent(&self) -> u64 {
        self.stats.sent_total
    }

    /// One control-loop iteration.
    pub fn tick(&mut self, now: Instant) {
        if self.peripherals.reset.is_pressed() {
            info!("manual reset, clearing stored session");
            self.purge();
            self.transition(DeviceState::Discovering);
        } else if !self.stream.is_connected() || self.state == DeviceState::Idle {
            self.reevaluate();
        }

        match self.state {
            DeviceState::Discovering => {
                if self.scheduler.due(TaskId::Heartbeat, now) {
                    self.send_heartbeat();
                }
                if self.scheduler.due(TaskId::PairListen, now) {
                    self.listen_for_pair_ack();
                }
            }
            DeviceState::Repairing => {
                if self.scheduler.due(TaskId::Repair, now) {
                    self.repair();
                }
            }
            DeviceState::Linked => {
                if self.scheduler.force(TaskId::Stream, now) {
                    self.stream_frame(now);
                }
                if self.scheduler.due(TaskId::CommandListen, now) {
                    self.listen_for_commands();
                }
            }
            DeviceState::Idle => {}
        }
    }

    fn transition(&mut self, next: DeviceState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "state change");
            self.state = next;
        }
    }

    /// Lost connection or idle: repair if a session is stored, else discover.
    fn reevaluate(&mut self) {
        if !self.store.has_valid() {
            if self.session.take().is_some() {
                self.stream.clear_session_keys();
            }
            self.transition(DeviceState::Discovering);
            return;
        }
        if self.session.is_none() && !self.load_session() {
            self.transition(DeviceState::Discovering);
            return;
        }
        self.transition(DeviceState::Repairing);
    }

    /// Load the stored session into memory and install its keys. False when none is usable.
    fn load_session(&mut self) -> bool {
        if !self.store.has_valid() {
            return false;
        }
        match self.store.load() {
            Ok(Some(record)) => {
                info!(peer = %record.peer(), "loaded stored session");
                debug!(secret = %hex::encode(record.shared_secret()), "stored shared secret");
                self.stream.set_session_keys(record.keys());
                self.session = Some(record);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to read stored session");
                false
            }
        }
    }

    /// Erase the session everywhere: connection, keys, frame buffer and store.
    fn purge(&mut self) {
        self.stream.reset();
        self.stream.clear_session_keys();
        self.session = None;
        self.frame = Vec::new();
        if let Err(e) = self.store.erase() {
            error!(error = %e, "failed to erase stored session");
        }
    }

    fn send_heartbeat(&mut self) {
        let broadcast = self.peripherals.network.broadcast_address();
        let msg = protocol::pair_request(self.identity.as_str());
        if let Err(e) = self.discovery.send(
            broadcast,
            self.config.discovery_port,
            &msg,
            TransferFlags::PLAIN,
        ) {
            warn!(error = %e, %broadcast, "failed to send heartbeat");
        }
    }

    fn next_datagram(&mut self) -> Option<Datagram> {
        match self.discovery.recv(self.config.transport.datagram_buffer) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "discovery receive failed");
                None
            }
        }
    }

    fn listen_for_pair_ack(&mut self) {
        for _ in 0..MAX_DATAGRAMS_PER_LISTEN {
            let Some(datagram) = self.next_datagram() else {
                return;
            };
            let IpAddr::V4(from) = datagram.from.ip() else {
                debug!(from = %datagram.from, "ignoring non-IPv4 sender");
                continue;
            };
            match protocol::parse_discovery(&datagram.payload) {
                Ok(Inbound::PairAck { stream_port, code }) => {
                    self.on_pair_ack(from, stream_port, &code);
                    return;
                }
                Ok(other) => debug!(?other, "ignoring message while discovering"),
                Err(ProtocolError::UnexpectedTag(tag)) => {
                    debug!(%tag, "ignoring datagram while discovering")
                }
                Err(e) => warn!(error = %e, from = %datagram.from, "invalid pairing ack, ignoring"),
            }
        }
    }

    fn on_pair_ack(&mut self, from: Ipv4Addr, stream_port: u16, code: &[u8]) {
        if code != self.config.pairing_code.as_bytes() {
            warn!(code = %String::from_utf8_lossy(code), %from, "invalid pairing code");
            let notice = protocol::bad_code(self.identity.as_str());
            if let Err(e) = self.discovery.send(
                from,
                self.config.discovery_port,
                &notice,
                TransferFlags::PLAIN,
            ) {
                warn!(error = %e, "failed to send bad-code notice");
            }
            return;
        }

        info!(server = %from, stream_port, "valid pairing ack, linking");
        let peer = SocketAddrV4::new(from, stream_port);
        match self.link(peer) {
            Ok(record) => {
                if let Err(e) = self.store.save(&record) {
                    error!(error = %e, "failed to persist session");
                }
                self.session = Some(record);
                info!(server = %peer, "linked to server");
                self.transition(DeviceState::Linked);
            }
            Err(e) => {
                error!(error = %e, "failed to link with server");
                self.purge();
                self.transition(DeviceState::Discovering);
            }
        }
    }

    /// First-link handshake: link request, ECDH hello exchange, encrypted confirmation both ways.
    fn link(&mut self, peer: SocketAddrV4) -> Result<SessionRecord, HandshakeError> {
        self.stream.connect(peer)?;
        self.stream
            .send(&protocol::link_request(self.identity.as_str()), TransferFlags::SIZED)?;
        debug!("sent link request");

        let raw = self.stream.recv(0, TransferFlags::SIZED)?;
        let Inbound::ServerHello { public_key } = protocol::parse_server_hello(&raw)? else {
            return Err(HandshakeError::UnexpectedMessage);
        };
        debug!(key = %hex::encode(&public_key), "received server public key");

        let keypair = EcdhKeypair::generate();
        let secret = Zeroizing::new(keypair.shared_secret(&public_key)?);
        self.stream
            .send(&protocol::hello(keypair.public_key()), TransferFlags::SIZED)?;
        debug!(key = %hex::encode(keypair.public_key()), "sent own public key");

        let keys = SessionKeys::from_shared_secret(&secret);
        let confirm = keys.encrypt(protocol::CONFIRM)?;
        self.stream.send(&confirm, TransferFlags::SIZED)?;
        debug!("sent encrypted confirmation, waiting for server confirmation");

        let reply = self.stream.recv(0, TransferFlags::SIZED)?;
        let plain = keys.decrypt(&reply)?;
        if plain != protocol::CONFIRM {
            return Err(HandshakeError::ConfirmMismatch);
        }

        let record = SessionRecord::new(peer, *secret, *keys.iv());
        self.stream.set_session_keys(keys);
        info!("key exchange successful");
        Ok(record)
    }

    fn repair(&mut self) {
        let Some((peer, keys)) = self.session.as_ref().map(|r| (r.peer(), r.keys())) else {
            self.transition(DeviceState::Discovering);
            return;
        };
        info!(server = %peer, "reconnecting to server");
        match self.relink(peer, &keys) {
            Ok(()) => {
                self.stream.set_session_keys(keys);
                info!("re-paired successfully");
                self.transition(DeviceState::Linked);
            }
            Err(e) => {
                warn!(error = %e, "repair failed, retrying");
                self.stream.reset();
            }
        }
    }

    /// Relink with the stored key material; no new key exchange.
    fn relink(&mut self, peer: SocketAddrV4, keys: &SessionKeys) -> Result<(), HandshakeError> {
        self.stream.connect(peer)?;
        self.stream
            .send(&protocol::relink_request(self.identity.as_str()), TransferFlags::SIZED)?;
        debug!("sent relink request");

        let raw = self.stream.recv(0, TransferFlags::SIZED)?;
        let Inbound::Repair { challenge } = protocol::parse_repair(&raw)? else {
            return Err(HandshakeError::UnexpectedMessage);
        };
        let plain = keys.decrypt(&challenge)?;
        if plain != protocol::CONFIRM_PAIR {
            return Err(HandshakeError::ConfirmMismatch);
        }

        let ack = keys.encrypt(protocol::CONFIRM_PAIR_ACK)?;
        self.stream
            .send(&protocol::repair_ack(&ack), TransferFlags::SIZED)?;
        Ok(())
    }

    fn stream_frame(&mut self, now: Instant) {
        if self.peripherals.camera.capture(&mut self.frame) {
            let msg = protocol::frame_data(&self.frame);
            match self.stream.send(&msg, TransferFlags::SIZED_ENCRYPTED) {
                Ok(()) => {
                    self.stats.frames += 1;
                    self.stats.sent_total += 1;
                }
                Err(e) => error!(error = %e, "failed to send frame"),
            }
        }

        let start = *self.stats.window_start.get_or_insert(now);
        if now.saturating_duration_since(start) >= FPS_WINDOW {
            info!(fps = self.stats.frames, "streaming");
            self.stats.frames = 0;
            self.stats.window_start = Some(now);
        }
    }

    fn listen_for_commands(&mut self) {
        let Some(peer) = self.session.as_ref().map(|r| *r.peer().ip()) else {
            return;
        };
        for _ in 0..MAX_DATAGRAMS_PER_LISTEN {
            let Some(datagram) = self.next_datagram() else {
                return;
            };
            let Ok(Inbound::Unpair { device_id }) = protocol::parse_discovery(&datagram.payload)
            else {
                continue;
            };
            if datagram.from.ip() != IpAddr::V4(peer) {
                warn!(from = %datagram.from, "unpair from unknown sender, ignoring");
                continue;
            }
            if let Some(target) = device_id {
                if target != self.identity.as_str().as_bytes() {
                    debug!(target = %String::from_utf8_lossy(&target), "unpair for another device");
                    continue;
                }
            }
            info!("received unpair request, purging server");
            self.purge();
            self.transition(DeviceState::Discovering);
            return;
        }
    }
}

/// Fatal boot failure; the host restarts the device.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("failed to initialize camera: {0}")]
    Camera(io::Error),
}

/// Why a link or relink attempt was abandoned. Always recovered by retrying later.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),
    #[error("unexpected message")]
    UnexpectedMessage,
    #[error("confirmation mismatch")]
    ConfirmMismatch,
}
