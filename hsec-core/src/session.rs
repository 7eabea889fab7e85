//! Session record and its persisted layout over a raw storage slot.
//!
//! Layout (58 bytes): `[magic u32 BE][ipv4 4][port u16 BE][shared secret 32][iv 16]`.
//! Validity is the magic alone; erase overwrites the whole record with `0xFF`.

use std::net::{Ipv4Addr, SocketAddrV4};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::{SessionKeys, IV_LEN, KEY_LEN};

/// "HSEC".
pub const SESSION_MAGIC: u32 = 0x4853_4543;

/// Size of the persisted record in bytes.
pub const RECORD_LEN: usize = 4 + 4 + 2 + KEY_LEN + IV_LEN;

const ERASED: u8 = 0xFF;

/// Raw non-volatile byte slot. Hosts provide the backing (flash page, file, memory).
pub trait Slot {
    /// Read `buf.len()` bytes from the start of the slot. Missing bytes read as erased.
    fn read(&self, buf: &mut [u8]) -> Result<(), StoreError>;
    /// Write bytes at the start of the slot (buffered until `commit`).
    fn write(&mut self, data: &[u8]) -> Result<(), StoreError>;
    /// Make previous writes durable.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// In-memory slot; starts erased.
#[derive(Debug, Clone)]
pub struct MemorySlot {
    bytes: Vec<u8>,
    commits: usize,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self {
            bytes: vec![ERASED; RECORD_LEN],
            commits: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Raw access for corrupting the slot in tests.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl Default for MemorySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot for MemorySlot {
    fn read(&self, buf: &mut [u8]) -> Result<(), StoreError> {
        buf.fill(ERASED);
        let n = buf.len().min(self.bytes.len());
        buf[..n].copy_from_slice(&self.bytes[..n]);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.bytes.len() < data.len() {
            self.bytes.resize(data.len(), ERASED);
        }
        self.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commits += 1;
        Ok(())
    }
}

/// The one session a device holds: server address plus symmetric key material.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionRecord {
    #[zeroize(skip)]
    peer: SocketAddrV4,
    shared_secret: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionRecord {
    pub fn new(peer: SocketAddrV4, shared_secret: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self {
            peer,
            shared_secret,
            iv,
        }
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn shared_secret(&self) -> &[u8; KEY_LEN] {
        &self.shared_secret
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn keys(&self) -> SessionKeys {
        SessionKeys::new(self.shared_secret, self.iv)
    }

    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..4].copy_from_slice(&SESSION_MAGIC.to_be_bytes());
        out[4..8].copy_from_slice(&self.peer.ip().octets());
        out[8..10].copy_from_slice(&self.peer.port().to_be_bytes());
        out[10..10 + KEY_LEN].copy_from_slice(&self.shared_secret);
        out[10 + KEY_LEN..].copy_from_slice(&self.iv);
        out
    }

    /// `None` unless the magic matches.
    pub fn from_bytes(bytes: &[u8; RECORD_LEN]) -> Option<Self> {
        if !has_magic(bytes) {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
        let port = u16::from_be_bytes([bytes[8], bytes[9]]);
        let mut shared_secret = [0u8; KEY_LEN];
        shared_secret.copy_from_slice(&bytes[10..10 + KEY_LEN]);
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[10 + KEY_LEN..]);
        Some(Self {
            peer: SocketAddrV4::new(ip, port),
            shared_secret,
            iv,
        })
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SESSION_MAGIC
}

/// Magic-guarded session persistence over a `Slot`.
pub struct SessionStore<S: Slot> {
    slot: S,
}

impl<S: Slot> SessionStore<S> {
    pub fn new(slot: S) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &S {
        &self.slot
    }

    pub fn slot_mut(&mut self) -> &mut S {
        &mut self.slot
    }

    /// True when the stored magic matches. A read failure counts as "no session".
    pub fn has_valid(&self) -> bool {
        let mut magic = [0u8; 4];
        self.slot.read(&mut magic).is_ok() && has_magic(&magic)
    }

    /// Load the record; corruption or a missing record is `Ok(None)`.
    pub fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        let mut buf = [0u8; RECORD_LEN];
        self.slot.read(&mut buf)?;
        let record = SessionRecord::from_bytes(&buf);
        buf.zeroize();
        Ok(record)
    }

    pub fn save(&mut self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut buf = record.to_bytes();
        let res = self.slot.write(&buf).and_then(|_| self.slot.commit());
        buf.zeroize();
        res
    }

    pub fn erase(&mut self) -> Result<(), StoreError> {
        self.slot.write(&[ERASED; RECORD_LEN])?;
        self.slot.commit()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionRecord {
        let mut secret = [0u8; KEY_LEN];
        for (i, b) in secret.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&secret[..IV_LEN]);
        SessionRecord::new(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 9000), secret, iv)
    }

    #[test]
    fn fresh_slot_has_no_session() {
        let store = SessionStore::new(MemorySlot::new());
        assert!(!store.has_valid());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let mut store = SessionStore::new(MemorySlot::new());
        let record = sample();
        store.save(&record).unwrap();
        assert!(store.has_valid());
        assert_eq!(store.load().unwrap(), Some(record));
        assert_eq!(store.slot().commits(), 1);
    }

    #[test]
    fn layout_is_fixed() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 58);
        assert_eq!(&bytes[..4], b"HSEC");
        assert_eq!(&bytes[4..8], &[192, 168, 1, 20]);
        assert_eq!(&bytes[8..10], &9000u16.to_be_bytes());
        assert_eq!(bytes[10], 1);
        assert_eq!(bytes[57], 16);
    }

    #[test]
    fn erase_overwrites_everything() {
        let mut store = SessionStore::new(MemorySlot::new());
        store.save(&sample()).unwrap();
        store.erase().unwrap();
        assert!(!store.has_valid());
        assert!(store.slot().bytes().iter().all(|b| *b == 0xFF));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn corrupted_magic_is_no_session() {
        let mut store = SessionStore::new(MemorySlot::new());
        store.save(&sample()).unwrap();
        store.slot_mut().bytes_mut()[2] ^= 0x01;
        assert!(!store.has_valid());
        assert!(store.load().unwrap().is_none());
    }
}
