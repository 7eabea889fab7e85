//! HSEC camera control plane.
//! Host-driven: the host supplies non-blocking sockets, a storage slot and peripherals, then
//! calls `Device::tick` from its control loop.

pub mod cipher;
pub mod config;
pub mod device;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod wire;

pub use cipher::{CipherError, EcdhKeypair, SessionKeys};
pub use config::{Config, TransportConfig};
pub use device::{
    BootError, Device, DeviceIdentity, DeviceState, FrameSource, HandshakeError, NetworkInterface,
    Peripherals, ResetTrigger,
};
pub use protocol::{Inbound, ProtocolError};
pub use scheduler::{Scheduler, TaskId};
pub use session::{MemorySlot, SessionRecord, SessionStore, Slot, StoreError};
pub use transport::{
    Datagram, DatagramIo, DatagramSocket, StreamIo, StreamSocket, TransferFlags, TransportError,
};
pub use wire::{decode_envelope, encode_envelope, FrameDecodeError, FrameEncodeError};
