//! Host sockets and interface lookups behind the core I/O traits.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use hsec_core::{DatagramIo, DeviceIdentity, NetworkInterface, StreamIo};
use tracing::{debug, warn};

/// Non-blocking TCP connection to the pairing server. At most one at a time.
///
/// Once `stop` is raised every read and write fails with `ConnectionAborted`, so a send
/// stuck against a peer that never reads gives up and the control loop can exit.
pub struct TcpStreamIo {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl TcpStreamIo {
    pub fn new(connect_timeout: Duration, stop: Arc<AtomicBool>) -> Self {
        Self {
            stream: None,
            connect_timeout,
            stop,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::ConnectionAborted, "shutting down"));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }
}

impl StreamIo for TcpStreamIo {
    fn connect(&mut self, addr: SocketAddrV4) -> io::Result<()> {
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), self.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        debug!(%addr, "stream connected");
        self.stream = Some(stream);
        Ok(())
    }

    /// Peeks the socket: end of stream or a hard error means the server went away.
    fn is_connected(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        let mut byte = [0u8; 1];
        match stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Discovery socket bound on all interfaces with broadcast enabled.
pub struct UdpDatagramIo {
    socket: UdpSocket,
}

impl UdpDatagramIo {
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl DatagramIo for UdpDatagramIo {
    fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }

    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Broadcast address: configured, else the /24 of the primary local address.
pub struct HostNetwork {
    configured: Option<Ipv4Addr>,
}

impl HostNetwork {
    pub fn new(configured: Option<Ipv4Addr>) -> Self {
        Self { configured }
    }
}

impl NetworkInterface for HostNetwork {
    fn broadcast_address(&self) -> Ipv4Addr {
        if let Some(addr) = self.configured {
            return addr;
        }
        match primary_ipv4() {
            Ok(ip) => subnet_broadcast(ip),
            Err(e) => {
                warn!(error = %e, "no local address, using limited broadcast");
                Ipv4Addr::BROADCAST
            }
        }
    }
}

/// Local address the OS would route external traffic from. Sends nothing.
fn primary_ipv4() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    match socket.local_addr()? {
        SocketAddr::V4(a) if !a.ip().is_unspecified() => Ok(*a.ip()),
        _ => Err(io::Error::from(ErrorKind::AddrNotAvailable)),
    }
}

fn subnet_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// Device identity from the configured MAC, else the first non-loopback interface.
pub fn resolve_identity(mac: Option<&str>) -> anyhow::Result<DeviceIdentity> {
    if let Some(s) = mac {
        return DeviceIdentity::parse(s).with_context(|| format!("invalid MAC {s:?}"));
    }
    interface_mac(Path::new("/sys/class/net"))
}

fn interface_mac(sys_net: &Path) -> anyhow::Result<DeviceIdentity> {
    let mut names: Vec<_> = std::fs::read_dir(sys_net)
        .with_context(|| format!("listing {}", sys_net.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| n != "lo")
        .collect();
    names.sort();
    for name in names {
        let Ok(raw) = std::fs::read_to_string(sys_net.join(&name).join("address")) else {
            continue;
        };
        match DeviceIdentity::parse(&raw) {
            Some(id) if id.mac() != &[0u8; 6] => return Ok(id),
            _ => continue,
        }
    }
    bail!("no interface with a hardware address; set mac or HSEC_MAC")
}
