//! Socket addresses and the 4-tuple identifying a connection.

use std::{fmt, net};

/// An IPv4 address and a port number.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketAddr {
    /// IPv4 address.
    pub addr: [u8; 4],
    /// Port number.
    pub port: u16,
}

impl SocketAddr {
    /// The unspecified address `0.0.0.0`, used by listeners bound to every
    /// local address.
    pub const UNSPECIFIED: [u8; 4] = [0; 4];

    /// Creates a socket address from an IPv4 address and port.
    pub const fn new(addr: [u8; 4], port: u16) -> Self {
        Self { addr, port }
    }

    /// Returns `true` if the address part is `0.0.0.0`.
    pub fn is_unspecified(&self) -> bool {
        self.addr == Self::UNSPECIFIED
    }

    /// Returns the same port on the unspecified address.
    pub fn wildcard(&self) -> Self {
        Self::new(Self::UNSPECIFIED, self.port)
    }
}

impl From<([u8; 4], u16)> for SocketAddr {
    fn from((addr, port): ([u8; 4], u16)) -> Self {
        Self::new(addr, port)
    }
}

impl From<net::SocketAddrV4> for SocketAddr {
    fn from(addr: net::SocketAddrV4) -> Self {
        Self::new(addr.ip().octets(), addr.port())
    }
}

impl From<SocketAddr> for net::SocketAddrV4 {
    fn from(addr: SocketAddr) -> Self {
        net::SocketAddrV4::new(addr.addr.into(), addr.port)
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            self.addr[0], self.addr[1], self.addr[2], self.addr[3], self.port,
        )
    }
}

/// Unique TCP connection, identified by the local and remote socket
/// addresses.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Socket {
    /// Local IP and port.
    pub local: SocketAddr,
    /// Remote IP and port.
    pub remote: SocketAddr,
}

impl Socket {
    /// Creates the 4-tuple for a local and remote address.
    pub const fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }

    /// Returns the 4-tuple as seen from the peer.
    pub fn reversed(&self) -> Self {
        Self::new(self.remote, self.local)
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
