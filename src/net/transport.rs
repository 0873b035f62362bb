//! Collaborators the stack hands frames to and asks for routes.
//!
//! The stack never performs device I/O itself: outbound frames go to a
//! [Transport] once a [Router] picked the interface and next hop and a
//! [Resolver] supplied the link address. Hand-off is fire-and-forget; the
//! outcome arrives later through a [TxCallback].

use std::fmt;
use std::io;

/// Link-layer (hardware) address of a neighbour.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkAddr(pub [u8; 6]);

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Outcome of a routing lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Output interface.
    pub interface: u32,
    /// Source address to use on this interface.
    pub source: [u8; 4],
    /// Gateway, or the destination itself when directly connected.
    pub next_hop: [u8; 4],
    /// Largest IPv4 datagram the path carries.
    pub path_mtu: u16,
}

/// Where a frame is handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    /// Output interface.
    pub interface: u32,
    /// IPv4 address of the neighbour.
    pub addr: [u8; 4],
    /// Link address of the neighbour. `None` while resolution is pending;
    /// the transport then holds the frame until the neighbour is resolved.
    pub link: Option<LinkAddr>,
}

/// Metadata accompanying an inbound frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxMeta {
    /// Interface the frame arrived on.
    pub interface: u32,
    /// Link address of the sender, when known.
    pub src_link: Option<LinkAddr>,
}

/// Reports the outcome of a transmission.
pub type TxCallback = Box<dyn FnOnce(io::Result<()>) + Send>;

/// Receives every inbound frame (a complete IPv4 datagram).
pub type RxHandler = Box<dyn Fn(&[u8], RxMeta) + Send + Sync>;

/// Carries IPv4 datagrams to and from the lower layer.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queues `frame` for transmission to `hop`. Must not block; `done` is
    /// invoked once the frame left or was dropped.
    fn send(&self, frame: Vec<u8>, hop: NextHop, done: TxCallback);

    /// Registers the handler for inbound frames. Called once by the stack.
    fn on_receive(&self, handler: RxHandler);
}

/// Resolves destinations to an interface and next hop.
pub trait Router: Send + Sync + fmt::Debug {
    /// Returns the route to `dst`, or `None` if it is unreachable.
    fn route(&self, dst: [u8; 4]) -> Option<Route>;
}

/// Resolves next hops to link addresses (the neighbour cache).
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Returns the link address of `addr` on `interface`, or `None` if the
    /// neighbour is not resolved yet (resolution continues in the
    /// background).
    fn resolve(&self, interface: u32, addr: [u8; 4]) -> Option<LinkAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_addr_display() {
        let addr = LinkAddr([0x02, 0, 0, 0xab, 0x0c, 0xff]);
        assert_eq!(addr.to_string(), "02:00:00:ab:0c:ff");
    }
}
