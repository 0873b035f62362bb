//! In-memory transport joining two stacks.
//!
//! Each [LoopbackPort] delivers what it sends to its peer's receive handler
//! on a dedicated thread, so a stack never re-enters itself from inside a
//! transmission. A drop filter can be installed to simulate loss.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use super::transport::{
    LinkAddr, NextHop, Resolver, Route, Router, RxHandler, RxMeta, Transport, TxCallback,
};
use crate::{debug, warn};

/// Decides whether a frame is lost in transit.
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

type HandlerSlot = Arc<Mutex<Option<RxHandler>>>;

/// One end of an in-memory link.
pub struct LoopbackPort {
    name: &'static str,
    peer: Mutex<Sender<Vec<u8>>>,
    handler: HandlerSlot,
    filter: Mutex<Option<DropFilter>>,
}

impl std::fmt::Debug for LoopbackPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPort")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl LoopbackPort {
    /// Creates two connected ports.
    ///
    /// # Errors
    ///
    /// Returns an error if a delivery thread could not be spawned.
    pub fn pair() -> crate::Result<(Arc<LoopbackPort>, Arc<LoopbackPort>)> {
        let (to_a, from_b) = mpsc::channel();
        let (to_b, from_a) = mpsc::channel();

        let a = Self::new("a", to_b, from_b)?;
        let b = Self::new("b", to_a, from_a)?;

        Ok((a, b))
    }

    fn new(
        name: &'static str,
        peer: Sender<Vec<u8>>,
        inbound: Receiver<Vec<u8>>,
    ) -> crate::Result<Arc<Self>> {
        let handler: HandlerSlot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&handler);

        // Ends once the peer port, the only sender, is dropped.
        thread::Builder::new()
            .name(format!("loopback-{name}"))
            .spawn(move || {
                for frame in inbound {
                    let handler = slot.lock().unwrap_or_else(PoisonError::into_inner);

                    match handler.as_ref() {
                        Some(handler) => handler(&frame, RxMeta::default()),
                        None => debug!("loopback-{name}: no receiver, dropping frame"),
                    }
                }
            })?;

        Ok(Arc::new(Self {
            name,
            peer: Mutex::new(peer),
            handler,
            filter: Mutex::new(None),
        }))
    }

    /// Installs a filter; frames for which it returns `true` are dropped.
    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = filter;
    }
}

impl Transport for LoopbackPort {
    fn send(&self, frame: Vec<u8>, _hop: NextHop, done: TxCallback) {
        let lost = self
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .is_some_and(|filter| filter(&frame));

        if lost {
            debug!("loopback-{}: frame dropped by filter", self.name);
            done(Ok(()));
            return;
        }

        let sent = self
            .peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(frame);

        match sent {
            Ok(()) => done(Ok(())),
            Err(_) => {
                warn!("loopback-{}: peer is gone", self.name);
                done(Err(std::io::ErrorKind::NotConnected.into()));
            }
        }
    }

    fn on_receive(&self, handler: RxHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}

/// Routes every destination straight out of one interface, with a fixed
/// source address and path MTU, and resolves every neighbour at once.
#[derive(Debug, Clone, Copy)]
pub struct DirectRoute {
    source: [u8; 4],
    path_mtu: u16,
}

impl DirectRoute {
    /// Creates a route sourcing from `source` over a path of `path_mtu`.
    pub fn new(source: [u8; 4], path_mtu: u16) -> Self {
        Self { source, path_mtu }
    }
}

impl Router for DirectRoute {
    fn route(&self, dst: [u8; 4]) -> Option<Route> {
        Some(Route {
            interface: 0,
            source: self.source,
            next_hop: dst,
            path_mtu: self.path_mtu,
        })
    }
}

impl Resolver for DirectRoute {
    fn resolve(&self, _interface: u32, _addr: [u8; 4]) -> Option<LinkAddr> {
        Some(LinkAddr::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    fn hop() -> NextHop {
        NextHop {
            interface: 0,
            addr: [10, 0, 0, 2],
            link: None,
        }
    }

    #[test]
    fn frames_reach_the_peer() {
        let (a, b) = LoopbackPort::pair().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx = Mutex::new(tx);
        b.on_receive(Box::new(move |frame: &[u8], _: RxMeta| {
            tx.lock().unwrap().send(frame.to_vec()).unwrap();
        }));

        a.send(vec![1, 2, 3], hop(), Box::new(|res: std::io::Result<()>| assert!(res.is_ok())));

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, vec![1, 2, 3]);
    }

    #[test]
    fn filter_drops_frames() {
        let (a, b) = LoopbackPort::pair().unwrap();
        let (tx, rx) = mpsc::channel();

        let tx = Mutex::new(tx);
        b.on_receive(Box::new(move |frame: &[u8], _: RxMeta| {
            tx.lock().unwrap().send(frame.to_vec()).unwrap();
        }));

        a.set_drop_filter(Some(Box::new(|frame: &[u8]| frame[0] == 0)));
        a.send(vec![0], hop(), Box::new(|_: std::io::Result<()>| {}));
        a.send(vec![1], hop(), Box::new(|_: std::io::Result<()>| {}));

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, vec![1]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn direct_route_targets_destination() {
        let route = DirectRoute::new([10, 0, 0, 1], 1500);
        let found = route.route([10, 0, 0, 9]).unwrap();

        assert_eq!(found.next_hop, [10, 0, 0, 9]);
        assert_eq!(found.source, [10, 0, 0, 1]);
        assert_eq!(route.resolve(0, [10, 0, 0, 9]), Some(LinkAddr::default()));
    }
}
