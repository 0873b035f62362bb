//! Demultiplexing of inbound segments to endpoints.
//!
//! Connections and `TIME_WAIT` records live in a table keyed by the full
//! 4-tuple, split into independently locked shards so lookups on different
//! connections proceed in parallel. Listeners are kept apart, keyed by their
//! bound address; a wildcard listener (`0.0.0.0`) matches every local
//! address of its port.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::protocol::time_wait::TimeWait;
use crate::protocol::{Socket, SocketAddr};

/// Number of independently locked connection shards.
const SHARDS: usize = 16;

/// Slot of the connection table.
#[derive(Debug)]
enum Slot<C> {
    Connection(C),
    TimeWait(TimeWait),
}

/// Outcome of a lookup, in precedence order.
#[derive(Debug)]
pub enum Lookup<C, L> {
    /// Exact match on a live connection.
    Connection(C),
    /// Exact match on a connection in `TIME_WAIT`.
    TimeWait,
    /// No connection; a listener is bound to the local address.
    Listener(L),
    /// Nothing matches.
    None,
}

type Shard<C> = RwLock<HashMap<Socket, Slot<C>>>;

/// Lookup table of a stack.
#[derive(Debug)]
pub struct Demux<C, L> {
    shards: Vec<Shard<C>>,
    listeners: RwLock<HashMap<SocketAddr, L>>,
    hasher: RandomState,
}

impl<C: Clone, L: Clone> Default for Demux<C, L> {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Clone, L: Clone> Demux<C, L> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            listeners: RwLock::new(HashMap::new()),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, sock: &Socket) -> &Shard<C> {
        let idx = self.hasher.hash_one(sock) as usize % SHARDS;
        &self.shards[idx]
    }

    /// Finds the endpoint responsible for a segment arriving on `sock`
    /// (local address first).
    pub fn lookup(&self, sock: &Socket) -> Lookup<C, L> {
        match read(self.shard(sock)).get(sock) {
            Some(Slot::Connection(conn)) => return Lookup::Connection(conn.clone()),
            Some(Slot::TimeWait(_)) => return Lookup::TimeWait,
            None => {}
        }

        match self.listener(sock.local) {
            Some(listener) => Lookup::Listener(listener),
            None => Lookup::None,
        }
    }

    /// Returns the listener accepting connections to `local`.
    pub fn listener(&self, local: SocketAddr) -> Option<L> {
        let listeners = read(&self.listeners);

        listeners
            .get(&local)
            .or_else(|| listeners.get(&local.wildcard()))
            .cloned()
    }

    /// Inserts the connection returned by `make` unless `sock` holds a live
    /// connection. `make` sees the `TIME_WAIT` record occupying the 4-tuple,
    /// if any, and may decline by returning `None`. Linking happens under
    /// the shard lock, so concurrent inserts for one 4-tuple never both
    /// succeed.
    pub fn insert_with<F>(&self, sock: Socket, make: F) -> Option<C>
    where
        F: FnOnce(Option<&TimeWait>) -> Option<C>,
    {
        let mut shard = write(self.shard(&sock));

        let conn = match shard.get(&sock) {
            Some(Slot::Connection(_)) => return None,
            Some(Slot::TimeWait(tw)) => make(Some(tw))?,
            None => make(None)?,
        };

        shard.insert(sock, Slot::Connection(conn.clone()));
        Some(conn)
    }

    /// Inserts `conn` if the 4-tuple is free, returning `false` otherwise.
    pub fn insert_unique(&self, sock: Socket, conn: C) -> bool {
        self.insert_with(sock, |tw| tw.is_none().then_some(conn))
            .is_some()
    }

    /// Removes the connection on `sock` if `is_same` holds for it.
    pub fn remove_connection(&self, sock: &Socket, is_same: impl FnOnce(&C) -> bool) -> bool {
        let mut shard = write(self.shard(sock));

        let same = match shard.get(sock) {
            Some(Slot::Connection(conn)) => is_same(conn),
            _ => false,
        };

        if same {
            shard.remove(sock);
        }

        same
    }

    /// Replaces the connection on `sock` with its `TIME_WAIT` record if
    /// `is_same` holds for it.
    pub fn enter_time_wait(
        &self,
        sock: &Socket,
        is_same: impl FnOnce(&C) -> bool,
        tw: TimeWait,
    ) -> bool {
        let mut shard = write(self.shard(sock));

        let same = match shard.get(sock) {
            Some(Slot::Connection(conn)) => is_same(conn),
            _ => false,
        };

        if same {
            shard.insert(*sock, Slot::TimeWait(tw));
        }

        same
    }

    /// Runs `f` on the `TIME_WAIT` record of `sock`.
    pub fn with_time_wait<R>(&self, sock: &Socket, f: impl FnOnce(&mut TimeWait) -> R) -> Option<R> {
        match write(self.shard(sock)).get_mut(sock) {
            Some(Slot::TimeWait(tw)) => Some(f(tw)),
            _ => None,
        }
    }

    /// Removes the `TIME_WAIT` record of `sock`.
    pub fn remove_time_wait(&self, sock: &Socket) -> bool {
        let mut shard = write(self.shard(sock));

        if matches!(shard.get(sock), Some(Slot::TimeWait(_))) {
            shard.remove(sock);
            return true;
        }

        false
    }

    /// Removes the `TIME_WAIT` record of `sock` if it expired, returning its
    /// expiry otherwise.
    pub fn expire_time_wait(&self, sock: &Socket, now: Instant) -> Option<Instant> {
        let mut shard = write(self.shard(sock));

        let expires = match shard.get(sock) {
            Some(Slot::TimeWait(tw)) => tw.expires(),
            _ => return None,
        };

        if now >= expires {
            shard.remove(sock);
            return None;
        }

        Some(expires)
    }

    /// Returns `true` if `sock` is occupied by a connection or record.
    pub fn contains(&self, sock: &Socket) -> bool {
        read(self.shard(sock)).contains_key(sock)
    }

    /// Returns the number of live connections.
    pub fn connections(&self) -> usize {
        self.count(|slot| matches!(slot, Slot::Connection(_)))
    }

    /// Returns the number of `TIME_WAIT` records.
    pub fn time_wait(&self) -> usize {
        self.count(|slot| matches!(slot, Slot::TimeWait(_)))
    }

    fn count(&self, pred: impl Fn(&Slot<C>) -> bool) -> usize {
        self.shards
            .iter()
            .map(|shard| read(shard).values().filter(|slot| pred(slot)).count())
            .sum()
    }

    /// Binds a listener to `addr`. Fails if the address, or the port as a
    /// whole for a wildcard bind, is taken.
    pub fn bind(&self, addr: SocketAddr, listener: L) -> bool {
        let mut listeners = write(&self.listeners);

        let conflict = listeners.keys().any(|bound| {
            bound.port == addr.port
                && (*bound == addr || bound.is_unspecified() || addr.is_unspecified())
        });

        if conflict {
            return false;
        }

        listeners.insert(addr, listener);
        true
    }

    /// Unbinds the listener on `addr`.
    pub fn unbind(&self, addr: &SocketAddr) -> Option<L> {
        write(&self.listeners).remove(addr)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sock(port: u16) -> Socket {
        Socket::new(
            SocketAddr::new([10, 0, 0, 1], 80),
            SocketAddr::new([10, 0, 0, 2], port),
        )
    }

    fn record(sock: Socket, now: Instant) -> TimeWait {
        TimeWait::new(sock, 100, 200, 65535, None, now + Duration::from_secs(60))
    }

    #[test]
    fn exact_match_precedes_listener() {
        let demux: Demux<u32, &str> = Demux::new();

        assert!(demux.bind(SocketAddr::new([0; 4], 80), "any"));
        assert!(demux.insert_unique(sock(1000), 7));

        assert!(matches!(demux.lookup(&sock(1000)), Lookup::Connection(7)));
        assert!(matches!(demux.lookup(&sock(1001)), Lookup::Listener("any")));

        let other = Socket::new(
            SocketAddr::new([10, 0, 0, 1], 81),
            SocketAddr::new([10, 0, 0, 2], 1000),
        );
        assert!(matches!(demux.lookup(&other), Lookup::None));
    }

    #[test]
    fn specific_listener_precedes_wildcard() {
        let demux: Demux<u32, &str> = Demux::new();

        assert!(demux.bind(SocketAddr::new([10, 0, 0, 1], 80), "specific"));
        assert!(!demux.bind(SocketAddr::new([0; 4], 80), "any"));
        assert!(!demux.bind(SocketAddr::new([10, 0, 0, 1], 80), "again"));
        assert!(demux.bind(SocketAddr::new([10, 0, 0, 9], 80), "other"));

        assert!(matches!(demux.lookup(&sock(1)), Lookup::Listener("specific")));

        assert_eq!(demux.unbind(&SocketAddr::new([10, 0, 0, 1], 80)), Some("specific"));
        assert!(matches!(demux.lookup(&sock(1)), Lookup::None));
    }

    #[test]
    fn insert_is_unique() {
        let demux: Demux<u32, ()> = Demux::new();

        assert!(demux.insert_unique(sock(1), 1));
        assert!(!demux.insert_unique(sock(1), 2));
        assert!(matches!(demux.lookup(&sock(1)), Lookup::Connection(1)));

        assert!(!demux.remove_connection(&sock(1), |c| *c == 2));
        assert!(demux.remove_connection(&sock(1), |c| *c == 1));
        assert!(!demux.contains(&sock(1)));
    }

    #[test]
    fn time_wait_replaces_and_can_be_recycled() {
        let now = Instant::now();
        let demux: Demux<u32, ()> = Demux::new();

        assert!(demux.insert_unique(sock(1), 1));
        assert!(demux.enter_time_wait(&sock(1), |c| *c == 1, record(sock(1), now)));
        assert!(matches!(demux.lookup(&sock(1)), Lookup::TimeWait));
        assert_eq!((demux.connections(), demux.time_wait()), (0, 1));

        // A plain insert does not displace the record.
        assert!(!demux.insert_unique(sock(1), 2));

        let isn = demux.with_time_wait(&sock(1), |tw| tw.reuse_isn());
        assert_eq!(isn, Some(100 + 65537));

        let conn = demux.insert_with(sock(1), |tw| tw.map(|_| 3));
        assert_eq!(conn, Some(3));
        assert!(matches!(demux.lookup(&sock(1)), Lookup::Connection(3)));
    }

    #[test]
    fn expired_record_is_removed() {
        let now = Instant::now();
        let demux: Demux<u32, ()> = Demux::new();

        assert!(demux.insert_unique(sock(1), 1));
        assert!(demux.enter_time_wait(&sock(1), |_| true, record(sock(1), now)));

        assert_eq!(
            demux.expire_time_wait(&sock(1), now),
            Some(now + Duration::from_secs(60))
        );
        assert_eq!(demux.expire_time_wait(&sock(1), now + Duration::from_secs(60)), None);
        assert!(!demux.contains(&sock(1)));
    }
}
