//! Per-endpoint synchronization.
//!
//! Every connection is guarded by one lock. User calls take it blocking;
//! segment arrival and timer expiry only try it, and when it is held they
//! queue the event on the connection's backlog instead. Whoever releases the
//! lock drains the backlog first, so no event is lost and events are
//! processed in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use super::stack::Inner;
use crate::protocol::listener::Listener;
use crate::protocol::tcb::TCB;
use crate::protocol::{Socket, SocketAddr, TcpSegment};
use crate::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Asynchronous input to a connection.
#[derive(Debug)]
pub(crate) enum Event {
    /// Inbound segment for the connection's 4-tuple.
    Segment(TcpSegment),
    /// The connection's timer deadline passed.
    Timer,
}

/// Shared handle to one connection.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    sock: Socket,
    tcb: Mutex<TCB>,
    backlog: Mutex<VecDeque<(Event, Instant)>>,
    /// Bumped whenever the connection was touched, to wake blocked callers.
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ConnectionHandle {
    pub(crate) fn new(tcb: TCB) -> Self {
        Self {
            sock: tcb.socket(),
            tcb: Mutex::new(tcb),
            backlog: Mutex::new(VecDeque::new()),
            generation: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn socket(&self) -> Socket {
        self.sock
    }

    /// Runs `f` with exclusive access to the connection, then settles the
    /// connection and processes whatever queued up meanwhile.
    pub(crate) fn with<R>(&self, stack: &Inner, now: Instant, f: impl FnOnce(&mut TCB) -> R) -> R {
        self.with_generation(stack, now, f).0
    }

    /// Like [Self::with], also returning the generation right after `f`, for
    /// a later [Self::wait] on any change `f` did not observe.
    pub(crate) fn with_generation<R>(
        &self,
        stack: &Inner,
        now: Instant,
        f: impl FnOnce(&mut TCB) -> R,
    ) -> (R, u64) {
        let mut tcb = lock(&self.tcb);

        let res = f(&mut tcb);
        stack.settle(self, &mut tcb, now);

        self.notify();
        let seen = self.generation();

        self.release(stack, tcb);
        (res, seen)
    }

    /// Hands `event` to the connection: processed right away if the lock is
    /// free, queued for the lock holder otherwise.
    pub(crate) fn deliver(&self, stack: &Inner, event: Event, now: Instant) {
        lock(&self.backlog).push_back((event, now));

        match self.tcb.try_lock() {
            Ok(tcb) => self.release(stack, tcb),
            Err(TryLockError::Poisoned(err)) => self.release(stack, err.into_inner()),
            Err(TryLockError::WouldBlock) => {}
        }
    }

    /// Drains the backlog and unlocks. An event queued after the final drain
    /// but before the unlock is picked up by re-acquiring, unless another
    /// thread took the lock and thereby inherited the backlog.
    fn release<'a>(&'a self, stack: &Inner, mut tcb: MutexGuard<'a, TCB>) {
        loop {
            let mut processed = false;

            loop {
                let next = lock(&self.backlog).pop_front();
                let Some((event, at)) = next else {
                    break;
                };
                stack.process(self, &mut tcb, event, at);
                processed = true;
            }

            if processed {
                self.notify();
            }
            drop(tcb);

            if lock(&self.backlog).is_empty() {
                return;
            }

            tcb = match self.tcb.try_lock() {
                Ok(tcb) => tcb,
                Err(TryLockError::Poisoned(err)) => err.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
        }
    }

    fn notify(&self) {
        *lock(&self.generation) += 1;
        self.changed.notify_all();
    }

    fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Blocks until the connection changed since generation `seen`. Returns
    /// `false` if `deadline` passed first.
    pub(crate) fn wait(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut generation = lock(&self.generation);

        while *generation == seen {
            generation = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }

                    self.changed
                        .wait_timeout(generation, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(generation)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        true
    }
}

/// Shared handle to one listening socket.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    addr: SocketAddr,
    listener: Mutex<Listener<Arc<ConnectionHandle>>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl ListenerHandle {
    pub(crate) fn new(listener: Listener<Arc<ConnectionHandle>>) -> Self {
        Self {
            addr: listener.addr(),
            listener: Mutex::new(listener),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Listener<Arc<ConnectionHandle>>> {
        lock(&self.listener)
    }

    /// Wakes callers blocked in [Self::accept].
    pub(crate) fn notify(&self) {
        self.ready.notify_all();
    }

    /// Marks the listener closed, returning `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);

        let _listener = self.lock();
        self.notify();

        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Dequeues an established connection. Without `block` an empty queue
    /// yields [std::io::ErrorKind::WouldBlock]; otherwise waits until
    /// `deadline`, if any.
    pub(crate) fn accept(
        &self,
        block: bool,
        deadline: Option<Instant>,
    ) -> Result<Arc<ConnectionHandle>> {
        let mut listener = self.lock();

        loop {
            if let Some(conn) = listener.accept() {
                return Ok(conn);
            }

            if self.is_closed() {
                return Err(Error::not_connected());
            }

            if !block {
                return Err(Error::would_block());
            }

            listener = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::timed_out());
                    }

                    self.ready
                        .wait_timeout(listener, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .ready
                    .wait(listener)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}
