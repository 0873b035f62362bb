//! The protocol engine of one host.
//!
//! A [Stack] ties the protocol state machines to the outside world. Inbound
//! frames are parsed and demultiplexed to their endpoint, outbound segments
//! are routed and handed to the [Transport], and one timer queue drives the
//! deadlines of every connection and listener.

use std::net::Ipv4Addr;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::connection::{ConnectionHandle, Event, ListenerHandle};
use super::demux::{Demux, Lookup};
use super::timers::TimerQueue;
use super::transport::{NextHop, Resolver, Router, RxMeta, Transport};
use crate::config::Config;
use crate::protocol::congestion::{CongestionControl, NewReno};
use crate::protocol::context::Context;
use crate::protocol::fsm::ConnectionState;
use crate::protocol::listener::{Listener, Promotion};
use crate::protocol::tcb::TCB;
use crate::protocol::time_wait::TimeWaitAction;
use crate::protocol::{Socket, SocketAddr, TcpSegment};
use crate::stats::{Stats, StatsSnapshot};
use crate::{Error, ParseError, Result};
use crate::{debug, error, info, warn};

/// IPv4 and TCP headers without options.
const HEADERS_LEN: u16 = 40;

/// Builds the congestion controller of each new connection.
pub type CongestionFactory = fn() -> Box<dyn CongestionControl>;

fn new_reno() -> Box<dyn CongestionControl> {
    Box::new(NewReno)
}

/// Timer owner: one deadline per connection (or `TIME_WAIT` record) and per
/// listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Connection(Socket),
    Listener(SocketAddr),
}

/// State of a [Stack], shared with its handles and collaborators.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) ctx: Arc<Context>,
    transport: Arc<dyn Transport>,
    router: Arc<dyn Router>,
    resolver: Arc<dyn Resolver>,
    demux: Demux<Arc<ConnectionHandle>, Arc<ListenerHandle>>,
    timers: Arc<TimerQueue<TimerKey>>,
    congestion: RwLock<CongestionFactory>,
    next_port: AtomicU32,
}

/// A TCP/IPv4 endpoint: every connection and listener of one host.
///
/// Cloning yields another handle to the same stack.
#[derive(Debug, Clone)]
pub struct Stack {
    pub(crate) inner: Arc<Inner>,
}

impl Stack {
    /// Creates a stack sending through `transport`, and registers with it
    /// for inbound frames.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        router: Arc<dyn Router>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        let inner = Arc::new(Inner {
            ctx: Arc::new(Context::new(config, Instant::now())),
            transport: Arc::clone(&transport),
            router,
            resolver,
            demux: Demux::new(),
            timers: Arc::new(TimerQueue::new()),
            congestion: RwLock::new(new_reno),
            next_port: AtomicU32::new(0),
        });

        let stack = Arc::downgrade(&inner);
        transport.on_receive(Box::new(move |frame: &[u8], meta: RxMeta| {
            if let Some(inner) = stack.upgrade() {
                inner.receive(frame, meta, Instant::now());
            }
        }));

        Self { inner }
    }

    /// Returns the configuration the stack was created with.
    pub fn config(&self) -> &Config {
        &self.inner.ctx.config
    }

    /// Replaces the congestion control of connections opened from now on.
    pub fn set_congestion_control(&self, factory: CongestionFactory) {
        *self
            .inner
            .congestion
            .write()
            .unwrap_or_else(PoisonError::into_inner) = factory;
    }

    /// Processes one inbound IPv4 datagram.
    pub fn receive(&self, frame: &[u8], meta: RxMeta) {
        self.inner.receive(frame, meta, Instant::now());
    }

    /// Processes one inbound IPv4 datagram arriving at `now`.
    pub fn receive_at(&self, frame: &[u8], meta: RxMeta, now: Instant) {
        self.inner.receive(frame, meta, now);
    }

    /// Fires every timer due at `now` and returns the next deadline.
    pub fn poll_timers(&self, now: Instant) -> Option<Instant> {
        self.inner.poll_timers(now)
    }

    /// Runs [Stack::poll_timers] on a background thread until the last
    /// handle to the stack is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread could not be spawned.
    pub fn spawn_timer_thread(&self) -> Result<JoinHandle<()>> {
        let stack = Arc::downgrade(&self.inner);
        let timers = Arc::clone(&self.inner.timers);

        let handle = thread::Builder::new()
            .name("tcp-timers".into())
            .spawn(move || {
                loop {
                    let next = match stack.upgrade() {
                        Some(inner) => inner.poll_timers(Instant::now()),
                        None => break,
                    };

                    if !timers.wait(next) {
                        break;
                    }
                }

                debug!("timer thread exiting");
            })?;

        Ok(handle)
    }

    /// Returns a snapshot of the diagnostic counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.ctx.stats.snapshot()
    }

    /// Returns the number of live connections.
    pub fn connections(&self) -> usize {
        self.inner.demux.connections()
    }

    /// Returns the number of connections lingering in `TIME_WAIT`.
    pub fn time_wait(&self) -> usize {
        self.inner.demux.time_wait()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timers.shutdown();
    }
}

impl Inner {
    fn congestion(&self) -> Box<dyn CongestionControl> {
        let factory = *self
            .congestion
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        factory()
    }

    /// MSS to announce towards `dst`: the path MTU less the headers.
    fn adv_mss(&self, dst: [u8; 4]) -> u16 {
        self.router
            .route(dst)
            .map(|route| route.path_mtu.saturating_sub(HEADERS_LEN))
            .filter(|mss| *mss > 0)
            .unwrap_or(self.ctx.config.default_mss)
    }

    fn receive(&self, frame: &[u8], meta: RxMeta, now: Instant) {
        Stats::incr(&self.ctx.stats.segments_in);

        let seg = match TcpSegment::parse(frame) {
            Ok(seg) => seg,
            Err(Error::Parse(ParseError::InvalidChecksum { .. })) => {
                Stats::incr(&self.ctx.stats.checksum_errors);
                warn!(
                    "invalid IP packet received on interface {}: checksum mismatch",
                    meta.interface
                );
                return;
            }
            Err(err) => {
                Stats::incr(&self.ctx.stats.malformed);
                debug!(
                    "invalid IP packet received on interface {}: {err}",
                    meta.interface
                );
                return;
            }
        };

        let (src, dst) = (Ipv4Addr::from(seg.ip.src()), Ipv4Addr::from(seg.ip.dst()));
        if src.is_broadcast() || src.is_multicast() || dst.is_broadcast() || dst.is_multicast() {
            Stats::incr(&self.ctx.stats.malformed);
            debug!("ignoring TCP segment {src} -> {dst}: not unicast");
            return;
        }

        self.dispatch(seg, now);
    }

    fn dispatch(&self, seg: TcpSegment, now: Instant) {
        let sock = seg.socket();

        match self.demux.lookup(&sock) {
            Lookup::Connection(conn) => conn.deliver(self, Event::Segment(seg), now),
            Lookup::TimeWait => self.on_time_wait_segment(seg, now),
            Lookup::Listener(listener) => self.on_listener_segment(&listener, seg, None, now),
            Lookup::None => {
                debug!("[{sock}] no endpoint for {seg}");
                self.reset(&seg);
            }
        }
    }

    /// Answers a segment no endpoint accounts for.
    fn reset(&self, seg: &TcpSegment) {
        match seg.reset_reply(self.ctx.config.ttl) {
            Ok(Some(rst)) => {
                Stats::incr(&self.ctx.stats.resets_sent);
                self.transmit(rst);
            }
            Ok(None) => {}
            Err(err) => error!("[{}] failed to construct RST: {err}", seg.socket()),
        }
    }

    fn on_time_wait_segment(&self, seg: TcpSegment, now: Instant) {
        let sock = seg.socket();
        let key = TimerKey::Connection(sock);

        let action = self
            .demux
            .with_time_wait(&sock, |tw| tw.process(&seg, &self.ctx, now));

        match action {
            // The record went away since the lookup.
            None => self.dispatch(seg, now),
            Some(Err(err)) => error!("[{sock}] (TIME_WAIT) {err}"),
            Some(Ok(TimeWaitAction::Drop)) => {}
            Some(Ok(TimeWaitAction::Ack(ack))) => self.transmit(ack),
            Some(Ok(TimeWaitAction::Remove)) => {
                if self.demux.remove_time_wait(&sock) {
                    self.timers.cancel(key);
                    debug!("[{sock}] (TIME_WAIT) record removed: TIME_WAIT -> CLOSED");
                }
            }
            Some(Ok(TimeWaitAction::Reuse { isn })) => {
                if self.demux.remove_time_wait(&sock) {
                    self.timers.cancel(key);
                    Stats::incr(&self.ctx.stats.time_wait_recycled);
                }

                match self.demux.listener(sock.local) {
                    Some(listener) => self.on_listener_segment(&listener, seg, Some(isn), now),
                    None => self.reset(&seg),
                }
            }
        }
    }

    fn on_listener_segment(
        &self,
        handle: &ListenerHandle,
        seg: TcpSegment,
        isn: Option<u32>,
        now: Instant,
    ) {
        let sock = seg.socket();
        let adv_mss = self.adv_mss(sock.remote.addr);

        let mut listener = handle.lock();

        if handle.is_closed() {
            drop(listener);
            self.reset(&seg);
            return;
        }

        // Promotion happens under the listener lock; a segment demultiplexed
        // before it linked the connection belongs to that connection.
        if let Lookup::Connection(conn) = self.demux.lookup(&sock) {
            drop(listener);
            conn.deliver(self, Event::Segment(seg), now);
            return;
        }

        let promotion = listener
            .on_segment(&seg, adv_mss, isn, now)
            .unwrap_or_else(|err| {
                error!("[{sock}] (LISTEN) {err}");
                None
            });

        for out in listener.take_outbox() {
            self.transmit(out);
        }

        if let Some(promotion) = promotion {
            if self.promote(&mut listener, promotion, adv_mss, now) {
                handle.notify();
            }
        }

        self.timers
            .reschedule(TimerKey::Listener(handle.addr()), listener.next_deadline());
    }

    /// Creates and links the connection of a completed handshake. Runs
    /// under the listener lock; linking fails if the 4-tuple is already
    /// taken, so one handshake never yields two connections. The request is
    /// retired only once linking succeeds.
    fn promote(
        &self,
        listener: &mut Listener<Arc<ConnectionHandle>>,
        promotion: Promotion,
        adv_mss: u16,
        now: Instant,
    ) -> bool {
        let sock = promotion.sock;

        let tcb = match TCB::accept(
            Arc::clone(&self.ctx),
            promotion,
            adv_mss,
            self.congestion(),
            now,
        ) {
            Ok(tcb) => tcb,
            Err(err) => {
                error!("[{sock}] (SYN_RECEIVED) failed to complete handshake: {err}");
                return false;
            }
        };

        let conn = Arc::new(ConnectionHandle::new(tcb));

        if !self.demux.insert_unique(sock, Arc::clone(&conn)) {
            warn!("[{sock}] (SYN_RECEIVED) 4-tuple already in use: keeping request");
            return false;
        }

        conn.with(self, now, |_| ());
        listener.complete(&sock, conn);

        true
    }

    /// Opens a connection to `remote` from an ephemeral port.
    pub(crate) fn connect(&self, remote: SocketAddr, now: Instant) -> Result<Arc<ConnectionHandle>> {
        let route = self.router.route(remote.addr).ok_or_else(Error::unreachable)?;
        let adv_mss = route.path_mtu.saturating_sub(HEADERS_LEN);

        let ports = &self.ctx.config.ephemeral_ports;
        let (first, last) = (u32::from(*ports.start()), u32::from(*ports.end()));

        if first > last {
            return Err(Error::addr_not_available());
        }

        let span = last - first + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed);

        for i in 0..span {
            let port = (first + offset.wrapping_add(i) % span) as u16;
            let local = SocketAddr::new(route.source, port);

            if self.demux.listener(local).is_some() {
                continue;
            }

            let sock = Socket::new(local, remote);
            if let Some(conn) = self.claim(sock, adv_mss, now)? {
                conn.with(self, now, |_| ());
                info!("[{sock}] (SYN_SENT) connecting");
                return Ok(conn);
            }
        }

        Err(Error::addr_not_available())
    }

    /// Links a new active-open connection on `sock` if the 4-tuple is free,
    /// or held by a `TIME_WAIT` record that may be recycled.
    fn claim(&self, sock: Socket, adv_mss: u16, now: Instant) -> Result<Option<Arc<ConnectionHandle>>> {
        let mut failure = None;
        let mut recycled = false;

        let conn = self.demux.insert_with(sock, |tw| {
            let iss = match tw {
                None => self.ctx.isn.generate(&sock, now),
                Some(tw) if self.ctx.config.tw_reuse && tw.timestamps() => {
                    recycled = true;
                    tw.reuse_isn()
                }
                Some(_) => return None,
            };

            TCB::connect(
                Arc::clone(&self.ctx),
                sock,
                iss,
                adv_mss,
                self.congestion(),
                now,
            )
            .map(|tcb| Arc::new(ConnectionHandle::new(tcb)))
            .map_err(|err| failure = Some(err))
            .ok()
        });

        if let Some(err) = failure {
            return Err(err);
        }

        if recycled && conn.is_some() {
            Stats::incr(&self.ctx.stats.time_wait_recycled);
            debug!("[{sock}] (TIME_WAIT) 4-tuple recycled for active open");
        }

        Ok(conn)
    }

    /// Binds a listener to `addr`.
    pub(crate) fn listen(&self, addr: SocketAddr, backlog: usize) -> Result<Arc<ListenerHandle>> {
        let listener = Listener::new(Arc::clone(&self.ctx), addr, backlog);
        let backlog = listener.backlog();
        let handle = Arc::new(ListenerHandle::new(listener));

        if !self.demux.bind(addr, Arc::clone(&handle)) {
            return Err(Error::addr_in_use());
        }

        info!("[{addr}] (LISTEN) listening, backlog {backlog}");

        Ok(handle)
    }

    /// Unbinds a listener, resetting the connections it never handed out.
    pub(crate) fn unlisten(&self, handle: &ListenerHandle, now: Instant) {
        if !handle.close() {
            return;
        }

        let addr = handle.addr();

        self.demux.unbind(&addr);
        self.timers.cancel_and_join(TimerKey::Listener(addr));

        let pending = handle.lock().shutdown();

        for conn in pending {
            conn.with(self, now, |tcb| {
                if let Err(err) = tcb.abort() {
                    error!("[{}] failed to abort connection: {err}", tcb.socket());
                }
            });
        }

        info!("[{addr}] (LISTEN) closed");
    }

    /// Runs one queued event for a connection.
    pub(crate) fn process(&self, conn: &ConnectionHandle, tcb: &mut TCB, event: Event, now: Instant) {
        let res = match event {
            Event::Segment(seg) => tcb.on_segment(&seg, now),
            Event::Timer => tcb.on_timer(now),
        };

        if let Err(err) = res {
            error!("[{}] ({:?}) {err}", tcb.socket(), tcb.state());
        }

        self.settle(conn, tcb, now);
    }

    /// Transmits the connection's outbox and brings its table entry and
    /// deadline in line with its state.
    pub(crate) fn settle(&self, conn: &ConnectionHandle, tcb: &mut TCB, now: Instant) {
        for seg in tcb.take_outbox() {
            self.transmit(seg);
        }

        let sock = tcb.socket();
        let key = TimerKey::Connection(sock);
        let is_same = |linked: &Arc<ConnectionHandle>| ptr::eq(Arc::as_ptr(linked), conn);

        match tcb.state() {
            ConnectionState::CLOSED => {
                if self.demux.remove_connection(&sock, is_same) {
                    self.timers.cancel_and_join(key);
                    debug!("[{sock}] (CLOSED) connection removed");
                }
            }
            ConnectionState::TIME_WAIT => {
                let tw = tcb.to_time_wait(now);
                let expires = tw.expires();

                if self.demux.enter_time_wait(&sock, is_same, tw) {
                    self.timers.schedule(key, expires);
                    debug!("[{sock}] (TIME_WAIT) connection replaced by TIME_WAIT record");
                }
            }
            _ => self.timers.reschedule(key, tcb.next_deadline()),
        }
    }

    fn poll_timers(&self, now: Instant) -> Option<Instant> {
        while let Some(key) = self.timers.pop_due(now) {
            match key {
                TimerKey::Connection(sock) => match self.demux.lookup(&sock) {
                    Lookup::Connection(conn) => conn.deliver(self, Event::Timer, now),
                    Lookup::TimeWait => match self.demux.expire_time_wait(&sock, now) {
                        Some(expires) => self.timers.schedule(key, expires),
                        None => debug!("[{sock}] (TIME_WAIT) timer expired: closing connection"),
                    },
                    Lookup::Listener(_) | Lookup::None => {}
                },
                TimerKey::Listener(addr) => {
                    if let Some(handle) = self.demux.listener(addr) {
                        let mut listener = handle.lock();

                        if let Err(err) = listener.on_timer(now) {
                            error!("[{addr}] (LISTEN) {err}");
                        }

                        for seg in listener.take_outbox() {
                            self.transmit(seg);
                        }

                        self.timers.reschedule(key, listener.next_deadline());
                    }
                }
            }

            self.timers.finish(key);
        }

        self.timers.next_deadline()
    }

    /// Routes `seg` and hands it to the transport.
    pub(crate) fn transmit(&self, seg: TcpSegment) {
        let dst = seg.ip.dst();

        let Some(route) = self.router.route(dst) else {
            Stats::incr(&self.ctx.stats.tx_failures);
            warn!("no route to {}: dropping {seg}", Ipv4Addr::from(dst));
            return;
        };

        let frame = match seg.to_be_bytes() {
            Ok(frame) => frame,
            Err(err) => {
                error!("failed to serialize {seg}: {err}");
                return;
            }
        };

        let hop = NextHop {
            interface: route.interface,
            addr: route.next_hop,
            link: self.resolver.resolve(route.interface, route.next_hop),
        };

        Stats::incr(&self.ctx.stats.segments_out);

        let ctx = Arc::clone(&self.ctx);
        self.transport.send(
            frame,
            hop,
            Box::new(move |res: std::io::Result<()>| {
                if let Err(err) = res {
                    Stats::incr(&ctx.stats.tx_failures);
                    debug!("transmission failed: {err}");
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::net::loopback::DirectRoute;
    use crate::net::transport::{Route, RxHandler, TxCallback};
    use crate::protocol::headers::TcpHeader;

    const LOCAL: [u8; 4] = [10, 0, 0, 1];
    const PEER: [u8; 4] = [10, 0, 0, 2];

    const SYN: u8 = 0b00_0010;
    const ACK: u8 = 0b01_0000;
    const RST: u8 = 0b00_0100;
    const FIN: u8 = 0b00_0001;

    /// Keeps every frame handed to it.
    #[derive(Debug, Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Transport for Recorder {
        fn send(&self, frame: Vec<u8>, _hop: NextHop, done: TxCallback) {
            self.frames.lock().unwrap().push(frame);
            done(Ok(()));
        }

        fn on_receive(&self, _handler: RxHandler) {}
    }

    impl Recorder {
        fn take(&self) -> Vec<TcpSegment> {
            self.frames
                .lock()
                .unwrap()
                .drain(..)
                .map(|frame| TcpSegment::parse(&frame).unwrap())
                .collect()
        }
    }

    fn stack(config: Config) -> (Stack, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let route = Arc::new(DirectRoute::new(LOCAL, 1500));

        let stack = Stack::new(config, recorder.clone(), route.clone(), route);
        (stack, recorder)
    }

    /// Frame sent by the peer from `port` to local port `to`.
    fn frame(port: u16, to: u16, seq: u32, ack: u32, flags: u8) -> Vec<u8> {
        frame_with(port, to, seq, ack, flags, &[], None)
    }

    /// Like [frame], with a payload and an optional timestamps option.
    fn frame_with(
        port: u16,
        to: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: &[u8],
        ts: Option<(u32, u32)>,
    ) -> Vec<u8> {
        let from = Socket::new(SocketAddr::new(PEER, port), SocketAddr::new(LOCAL, to));
        let mut tcp = TcpHeader::new(port, to, seq, 65535);

        if flags & SYN != 0 {
            tcp.set_syn();
        }
        if flags & FIN != 0 {
            tcp.set_fin();
        }
        if flags & RST != 0 {
            tcp.set_rst();
        }
        if flags & ACK != 0 {
            tcp.set_ack();
            tcp.set_ack_number(ack);
        }
        if let Some((val, ecr)) = ts {
            tcp.set_option_timestamps(val, ecr).unwrap();
        }

        TcpSegment::build(from, tcp, payload, 64)
            .unwrap()
            .to_be_bytes()
            .unwrap()
    }

    fn parsed(frame: &[u8]) -> TcpSegment {
        TcpSegment::parse(frame).unwrap()
    }

    #[test]
    fn closed_port_answers_with_reset() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());

        stack.receive_at(&frame(40000, 81, 1000, 0, SYN), RxMeta::default(), now);

        let out = recorder.take();
        assert_eq!(out.len(), 1);
        assert!(out[0].tcp.rst() && out[0].tcp.ack());
        assert_eq!(out[0].ack(), 1001);
        assert_eq!(stack.stats().resets_sent, 1);

        // Never a RST for a RST.
        stack.receive_at(&frame(40000, 81, 1000, 0, RST), RxMeta::default(), now);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn bad_frames_are_counted_and_dropped() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());

        stack.receive_at(&[0x45, 0, 0], RxMeta::default(), now);

        let mut corrupt = frame(40000, 81, 1000, 0, SYN);
        corrupt[25] ^= 0xff;
        stack.receive_at(&corrupt, RxMeta::default(), now);

        let stats = stack.stats();
        assert_eq!(stats.segments_in, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.checksum_errors, 1);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn handshake_is_promoted_once() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());
        let listener = stack
            .inner
            .listen(SocketAddr::new([0; 4], 80), 8)
            .unwrap();

        stack.receive_at(&frame(40000, 80, 1000, 0, SYN), RxMeta::default(), now);

        let out = recorder.take();
        assert_eq!(out.len(), 1);
        assert!(out[0].tcp.syn() && out[0].tcp.ack());
        assert_eq!(out[0].ack(), 1001);
        assert_eq!(out[0].tcp.options().mss(), Some(1460));

        let iss = out[0].seq();
        let ack = frame(40000, 80, 1001, iss.wrapping_add(1), ACK);

        stack.receive_at(&ack, RxMeta::default(), now);
        stack.receive_at(&ack, RxMeta::default(), now);

        assert_eq!(stack.connections(), 1);
        assert_eq!(listener.lock().queued(), 1);
        assert_eq!(stack.stats().passive_opens, 1);

        let conn = listener.accept(false, None).unwrap();
        assert_eq!(
            conn.with(&stack.inner, now, |tcb| tcb.state()),
            ConnectionState::ESTABLISHED
        );
        assert!(matches!(
            listener.accept(false, None),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock
        ));
    }

    #[test]
    fn listener_rebinding_is_refused() {
        let (stack, _) = stack(Config::default());

        let listener = stack.inner.listen(SocketAddr::new(LOCAL, 80), 8).unwrap();
        assert!(matches!(
            stack.inner.listen(SocketAddr::new([0; 4], 80), 8),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse
        ));

        stack.inner.unlisten(&listener, Instant::now());
        assert!(stack.inner.listen(SocketAddr::new([0; 4], 80), 8).is_ok());
    }

    #[test]
    fn syn_is_retransmitted_by_timers() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());

        let conn = stack
            .inner
            .connect(SocketAddr::new(PEER, 80), now)
            .unwrap();
        assert_eq!(conn.socket().local.port, 32768);

        let syn = recorder.take();
        assert_eq!(syn.len(), 1);
        assert!(syn[0].tcp.syn() && !syn[0].tcp.ack());

        let deadline = now + Duration::from_secs(1);
        assert_eq!(stack.poll_timers(now), Some(deadline));
        assert!(recorder.take().is_empty());

        let next = stack.poll_timers(deadline);
        let again = recorder.take();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].seq(), syn[0].seq());
        assert_eq!(next, Some(deadline + Duration::from_secs(2)));
        assert_eq!(stack.stats().retransmissions, 1);
    }

    #[test]
    fn refused_connect_is_removed() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());

        let conn = stack
            .inner
            .connect(SocketAddr::new(PEER, 80), now)
            .unwrap();
        let syn = recorder.take().remove(0);

        let local = conn.socket().local.port;
        stack.receive_at(
            &frame(80, local, 0, syn.seq().wrapping_add(1), RST | ACK),
            RxMeta::default(),
            now,
        );

        assert_eq!(stack.connections(), 0);
        assert!(matches!(
            conn.with(&stack.inner, now, |tcb| tcb.poll_connect()),
            Some(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionRefused
        ));
        assert_eq!(stack.poll_timers(now + Duration::from_secs(5)), None);
    }

    #[test]
    fn unreachable_destination_fails_connect() {
        #[derive(Debug)]
        struct Nowhere;

        impl Router for Nowhere {
            fn route(&self, _dst: [u8; 4]) -> Option<Route> {
                None
            }
        }

        let recorder = Arc::new(Recorder::default());
        let stack = Stack::new(
            Config::default(),
            recorder,
            Arc::new(Nowhere),
            Arc::new(DirectRoute::new(LOCAL, 1500)),
        );

        let err = stack
            .inner
            .connect(SocketAddr::new(PEER, 80), Instant::now())
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::HostUnreachable);
    }

    #[test]
    fn exhausted_ports_are_reported() {
        let now = Instant::now();
        let config = Config {
            ephemeral_ports: 50000..=50001,
            ..Config::default()
        };
        let (stack, _) = stack(config);
        let remote = SocketAddr::new(PEER, 80);

        let a = stack.inner.connect(remote, now).unwrap();
        let b = stack.inner.connect(remote, now).unwrap();
        assert_ne!(a.socket().local.port, b.socket().local.port);

        let err = stack.inner.connect(remote, now).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrNotAvailable);
    }

    #[test]
    fn segment_racing_promotion_reaches_the_connection() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());
        let listener = stack
            .inner
            .listen(SocketAddr::new([0; 4], 80), 8)
            .unwrap();

        stack.receive_at(&frame(40000, 80, 1000, 0, SYN), RxMeta::default(), now);
        let iss = recorder.take()[0].seq();

        // Both segments were demultiplexed to the listener before the
        // connection was linked.
        let ack = frame(40000, 80, 1001, iss.wrapping_add(1), ACK);
        let data = frame_with(40000, 80, 1001, iss.wrapping_add(1), ACK, b"hello", None);

        stack.inner.on_listener_segment(&listener, parsed(&ack), None, now);
        stack.inner.on_listener_segment(&listener, parsed(&data), None, now);

        assert!(recorder.take().iter().all(|seg| !seg.tcp.rst()));
        assert_eq!(stack.connections(), 1);
        assert_eq!(stack.stats().resets_sent, 0);

        let conn = listener.accept(false, None).unwrap();
        let received = conn.with(&stack.inner, now, |tcb| {
            let mut buf = [0; 16];
            let n = tcb.recv(&mut buf, now).unwrap();
            buf[..n].to_vec()
        });
        assert_eq!(received, b"hello");
    }

    #[test]
    fn syn_recycles_time_wait_for_listener() {
        let now = Instant::now();
        let (stack, recorder) = stack(Config::default());
        let listener = stack
            .inner
            .listen(SocketAddr::new([0; 4], 80), 8)
            .unwrap();

        stack.receive_at(&frame(40000, 80, 1000, 0, SYN), RxMeta::default(), now);
        let iss = recorder.take()[0].seq();
        let snd_nxt = iss.wrapping_add(2);

        stack.receive_at(
            &frame(40000, 80, 1001, iss.wrapping_add(1), ACK),
            RxMeta::default(),
            now,
        );
        let conn = listener.accept(false, None).unwrap();

        // Active close on our side: FIN, its ACK, then the peer's FIN.
        conn.with(&stack.inner, now, |tcb| tcb.close(now)).unwrap();
        let fin = recorder.take();
        assert!(fin.iter().any(|seg| seg.tcp.fin()));

        stack.receive_at(&frame(40000, 80, 1001, snd_nxt, ACK), RxMeta::default(), now);
        stack.receive_at(
            &frame(40000, 80, 1001, snd_nxt, FIN | ACK),
            RxMeta::default(),
            now,
        );

        assert_eq!(stack.time_wait(), 1);
        assert_eq!(stack.connections(), 0);
        recorder.take();

        // A SYN beyond RCV.NXT evicts the record.
        stack.receive_at(&frame(40000, 80, 9000, 0, SYN), RxMeta::default(), now);

        let out = recorder.take();
        assert_eq!(out.len(), 1);
        assert!(out[0].tcp.syn() && out[0].tcp.ack());
        assert_eq!(out[0].seq(), snd_nxt.wrapping_add(65535 + 2));
        assert_eq!(out[0].ack(), 9001);

        assert_eq!(stack.time_wait(), 0);
        assert_eq!(stack.stats().time_wait_recycled, 1);
        assert_eq!(listener.lock().pending_requests(), 1);
    }

    /// Drives an active open from the only ephemeral port into TIME_WAIT,
    /// returning the connection and its final SND.NXT.
    fn active_close_on_only_port(
        ts: Option<(u32, u32)>,
    ) -> (Stack, Arc<Recorder>, Arc<ConnectionHandle>, u32) {
        let now = Instant::now();
        let config = Config {
            ephemeral_ports: 50000..=50000,
            ..Config::default()
        };
        let (stack, recorder) = stack(config);

        let conn = stack.inner.connect(SocketAddr::new(PEER, 80), now).unwrap();
        let syn = recorder.take().remove(0);
        assert!(syn.tcp.options().timestamps().is_some());

        let iss = syn.seq();
        let snd_nxt = iss.wrapping_add(2);

        let syn_ack = frame_with(80, 50000, 5000, iss.wrapping_add(1), SYN | ACK, &[], ts);
        stack.receive_at(&syn_ack, RxMeta::default(), now);
        assert_eq!(
            conn.with(&stack.inner, now, |tcb| tcb.state()),
            ConnectionState::ESTABLISHED
        );

        conn.with(&stack.inner, now, |tcb| tcb.close(now)).unwrap();
        stack.receive_at(&frame(80, 50000, 5001, snd_nxt, ACK), RxMeta::default(), now);
        stack.receive_at(&frame(80, 50000, 5001, snd_nxt, FIN | ACK), RxMeta::default(), now);

        assert_eq!(stack.time_wait(), 1);
        assert_eq!(stack.connections(), 0);
        recorder.take();

        (stack, recorder, conn, snd_nxt)
    }

    #[test]
    fn active_open_recycles_time_wait() {
        let (stack, recorder, conn, snd_nxt) = active_close_on_only_port(Some((100, 0)));

        let again = stack
            .inner
            .connect(SocketAddr::new(PEER, 80), Instant::now())
            .unwrap();
        assert_eq!(again.socket(), conn.socket());

        let out = recorder.take();
        assert_eq!(out.len(), 1);
        assert!(out[0].tcp.syn() && !out[0].tcp.ack());
        assert_eq!(out[0].seq(), snd_nxt.wrapping_add(65535 + 2));

        assert_eq!(stack.time_wait(), 0);
        assert_eq!(stack.connections(), 1);
        assert_eq!(stack.stats().time_wait_recycled, 1);
    }

    #[test]
    fn time_wait_without_timestamps_is_not_recycled() {
        let (stack, recorder, _conn, _) = active_close_on_only_port(None);

        let err = stack
            .inner
            .connect(SocketAddr::new(PEER, 80), Instant::now())
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrNotAvailable);

        assert!(recorder.take().is_empty());
        assert_eq!(stack.time_wait(), 1);
        assert_eq!(stack.stats().time_wait_recycled, 0);
    }
}
