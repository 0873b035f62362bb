//! Passive open: half-open requests, SYN cookies, and the accept queue.
//!
//! A [Listener] answers `SYN`s with `SYN_ACK`s, tracking each half-open
//! handshake as a [Request] until the completing `ACK` arrives. Once the
//! half-open queue is full it falls back to stateless SYN cookies (RFC 4987)
//! instead of storing more requests. A completed handshake is returned as a
//! [Promotion]; the caller builds the connection and queues it with
//! [Listener::complete] while still holding the listener.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::context::Context;
use super::headers::TcpHeader;
use super::{Socket, SocketAddr, TcpSegment, seq};
use crate::Result;
use crate::stats::Stats;
use crate::{debug, warn};

/// A completed handshake, ready to become a connection.
#[derive(Debug)]
pub struct Promotion {
    /// 4-tuple of the new connection.
    pub sock: Socket,
    /// Our initial sequence number.
    pub iss: u32,
    /// The peer's initial sequence number.
    pub irs: u32,
    /// MSS announced by the peer (or recovered from the cookie).
    pub peer_mss: u16,
    /// SACK was negotiated.
    pub sack_ok: bool,
    /// Timestamps were negotiated.
    pub ts_ok: bool,
    /// Latest timestamp received from the peer.
    pub ts_recent: u32,
    /// Data carried on the `SYN` and already acknowledged.
    pub data: Vec<u8>,
    /// The handshake was completed from a SYN cookie.
    pub from_cookie: bool,
    /// The segment completing the handshake.
    pub ack: TcpSegment,
}

/// A half-open connection in `SYN_RECEIVED`.
#[derive(Debug)]
pub struct Request {
    sock: Socket,
    iss: u32,
    irs: u32,
    peer_mss: u16,
    adv_mss: u16,
    sack_ok: bool,
    ts_ok: bool,
    ts_recent: u32,
    data: Vec<u8>,
    retries: u32,
    created: Instant,
    rto: Duration,
    deadline: Instant,
}

impl Request {
    /// Returns the 4-tuple of the request.
    pub fn socket(&self) -> Socket {
        self.sock
    }

    /// Returns our initial sequence number.
    pub fn iss(&self) -> u32 {
        self.iss
    }

    /// Returns the peer's initial sequence number.
    pub fn irs(&self) -> u32 {
        self.irs
    }

    /// Returns the number of `SYN_ACK` retransmissions so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns the time the `SYN` arrived.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Returns the sequence number expected from the peer.
    fn rcv_nxt(&self) -> u32 {
        self.irs.wrapping_add(1).wrapping_add(self.data.len() as u32)
    }
}

/// A socket in the `LISTEN` state, holding connections of type `C` until
/// they are accepted.
#[derive(Debug)]
pub struct Listener<C> {
    addr: SocketAddr,
    backlog: usize,
    requests: HashMap<Socket, Request>,
    accept_queue: VecDeque<C>,
    /// Last time a cookie was sent; cookies are only checked shortly after.
    last_cookie: Option<Instant>,
    outbox: Vec<TcpSegment>,
    ctx: Arc<Context>,
}

impl<C> Listener<C> {
    /// Creates a listener on `addr`. The backlog bounds both the half-open
    /// and the accept queue and is capped by `max_syn_backlog`.
    pub fn new(ctx: Arc<Context>, addr: SocketAddr, backlog: usize) -> Self {
        let backlog = backlog.clamp(1, ctx.config.max_syn_backlog.max(1));

        Self {
            addr,
            backlog,
            requests: HashMap::new(),
            accept_queue: VecDeque::new(),
            last_cookie: None,
            outbox: Vec::new(),
            ctx,
        }
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the effective backlog.
    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// Returns the pending request on `sock`, if any.
    pub fn request(&self, sock: &Socket) -> Option<&Request> {
        self.requests.get(sock)
    }

    /// Returns the number of half-open requests.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Returns the number of connections waiting to be accepted.
    pub fn queued(&self) -> usize {
        self.accept_queue.len()
    }

    /// Returns `true` if no further connection can be queued.
    pub fn accept_queue_full(&self) -> bool {
        self.accept_queue.len() >= self.backlog
    }

    /// Queues the connection built from a [Promotion] for `sock`, retiring
    /// its request. Until then the request stays, so a handshake whose
    /// connection could not be linked is completed by the peer's next `ACK`.
    pub fn complete(&mut self, sock: &Socket, conn: C) {
        self.requests.remove(sock);
        self.accept_queue.push_back(conn);
    }

    /// Dequeues the oldest completed connection.
    pub fn accept(&mut self) -> Option<C> {
        self.accept_queue.pop_front()
    }

    /// Drops every request and returns the connections never accepted.
    pub fn shutdown(&mut self) -> Vec<C> {
        self.requests.clear();
        self.accept_queue.drain(..).collect()
    }

    /// Removes and returns the segments waiting to be transmitted.
    pub fn take_outbox(&mut self) -> Vec<TcpSegment> {
        mem::take(&mut self.outbox)
    }

    /// Returns the earliest `SYN_ACK` retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests.values().map(|req| req.deadline).min()
    }

    /// Processes a segment addressed to the listener. `adv_mss` is the MSS
    /// to announce on the route back to the peer, and `isn` overrides the
    /// generated initial sequence number (reuse of a `TIME_WAIT` 4-tuple).
    ///
    /// (RFC 793 3.9, LISTEN STATE)
    ///
    /// ```text
    ///     first check for an RST
    ///         An incoming RST should be ignored.
    ///     second check for an ACK
    ///         Any acknowledgment is bad if it arrives on a connection still
    ///         in the LISTEN state. An acceptable reset segment should be
    ///         formed for any arriving ACK-bearing segment.
    ///     third check for a SYN
    /// ```
    ///
    /// Here the `ACK` check first looks for a request (or cookie) the
    /// segment completes.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment to transmit could not be constructed.
    pub fn on_segment(
        &mut self,
        seg: &TcpSegment,
        adv_mss: u16,
        isn: Option<u32>,
        now: Instant,
    ) -> Result<Option<Promotion>> {
        let sock = seg.socket();

        debug!("[{}] (LISTEN) received {}", sock, seg);

        if seg.tcp.rst() {
            self.on_rst(seg);
            return Ok(None);
        }

        if seg.tcp.ack() {
            if seg.tcp.syn() {
                self.reset_reply(seg)?;
                return Ok(None);
            }

            return self.on_ack(seg, now);
        }

        if seg.tcp.syn() {
            self.on_syn(seg, adv_mss, isn, now)?;
        }

        Ok(None)
    }

    /// Retransmits due `SYN_ACK`s and expires requests out of retries.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment to transmit could not be constructed.
    pub fn on_timer(&mut self, now: Instant) -> Result<()> {
        let due: Vec<Socket> = self
            .requests
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(sock, _)| *sock)
            .collect();

        for sock in due {
            let expired = self
                .requests
                .get(&sock)
                .is_some_and(|req| req.retries >= self.ctx.config.synack_retries);

            if expired {
                self.requests.remove(&sock);

                Stats::incr(&self.ctx.stats.request_timeouts);
                Stats::incr(&self.ctx.stats.failed_attempts);
                warn!("[{}] (SYN_RECEIVED) handshake timed out: dropping request", sock);

                continue;
            }

            let max_rto = self.ctx.config.max_rto;
            let Some(req) = self.requests.get_mut(&sock) else {
                continue;
            };

            req.retries += 1;
            req.rto = (req.rto * 2).min(max_rto);
            req.deadline = now + req.rto;

            Stats::incr(&self.ctx.stats.retransmissions);
            self.send_syn_ack(&sock, now)?;
        }

        Ok(())
    }

    /// A `RST` with the sequence number following the peer's `SYN` aborts
    /// the matching request.
    fn on_rst(&mut self, seg: &TcpSegment) {
        let sock = seg.socket();

        let matches = self
            .requests
            .get(&sock)
            .is_some_and(|req| seg.seq() == req.rcv_nxt());

        if matches {
            self.requests.remove(&sock);
            Stats::incr(&self.ctx.stats.resets_received);
            Stats::incr(&self.ctx.stats.failed_attempts);
            debug!("[{}] (SYN_RECEIVED) received RST: dropping request", sock);
        }
    }

    fn on_ack(&mut self, seg: &TcpSegment, now: Instant) -> Result<Option<Promotion>> {
        let sock = seg.socket();

        let Some(req) = self.requests.get(&sock) else {
            return self.on_cookie_ack(seg, now);
        };

        //   If SND.UNA =< SEG.ACK =< SND.NXT then enter ESTABLISHED state
        if seg.ack() != req.iss.wrapping_add(1) {
            debug!(
                "[{}] (SYN_RECEIVED) ACK {} does not match ISS {}: dropping",
                sock,
                seg.ack(),
                req.iss
            );
            return Ok(None);
        }

        let rcv_wnd = self.rcv_wnd(req.data.len());
        if !seq::in_window(seg.seq(), seg.seg_len(), req.rcv_nxt(), rcv_wnd) {
            debug!(
                "[{}] (SYN_RECEIVED) seq={} outside the window: dropping",
                sock,
                seg.seq()
            );
            return Ok(None);
        }

        if self.accept_queue_full() {
            Stats::incr(&self.ctx.stats.listen_overflows);
            warn!(
                "[{}] (SYN_RECEIVED) accept queue full: dropping completing ACK",
                sock
            );
            return Ok(None);
        }

        debug!("[{}] (SYN_RECEIVED) received ACK of SYN: promoting", sock);

        Ok(Some(Promotion {
            sock,
            iss: req.iss,
            irs: req.irs,
            peer_mss: req.peer_mss,
            sack_ok: req.sack_ok,
            ts_ok: req.ts_ok,
            ts_recent: seg
                .tcp
                .options()
                .timestamps()
                .map_or(req.ts_recent, |(val, _)| val),
            data: req.data.clone(),
            from_cookie: false,
            ack: seg.clone(),
        }))
    }

    /// Completes a handshake no request exists for, when the `ACK` echoes a
    /// valid cookie.
    fn on_cookie_ack(&mut self, seg: &TcpSegment, now: Instant) -> Result<Option<Promotion>> {
        let sock = seg.socket();

        let window = self.ctx.config.syncookie_granularity * (self.ctx.config.syncookie_max_age + 1);
        let recent = self
            .last_cookie
            .is_some_and(|at| now.saturating_duration_since(at) <= window);

        if !self.ctx.config.syncookies || !recent {
            debug!("[{}] (LISTEN) ACK without request: sending RST", sock);
            return self.reset_reply(seg).map(|()| None);
        }

        let irs = seg.seq().wrapping_sub(1);
        let cookie = seg.ack().wrapping_sub(1);

        let mss = self
            .ctx
            .cookies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .validate(&sock, irs, cookie, now);

        let Some(peer_mss) = mss else {
            Stats::incr(&self.ctx.stats.cookies_rejected);
            warn!("[{}] (LISTEN) invalid SYN cookie: sending RST", sock);
            return self.reset_reply(seg).map(|()| None);
        };

        if self.accept_queue_full() {
            Stats::incr(&self.ctx.stats.listen_overflows);
            warn!("[{}] (LISTEN) accept queue full: dropping cookie ACK", sock);
            return Ok(None);
        }

        Stats::incr(&self.ctx.stats.cookies_accepted);
        debug!("[{}] (LISTEN) valid SYN cookie: promoting", sock);

        Ok(Some(Promotion {
            sock,
            iss: cookie,
            irs,
            peer_mss,
            sack_ok: false,
            ts_ok: false,
            ts_recent: 0,
            data: Vec::new(),
            from_cookie: true,
            ack: seg.clone(),
        }))
    }

    fn on_syn(
        &mut self,
        seg: &TcpSegment,
        adv_mss: u16,
        isn: Option<u32>,
        now: Instant,
    ) -> Result<()> {
        let sock = seg.socket();

        if let Some(req) = self.requests.get_mut(&sock) {
            if req.irs == seg.seq() {
                debug!("[{}] (SYN_RECEIVED) SYN retransmitted: resending SYN_ACK", sock);
                return self.send_syn_ack(&sock, now);
            }

            debug!("[{}] (SYN_RECEIVED) new SYN: replacing request", sock);
            self.requests.remove(&sock);
        }

        if self.accept_queue_full() {
            Stats::incr(&self.ctx.stats.listen_drops);
            warn!("[{}] (LISTEN) accept queue full: dropping SYN", sock);
            return Ok(());
        }

        let options = seg.tcp.options();
        let peer_mss = options.mss().unwrap_or(self.ctx.config.default_mss);

        if self.requests.len() >= self.backlog {
            if !self.ctx.config.syncookies {
                Stats::incr(&self.ctx.stats.listen_drops);
                warn!("[{}] (LISTEN) SYN backlog full: dropping SYN", sock);
                return Ok(());
            }

            return self.send_cookie(seg, adv_mss, peer_mss, now);
        }

        let config = &self.ctx.config;

        let data = if config.fast_open {
            seg.payload.clone()
        } else {
            Vec::new()
        };

        let ts = options.timestamps();
        let iss = isn.unwrap_or_else(|| self.ctx.isn.generate(&sock, now));

        let req = Request {
            sock,
            iss,
            irs: seg.seq(),
            peer_mss,
            adv_mss,
            sack_ok: config.sack && options.sack_permitted(),
            ts_ok: config.timestamps && ts.is_some(),
            ts_recent: ts.map_or(0, |(val, _)| val),
            data,
            retries: 0,
            created: now,
            rto: config.initial_rto,
            deadline: now + config.initial_rto,
        };

        debug!(
            "[{}] (LISTEN) received SYN, sending SYN_ACK: LISTEN -> SYN_RECEIVED",
            sock
        );

        self.requests.insert(sock, req);
        self.send_syn_ack(&sock, now)
    }

    /// Answers a `SYN` statelessly, encoding the handshake in our ISN.
    fn send_cookie(
        &mut self,
        seg: &TcpSegment,
        adv_mss: u16,
        peer_mss: u16,
        now: Instant,
    ) -> Result<()> {
        let sock = seg.socket();

        let (cookie, _) = self
            .ctx
            .cookies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .encode(&sock, seg.seq(), peer_mss, now);

        let mut syn_ack = TcpHeader::new(
            sock.local.port,
            sock.remote.port,
            cookie,
            self.rcv_wnd(0) as u16,
        );

        syn_ack.set_syn();
        syn_ack.set_ack();
        syn_ack.set_ack_number(seg.seq().wrapping_add(1));
        syn_ack.set_option_mss(adv_mss)?;

        Stats::incr(&self.ctx.stats.cookies_sent);
        self.last_cookie = Some(now);

        debug!("[{}] (LISTEN) SYN backlog full: sending SYN cookie", sock);

        self.emit(sock, syn_ack)
    }

    fn send_syn_ack(&mut self, sock: &Socket, now: Instant) -> Result<()> {
        let Some(req) = self.requests.get(sock) else {
            return Ok(());
        };

        let mut syn_ack = TcpHeader::new(
            sock.local.port,
            sock.remote.port,
            req.iss,
            self.rcv_wnd(req.data.len()) as u16,
        );

        syn_ack.set_syn();
        syn_ack.set_ack();
        syn_ack.set_ack_number(req.rcv_nxt());
        syn_ack.set_option_mss(req.adv_mss)?;

        if req.sack_ok {
            syn_ack.set_option_sack_permitted()?;
        }

        if req.ts_ok {
            syn_ack.set_option_timestamps(self.ctx.timestamp(now), req.ts_recent)?;
        }

        self.emit(*sock, syn_ack)
    }

    fn emit(&mut self, sock: Socket, tcp: TcpHeader) -> Result<()> {
        let seg = TcpSegment::build(sock, tcp, &[], self.ctx.config.ttl)?;

        debug!("[{}] (LISTEN) sending {}", sock, seg);
        self.outbox.push(seg);

        Ok(())
    }

    fn reset_reply(&mut self, seg: &TcpSegment) -> Result<()> {
        if let Some(rst) = seg.reset_reply(self.ctx.config.ttl)? {
            Stats::incr(&self.ctx.stats.resets_sent);
            debug!("[{}] (LISTEN) sending {}", seg.socket(), rst);
            self.outbox.push(rst);
        }

        Ok(())
    }

    /// Receive window of a new connection holding `buffered` bytes.
    fn rcv_wnd(&self, buffered: usize) -> u32 {
        let free = self.ctx.config.recv_buffer.saturating_sub(buffered);
        free.min(u16::MAX as usize) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const CLIENT_ISN: u32 = 1000;

    fn listener(config: Config, backlog: usize, now: Instant) -> Listener<u32> {
        let ctx = Arc::new(Context::new(config, now));
        Listener::new(ctx, SocketAddr::new([10, 0, 0, 1], 80), backlog)
    }

    /// 4-tuple as seen by the client.
    fn client(port: u16) -> Socket {
        Socket::new(
            SocketAddr::new([10, 0, 0, 2], port),
            SocketAddr::new([10, 0, 0, 1], 80),
        )
    }

    fn syn(from: Socket, seq: u32, payload: &[u8]) -> TcpSegment {
        let mut tcp = TcpHeader::new(from.local.port, from.remote.port, seq, 65535);
        tcp.set_syn();
        tcp.set_option_mss(1460).unwrap();
        tcp.set_option_sack_permitted().unwrap();

        let seg = TcpSegment::build(from, tcp, payload, 64).unwrap();
        TcpSegment::parse(&seg.to_be_bytes().unwrap()).unwrap()
    }

    fn ack(from: Socket, seq: u32, ack: u32) -> TcpSegment {
        let mut tcp = TcpHeader::new(from.local.port, from.remote.port, seq, 65535);
        tcp.set_ack();
        tcp.set_ack_number(ack);

        let seg = TcpSegment::build(from, tcp, &[], 64).unwrap();
        TcpSegment::parse(&seg.to_be_bytes().unwrap()).unwrap()
    }

    fn rst(from: Socket, seq: u32) -> TcpSegment {
        let mut tcp = TcpHeader::new(from.local.port, from.remote.port, seq, 0);
        tcp.set_rst();

        let seg = TcpSegment::build(from, tcp, &[], 64).unwrap();
        TcpSegment::parse(&seg.to_be_bytes().unwrap()).unwrap()
    }

    #[test]
    fn handshake_promotes_once() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);

        assert!(lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap()
            .is_none());

        let out = lst.take_outbox();
        assert_eq!(out.len(), 1);
        let syn_ack = &out[0];
        assert!(syn_ack.tcp.syn() && syn_ack.tcp.ack());
        assert_eq!(syn_ack.ack(), CLIENT_ISN + 1);
        assert_eq!(syn_ack.tcp.options().mss(), Some(1460));
        assert!(syn_ack.tcp.options().sack_permitted());
        assert_eq!(lst.pending_requests(), 1);

        let iss = syn_ack.seq();
        let completing = ack(client(40000), CLIENT_ISN + 1, iss.wrapping_add(1));

        let promotion = lst
            .on_segment(&completing, 1460, None, now)
            .unwrap()
            .unwrap();
        assert_eq!(promotion.iss, iss);
        assert_eq!(promotion.irs, CLIENT_ISN);
        assert_eq!(promotion.peer_mss, 1460);
        assert!(promotion.sack_ok);
        assert!(!promotion.from_cookie);
        assert_eq!(lst.pending_requests(), 1);
        lst.complete(&promotion.sock, 1);
        assert_eq!(lst.pending_requests(), 0);

        // No request remains and no cookie was sent: the replay is reset.
        assert!(lst.on_segment(&completing, 1460, None, now)
            .unwrap()
            .is_none());
        let out = lst.take_outbox();
        assert_eq!(out.len(), 1);
        assert!(out[0].tcp.rst());

        assert_eq!(lst.accept(), Some(1));
        assert_eq!(lst.accept(), None);
    }

    #[test]
    fn request_survives_until_completed() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);
        let from = client(40000);

        lst.on_segment(&syn(from, CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        let iss = lst.take_outbox()[0].seq();

        // The connection was never queued: the retransmitted ACK promotes
        // again instead of drawing a RST.
        let completing = ack(from, CLIENT_ISN + 1, iss.wrapping_add(1));
        let first = lst.on_segment(&completing, 1460, None, now).unwrap().unwrap();
        let again = lst.on_segment(&completing, 1460, None, now).unwrap().unwrap();

        assert_eq!(first.iss, again.iss);
        assert!(lst.take_outbox().is_empty());
        assert_eq!(lst.pending_requests(), 1);

        lst.complete(&again.sock, 7);
        assert_eq!(lst.pending_requests(), 0);
        assert_eq!(lst.accept(), Some(7));
    }

    #[test]
    fn bad_ack_number_keeps_request() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);

        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        let iss = lst.take_outbox()[0].seq();

        let bad = ack(client(40000), CLIENT_ISN + 1, iss.wrapping_add(7));
        assert!(lst.on_segment(&bad, 1460, None, now).unwrap().is_none());
        assert_eq!(lst.pending_requests(), 1);

        let good = ack(client(40000), CLIENT_ISN + 1, iss.wrapping_add(1));
        assert!(lst.on_segment(&good, 1460, None, now).unwrap().is_some());
    }

    #[test]
    fn syn_retransmission_refreshes_request() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);
        let from = client(40000);

        lst.on_segment(&syn(from, CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        lst.on_segment(&syn(from, CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();

        let out = lst.take_outbox();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].seq(), out[1].seq());
        assert_eq!(lst.pending_requests(), 1);

        // A different ISN replaces the request.
        lst.on_segment(&syn(from, 5000, &[]), 1460, None, now)
            .unwrap();
        assert_eq!(lst.pending_requests(), 1);
        assert_eq!(lst.request(&from.reversed()).unwrap().irs(), 5000);
    }

    #[test]
    fn rst_removes_request() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);
        let from = client(40000);

        lst.on_segment(&syn(from, CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        lst.take_outbox();

        lst.on_segment(&rst(from, CLIENT_ISN + 5), 1460, None, now)
            .unwrap();
        assert_eq!(lst.pending_requests(), 1);

        lst.on_segment(&rst(from, CLIENT_ISN + 1), 1460, None, now)
            .unwrap();
        assert_eq!(lst.pending_requests(), 0);

        // Never RST in response to RST.
        assert!(lst.take_outbox().is_empty());
    }

    #[test]
    fn full_backlog_falls_back_to_cookies() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 1, now);

        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        lst.on_segment(&syn(client(40001), 7000, &[]), 1460, None, now)
            .unwrap();

        assert_eq!(lst.pending_requests(), 1);

        let out = lst.take_outbox();
        assert_eq!(out.len(), 2);
        let cookie_syn_ack = &out[1];
        assert!(!cookie_syn_ack.tcp.options().sack_permitted());
        assert_eq!(lst.ctx.stats.snapshot().cookies_sent, 1);

        let cookie = cookie_syn_ack.seq();

        // A tampered ACK number is rejected.
        let tampered = ack(client(40001), 7001, cookie.wrapping_add(2));
        assert!(lst.on_segment(&tampered, 1460, None, now)
            .unwrap()
            .is_none());
        assert_eq!(lst.ctx.stats.snapshot().cookies_rejected, 1);
        assert!(lst.take_outbox()[0].tcp.rst());

        let valid = ack(client(40001), 7001, cookie.wrapping_add(1));
        let promotion = lst
            .on_segment(&valid, 1460, None, now + Duration::from_secs(1))
            .unwrap()
            .unwrap();

        assert!(promotion.from_cookie);
        assert_eq!(promotion.iss, cookie);
        assert_eq!(promotion.irs, 7000);
        assert_eq!(promotion.peer_mss, 1460);
        assert!(!promotion.sack_ok && !promotion.ts_ok);
        assert_eq!(lst.ctx.stats.snapshot().cookies_accepted, 1);
    }

    #[test]
    fn stale_cookie_rejected() {
        let now = Instant::now();
        let config = Config {
            syncookie_granularity: Duration::from_secs(1),
            syncookie_max_age: 2,
            ..Default::default()
        };
        let mut lst = listener(config, 1, now);

        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        lst.on_segment(&syn(client(40001), 7000, &[]), 1460, None, now)
            .unwrap();
        let cookie = lst.take_outbox()[1].seq();

        // Keep cookies in use.
        let later = now + Duration::from_secs(5);
        lst.on_segment(&syn(client(40002), 9000, &[]), 1460, None, later)
            .unwrap();

        let valid = ack(client(40001), 7001, cookie.wrapping_add(1));
        assert!(lst.on_segment(&valid, 1460, None, later)
            .unwrap()
            .is_none());
        assert_eq!(lst.ctx.stats.snapshot().cookies_rejected, 1);
    }

    #[test]
    fn cookies_disabled_drops_syn() {
        let now = Instant::now();
        let config = Config {
            syncookies: false,
            ..Default::default()
        };
        let mut lst = listener(config, 1, now);

        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        lst.on_segment(&syn(client(40001), 7000, &[]), 1460, None, now)
            .unwrap();

        assert_eq!(lst.take_outbox().len(), 1);
        assert_eq!(lst.ctx.stats.snapshot().listen_drops, 1);
    }

    #[test]
    fn full_accept_queue_keeps_request() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 1, now);

        lst.complete(&client(1).reversed(), 0);

        // SYNs are shed while the queue is full.
        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        assert_eq!(lst.pending_requests(), 0);
        assert!(lst.take_outbox().is_empty());

        assert_eq!(lst.accept(), Some(0));
        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        let iss = lst.take_outbox()[0].seq();

        lst.complete(&client(1).reversed(), 0);

        let completing = ack(client(40000), CLIENT_ISN + 1, iss.wrapping_add(1));
        assert!(lst.on_segment(&completing, 1460, None, now)
            .unwrap()
            .is_none());
        assert_eq!(lst.pending_requests(), 1);
        assert_eq!(lst.ctx.stats.snapshot().listen_overflows, 1);

        lst.accept();
        assert!(lst.on_segment(&completing, 1460, None, now)
            .unwrap()
            .is_some());
    }

    #[test]
    fn syn_ack_retransmitted_then_request_expires() {
        let now = Instant::now();
        let config = Config {
            synack_retries: 2,
            ..Default::default()
        };
        let mut lst = listener(config, 8, now);

        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, None, now)
            .unwrap();
        lst.take_outbox();

        let first = lst.next_deadline().unwrap();
        assert_eq!(first, now + Duration::from_secs(1));

        lst.on_timer(first).unwrap();
        assert_eq!(lst.take_outbox().len(), 1);

        let second = lst.next_deadline().unwrap();
        assert_eq!(second, first + Duration::from_secs(2));

        lst.on_timer(second).unwrap();
        let third = lst.next_deadline().unwrap();
        lst.on_timer(third).unwrap();

        assert_eq!(lst.pending_requests(), 0);
        assert_eq!(lst.next_deadline(), None);
        assert_eq!(lst.ctx.stats.snapshot().request_timeouts, 1);
    }

    #[test]
    fn fast_open_data_is_kept_and_acknowledged() {
        let now = Instant::now();
        let config = Config {
            fast_open: true,
            ..Default::default()
        };
        let mut lst = listener(config, 8, now);
        let from = client(40000);

        lst.on_segment(&syn(from, CLIENT_ISN, b"early"), 1460, None, now)
            .unwrap();

        let syn_ack = lst.take_outbox().remove(0);
        assert_eq!(syn_ack.ack(), CLIENT_ISN + 6);

        let completing = ack(from, CLIENT_ISN + 6, syn_ack.seq().wrapping_add(1));
        let promotion = lst
            .on_segment(&completing, 1460, None, now)
            .unwrap()
            .unwrap();
        assert_eq!(promotion.data, b"early");
    }

    #[test]
    fn isn_override_is_used() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);

        lst.on_segment(&syn(client(40000), CLIENT_ISN, &[]), 1460, Some(424242), now)
            .unwrap();
        assert_eq!(lst.take_outbox()[0].seq(), 424242);
    }

    #[test]
    fn stray_segments_get_reset() {
        let now = Instant::now();
        let mut lst = listener(Config::default(), 8, now);
        let from = client(40000);

        let mut tcp = TcpHeader::new(40000, 80, 77, 65535);
        tcp.set_syn();
        tcp.set_ack();
        tcp.set_ack_number(99);
        let syn_ack = TcpSegment::build(from, tcp, &[], 64).unwrap();
        let syn_ack = TcpSegment::parse(&syn_ack.to_be_bytes().unwrap()).unwrap();

        lst.on_segment(&syn_ack, 1460, None, now).unwrap();

        let out = lst.take_outbox();
        assert_eq!(out.len(), 1);
        assert!(out[0].tcp.rst() && !out[0].tcp.ack());
        assert_eq!(out[0].seq(), 99);
        assert_eq!(lst.pending_requests(), 0);
    }
}
