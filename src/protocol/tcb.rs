//! Transmission Control Block (TCB).
//!
//! The per-connection record: sequence spaces, buffers, retransmission
//! bookkeeping, and the user operations acting on them. Segment arrival and
//! timer expiry are handled in [super::fsm].

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::congestion::{AckEvent, AckSample, CongestionControl, Window};
use super::context::Context;
use super::fsm::ConnectionState;
use super::headers::{SackBlock, TcpHeader};
use super::listener::Promotion;
use super::reassembly::Reassembly;
use super::time_wait::TimeWait;
use super::timer::{PendingReason, RttEstimator, Timers};
use super::{Socket, TcpSegment, seq};
use crate::stats::Stats;
use crate::{Error, Result};
use crate::{debug, warn};

/// Floor of the tail-loss probe timeout.
const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);

/// Segment sent to the peer and not yet fully acknowledged.
///
/// Only the metadata and payload are kept; headers are regenerated on
/// retransmission so they carry the current `ACK` and window.
#[derive(Debug)]
pub(super) struct InFlight {
    /// First sequence number occupied.
    pub(super) seq: u32,
    /// Sequence space occupied, `SYN` and `FIN` included.
    pub(super) len: u32,
    pub(super) syn: bool,
    pub(super) fin: bool,
    pub(super) payload: Vec<u8>,
    /// Time of the latest (re)transmission.
    pub(super) sent_at: Instant,
    /// Set once retransmitted; such segments give no RTT sample (Karn).
    pub(super) retransmitted: bool,
    /// Covered by a SACK block from the peer.
    pub(super) sacked: bool,
}

impl InFlight {
    /// Returns the sequence number following the segment.
    pub(super) fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len)
    }
}

/// Send Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers of unacknowledged data
///        3 - sequence numbers allowed for new data transmission
///        4 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SendSeqSpace {
    /// SND.UNA - send unacknowledged
    pub una: u32,
    /// SND.NXT - send next
    pub nxt: u32,
    /// SND.WND - send window
    pub wnd: u32,
    /// SND.WL1 - segment sequence number used for last window update
    pub wl1: u32,
    /// SND.WL2 - segment acknowledgment number used for last window update
    pub wl2: u32,
    /// ISS     - initial send sequence number
    pub iss: u32,
}

/// Receive Sequence Space.
///
/// (RFC 793 3.2)
///
/// ```text
///                       1          2          3
///                   ----------|----------|----------
///                          RCV.NXT    RCV.NXT
///                                    +RCV.WND
///
///        1 - old sequence numbers which have been acknowledged
///        2 - sequence numbers allowed for new reception
///        3 - future sequence numbers which are not yet allowed
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvSeqSpace {
    /// RCV.NXT - receive next
    pub nxt: u32,
    /// RCV.WND - receive window, as last advertised
    pub wnd: u32,
    /// Highest `RCV.NXT` acknowledged to the peer
    pub acked: u32,
    /// IRS     - initial receive sequence number
    pub irs: u32,
}

/// Transmission Control Block (TCB).
#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub struct TCB {
    /// Current state of the TCP connection.
    pub(super) state: ConnectionState,
    /// Socket addresses of the local and remote TCPs.
    pub(super) sock: Socket,
    pub(super) snd: SendSeqSpace,
    pub(super) rcv: RecvSeqSpace,
    /// Sender maximum segment size, bounded by the peer's MSS and the path.
    pub(super) mss: u16,
    /// MSS advertised to the peer.
    pub(super) adv_mss: u16,
    pub(super) window: Window,
    pub(super) cc: Box<dyn CongestionControl>,
    pub(super) rtt: RttEstimator,
    pub(super) timers: Timers,
    /// Consecutive retransmissions or unanswered probes.
    pub(super) retries: u32,
    /// Segments awaiting acknowledgment, ordered by sequence number.
    pub(super) in_flight: VecDeque<InFlight>,
    /// Data written by the user and not yet sent.
    pub(super) snd_buf: VecDeque<u8>,
    /// The user closed the connection; a `FIN` follows the buffered data.
    pub(super) fin_queued: bool,
    /// Sequence number of our `FIN`, once sent.
    pub(super) fin_seq: Option<u32>,
    /// In-order data not yet read by the user.
    pub(super) rcv_buf: VecDeque<u8>,
    /// Out-of-order data beyond `RCV.NXT`.
    pub(super) reassembly: Reassembly,
    /// Sequence number of a peer `FIN` received ahead of missing data.
    pub(super) peer_fin: Option<u32>,
    /// The peer's `FIN` was consumed; reads past the buffer see end of file.
    pub(super) fin_received: bool,
    pub(super) sack_ok: bool,
    pub(super) ts_ok: bool,
    /// TS.Recent of RFC 7323.
    pub(super) ts_recent: u32,
    /// Duplicate range to report in the next ACK.
    pub(super) dsack: Option<SackBlock>,
    pub(super) dup_acks: u32,
    /// Recovery point (`SND.NXT` on entering fast recovery).
    pub(super) recovery: Option<u32>,
    /// A tail-loss probe went out for the current flight.
    pub(super) tlp_sent: bool,
    pub(super) keepalive: bool,
    /// Unanswered keepalive probes.
    pub(super) probes: u32,
    /// The user handle was dropped.
    pub(super) orphaned: bool,
    /// Error reported to every subsequent user operation.
    pub(super) error: Option<io::ErrorKind>,
    outbox: Vec<TcpSegment>,
    pub(super) ctx: Arc<Context>,
}

impl TCB {
    fn new(
        ctx: Arc<Context>,
        state: ConnectionState,
        sock: Socket,
        iss: u32,
        adv_mss: u16,
        cc: Box<dyn CongestionControl>,
    ) -> Self {
        let config = &ctx.config;
        let mss = config.default_mss.min(adv_mss);

        TCB {
            state,
            sock,
            snd: SendSeqSpace {
                una: iss,
                // Account for the SYN.
                nxt: iss.wrapping_add(1),
                iss,
                ..Default::default()
            },
            rcv: RecvSeqSpace::default(),
            mss,
            adv_mss,
            window: Window::initial(u32::from(mss)),
            cc,
            rtt: RttEstimator::new(config.initial_rto, config.min_rto, config.max_rto),
            timers: Timers::default(),
            retries: 0,
            in_flight: VecDeque::new(),
            snd_buf: VecDeque::new(),
            fin_queued: false,
            fin_seq: None,
            rcv_buf: VecDeque::new(),
            reassembly: Reassembly::new(),
            peer_fin: None,
            fin_received: false,
            sack_ok: config.sack,
            ts_ok: config.timestamps,
            ts_recent: 0,
            dsack: None,
            dup_acks: 0,
            recovery: None,
            tlp_sent: false,
            keepalive: false,
            probes: 0,
            orphaned: false,
            error: None,
            outbox: Vec::new(),
            ctx,
        }
    }

    /// Initiates a new TCP connection on `sock` with initial send sequence
    /// number `iss`. The `SYN` is left in the outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SYN` segment could not be constructed.
    pub fn connect(
        ctx: Arc<Context>,
        sock: Socket,
        iss: u32,
        adv_mss: u16,
        cc: Box<dyn CongestionControl>,
        now: Instant,
    ) -> Result<Self> {
        let mut conn = Self::new(ctx, ConnectionState::SYN_SENT, sock, iss, adv_mss, cc);

        // <SEQ=ISS><CTL=SYN>
        conn.create_syn(now)?;
        conn.in_flight.push_back(InFlight {
            seq: iss,
            len: 1,
            syn: true,
            fin: false,
            payload: Vec::new(),
            sent_at: now,
            retransmitted: false,
            sacked: false,
        });
        conn.timers
            .arm(PendingReason::Retransmit, now + conn.rtt.backed_off());

        Stats::incr(&conn.ctx.stats.active_opens);
        debug!(
            "[{}] (CLOSED) constructing SYN: CLOSED/ACTIVE_OPEN -> SYN_SENT",
            conn.sock
        );

        Ok(conn)
    }

    /// Creates the TCB of a handshake completed against a listener. The
    /// completing `ACK` is processed as well when it carries data or a
    /// `FIN`.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment answering the `ACK` could not be
    /// constructed.
    pub fn accept(
        ctx: Arc<Context>,
        promotion: Promotion,
        adv_mss: u16,
        cc: Box<dyn CongestionControl>,
        now: Instant,
    ) -> Result<Self> {
        let Promotion {
            sock,
            iss,
            irs,
            peer_mss,
            sack_ok,
            ts_ok,
            ts_recent,
            data,
            ack,
            ..
        } = promotion;

        let mut conn = Self::new(ctx, ConnectionState::ESTABLISHED, sock, iss, adv_mss, cc);

        let fast_open = data.len() as u32;

        conn.snd.una = conn.snd.nxt;
        conn.snd.wnd = u32::from(ack.tcp.window());
        conn.snd.wl1 = ack.seq();
        conn.snd.wl2 = ack.ack();

        conn.rcv.irs = irs;
        conn.rcv.nxt = irs.wrapping_add(1).wrapping_add(fast_open);
        conn.rcv.acked = conn.rcv.nxt;
        conn.reassembly.advance(data.len());
        conn.rcv_buf.extend(data);
        conn.rcv.wnd = conn.rcv_space();

        conn.mss = peer_mss.min(adv_mss);
        conn.window = Window::initial(u32::from(conn.mss));
        conn.sack_ok = sack_ok;
        conn.ts_ok = ts_ok;
        conn.ts_recent = ts_recent;

        Stats::incr(&conn.ctx.stats.passive_opens);
        debug!(
            "[{}] (SYN_RECEIVED) handshake completed: SYN_RECEIVED -> ESTABLISHED",
            conn.sock
        );

        if !ack.payload.is_empty() || ack.tcp.fin() {
            conn.on_segment(&ack, now)?;
        }

        Ok(conn)
    }

    /// Returns the current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the 4-tuple of the connection.
    pub fn socket(&self) -> Socket {
        self.sock
    }

    /// Returns the send sequence space.
    pub fn snd(&self) -> &SendSeqSpace {
        &self.snd
    }

    /// Returns the receive sequence space.
    pub fn rcv(&self) -> &RecvSeqSpace {
        &self.rcv
    }

    /// Returns the congestion window and slow-start threshold.
    pub fn congestion_window(&self) -> Window {
        self.window
    }

    /// Returns the pending error, if the connection failed.
    pub fn error(&self) -> Option<io::ErrorKind> {
        self.error
    }

    /// Returns the number of bytes waiting in the out-of-order buffer.
    pub fn out_of_order_len(&self) -> usize {
        self.reassembly.len()
    }

    /// Returns the number of bytes ready to be read.
    pub fn readable_len(&self) -> usize {
        self.rcv_buf.len()
    }

    /// Returns the earliest armed timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Removes and returns the segments waiting to be transmitted.
    pub fn take_outbox(&mut self) -> Vec<TcpSegment> {
        mem::take(&mut self.outbox)
    }

    /// Returns the outcome of an active open: `None` while the handshake is
    /// in progress.
    pub fn poll_connect(&self) -> Option<Result<()>> {
        match self.state {
            ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED => None,
            ConnectionState::CLOSED => Some(Err(self
                .error
                .map(Error::from_kind)
                .unwrap_or_else(Error::not_connected))),
            _ => Some(Ok(())),
        }
    }

    /// Queues `buf` for transmission, returning the number of bytes accepted.
    ///
    /// Data written during the handshake is held until the connection is
    /// established.
    ///
    /// # Errors
    ///
    /// - [io::ErrorKind::WouldBlock] if the send buffer is full.
    /// - [io::ErrorKind::BrokenPipe] once the connection was closed for
    ///   sending.
    /// - [io::ErrorKind::NotConnected] if the connection is closed.
    /// - The failure of the connection, if it was reset or timed out.
    pub fn send(&mut self, buf: &[u8], now: Instant) -> Result<usize> {
        if let Some(kind) = self.error {
            return Err(Error::from_kind(kind));
        }

        match self.state {
            ConnectionState::CLOSED | ConnectionState::LISTEN => {
                return Err(Error::not_connected());
            }
            ConnectionState::SYN_SENT
            | ConnectionState::SYN_RECEIVED
            | ConnectionState::ESTABLISHED
            | ConnectionState::CLOSE_WAIT
                if !self.fin_queued => {}
            _ => return Err(Error::broken_pipe()),
        }

        if buf.is_empty() {
            return Ok(0);
        }

        let used = self.snd_buf.len() + self.flight_size() as usize;
        let space = self.ctx.config.send_buffer.saturating_sub(used);

        if space == 0 {
            return Err(Error::would_block());
        }

        let n = space.min(buf.len());
        self.snd_buf.extend(&buf[..n]);

        self.flush(now)?;

        Ok(n)
    }

    /// Copies in-order received data into `buf`, returning the number of
    /// bytes written. `Ok(0)` signals the peer closed its side.
    ///
    /// # Errors
    ///
    /// - [io::ErrorKind::WouldBlock] if no data is available yet.
    /// - [io::ErrorKind::NotConnected] if the connection is closed.
    /// - The failure of the connection, if it was reset or timed out.
    pub fn recv(&mut self, buf: &mut [u8], now: Instant) -> Result<usize> {
        if !self.rcv_buf.is_empty() {
            let n = buf.len().min(self.rcv_buf.len());

            for (dst, src) in buf.iter_mut().zip(self.rcv_buf.drain(..n)) {
                *dst = src;
            }

            // Announce a window that reopened past one segment.
            let mss = u32::from(self.mss);
            if self.state.is_synchronized() && self.rcv.wnd < mss && self.rcv_space() >= mss {
                debug!(
                    "[{}] ({:?}) receive window reopened: sending window update",
                    self.sock, self.state
                );
                self.create_ack(now)?;
            }

            return Ok(n);
        }

        if let Some(kind) = self.error {
            return Err(Error::from_kind(kind));
        }

        if self.fin_received {
            return Ok(0);
        }

        match self.state {
            ConnectionState::CLOSED => Err(Error::not_connected()),
            _ => Err(Error::would_block()),
        }
    }

    /// Closes the connection for sending. Buffered data is transmitted
    /// followed by a `FIN`; reads keep working until the peer's `FIN`.
    ///
    /// Closing with unread received data resets the connection (RFC 2525
    /// 2.17). Closing an already closed connection does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment could not be constructed.
    pub fn close(&mut self, now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::SYN_SENT => {
                self.terminate(None, "close call received");
            }
            ConnectionState::SYN_RECEIVED => {
                // <SEQ=SND.NXT><CTL=RST>
                self.create_rst(self.snd.nxt, None)?;
                self.terminate(None, "close call received, sending RST");
            }
            ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT
                if !self.rcv_buf.is_empty() =>
            {
                warn!(
                    "[{}] ({:?}) closing with {} unread bytes",
                    self.sock,
                    self.state,
                    self.rcv_buf.len()
                );

                self.create_rst(self.snd.nxt, None)?;
                self.terminate(None, "close call with unread data, sending RST");
            }
            ConnectionState::ESTABLISHED => {
                self.fin_queued = true;
                self.transition(ConnectionState::FIN_WAIT_1, "close call received");
                self.flush(now)?;
            }
            ConnectionState::CLOSE_WAIT => {
                // CLOSE-WAIT STATE
                //
                // Queue this request until all preceding SENDs have been
                // segmentized; then send a FIN segment, enter CLOSING state.
                //
                // The state is LAST_ACK as amended by RFC 1122 4.2.2.20.
                self.fin_queued = true;
                self.transition(ConnectionState::LAST_ACK, "close call received");
                self.flush(now)?;
            }
            _ => {
                debug!(
                    "[{}] ({:?}) close call received: ignoring",
                    self.sock, self.state
                );
            }
        }

        Ok(())
    }

    /// Aborts the connection, sending a `RST` if the peer holds state for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the `RST` segment could not be constructed.
    pub fn abort(&mut self) -> Result<()> {
        if matches!(
            self.state,
            ConnectionState::CLOSED | ConnectionState::SYN_SENT | ConnectionState::TIME_WAIT
        ) {
            self.terminate(None, "abort call received");
            return Ok(());
        }

        self.create_rst(self.snd.nxt, None)?;
        self.terminate(None, "abort call received, sending RST");

        Ok(())
    }

    /// Enables or disables keepalive probing.
    pub fn set_keepalive(&mut self, enabled: bool, now: Instant) {
        self.keepalive = enabled;
        self.probes = 0;

        let deadline = (enabled && self.state.is_synchronized())
            .then(|| now + self.ctx.config.keepalive_time);
        self.timers.set_keepalive(deadline);
    }

    /// Marks the connection as no longer owned by a user handle.
    pub fn orphan(&mut self, now: Instant) {
        self.orphaned = true;

        if self.state == ConnectionState::FIN_WAIT_2 {
            self.timers
                .set_fin_wait2(Some(now + self.ctx.config.fin_timeout));
        }
    }

    /// Returns the `TIME_WAIT` record standing in for this connection.
    pub fn to_time_wait(&self, now: Instant) -> TimeWait {
        TimeWait::new(
            self.sock,
            self.snd.nxt,
            self.rcv.nxt,
            self.rcv_space(),
            self.ts_ok.then_some(self.ts_recent),
            now + self.ctx.config.time_wait_len(),
        )
    }

    /// Returns the sequence space in flight.
    pub(super) fn flight_size(&self) -> u32 {
        self.snd.nxt.wrapping_sub(self.snd.una)
    }

    /// Returns the receive window to advertise.
    pub(super) fn rcv_space(&self) -> u32 {
        let free = self
            .ctx
            .config
            .recv_buffer
            .saturating_sub(self.rcv_buf.len());

        free.min(u16::MAX as usize) as u32
    }

    /// Moves to `to`, logging the transition.
    pub(super) fn transition(&mut self, to: ConnectionState, reason: &str) {
        debug!(
            "[{}] ({from:?}) {reason}: {from:?} -> {to:?}",
            self.sock,
            from = self.state
        );

        self.state = to;
    }

    /// Moves to `CLOSED`, discarding all queues. `error` is reported to
    /// subsequent user operations.
    pub(super) fn terminate(&mut self, error: Option<io::ErrorKind>, reason: &str) {
        self.transition(ConnectionState::CLOSED, reason);

        if error.is_some() {
            self.error = error;
            self.rcv_buf.clear();
        }

        self.timers.clear();
        self.in_flight.clear();
        self.snd_buf.clear();
        self.reassembly.clear();
        self.fin_queued = false;
        self.recovery = None;
    }

    /// Transmits as much buffered data as the send and congestion windows
    /// allow, followed by a queued `FIN`, then arms the retransmission or
    /// probe timer.
    pub(super) fn flush(&mut self, now: Instant) -> Result<()> {
        let can_send = matches!(
            self.state,
            ConnectionState::ESTABLISHED
                | ConnectionState::CLOSE_WAIT
                | ConnectionState::FIN_WAIT_1
                | ConnectionState::CLOSING
                | ConnectionState::LAST_ACK
        ) && self.fin_seq.is_none();

        if !can_send {
            return Ok(());
        }

        let mss = u32::from(self.mss);

        loop {
            let wnd = self.snd.wnd.min(self.window.cwnd);
            let usable = wnd.saturating_sub(self.flight_size());
            let len = (self.snd_buf.len() as u32).min(mss).min(usable) as usize;

            if len == 0 {
                break;
            }

            let payload: Vec<u8> = self.snd_buf.drain(..len).collect();
            let fin = self.fin_queued && self.snd_buf.is_empty();

            self.send_new(payload, fin, now)?;
        }

        if self.fin_queued && self.fin_seq.is_none() && self.snd_buf.is_empty() {
            self.send_new(Vec::new(), true, now)?;
        }

        self.arm_send_timers(now);

        Ok(())
    }

    fn send_new(&mut self, payload: Vec<u8>, fin: bool, now: Instant) -> Result<()> {
        let seq = self.snd.nxt;
        let tcp = self.data_header(seq, &payload, fin, now)?;
        self.emit(tcp, &payload)?;

        let len = payload.len() as u32 + fin as u32;
        if fin {
            self.fin_seq = Some(seq.wrapping_add(payload.len() as u32));
        }

        self.snd.nxt = seq.wrapping_add(len);
        self.in_flight.push_back(InFlight {
            seq,
            len,
            syn: false,
            fin,
            payload,
            sent_at: now,
            retransmitted: false,
            sacked: false,
        });

        Ok(())
    }

    /// Keeps the retransmission/probe slot consistent with what is in
    /// flight (RFC 6298 5.1, RFC 1122 4.2.2.17).
    pub(super) fn arm_send_timers(&mut self, now: Instant) {
        let pending = self.timers.pending().map(|(_, reason)| reason);

        if self.in_flight.is_empty() {
            if self.snd.wnd == 0 && !self.snd_buf.is_empty() {
                if pending != Some(PendingReason::ZeroWindowProbe) {
                    self.timers.arm(
                        PendingReason::ZeroWindowProbe,
                        now + self.rtt.backed_off(),
                    );
                }
            } else if pending.is_some() {
                self.timers.disarm();
            }

            return;
        }

        if matches!(pending, None | Some(PendingReason::ZeroWindowProbe)) {
            self.timers
                .arm(PendingReason::Retransmit, now + self.rtt.backed_off());
        }

        self.arm_tail_loss_probe(now);
    }

    fn arm_tail_loss_probe(&mut self, now: Instant) {
        if !self.ctx.config.tlp
            || self.tlp_sent
            || !self.snd_buf.is_empty()
            || self.recovery.is_some()
        {
            return;
        }

        let (Some(srtt), Some((deadline, PendingReason::Retransmit))) =
            (self.rtt.srtt(), self.timers.pending())
        else {
            return;
        };

        let at = now + (srtt * 2).max(MIN_TLP_TIMEOUT);
        if at < deadline {
            self.timers.arm(PendingReason::TailLossProbe, at);
        }
    }

    /// Retransmits the in-flight segment at `idx`, regenerating its header.
    pub(super) fn retransmit(&mut self, idx: usize, now: Instant) -> Result<()> {
        let Some(entry) = self.in_flight.get_mut(idx) else {
            return Ok(());
        };

        entry.retransmitted = true;
        entry.sent_at = now;

        let (seq, syn, fin) = (entry.seq, entry.syn, entry.fin);
        let payload = entry.payload.clone();

        Stats::incr(&self.ctx.stats.retransmissions);
        debug!(
            "[{}] ({:?}) retransmitting seq={} len={}",
            self.sock,
            self.state,
            seq,
            payload.len()
        );

        if syn {
            return match self.state {
                ConnectionState::SYN_SENT => self.create_syn(now),
                _ => self.create_syn_ack(now),
            };
        }

        let tcp = self.data_header(seq, &payload, fin, now)?;
        self.emit(tcp, &payload)
    }

    /// Removes fully acknowledged segments and trims a partially
    /// acknowledged one. Returns an RTT sample unless a retransmitted
    /// segment was acknowledged (Karn's algorithm).
    pub(super) fn ack_in_flight(&mut self, ack: u32, now: Instant) -> Option<Duration> {
        let mut sample = None;
        let mut ambiguous = false;

        while let Some(front) = self.in_flight.front_mut() {
            if seq::before_eq(front.end(), ack) {
                ambiguous |= front.retransmitted;
                sample = Some(now.saturating_duration_since(front.sent_at));
                self.in_flight.pop_front();
            } else {
                if seq::after(ack, front.seq) && !front.syn {
                    let n = ack.wrapping_sub(front.seq);
                    let drained = (n as usize).min(front.payload.len());

                    front.payload.drain(..drained);
                    front.seq = ack;
                    front.len -= n;
                }

                break;
            }
        }

        if ambiguous { None } else { sample }
    }

    /// Hands an ACK or loss event to the congestion control strategy.
    pub(super) fn congestion_event(
        &mut self,
        event: AckEvent,
        bytes_acked: u32,
        rtt: Option<Duration>,
        in_flight: u32,
    ) {
        let sample = AckSample {
            bytes_acked,
            rtt,
            event,
            mss: u32::from(self.mss),
            in_flight,
        };

        self.window = self.cc.on_ack(&sample, self.window);
    }

    /// Returns a header carrying `seq`, the receive window, and the
    /// timestamps option when negotiated.
    fn header(&mut self, seq: u32, now: Instant) -> Result<TcpHeader> {
        self.rcv.wnd = self.rcv_space();

        let mut tcp = TcpHeader::new(
            self.sock.local.port,
            self.sock.remote.port,
            seq,
            self.rcv.wnd as u16,
        );

        if self.ts_ok {
            tcp.set_option_timestamps(self.ctx.timestamp(now), self.ts_recent)?;
        }

        Ok(tcp)
    }

    fn ack_header(&mut self, seq: u32, now: Instant) -> Result<TcpHeader> {
        let mut tcp = self.header(seq, now)?;

        tcp.set_ack_number(self.rcv.nxt);
        tcp.set_ack();

        Ok(tcp)
    }

    fn data_header(
        &mut self,
        seq: u32,
        payload: &[u8],
        fin: bool,
        now: Instant,
    ) -> Result<TcpHeader> {
        let mut tcp = self.ack_header(seq, now)?;

        if !payload.is_empty() {
            tcp.set_psh();
        }

        if fin {
            tcp.set_fin();
        }

        Ok(tcp)
    }

    /// Builds the segment and queues it in the outbox. Any segment carrying
    /// an `ACK` satisfies a pending delayed ACK.
    fn emit(&mut self, tcp: TcpHeader, payload: &[u8]) -> Result<()> {
        if tcp.ack() {
            self.rcv.acked = tcp.ack_number();
            self.timers.disarm_delayed_ack();
        }

        let seg = TcpSegment::build(self.sock, tcp, payload, self.ctx.config.ttl)?;

        debug!("[{}] ({:?}) sending {}", self.sock, self.state, seg);
        self.outbox.push(seg);

        Ok(())
    }

    /// Creates a `SYN` segment to initiate a connection.
    pub(super) fn create_syn(&mut self, now: Instant) -> Result<()> {
        let mut syn = self.header(self.snd.iss, now)?;

        syn.set_syn();
        syn.set_option_mss(self.adv_mss)?;
        if self.sack_ok {
            syn.set_option_sack_permitted()?;
        }

        self.emit(syn, &[])
    }

    /// Creates a `SYN_ACK` segment answering a simultaneous open.
    pub(super) fn create_syn_ack(&mut self, now: Instant) -> Result<()> {
        let mut syn_ack = self.ack_header(self.snd.iss, now)?;

        syn_ack.set_syn();
        syn_ack.set_option_mss(self.adv_mss)?;
        if self.sack_ok {
            syn_ack.set_option_sack_permitted()?;
        }

        self.emit(syn_ack, &[])
    }

    /// Creates an `ACK` segment carrying SACK blocks for out-of-order data
    /// and a pending DSACK block.
    pub(super) fn create_ack(&mut self, now: Instant) -> Result<()> {
        let mut ack = self.ack_header(self.snd.nxt, now)?;

        if self.sack_ok {
            let mut blocks = heapless::Vec::<SackBlock, 5>::new();

            if self.ctx.config.dsack {
                if let Some(dsack) = self.dsack.take() {
                    let _ = blocks.push(dsack);
                }
            }

            for block in self.reassembly.sack_blocks(self.rcv.nxt).iter() {
                let _ = blocks.push(*block);
            }

            ack.set_option_sack(&blocks);
        }

        self.dsack = None;
        self.emit(ack, &[])
    }

    /// Creates a probe `<SEQ=SND.UNA-1><CTL=ACK>` eliciting an ACK from the
    /// peer, for keepalive and zero-window probing.
    pub(super) fn create_probe(&mut self, now: Instant) -> Result<()> {
        let probe = self.ack_header(self.snd.una.wrapping_sub(1), now)?;
        self.emit(probe, &[])
    }

    /// Answers `seg` with the `RST` prescribed when no connection state
    /// accounts for it.
    pub(super) fn reset_reply(&mut self, seg: &TcpSegment) -> Result<()> {
        if let Some(rst) = seg.reset_reply(self.ctx.config.ttl)? {
            Stats::incr(&self.ctx.stats.resets_sent);
            debug!("[{}] ({:?}) sending {}", self.sock, self.state, rst);
            self.outbox.push(rst);
        }

        Ok(())
    }

    /// Creates an `RST` segment, with an `ACK` when `ack` is given.
    pub(super) fn create_rst(&mut self, seq: u32, ack: Option<u32>) -> Result<()> {
        let mut rst = TcpHeader::new(self.sock.local.port, self.sock.remote.port, seq, 0);

        rst.set_rst();

        if let Some(ack) = ack {
            rst.set_ack_number(ack);
            rst.set_ack();
        }

        Stats::incr(&self.ctx.stats.resets_sent);

        // Does not satisfy a delayed ACK.
        let seg = TcpSegment::build(self.sock, rst, &[], self.ctx.config.ttl)?;
        debug!("[{}] ({:?}) sending {}", self.sock, self.state, seg);
        self.outbox.push(seg);

        Ok(())
    }
}
