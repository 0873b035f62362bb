//! TCP finite state machine (FSM), as described in [RFC 793].
//!
//! Segment arrival and timer expiry for an existing [TCB]. Listening sockets
//! and `TIME_WAIT` are handled by [super::listener] and [super::time_wait].
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

use std::io;
use std::time::Instant;

use super::congestion::{AckEvent, Window};
use super::headers::SackBlock;
use super::tcb::TCB;
use super::timer::{Expired, PendingReason};
use super::{TcpSegment, seq};
use crate::Result;
use crate::stats::Stats;
use crate::{debug, warn};

/// Control bits other than `ACK` and `PSH`.
const NOT_FAST_PATH: u8 = !0b01_1000 & 0x3F;

/// Different TCP connection states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum ConnectionState {
    /// Represents waiting for a connection request from any remote TCP and
    /// port.
    LISTEN,
    /// Represents waiting for a matching connection request after having sent a
    /// connection request.
    SYN_SENT,
    /// Represents waiting for a confirming connection request acknowledgment
    /// after having both received and sent a connection request.
    SYN_RECEIVED,
    /// Represents an open connection, data received can be delivered to the
    /// user. The normal state for the data transfer phase of the connection.
    ESTABLISHED,
    /// Represents waiting for a connection termination request from the remote
    /// TCP, or an acknowledgment of the connection termination request
    /// previously sent.
    FIN_WAIT_1,
    /// Represents waiting for a connection termination request from the remote
    /// TCP.
    FIN_WAIT_2,
    /// Represents waiting for a connection termination request from the local
    /// user.
    CLOSE_WAIT,
    /// Represents waiting for a connection termination request acknowledgment
    /// from the remote TCP.
    CLOSING,
    /// Represents waiting for an acknowledgment of the connection termination
    /// request previously sent to the remote TCP (which includes an
    /// acknowledgment of its connection termination request).
    LAST_ACK,
    /// Represents waiting for enough time to pass to be sure the remote TCP
    /// received the acknowledgment of its connection termination request.
    TIME_WAIT,
    /// Represents no connection state at all.
    CLOSED,
}

impl ConnectionState {
    /// Returns `true` for the states reached after both `SYN`s were
    /// acknowledged.
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            ConnectionState::LISTEN
                | ConnectionState::SYN_SENT
                | ConnectionState::SYN_RECEIVED
                | ConnectionState::CLOSED
        )
    }
}

impl TCB {
    /// Processes an incoming TCP segment for this connection. Segments to
    /// transmit in response are left in the outbox.
    ///
    /// The caller can determine if a connection is finished once its state
    /// is `CLOSED` (the cause, if any, is reported by [TCB::error]) or
    /// `TIME_WAIT`.
    ///
    /// TCP State Diagram.
    ///
    /// (RFC 793 3.2)
    ///
    /// ```text
    ///                              +---------+ ---------\      active OPEN
    ///                              |  CLOSED |            \    -----------
    ///                              +---------+<---------\   \   create TCB
    ///                                |     ^              \   \  snd SYN
    ///                   passive OPEN |     |   CLOSE        \   \
    ///                   ------------ |     | ----------       \   \
    ///                    create TCB  |     | delete TCB         \   \
    ///                                V     |                      \   \
    ///                              +---------+            CLOSE    |    \
    ///                              |  LISTEN |          ---------- |     |
    ///                              +---------+          delete TCB |     |
    ///                   rcv SYN      |     |     SEND              |     |
    ///                  -----------   |     |    -------            |     V
    /// +---------+      snd SYN,ACK  /       \   snd SYN          +---------+
    /// |         |<-----------------           ------------------>|         |
    /// |   SYN   |                    rcv SYN                     |   SYN   |
    /// |   RCVD  |<-----------------------------------------------|   SENT  |
    /// |         |                    snd ACK                     |         |
    /// |         |------------------           -------------------|         |
    /// +---------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +---------+
    ///   |           --------------   |     |   -----------
    ///   |                  x         |     |     snd ACK
    ///   |                            V     V
    ///   |  CLOSE                   +---------+
    ///   | -------                  |  ESTAB  |
    ///   | snd FIN                  +---------+
    ///   |                   CLOSE    |     |    rcv FIN
    ///   V                  -------   |     |    -------
    /// +---------+          snd FIN  /       \   snd ACK          +---------+
    /// |  FIN    |<-----------------           ------------------>|  CLOSE  |
    /// | WAIT-1  |------------------                              |   WAIT  |
    /// +---------+          rcv FIN  \                            +---------+
    ///   | rcv ACK of FIN   -------   |                            CLOSE  |
    ///   | --------------   snd ACK   |                           ------- |
    ///   V        x                   V                           snd FIN V
    /// +---------+                  +---------+                   +---------+
    /// |FINWAIT-2|                  | CLOSING |                   | LAST-ACK|
    /// +---------+                  +---------+                   +---------+
    ///   |                rcv ACK of FIN |                 rcv ACK of FIN |
    ///   |  rcv FIN       -------------- |    Timeout=2MSL -------------- |
    ///   |  -------              x       V    ------------        x       V
    ///    \ snd ACK                 +---------+delete TCB         +---------+
    ///     ------------------------>|TIME WAIT|------------------>| CLOSED  |
    ///                              +---------+                   +---------+
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if a segment to transmit could not be constructed.
    pub fn on_segment(&mut self, seg: &TcpSegment, now: Instant) -> Result<()> {
        debug!("[{}] ({:?}) received {}", self.sock, self.state, seg);

        match self.state {
            ConnectionState::CLOSED | ConnectionState::LISTEN => {
                debug!(
                    "[{}] ({:?}) no connection state: ignoring",
                    self.sock, self.state
                );
                return Ok(());
            }
            ConnectionState::SYN_SENT => return self.on_syn_sent(seg, now),
            _ => {}
        }

        if self.is_fast_path(seg) {
            self.on_activity(now);
            self.update_ts_recent(seg);
            self.process_ack(seg, now)?;

            let immediate = self.process_data(seg);
            self.flush(now)?;

            return self.schedule_ack(immediate, now);
        }

        // first check sequence number
        let rcv_wnd = self.rcv_space();
        if !seq::in_window(seg.seq(), seg.seg_len(), self.rcv.nxt, rcv_wnd) {
            return self.on_unacceptable(seg, rcv_wnd, now);
        }

        self.on_activity(now);
        self.update_ts_recent(seg);

        // second check the RST bit
        if seg.tcp.rst() {
            return self.on_rst(seg, now);
        }

        // fourth, check the SYN bit
        //
        //   If the SYN is in the window it is an error, send a reset, any
        //   outstanding RECEIVEs and SEND should receive "reset" responses,
        //   all segment queues should be flushed, the user should also
        //   receive an unsolicited general "connection reset" signal, enter
        //   the CLOSED state, delete the TCB, and return.
        if seg.tcp.syn() {
            warn!(
                "[{}] ({:?}) received SYN in window: sending RST",
                self.sock, self.state
            );

            self.reset_reply(seg)?;
            self.terminate(
                Some(io::ErrorKind::ConnectionReset),
                "received SYN in window",
            );

            return Ok(());
        }

        // fifth check the ACK field
        if !seg.tcp.ack() {
            debug!(
                "[{}] ({:?}) segment without ACK: dropping",
                self.sock, self.state
            );
            return Ok(());
        }

        if self.state == ConnectionState::SYN_RECEIVED {
            // If SND.UNA < SEG.ACK =< SND.NXT then enter ESTABLISHED state
            // and continue processing.
            if !(seq::after(seg.ack(), self.snd.una) && seq::before_eq(seg.ack(), self.snd.nxt)) {
                warn!(
                    "[{}] (SYN_RECEIVED) received unacceptable ACK {}: sending RST",
                    self.sock,
                    seg.ack()
                );
                return self.reset_reply(seg);
            }

            self.snd.wnd = u32::from(seg.tcp.window());
            self.snd.wl1 = seg.seq();
            self.snd.wl2 = seg.ack();
            self.transition(ConnectionState::ESTABLISHED, "received ACK of SYN");
            self.arm_keepalive(now);
        }

        // If the ACK acks something not yet sent (SEG.ACK > SND.NXT) then send
        // an ACK, drop the segment, and return (RFC 5961 5.2: rate limited).
        if seq::after(seg.ack(), self.snd.nxt) {
            if self.ctx.allow_challenge_ack(now) {
                debug!(
                    "[{}] ({:?}) ACK {} beyond SND.NXT {}: sending challenge ACK",
                    self.sock,
                    self.state,
                    seg.ack(),
                    self.snd.nxt
                );
                self.create_ack(now)?;
            }

            return Ok(());
        }

        self.process_ack(seg, now)?;

        if self.state == ConnectionState::CLOSED {
            return Ok(());
        }

        // seventh, process the segment text; eighth, check the FIN bit
        let immediate = self.process_data(seg);

        self.flush(now)?;
        self.schedule_ack(immediate, now)
    }

    /// Fires every expired timer of the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if a segment to transmit could not be constructed.
    pub fn on_timer(&mut self, now: Instant) -> Result<()> {
        let expired = self.timers.take_expired(now);

        for &timer in expired.iter() {
            if self.state == ConnectionState::CLOSED {
                break;
            }

            match timer {
                Expired::Pending(PendingReason::Retransmit) => self.on_retransmit_timeout(now)?,
                Expired::Pending(PendingReason::ZeroWindowProbe) => {
                    self.on_zero_window_probe(now)?
                }
                Expired::Pending(PendingReason::TailLossProbe) => self.on_tail_loss_probe(now)?,
                Expired::Pending(PendingReason::ReorderTimeout) => {
                    if self.recovery.is_none() && !self.in_flight.is_empty() {
                        debug!(
                            "[{}] ({:?}) reordering timeout: entering recovery",
                            self.sock, self.state
                        );
                        self.enter_recovery(now)?;
                    }
                }
                Expired::DelayedAck => {
                    if self.rcv.acked != self.rcv.nxt {
                        Stats::incr(&self.ctx.stats.delayed_acks);
                        self.create_ack(now)?;
                    }
                }
                Expired::Keepalive => self.on_keepalive(now)?,
                Expired::FinWait2 => {
                    if self.state == ConnectionState::FIN_WAIT_2 {
                        self.terminate(None, "FIN_WAIT_2 timeout");
                    }
                }
            }
        }

        Ok(())
    }

    fn on_syn_sent(&mut self, seg: &TcpSegment, now: Instant) -> Result<()> {
        // first check the ACK bit
        //
        //   If SEG.ACK =< ISS, or SEG.ACK > SND.NXT, send a reset (unless
        //   the RST bit is set, if so drop the segment and return)
        let acceptable_ack = if seg.tcp.ack() {
            if seq::before_eq(seg.ack(), self.snd.iss) || seq::after(seg.ack(), self.snd.nxt) {
                if seg.tcp.rst() {
                    debug!(
                        "[{}] (SYN_SENT) invalid ACK number {} with RST: ignoring",
                        self.sock,
                        seg.ack()
                    );
                    return Ok(());
                }

                warn!(
                    "[{}] (SYN_SENT) received invalid ACK {}: sending RST",
                    self.sock,
                    seg.ack()
                );

                // <SEQ=SEG.ACK><CTL=RST>
                return self.reset_reply(seg);
            }

            true
        } else {
            false
        };

        // second check the RST bit
        if seg.tcp.rst() {
            if acceptable_ack {
                Stats::incr(&self.ctx.stats.resets_received);
                Stats::incr(&self.ctx.stats.failed_attempts);
                self.terminate(
                    Some(io::ErrorKind::ConnectionRefused),
                    "received RST, connection refused",
                );
            } else {
                debug!("[{}] (SYN_SENT) RST without ACK: ignoring", self.sock);
            }

            return Ok(());
        }

        // fourth check the SYN bit
        if !seg.tcp.syn() {
            debug!("[{}] (SYN_SENT) did not receive SYN: ignoring", self.sock);
            return Ok(());
        }

        self.rcv.irs = seg.seq();
        self.rcv.nxt = seg.seq().wrapping_add(1);

        let options = seg.tcp.options();
        let peer_mss = options.mss().unwrap_or(self.ctx.config.default_mss);

        self.mss = peer_mss.min(self.adv_mss);
        self.window = Window::initial(u32::from(self.mss));
        self.sack_ok &= options.sack_permitted();

        match options.timestamps() {
            Some((val, _)) if self.ts_ok => self.ts_recent = val,
            _ => self.ts_ok = false,
        }

        self.snd.wnd = u32::from(seg.tcp.window());
        self.snd.wl1 = seg.seq();
        self.snd.wl2 = seg.ack();

        if !acceptable_ack {
            // Simultaneous open: our SYN stays in flight and is retransmitted
            // as a SYN_ACK from now on.
            self.transition(
                ConnectionState::SYN_RECEIVED,
                "received SYN, sending SYN_ACK",
            );

            // <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
            return self.create_syn_ack(now);
        }

        self.snd.una = seg.ack();

        if let Some(rtt) = self.ack_in_flight(seg.ack(), now) {
            self.rtt.sample(rtt);
        }

        self.rtt.reset_backoff();
        self.retries = 0;
        self.timers.disarm();

        self.transition(ConnectionState::ESTABLISHED, "received SYN_ACK");
        self.arm_keepalive(now);

        // Data may ride on the SYN_ACK.
        self.process_data(seg);

        // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
        self.create_ack(now)?;

        // Release data written during the handshake.
        self.flush(now)
    }

    /// Returns `true` for in-sequence segments carrying nothing but data and
    /// an acknowledgment, processed without the general checks.
    ///
    /// The shortcut applies only where every general check would pass, so it
    /// calls the same helpers in the same order.
    fn is_fast_path(&self, seg: &TcpSegment) -> bool {
        self.state == ConnectionState::ESTABLISHED
            && seg.tcp.ack()
            && seg.tcp.control_bits() & NOT_FAST_PATH == 0
            && seg.seq() == self.rcv.nxt
            && u32::from(seg.tcp.window()) == self.snd.wnd
            && self.reassembly.is_empty()
            && self.peer_fin.is_none()
            && self.recovery.is_none()
            && seq::after_eq(seg.ack(), self.snd.una)
            && seq::before_eq(seg.ack(), self.snd.nxt)
            && seg.payload.len() as u32 <= self.rcv_space()
            && seg.tcp.options().sack_blocks().is_empty()
    }

    /// Answers a segment failing the acceptability test.
    ///
    ///   If an incoming segment is not acceptable, an acknowledgment should
    ///   be sent in reply (unless the RST bit is set, if so drop the segment
    ///   and return).
    fn on_unacceptable(&mut self, seg: &TcpSegment, rcv_wnd: u32, now: Instant) -> Result<()> {
        if seg.tcp.rst() {
            debug!(
                "[{}] ({:?}) RST out of window: ignoring",
                self.sock, self.state
            );
            return Ok(());
        }

        // With a zero window, valid ACKs are still processed.
        if rcv_wnd == 0
            && seg.seq() == self.rcv.nxt
            && seg.tcp.ack()
            && !seg.tcp.syn()
            && seq::before_eq(seg.ack(), self.snd.nxt)
        {
            self.on_activity(now);
            self.process_ack(seg, now)?;

            if self.state == ConnectionState::CLOSED {
                return Ok(());
            }

            self.flush(now)?;
        } else if !seg.payload.is_empty() && seq::before(seg.seq(), self.rcv.nxt) {
            // Entirely old data: report the duplicate (RFC 2883).
            let left = seg.seq().wrapping_add(seg.tcp.syn() as u32);
            let right = left.wrapping_add(seg.payload.len() as u32);

            if seq::before_eq(right, self.rcv.nxt) {
                self.dsack = Some(SackBlock { left, right });
            }
        }

        debug!(
            "[{}] ({:?}) unacceptable segment seq={} len={}: sending ACK",
            self.sock,
            self.state,
            seg.seq(),
            seg.seg_len()
        );

        self.create_ack(now)
    }

    /// Handles an in-window `RST` (RFC 5961 3.2): only an exact match of
    /// `RCV.NXT` resets the connection, any other draws a challenge ACK.
    fn on_rst(&mut self, seg: &TcpSegment, now: Instant) -> Result<()> {
        if seg.seq() != self.rcv.nxt {
            if self.ctx.allow_challenge_ack(now) {
                debug!(
                    "[{}] ({:?}) RST seq={} inexact: sending challenge ACK",
                    self.sock,
                    self.state,
                    seg.seq()
                );
                self.create_ack(now)?;
            }

            return Ok(());
        }

        Stats::incr(&self.ctx.stats.resets_received);

        let error = match self.state {
            // The passive side of a simultaneous open refused.
            ConnectionState::SYN_RECEIVED => {
                Stats::incr(&self.ctx.stats.failed_attempts);
                Some(io::ErrorKind::ConnectionRefused)
            }
            ConnectionState::CLOSING | ConnectionState::LAST_ACK | ConnectionState::TIME_WAIT => {
                None
            }
            _ => Some(io::ErrorKind::ConnectionReset),
        };

        warn!("[{}] ({:?}) connection reset by peer", self.sock, self.state);
        self.terminate(error, "received RST");

        Ok(())
    }

    /// Processes an acceptable `ACK` field: window update, removal of
    /// acknowledged segments, RTT sampling, congestion control, duplicate
    /// detection, and the close-sequence transitions driven by the ACK of
    /// our `FIN`.
    fn process_ack(&mut self, seg: &TcpSegment, now: Instant) -> Result<()> {
        let ack = seg.ack();

        // If the ACK is a duplicate (SEG.ACK < SND.UNA), it can be ignored.
        if seq::before(ack, self.snd.una) {
            debug!(
                "[{}] ({:?}) old ACK {}: ignoring",
                self.sock, self.state, ack
            );
            return Ok(());
        }

        let window = u32::from(seg.tcp.window());
        let prev_wnd = self.snd.wnd;
        let flight = self.flight_size();

        // If SND.WL1 < SEG.SEQ or (SND.WL1 = SEG.SEQ and SND.WL2 =< SEG.ACK),
        // set SND.WND <- SEG.WND, set SND.WL1 <- SEG.SEQ, and set
        // SND.WL2 <- SEG.ACK.
        if seq::before(self.snd.wl1, seg.seq())
            || (self.snd.wl1 == seg.seq() && seq::before_eq(self.snd.wl2, ack))
        {
            self.snd.wnd = window;
            self.snd.wl1 = seg.seq();
            self.snd.wl2 = ack;
        }

        if self.sack_ok {
            for block in seg.tcp.options().sack_blocks().iter() {
                for entry in self.in_flight.iter_mut() {
                    if seq::after_eq(entry.seq, block.left) && seq::before_eq(entry.end(), block.right)
                    {
                        entry.sacked = true;
                    }
                }
            }
        }

        // An answered zero-window probe.
        if matches!(
            self.timers.pending(),
            Some((_, PendingReason::ZeroWindowProbe))
        ) {
            self.retries = 0;
        }

        if seq::after(ack, self.snd.una) {
            let acked = ack.wrapping_sub(self.snd.una);
            self.snd.una = ack;

            let rtt = self.ack_in_flight(ack, now);
            if let Some(rtt) = rtt {
                self.rtt.sample(rtt);
            }

            self.rtt.reset_backoff();
            self.retries = 0;
            self.dup_acks = 0;
            self.tlp_sent = false;

            match self.recovery {
                Some(point) if seq::before(ack, point) => {
                    self.congestion_event(AckEvent::PartialAck, acked, rtt, flight);

                    // Retransmit the first unacknowledged segment (RFC 6582
                    // 3.2 step 5).
                    self.retransmit(0, now)?;
                }
                Some(_) => {
                    self.recovery = None;
                    self.congestion_event(AckEvent::RecoveryExit, acked, rtt, flight);
                }
                None => self.congestion_event(AckEvent::NewData, acked, rtt, flight),
            }

            // Restart the retransmission timer (RFC 6298 5.3).
            self.timers.disarm();
            self.arm_send_timers(now);
        } else if ack == self.snd.una
            && seg.payload.is_empty()
            && !seg.tcp.syn()
            && !seg.tcp.fin()
            && window == prev_wnd
            && !self.in_flight.is_empty()
        {
            self.on_duplicate_ack(now)?;
        }

        let fin_acked = self
            .fin_seq
            .is_some_and(|fin| seq::after(self.snd.una, fin));

        if fin_acked {
            match self.state {
                ConnectionState::FIN_WAIT_1 => {
                    self.transition(ConnectionState::FIN_WAIT_2, "received ACK of FIN");

                    if self.orphaned {
                        self.timers
                            .set_fin_wait2(Some(now + self.ctx.config.fin_timeout));
                    }
                }
                ConnectionState::CLOSING => {
                    self.timers.clear();
                    self.transition(ConnectionState::TIME_WAIT, "received ACK of FIN");
                }
                ConnectionState::LAST_ACK => {
                    self.terminate(None, "received ACK of FIN");
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn on_duplicate_ack(&mut self, now: Instant) -> Result<()> {
        self.dup_acks += 1;

        if self.recovery.is_some() {
            // Each duplicate signals a segment left the network.
            self.congestion_event(AckEvent::Duplicate, 0, None, self.flight_size());
            return self.flush(now);
        }

        if self.dup_acks >= self.ctx.config.dupack_threshold {
            return self.enter_recovery(now);
        }

        // SACKed data above the first hole: wait a fraction of the RTT for
        // reordering to resolve instead of more duplicates.
        if self.sack_ok && self.in_flight.iter().any(|entry| entry.sacked) {
            if let Some(srtt) = self.rtt.srtt() {
                self.timers
                    .arm(PendingReason::ReorderTimeout, now + srtt / 4);
            }
        }

        Ok(())
    }

    /// Fast retransmit followed by fast recovery (RFC 6582).
    fn enter_recovery(&mut self, now: Instant) -> Result<()> {
        let flight = self.flight_size();

        self.recovery = Some(self.snd.nxt);
        Stats::incr(&self.ctx.stats.fast_retransmits);

        debug!(
            "[{}] ({:?}) {} duplicate ACKs: fast retransmit of seq={}",
            self.sock, self.state, self.dup_acks, self.snd.una
        );

        self.congestion_event(AckEvent::FastRetransmit, 0, None, flight);
        self.retransmit(0, now)?;
        self.timers
            .arm(PendingReason::Retransmit, now + self.rtt.backed_off());

        Ok(())
    }

    /// Accepts the segment text and `FIN`. Returns `true` when the segment
    /// calls for an immediate acknowledgment: out-of-order or duplicate
    /// data, a filled gap, or a `FIN`.
    fn process_data(&mut self, seg: &TcpSegment) -> bool {
        if !matches!(
            self.state,
            ConnectionState::ESTABLISHED | ConnectionState::FIN_WAIT_1 | ConnectionState::FIN_WAIT_2
        ) {
            return false;
        }

        let mut immediate = false;
        let mut start = seg.seq().wrapping_add(seg.tcp.syn() as u32);
        let mut data = &seg.payload[..];
        let mut fin = seg
            .tcp
            .fin()
            .then(|| start.wrapping_add(data.len() as u32));

        // Drop the part already received.
        if seq::before(start, self.rcv.nxt) {
            let dup = (self.rcv.nxt.wrapping_sub(start) as usize).min(data.len());

            if dup > 0 {
                self.dsack = Some(SackBlock {
                    left: start,
                    right: start.wrapping_add(dup as u32),
                });
                immediate = true;
            }

            data = &data[dup..];
            start = start.wrapping_add(dup as u32);
        }

        if !data.is_empty() {
            let offset = start.wrapping_sub(self.rcv.nxt);
            let room = self.rcv_space().saturating_sub(offset) as usize;

            if data.len() > room {
                debug!(
                    "[{}] ({:?}) trimming {} bytes beyond the receive window",
                    self.sock,
                    self.state,
                    data.len() - room
                );

                data = &data[..room];
                fin = None;
            }

            if offset == 0 {
                self.rcv_buf.extend(data);
                self.rcv.nxt = self.rcv.nxt.wrapping_add(data.len() as u32);
                self.reassembly.advance(data.len());

                let filled = !self.reassembly.is_empty();
                while let Some(tail) = self.reassembly.pop() {
                    self.rcv.nxt = self.rcv.nxt.wrapping_add(tail.len() as u32);
                    self.rcv_buf.extend(tail);
                }

                // Acknowledge a filled gap at once (RFC 5681 4.2).
                immediate |= filled;
            } else if !data.is_empty() {
                let inserted = self.reassembly.insert(offset, data);

                debug!(
                    "[{}] ({:?}) out-of-order seq={} len={}: buffered {} new bytes",
                    self.sock,
                    self.state,
                    start,
                    data.len(),
                    inserted.new_bytes
                );

                if inserted.duplicate > 0 && self.dsack.is_none() {
                    self.dsack = Some(SackBlock {
                        left: start,
                        right: start.wrapping_add(data.len() as u32),
                    });
                }

                immediate = true;
            }
        }

        if let Some(fin) = fin {
            if seq::after_eq(fin, self.rcv.nxt) {
                self.peer_fin = Some(fin);
            }
        }

        // The FIN is consumed once every byte before it arrived.
        if self.peer_fin == Some(self.rcv.nxt) {
            self.peer_fin = None;
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.fin_received = true;
            immediate = true;

            match self.state {
                ConnectionState::ESTABLISHED => {
                    self.timers.set_keepalive(None);
                    self.transition(ConnectionState::CLOSE_WAIT, "received FIN");
                }
                ConnectionState::FIN_WAIT_1 => {
                    self.transition(ConnectionState::CLOSING, "received FIN");
                }
                ConnectionState::FIN_WAIT_2 => {
                    //   TIME-WAIT STATE
                    //
                    //   Enter the TIME-WAIT state. Start the time-wait timer,
                    //   turn off the other timers.
                    self.timers.clear();
                    self.transition(ConnectionState::TIME_WAIT, "received FIN");
                }
                _ => {}
            }
        }

        immediate
    }

    /// Sends an ACK now, or holds it back for the delayed-ACK interval.
    ///
    /// An ACK goes out at once when asked for, or once two full-sized
    /// segments are unacknowledged (RFC 1122 4.2.3.2).
    fn schedule_ack(&mut self, immediate: bool, now: Instant) -> Result<()> {
        if immediate {
            return self.create_ack(now);
        }

        let pending = self.rcv.nxt.wrapping_sub(self.rcv.acked);
        if pending == 0 {
            return Ok(());
        }

        if pending >= 2 * u32::from(self.mss) {
            return self.create_ack(now);
        }

        self.timers
            .arm_delayed_ack(now + self.ctx.config.delayed_ack);

        Ok(())
    }

    fn on_retransmit_timeout(&mut self, now: Instant) -> Result<()> {
        if self.in_flight.is_empty() {
            return Ok(());
        }

        Stats::incr(&self.ctx.stats.timeouts);

        let limit = match self.state {
            ConnectionState::SYN_SENT => self.ctx.config.syn_retries,
            ConnectionState::SYN_RECEIVED => self.ctx.config.synack_retries,
            _ => self.ctx.config.retries,
        };

        if self.retries >= limit {
            warn!(
                "[{}] ({:?}) no acknowledgment after {} retransmissions",
                self.sock, self.state, self.retries
            );

            Stats::incr(&self.ctx.stats.aborted_on_timeout);
            if !self.state.is_synchronized() {
                Stats::incr(&self.ctx.stats.failed_attempts);
            }

            self.terminate(
                Some(io::ErrorKind::TimedOut),
                "retransmission limit reached",
            );

            return Ok(());
        }

        self.retries += 1;

        if self.state.is_synchronized() {
            let flight = self.flight_size();
            self.congestion_event(AckEvent::Timeout, 0, None, flight);
        }

        self.recovery = None;
        self.dup_acks = 0;
        for entry in self.in_flight.iter_mut() {
            entry.sacked = false;
        }

        self.rtt.backoff();
        self.retransmit(0, now)?;
        self.timers
            .arm(PendingReason::Retransmit, now + self.rtt.backed_off());

        Ok(())
    }

    fn on_zero_window_probe(&mut self, now: Instant) -> Result<()> {
        if !(self.in_flight.is_empty() && !self.snd_buf.is_empty() && self.snd.wnd == 0) {
            self.arm_send_timers(now);
            return Ok(());
        }

        if self.retries >= self.ctx.config.retries {
            Stats::incr(&self.ctx.stats.aborted_on_timeout);
            self.terminate(
                Some(io::ErrorKind::TimedOut),
                "zero window probes unanswered",
            );

            return Ok(());
        }

        self.retries += 1;

        debug!(
            "[{}] ({:?}) peer window closed: sending probe",
            self.sock, self.state
        );

        self.create_probe(now)?;
        self.rtt.backoff();
        self.timers
            .arm(PendingReason::ZeroWindowProbe, now + self.rtt.backed_off());

        Ok(())
    }

    fn on_tail_loss_probe(&mut self, now: Instant) -> Result<()> {
        let Some(last) = self.in_flight.len().checked_sub(1) else {
            return Ok(());
        };

        self.tlp_sent = true;
        Stats::incr(&self.ctx.stats.tail_loss_probes);

        self.retransmit(last, now)?;
        self.timers
            .arm(PendingReason::Retransmit, now + self.rtt.backed_off());

        Ok(())
    }

    fn on_keepalive(&mut self, now: Instant) -> Result<()> {
        if !self.keepalive
            || !matches!(
                self.state,
                ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT
            )
        {
            return Ok(());
        }

        if self.probes >= self.ctx.config.keepalive_probes {
            Stats::incr(&self.ctx.stats.aborted_on_timeout);
            self.terminate(
                Some(io::ErrorKind::TimedOut),
                "keepalive probes unanswered",
            );

            return Ok(());
        }

        self.probes += 1;

        debug!(
            "[{}] ({:?}) idle: sending keepalive probe {}",
            self.sock, self.state, self.probes
        );

        self.create_probe(now)?;
        self.timers
            .set_keepalive(Some(now + self.ctx.config.keepalive_intvl));

        Ok(())
    }

    /// Records that the peer is alive.
    fn on_activity(&mut self, now: Instant) {
        self.probes = 0;
        self.arm_keepalive(now);
    }

    fn arm_keepalive(&mut self, now: Instant) {
        if self.keepalive && self.state.is_synchronized() {
            self.timers
                .set_keepalive(Some(now + self.ctx.config.keepalive_time));
        }
    }

    /// TS.Recent tracks the latest timestamp of a segment covering
    /// Last.ACK.sent (RFC 7323 4.3).
    fn update_ts_recent(&mut self, seg: &TcpSegment) {
        if !self.ts_ok {
            return;
        }

        if let Some((val, _)) = seg.tcp.options().timestamps() {
            if seq::before_eq(seg.seq(), self.rcv.acked) {
                self.ts_recent = val;
            }
        }
    }
}
