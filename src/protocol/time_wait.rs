//! Compact `TIME_WAIT` record.
//!
//! Once a connection reaches `TIME_WAIT` only the state needed to answer
//! stray duplicates is kept, replacing the full [super::tcb::TCB] in the
//! lookup table for `2 * MSL`.

use std::time::Instant;

use super::context::Context;
use super::headers::TcpHeader;
use super::{Socket, TcpSegment, seq};
use crate::Result;
use crate::debug;

/// Distance between the old `SND.NXT` and the ISN of a connection reusing
/// the 4-tuple, beyond any window the old peer could still accept.
const REUSE_ISN_OFFSET: u32 = 65535 + 2;

/// Outcome of a segment arriving for a `TIME_WAIT` record.
#[derive(Debug)]
pub enum TimeWaitAction {
    /// Discard the segment.
    Drop,
    /// Transmit the enclosed `ACK`.
    Ack(TcpSegment),
    /// Discard the record and the segment.
    Remove,
    /// Discard the record and hand the `SYN` to the listener, which must
    /// use `isn` as its initial sequence number.
    Reuse {
        /// ISN of the new connection.
        isn: u32,
    },
}

/// A connection lingering in `TIME_WAIT`.
#[derive(Debug, Clone)]
pub struct TimeWait {
    sock: Socket,
    snd_nxt: u32,
    rcv_nxt: u32,
    rcv_wnd: u32,
    /// Latest timestamp received from the peer, when negotiated.
    ts_recent: Option<u32>,
    expires: Instant,
}

impl TimeWait {
    /// Creates the record of a connection on `sock`, expiring at `expires`.
    pub fn new(
        sock: Socket,
        snd_nxt: u32,
        rcv_nxt: u32,
        rcv_wnd: u32,
        ts_recent: Option<u32>,
        expires: Instant,
    ) -> Self {
        Self {
            sock,
            snd_nxt,
            rcv_nxt,
            rcv_wnd,
            ts_recent,
            expires,
        }
    }

    /// Returns the 4-tuple of the old connection.
    pub fn socket(&self) -> Socket {
        self.sock
    }

    /// Returns the final `SND.NXT`.
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    /// Returns the final `RCV.NXT`.
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Returns the time the record expires.
    pub fn expires(&self) -> Instant {
        self.expires
    }

    /// Returns `true` once `2 * MSL` elapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    /// Returns `true` if the connection used timestamps, the condition for
    /// an active open to recycle the 4-tuple early.
    pub fn timestamps(&self) -> bool {
        self.ts_recent.is_some()
    }

    /// Returns the ISN of a new connection reusing the 4-tuple.
    pub fn reuse_isn(&self) -> u32 {
        self.snd_nxt.wrapping_add(REUSE_ISN_OFFSET)
    }

    /// Processes a segment for the 4-tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the `ACK` could not be constructed.
    pub fn process(
        &mut self,
        seg: &TcpSegment,
        ctx: &Context,
        now: Instant,
    ) -> Result<TimeWaitAction> {
        debug!("[{}] (TIME_WAIT) received {}", self.sock, seg);

        if self.is_expired(now) {
            return Ok(TimeWaitAction::Remove);
        }

        if seg.tcp.rst() {
            if seq::in_window(seg.seq(), 0, self.rcv_nxt, self.rcv_wnd) {
                debug!("[{}] (TIME_WAIT) received RST: closing", self.sock);
                return Ok(TimeWaitAction::Remove);
            }

            return Ok(TimeWaitAction::Drop);
        }

        if seg.tcp.syn() && !seg.tcp.ack() {
            let newer_ts = match (self.ts_recent, seg.tcp.options().timestamps()) {
                (Some(recent), Some((val, _))) => seq::after(val, recent),
                _ => false,
            };

            if seq::after(seg.seq(), self.rcv_nxt) || newer_ts {
                debug!(
                    "[{}] (TIME_WAIT) new SYN seq={}: recycling 4-tuple",
                    self.sock,
                    seg.seq()
                );
                return Ok(TimeWaitAction::Reuse {
                    isn: self.reuse_isn(),
                });
            }

            return self.ack(ctx, now).map(TimeWaitAction::Ack);
        }

        if let Some((val, _)) = seg.tcp.options().timestamps() {
            if self.ts_recent.is_some_and(|recent| seq::after(val, recent)) {
                self.ts_recent = Some(val);
            }
        }

        //   The only thing that can arrive in this state is a retransmission
        //   of the remote FIN. Acknowledge it, and restart the 2 MSL timeout.
        if seg.tcp.fin() && seg.end_seq() == self.rcv_nxt {
            self.expires = now + ctx.config.time_wait_len();
            return self.ack(ctx, now).map(TimeWaitAction::Ack);
        }

        // In-window pure ACKs are dropped; answering them would loop between
        // two records after a simultaneous close.
        if seg.payload.is_empty() && !seg.tcp.fin() && seg.seq() == self.rcv_nxt {
            return Ok(TimeWaitAction::Drop);
        }

        self.ack(ctx, now).map(TimeWaitAction::Ack)
    }

    fn ack(&self, ctx: &Context, now: Instant) -> Result<TcpSegment> {
        let mut tcp = TcpHeader::new(
            self.sock.local.port,
            self.sock.remote.port,
            self.snd_nxt,
            self.rcv_wnd.min(u16::MAX as u32) as u16,
        );

        tcp.set_ack();
        tcp.set_ack_number(self.rcv_nxt);

        if let Some(recent) = self.ts_recent {
            tcp.set_option_timestamps(ctx.timestamp(now), recent)?;
        }

        let seg = TcpSegment::build(self.sock, tcp, &[], ctx.config.ttl)?;
        debug!("[{}] (TIME_WAIT) sending {}", self.sock, seg);

        Ok(seg)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::protocol::SocketAddr;

    const SND_NXT: u32 = 5000;
    const RCV_NXT: u32 = 9000;

    fn sock() -> Socket {
        Socket::new(
            SocketAddr::new([10, 0, 0, 1], 80),
            SocketAddr::new([10, 0, 0, 2], 40000),
        )
    }

    fn record(ts: Option<u32>, now: Instant) -> TimeWait {
        TimeWait::new(sock(), SND_NXT, RCV_NXT, 65535, ts, now + Duration::from_secs(60))
    }

    fn segment(seq: u32, syn: bool, fin: bool, rst: bool, ts: Option<u32>) -> TcpSegment {
        let from = sock().reversed();
        let mut tcp = TcpHeader::new(from.local.port, from.remote.port, seq, 65535);

        if syn {
            tcp.set_syn();
        } else if !rst {
            tcp.set_ack();
            tcp.set_ack_number(SND_NXT);
        }
        if fin {
            tcp.set_fin();
        }
        if rst {
            tcp.set_rst();
        }
        if let Some(val) = ts {
            tcp.set_option_timestamps(val, 0).unwrap();
        }

        let seg = TcpSegment::build(from, tcp, &[], 64).unwrap();
        TcpSegment::parse(&seg.to_be_bytes().unwrap()).unwrap()
    }

    #[test]
    fn retransmitted_fin_is_acknowledged_and_restarts_timer() {
        let now = Instant::now();
        let ctx = Context::new(Config::default(), now);
        let mut tw = record(None, now);

        let later = now + Duration::from_secs(10);
        let action = tw
            .process(&segment(RCV_NXT - 1, false, true, false, None), &ctx, later)
            .unwrap();

        let TimeWaitAction::Ack(ack) = action else {
            panic!("expected ACK, got {action:?}");
        };
        assert_eq!(ack.seq(), SND_NXT);
        assert_eq!(ack.ack(), RCV_NXT);
        assert_eq!(tw.expires(), later + Duration::from_secs(60));
    }

    #[test]
    fn new_syn_recycles_with_offset_isn() {
        let now = Instant::now();
        let ctx = Context::new(Config::default(), now);
        let mut tw = record(None, now);

        let action = tw
            .process(&segment(RCV_NXT + 100, true, false, false, None), &ctx, now)
            .unwrap();
        assert!(matches!(
            action,
            TimeWaitAction::Reuse { isn } if isn == SND_NXT + 65537
        ));

        // An old SYN is answered with an ACK instead.
        let action = tw
            .process(&segment(RCV_NXT - 100, true, false, false, None), &ctx, now)
            .unwrap();
        assert!(matches!(action, TimeWaitAction::Ack(_)));
    }

    #[test]
    fn newer_timestamp_allows_reuse() {
        let now = Instant::now();
        let ctx = Context::new(Config::default(), now);
        let mut tw = record(Some(1000), now);

        let old = segment(RCV_NXT - 100, true, false, false, Some(900));
        assert!(matches!(
            tw.process(&old, &ctx, now).unwrap(),
            TimeWaitAction::Ack(_)
        ));

        let newer = segment(RCV_NXT - 100, true, false, false, Some(1001));
        assert!(matches!(
            tw.process(&newer, &ctx, now).unwrap(),
            TimeWaitAction::Reuse { .. }
        ));
    }

    #[test]
    fn rst_removes_and_pure_ack_is_dropped() {
        let now = Instant::now();
        let ctx = Context::new(Config::default(), now);
        let mut tw = record(None, now);

        assert!(matches!(
            tw.process(&segment(RCV_NXT, false, false, false, None), &ctx, now)
                .unwrap(),
            TimeWaitAction::Drop
        ));
        assert!(matches!(
            tw.process(&segment(RCV_NXT + 5, false, false, false, None), &ctx, now)
                .unwrap(),
            TimeWaitAction::Ack(_)
        ));
        assert!(matches!(
            tw.process(&segment(RCV_NXT, false, false, true, None), &ctx, now)
                .unwrap(),
            TimeWaitAction::Remove
        ));
    }

    #[test]
    fn expired_record_is_removed() {
        let now = Instant::now();
        let ctx = Context::new(Config::default(), now);
        let mut tw = record(None, now);

        let late = now + Duration::from_secs(61);
        assert!(tw.is_expired(late));
        assert!(matches!(
            tw.process(&segment(RCV_NXT, true, false, false, None), &ctx, late)
                .unwrap(),
            TimeWaitAction::Remove
        ));
    }
}
