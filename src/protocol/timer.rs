//! Per-connection timer state: RTT estimation and the deadline slots a
//! connection can arm.

use std::time::{Duration, Instant};

/// Clock granularity `G` of RFC 6298.
const CLOCK_GRANULARITY: Duration = Duration::from_millis(1);

/// Longest shift applied when backing off the RTO.
const MAX_BACKOFF: u32 = 16;

/// Round-trip time estimator and retransmission timeout (RFC 6298).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    backoff: u32,
}

impl RttEstimator {
    /// Creates an estimator with no samples, starting at `initial` RTO.
    pub fn new(initial: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial.clamp(min_rto, max_rto),
            min_rto,
            max_rto,
            backoff: 0,
        }
    }

    /// Feeds one RTT measurement. Callers must not sample retransmitted
    /// segments (Karn's algorithm).
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };

                // RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                // SRTT <- (1 - alpha) * SRTT + alpha * R'
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }

        let srtt = self.srtt.unwrap_or(rtt);
        let rto = srtt + (self.rttvar * 4).max(CLOCK_GRANULARITY);

        self.rto = rto.clamp(self.min_rto, self.max_rto);
    }

    /// Returns the smoothed RTT, if any sample was taken.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// Returns the RTO without backoff.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Returns the RTO with the current exponential backoff applied.
    pub fn backed_off(&self) -> Duration {
        self.rto
            .saturating_mul(1 << self.backoff.min(MAX_BACKOFF))
            .min(self.max_rto)
    }

    /// Doubles the effective timeout.
    pub fn backoff(&mut self) {
        self.backoff = (self.backoff + 1).min(MAX_BACKOFF);
    }

    /// Clears the backoff after forward progress.
    pub fn reset_backoff(&mut self) {
        self.backoff = 0;
    }

    /// Returns the number of consecutive backoffs.
    pub fn backoff_count(&self) -> u32 {
        self.backoff
    }
}

/// Purpose of the single retransmission/probe slot. Arming the slot with a
/// new reason replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReason {
    /// Retransmit the earliest unacknowledged segment.
    Retransmit,
    /// Probe a zero receive window.
    ZeroWindowProbe,
    /// Retransmit the last segment to elicit SACK feedback (tail-loss
    /// probe).
    TailLossProbe,
    /// Give up waiting for more duplicate ACKs and enter recovery.
    ReorderTimeout,
}

/// A timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expired {
    /// The retransmission/probe slot.
    Pending(PendingReason),
    /// Delayed acknowledgment.
    DelayedAck,
    /// Keepalive probe or idle check.
    Keepalive,
    /// Orphaned connection lingering in `FIN_WAIT_2`.
    FinWait2,
}

/// Deadline slots of one connection.
#[derive(Debug, Default, Clone)]
pub struct Timers {
    pending: Option<(Instant, PendingReason)>,
    delayed_ack: Option<Instant>,
    keepalive: Option<Instant>,
    fin_wait2: Option<Instant>,
}

impl Timers {
    /// Arms the retransmission/probe slot, replacing any previous reason.
    pub fn arm(&mut self, reason: PendingReason, at: Instant) {
        self.pending = Some((at, reason));
    }

    /// Returns the armed reason and its deadline.
    pub fn pending(&self) -> Option<(Instant, PendingReason)> {
        self.pending
    }

    /// Disarms the retransmission/probe slot.
    pub fn disarm(&mut self) {
        self.pending = None;
    }

    /// Arms the delayed-ACK timer unless it is already running.
    pub fn arm_delayed_ack(&mut self, at: Instant) {
        self.delayed_ack.get_or_insert(at);
    }

    /// Returns `true` if an ACK is being held back.
    pub fn delayed_ack_armed(&self) -> bool {
        self.delayed_ack.is_some()
    }

    /// Disarms the delayed-ACK timer.
    pub fn disarm_delayed_ack(&mut self) {
        self.delayed_ack = None;
    }

    /// Sets or clears the keepalive deadline.
    pub fn set_keepalive(&mut self, at: Option<Instant>) {
        self.keepalive = at;
    }

    /// Sets or clears the `FIN_WAIT_2` deadline.
    pub fn set_fin_wait2(&mut self, at: Option<Instant>) {
        self.fin_wait2 = at;
    }

    /// Disarms every slot.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Returns the earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.pending.map(|(at, _)| at),
            self.delayed_ack,
            self.keepalive,
            self.fin_wait2,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Disarms and returns every slot whose deadline is at or before `now`.
    pub fn take_expired(&mut self, now: Instant) -> heapless::Vec<Expired, 4> {
        let mut expired = heapless::Vec::new();

        if let Some((at, reason)) = self.pending {
            if at <= now {
                self.pending = None;
                let _ = expired.push(Expired::Pending(reason));
            }
        }

        if self.delayed_ack.is_some_and(|at| at <= now) {
            self.delayed_ack = None;
            let _ = expired.push(Expired::DelayedAck);
        }

        if self.keepalive.is_some_and(|at| at <= now) {
            self.keepalive = None;
            let _ = expired.push(Expired::Keepalive);
        }

        if self.fin_wait2.is_some_and(|at| at <= now) {
            self.fin_wait2 = None;
            let _ = expired.push(Expired::FinWait2);
        }

        expired
    }
}
