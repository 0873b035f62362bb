//! Pluggable congestion control.
//!
//! The connection reports every acknowledgment and loss event to a
//! [CongestionControl] strategy, which returns the updated congestion window
//! and slow-start threshold. [NewReno] (RFC 5681, RFC 6582) is the default.

use std::fmt;
use std::time::Duration;

/// Congestion window and slow-start threshold, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Congestion window.
    pub cwnd: u32,
    /// Slow-start threshold.
    pub ssthresh: u32,
}

impl Window {
    /// Initial window for a connection with the given sender MSS.
    pub fn initial(mss: u32) -> Self {
        Self {
            cwnd: initial_cwnd(mss),
            ssthresh: u32::MAX,
        }
    }
}

/// What an acknowledgment told the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// New data acknowledged outside of loss recovery.
    NewData,
    /// Duplicate acknowledgment received during fast recovery.
    Duplicate,
    /// New data acknowledged during recovery, but not up to the recovery
    /// point.
    PartialAck,
    /// The recovery point was acknowledged.
    RecoveryExit,
    /// Loss inferred from duplicate acknowledgments.
    FastRetransmit,
    /// Loss inferred from a retransmission timeout.
    Timeout,
}

impl AckEvent {
    /// Returns `true` for the events that signal a loss.
    pub fn is_loss_event(&self) -> bool {
        matches!(self, AckEvent::FastRetransmit | AckEvent::Timeout)
    }
}

/// Input handed to a [CongestionControl] strategy.
#[derive(Debug, Clone, Copy)]
pub struct AckSample {
    /// Bytes newly acknowledged by this ACK.
    pub bytes_acked: u32,
    /// RTT measured from this ACK, if any (Karn's algorithm applies).
    pub rtt: Option<Duration>,
    /// Kind of event.
    pub event: AckEvent,
    /// Sender maximum segment size.
    pub mss: u32,
    /// Bytes outstanding before this ACK was applied.
    pub in_flight: u32,
}

/// Congestion control strategy invoked by a connection on each ACK and loss
/// event.
pub trait CongestionControl: Send + fmt::Debug {
    /// Name of the algorithm, for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns the window after applying `sample` to `window`.
    fn on_ack(&mut self, sample: &AckSample, window: Window) -> Window;
}

/// Initial congestion window of RFC 6928.
pub fn initial_cwnd(mss: u32) -> u32 {
    (10 * mss).min((2 * mss).max(14600))
}

/// TCP NewReno.
#[derive(Debug, Default, Clone, Copy)]
pub struct NewReno;

impl CongestionControl for NewReno {
    fn name(&self) -> &'static str {
        "newreno"
    }

    fn on_ack(&mut self, sample: &AckSample, window: Window) -> Window {
        let Window { cwnd, ssthresh } = window;
        let mss = sample.mss.max(1);

        match sample.event {
            AckEvent::NewData => {
                let cwnd = if cwnd < ssthresh {
                    // Slow start (RFC 5681 3.1, L = 1 SMSS).
                    cwnd.saturating_add(sample.bytes_acked.min(mss))
                } else {
                    // Congestion avoidance.
                    cwnd.saturating_add((mss * mss / cwnd.max(1)).max(1))
                };

                Window { cwnd, ssthresh }
            }
            AckEvent::Duplicate => Window {
                cwnd: cwnd.saturating_add(mss),
                ssthresh,
            },
            AckEvent::PartialAck => {
                // Deflate by the amount acknowledged, add back one segment
                // (RFC 6582 3.2 step 5).
                let cwnd = cwnd.saturating_sub(sample.bytes_acked).saturating_add(mss);

                Window {
                    cwnd: cwnd.max(mss),
                    ssthresh,
                }
            }
            AckEvent::RecoveryExit => Window {
                cwnd: ssthresh.min(sample.in_flight.saturating_add(mss)).max(mss),
                ssthresh,
            },
            AckEvent::FastRetransmit => {
                let ssthresh = (sample.in_flight / 2).max(2 * mss);

                Window {
                    cwnd: ssthresh + 3 * mss,
                    ssthresh,
                }
            }
            AckEvent::Timeout => Window {
                cwnd: mss,
                ssthresh: (sample.in_flight / 2).max(2 * mss),
            },
        }
    }
}
