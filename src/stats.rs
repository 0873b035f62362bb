//! Stack-wide diagnostic counters.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)+) => {
        /// Live counters, updated with relaxed atomics.
        #[derive(Debug, Default)]
        pub struct Stats {
            $($(#[$doc])* pub(crate) $name: AtomicU64,)+
        }

        /// Point-in-time copy of [Stats].
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)+
        }

        impl Stats {
            /// Returns the current value of every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters! {
    /// Frames handed to the stack.
    segments_in,
    /// Segments handed to the transport.
    segments_out,
    /// Frames discarded as structurally malformed.
    malformed,
    /// Frames discarded for an IPv4 or TCP checksum mismatch.
    checksum_errors,
    /// RST segments sent.
    resets_sent,
    /// RST segments accepted.
    resets_received,
    /// Connections opened actively.
    active_opens,
    /// Connections promoted from a listener.
    passive_opens,
    /// Active or passive opens that failed.
    failed_attempts,
    /// Segments retransmitted.
    retransmissions,
    /// Fast retransmits triggered by duplicate ACKs.
    fast_retransmits,
    /// Retransmission timer expirations.
    timeouts,
    /// Connections aborted after exhausting their retries.
    aborted_on_timeout,
    /// Tail-loss probes sent.
    tail_loss_probes,
    /// SYN-ACKs carrying a cookie.
    cookies_sent,
    /// Handshakes completed from a cookie.
    cookies_accepted,
    /// Handshake ACKs carrying an invalid cookie.
    cookies_rejected,
    /// Handshakes dropped because the accept queue was full.
    listen_overflows,
    /// SYNs dropped by a listener.
    listen_drops,
    /// Half-open requests expired after their SYN-ACK retries.
    request_timeouts,
    /// Challenge ACKs sent.
    challenge_acks,
    /// Challenge ACKs suppressed by the rate limit.
    challenge_acks_suppressed,
    /// `TIME_WAIT` entries recycled for a new connection.
    time_wait_recycled,
    /// Delayed ACKs sent by their timer.
    delayed_acks,
    /// Segments the transport or routing layer failed to deliver.
    tx_failures,
}

impl Stats {
    /// Increments `counter` by one.
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
