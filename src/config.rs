//! Tunables of the protocol engine.
//!
//! Each field mirrors a system-wide knob of a kernel TCP implementation. A
//! [Config] is handed to [crate::Stack::new] and shared read-only by every
//! connection of that stack.

use std::ops::RangeInclusive;
use std::time::Duration;

const SYN_RETRIES: u32 = 6;
const SYNACK_RETRIES: u32 = 5;
const RETRIES: u32 = 15;

const MAX_SYN_BACKLOG: usize = 128;

const INITIAL_RTO: Duration = Duration::from_secs(1);
const MIN_RTO: Duration = Duration::from_millis(200);
const MAX_RTO: Duration = Duration::from_secs(120);

const DELAYED_ACK: Duration = Duration::from_millis(40);
const MSL: Duration = Duration::from_secs(30);
const FIN_TIMEOUT: Duration = Duration::from_secs(60);

const KEEPALIVE_TIME: Duration = Duration::from_secs(7200);
const KEEPALIVE_INTVL: Duration = Duration::from_secs(75);
const KEEPALIVE_PROBES: u32 = 9;

const CHALLENGE_ACK_LIMIT: u32 = 1000;

const SYNCOOKIE_GRANULARITY: Duration = Duration::from_secs(16);
const SYNCOOKIE_MAX_AGE: u32 = 4;
const SECRET_ROTATION: Duration = Duration::from_secs(300);

const RECV_BUFFER: usize = 65535;
const SEND_BUFFER: usize = 262144;

/// Assumed peer MSS when a SYN carries no MSS option (RFC 1122 4.2.2.6).
const DEFAULT_MSS: u16 = 536;
const TTL: u8 = 64;
const DUPACK_THRESHOLD: u32 = 3;

/// Configuration of a [crate::Stack].
#[derive(Debug, Clone)]
pub struct Config {
    /// Retransmissions of an active-open SYN before giving up.
    pub syn_retries: u32,
    /// Retransmissions of a SYN-ACK before dropping the half-open request.
    pub synack_retries: u32,
    /// Retransmissions (or unanswered zero-window probes) on an established
    /// connection before aborting it.
    pub retries: u32,

    /// Fall back to SYN cookies once a listener's half-open queue is full.
    pub syncookies: bool,
    /// Upper bound applied to any listen backlog.
    pub max_syn_backlog: usize,

    /// RTO used before the first RTT sample.
    pub initial_rto: Duration,
    /// Lower bound of the RTO.
    pub min_rto: Duration,
    /// Upper bound of the RTO, backoff included.
    pub max_rto: Duration,

    /// Longest an acknowledgment may be held back.
    pub delayed_ack: Duration,
    /// Maximum segment lifetime; `TIME_WAIT` lasts twice this long.
    pub msl: Duration,
    /// Lifetime of an orphaned connection in `FIN_WAIT_2`.
    pub fin_timeout: Duration,

    /// Idle time before the first keepalive probe.
    pub keepalive_time: Duration,
    /// Interval between keepalive probes.
    pub keepalive_intvl: Duration,
    /// Unanswered keepalive probes before the connection is aborted.
    pub keepalive_probes: u32,

    /// Negotiate selective acknowledgments.
    pub sack: bool,
    /// Report duplicate segments with DSACK blocks.
    pub dsack: bool,
    /// Negotiate the timestamps option.
    pub timestamps: bool,
    /// Send tail-loss probes.
    pub tlp: bool,
    /// Accept data carried on a SYN.
    pub fast_open: bool,

    /// Challenge ACKs allowed per second, stack wide.
    pub challenge_ack_limit: u32,

    /// Quantization step of SYN cookie timestamps.
    pub syncookie_granularity: Duration,
    /// Oldest cookie accepted, in quantization steps.
    pub syncookie_max_age: u32,
    /// Interval between secret rotations for ISNs and cookies.
    pub secret_rotation: Duration,

    /// Receive buffer per connection, in bytes.
    pub recv_buffer: usize,
    /// Send buffer per connection, in bytes.
    pub send_buffer: usize,
    /// MSS assumed when the peer does not announce one.
    pub default_mss: u16,
    /// IPv4 time to live of outbound segments.
    pub ttl: u8,

    /// Allow an active open to reuse a 4-tuple still in `TIME_WAIT`.
    pub tw_reuse: bool,
    /// Duplicate ACKs that trigger fast retransmit.
    pub dupack_threshold: u32,
    /// Local ports chosen for active opens.
    pub ephemeral_ports: RangeInclusive<u16>,
}

impl Config {
    /// Returns `2 * MSL`, the `TIME_WAIT` lifetime.
    pub fn time_wait_len(&self) -> Duration {
        self.msl * 2
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            syn_retries: SYN_RETRIES,
            synack_retries: SYNACK_RETRIES,
            retries: RETRIES,
            syncookies: true,
            max_syn_backlog: MAX_SYN_BACKLOG,
            initial_rto: INITIAL_RTO,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
            delayed_ack: DELAYED_ACK,
            msl: MSL,
            fin_timeout: FIN_TIMEOUT,
            keepalive_time: KEEPALIVE_TIME,
            keepalive_intvl: KEEPALIVE_INTVL,
            keepalive_probes: KEEPALIVE_PROBES,
            sack: true,
            dsack: true,
            timestamps: true,
            tlp: true,
            fast_open: false,
            challenge_ack_limit: CHALLENGE_ACK_LIMIT,
            syncookie_granularity: SYNCOOKIE_GRANULARITY,
            syncookie_max_age: SYNCOOKIE_MAX_AGE,
            secret_rotation: SECRET_ROTATION,
            recv_buffer: RECV_BUFFER,
            send_buffer: SEND_BUFFER,
            default_mss: DEFAULT_MSS,
            ttl: TTL,
            tw_reuse: true,
            dupack_threshold: DUPACK_THRESHOLD,
            ephemeral_ports: 32768..=60999,
        }
    }
}
