//! State shared by every connection and listener of one stack.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::protocol::isn::{IsnGenerator, SynCookies};
use crate::stats::Stats;

/// Window over which challenge ACKs are counted.
const CHALLENGE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ChallengeBudget {
    window_start: Instant,
    sent: u32,
}

/// Stack-wide protocol context: configuration, counters, secrets, and the
/// clocks derived from the stack's epoch.
#[derive(Debug)]
pub struct Context {
    /// Tunables.
    pub config: Config,
    /// Diagnostic counters.
    pub stats: Stats,
    /// ISN generator.
    pub isn: IsnGenerator,
    /// SYN cookie secrets.
    pub cookies: Mutex<SynCookies>,
    challenge: Mutex<ChallengeBudget>,
    epoch: Instant,
}

impl Context {
    /// Creates the context of a stack started at `epoch`.
    pub fn new(config: Config, epoch: Instant) -> Self {
        let cookies = SynCookies::new(
            epoch,
            config.syncookie_granularity,
            config.syncookie_max_age,
            config.secret_rotation,
        );

        Self {
            config,
            stats: Stats::default(),
            isn: IsnGenerator::new(epoch),
            cookies: Mutex::new(cookies),
            challenge: Mutex::new(ChallengeBudget {
                window_start: epoch,
                sent: 0,
            }),
            epoch,
        }
    }

    /// Returns the TSval clock: milliseconds since the stack started.
    pub fn timestamp(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    /// Consumes one unit of the challenge ACK budget (RFC 5961 7), returning
    /// `false` once the per-second limit is reached.
    pub fn allow_challenge_ack(&self, now: Instant) -> bool {
        let mut budget = self.challenge.lock().unwrap_or_else(PoisonError::into_inner);

        if now.saturating_duration_since(budget.window_start) >= CHALLENGE_WINDOW {
            budget.window_start = now;
            budget.sent = 0;
        }

        if budget.sent >= self.config.challenge_ack_limit {
            Stats::incr(&self.stats.challenge_acks_suppressed);
            return false;
        }

        budget.sent += 1;
        Stats::incr(&self.stats.challenge_acks);

        true
    }
}
