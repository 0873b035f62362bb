//! Initial sequence number selection (RFC 6528) and SYN cookies (RFC 4987).

use std::hash::{BuildHasher, RandomState};
use std::mem;
use std::time::{Duration, Instant};

use crate::protocol::Socket;

/// MSS values a cookie can encode. The largest entry not exceeding the
/// peer's offer is chosen.
pub const MSS_TABLE: [u16; 8] = [536, 1300, 1440, 1460, 4312, 8960, 9000, 65495];

const MAC_BITS: u32 = 23;
const MAC_MASK: u32 = (1 << MAC_BITS) - 1;
const SLOT_MASK: u32 = 0x3F;
const MSS_MASK: u32 = 0x7;

/// Generates initial sequence numbers as `F(4-tuple, secret) + M`, where `M`
/// is a timer ticking every 4 microseconds.
#[derive(Debug)]
pub struct IsnGenerator {
    key: RandomState,
    epoch: Instant,
}

impl IsnGenerator {
    /// Creates a generator with a fresh random secret.
    pub fn new(epoch: Instant) -> Self {
        Self {
            key: RandomState::new(),
            epoch,
        }
    }

    /// Returns the ISN for a connection on `sock` at time `now`.
    pub fn generate(&self, sock: &Socket, now: Instant) -> u32 {
        let offset = self.key.hash_one(sock) as u32;
        let ticks = (now.saturating_duration_since(self.epoch).as_micros() / 4) as u32;

        offset.wrapping_add(ticks)
    }
}

/// Stateless SYN cookies.
///
/// ```text
///     31                        9 8        3 2    0
///    +---------------------------+----------+------+
///    |       MAC (23 bits)       | slot (6) | MSS  |
///    +---------------------------+----------+------+
/// ```
///
/// The MAC covers the 4-tuple, the peer's ISN, the time slot, and the MSS
/// index. Secrets rotate periodically and the previous one stays valid for
/// one rotation.
#[derive(Debug)]
pub struct SynCookies {
    current: RandomState,
    previous: Option<RandomState>,
    rotated_at: Instant,
    epoch: Instant,
    granularity: Duration,
    max_age: u32,
    rotation: Duration,
}

impl SynCookies {
    /// Creates a cookie generator quantizing time in `granularity` steps and
    /// accepting cookies at most `max_age` steps old.
    pub fn new(epoch: Instant, granularity: Duration, max_age: u32, rotation: Duration) -> Self {
        Self {
            current: RandomState::new(),
            previous: None,
            rotated_at: epoch,
            epoch,
            granularity,
            max_age: max_age.min(SLOT_MASK),
            rotation,
        }
    }

    /// Returns the cookie to use as ISN in a SYN-ACK answering a SYN with
    /// sequence `irs` on `sock`, with the MSS actually encoded.
    pub fn encode(&mut self, sock: &Socket, irs: u32, peer_mss: u16, now: Instant) -> (u32, u16) {
        self.rotate(now);

        let idx = MSS_TABLE
            .iter()
            .rposition(|&mss| mss <= peer_mss)
            .unwrap_or(0) as u32;
        let slot = self.slot(now);

        let mac = Self::mac(&self.current, sock, irs, slot, idx);
        let cookie = (mac << (32 - MAC_BITS)) | (slot << 3) | idx;

        (cookie, MSS_TABLE[idx as usize])
    }

    /// Checks a cookie echoed back as `ACK - 1` in the final handshake ACK,
    /// whose own sequence number is `irs + 1`. Returns the encoded MSS when
    /// the cookie is authentic and recent.
    pub fn validate(&mut self, sock: &Socket, irs: u32, cookie: u32, now: Instant) -> Option<u16> {
        self.rotate(now);

        let idx = cookie & MSS_MASK;
        let slot = (cookie >> 3) & SLOT_MASK;
        let mac = cookie >> (32 - MAC_BITS);

        let age = self.slot(now).wrapping_sub(slot) & SLOT_MASK;
        if age > self.max_age {
            return None;
        }

        let authentic = std::iter::once(&self.current)
            .chain(self.previous.as_ref())
            .any(|key| Self::mac(key, sock, irs, slot, idx) == mac);

        authentic.then_some(MSS_TABLE[idx as usize])
    }

    fn mac(key: &RandomState, sock: &Socket, irs: u32, slot: u32, idx: u32) -> u32 {
        key.hash_one((sock, irs, slot, idx)) as u32 & MAC_MASK
    }

    fn slot(&self, now: Instant) -> u32 {
        let step = self.granularity.as_millis().max(1);
        let elapsed = now.saturating_duration_since(self.epoch).as_millis();

        (elapsed / step) as u32 & SLOT_MASK
    }

    fn rotate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.rotated_at) >= self.rotation {
            let retired = mem::replace(&mut self.current, RandomState::new());
            self.previous = Some(retired);
            self.rotated_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SocketAddr;

    fn sock() -> Socket {
        Socket::new(
            SocketAddr::new([10, 0, 0, 1], 80),
            SocketAddr::new([10, 0, 0, 2], 40000),
        )
    }

    fn cookies(epoch: Instant) -> SynCookies {
        SynCookies::new(epoch, Duration::from_secs(16), 4, Duration::from_secs(300))
    }

    #[test]
    fn isn_advances_with_clock() {
        let epoch = Instant::now();
        let isn = IsnGenerator::new(epoch);

        let a = isn.generate(&sock(), epoch);
        let b = isn.generate(&sock(), epoch + Duration::from_millis(4));

        assert_eq!(b.wrapping_sub(a), 1000);
        assert_eq!(isn.generate(&sock(), epoch), a);
    }

    #[test]
    fn cookie_round_trip() {
        let epoch = Instant::now();
        let mut jar = cookies(epoch);

        let (cookie, mss) = jar.encode(&sock(), 1000, 1460, epoch);
        assert_eq!(mss, 1460);

        let later = epoch + Duration::from_secs(20);
        assert_eq!(jar.validate(&sock(), 1000, cookie, later), Some(1460));
    }

    #[test]
    fn cookie_encodes_largest_mss_not_above_offer() {
        let epoch = Instant::now();
        let mut jar = cookies(epoch);

        assert_eq!(jar.encode(&sock(), 1, 1400, epoch).1, 1300);
        assert_eq!(jar.encode(&sock(), 1, 100, epoch).1, 536);
        assert_eq!(jar.encode(&sock(), 1, u16::MAX, epoch).1, 65495);
    }

    #[test]
    fn cookie_tampering_rejected() {
        let epoch = Instant::now();
        let mut jar = cookies(epoch);

        let (cookie, _) = jar.encode(&sock(), 1000, 1460, epoch);

        assert_eq!(jar.validate(&sock(), 1001, cookie, epoch), None);
        assert_eq!(jar.validate(&sock().reversed(), 1000, cookie, epoch), None);
        assert_eq!(jar.validate(&sock(), 1000, cookie ^ (1 << 20), epoch), None);
    }

    #[test]
    fn cookie_expires_after_max_age() {
        let epoch = Instant::now();
        let mut jar = cookies(epoch);

        let (cookie, _) = jar.encode(&sock(), 7, 1460, epoch);

        let stale = epoch + Duration::from_secs(16 * 5);
        assert_eq!(jar.validate(&sock(), 7, cookie, stale), None);
    }

    #[test]
    fn cookie_survives_one_rotation_only() {
        let epoch = Instant::now();
        let mut jar = SynCookies::new(epoch, Duration::from_secs(1), 63, Duration::from_secs(10));

        let (cookie, _) = jar.encode(&sock(), 7, 1460, epoch);

        let once = epoch + Duration::from_secs(11);
        assert!(jar.validate(&sock(), 7, cookie, once).is_some());

        let twice = epoch + Duration::from_secs(22);
        assert!(jar.validate(&sock(), 7, cookie, twice).is_none());
    }
}
