//! Sequence number arithmetic over the 32-bit modular space (RFC 793 3.3).
//!
//! Every comparison is made on the signed difference of its operands, so the
//! relation holds across wraparound as long as the two values are less than
//! 2^31 apart.

/// Returns `true` if `a` precedes `b`.
#[inline]
pub fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Returns `true` if `a` follows `b`.
#[inline]
pub fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// Returns `true` if `a` precedes or equals `b`.
#[inline]
pub fn before_eq(a: u32, b: u32) -> bool {
    !after(a, b)
}

/// Returns `true` if `a` follows or equals `b`.
#[inline]
pub fn after_eq(a: u32, b: u32) -> bool {
    !before(a, b)
}

/// Returns `true` if `lo <= x < hi` in sequence space.
#[inline]
pub fn between(x: u32, lo: u32, hi: u32) -> bool {
    x.wrapping_sub(lo) < hi.wrapping_sub(lo)
}

/// Returns the later of two sequence numbers.
#[inline]
pub fn max(a: u32, b: u32) -> u32 {
    if after(a, b) { a } else { b }
}

/// Segment acceptability test of RFC 793 (3.3).
///
/// A segment occupying `len` sequence numbers starting at `seq` is acceptable
/// if its range intersects `[rcv_nxt, rcv_nxt + rcv_wnd)`.
///
/// ```text
///     Segment Receive  Test
///     Length  Window
///     ------- -------  -------------------------------------------
///
///        0       0     SEG.SEQ = RCV.NXT
///
///        0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
///
///       >0       0     not acceptable
///
///       >0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
///                   or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
/// ```
pub fn in_window(seq: u32, len: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    let wnd_end = rcv_nxt.wrapping_add(rcv_wnd);

    match (len, rcv_wnd) {
        (0, 0) => seq == rcv_nxt,
        (0, _) => between(seq, rcv_nxt, wnd_end),
        (_, 0) => false,
        (_, _) => {
            let last = seq.wrapping_add(len - 1);
            between(seq, rcv_nxt, wnd_end)
                || between(last, rcv_nxt, wnd_end)
                // Segment straddling the whole window.
                || (before(seq, rcv_nxt) && after_eq(last, wnd_end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ordering_is_wrap_safe(a in any::<u32>(), d in 1u32..(1 << 31)) {
            let b = a.wrapping_add(d);

            prop_assert!(before(a, b));
            prop_assert!(after(b, a));
            prop_assert!(!before(b, a));
            prop_assert!(before_eq(a, a) && after_eq(a, a));
            prop_assert_eq!(max(a, b), b);
        }

        #[test]
        fn between_matches_offsets(lo in any::<u32>(), off in any::<u32>(), span in any::<u32>()) {
            let x = lo.wrapping_add(off);
            let hi = lo.wrapping_add(span);

            prop_assert_eq!(between(x, lo, hi), off < span);
        }

        #[test]
        fn segments_outside_window_rejected(
            nxt in any::<u32>(),
            wnd in 1u32..65536,
            len in 1u32..1500,
            gap in 0u32..(1 << 20),
        ) {
            // Ending before RCV.NXT.
            let seq = nxt.wrapping_sub(len).wrapping_sub(gap);
            prop_assert!(!in_window(seq, len, nxt, wnd));

            // Starting at or past the right edge.
            let seq = nxt.wrapping_add(wnd).wrapping_add(gap);
            prop_assert!(!in_window(seq, len, nxt, wnd));
        }
    }

    #[test]
    fn in_window_four_cases() {
        assert!(in_window(100, 0, 100, 0));
        assert!(!in_window(101, 0, 100, 0));

        assert!(in_window(150, 0, 100, 100));
        assert!(!in_window(200, 0, 100, 100));

        assert!(!in_window(100, 10, 100, 0));

        // Tail overlaps the left edge.
        assert!(in_window(95, 10, 100, 100));
        // Head inside, tail past the right edge.
        assert!(in_window(195, 10, 100, 100));
        // Entirely old.
        assert!(!in_window(80, 20, 100, 100));
    }

    #[test]
    fn in_window_across_wraparound() {
        let nxt = u32::MAX - 10;

        assert!(in_window(5, 10, nxt, 100));
        assert!(in_window(nxt, 1, nxt, 1));
        assert!(!in_window(nxt.wrapping_sub(1), 1, nxt, 100));
    }
}
