//! Parsing, serialization, and construction of IPv4/TCP headers.

mod ipv4;
pub use ipv4::{Ipv4Header, Protocol};

mod tcp;
pub use tcp::{OptionKind, SackBlock, SackBlocks, TcpHeader, TcpOption, TcpOptions};

/// Computes the Internet checksum (RFC 1071) over the concatenation of
/// `parts`.
///
/// The checksum field is the 16 bit one's complement of the one's complement
/// sum of all 16 bit words. An odd trailing octet is padded on the right with
/// zero. Parts are treated as one contiguous byte stream, so an odd-length
/// part does not introduce padding in the middle.
pub(crate) fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut bytes = parts.iter().flat_map(|part| part.iter().copied());
    let mut sum = 0u32;

    loop {
        let word = match (bytes.next(), bytes.next()) {
            (Some(h), Some(l)) => u16::from_be_bytes([h, l]),
            (Some(h), None) => u16::from_be_bytes([h, 0x00]),
            _ => break,
        };

        sum += word as u32;

        // Carry folding.
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_split_parts_matches_contiguous() {
        let data = [0x45u8, 0x00, 0x00, 0x3c, 0xbe, 0xfa, 0x40];

        let whole = internet_checksum(&[&data[..]]);
        let split = internet_checksum(&[&data[..3], &data[3..]]);

        assert_eq!(whole, split);
    }

    #[test]
    fn checksum_rfc1071_example() {
        // RFC 1071 (3): 0001 f203 f4f5 f6f7 sums to 0xddf2 (before complement).
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];

        assert_eq!(internet_checksum(&[&data[..]]), !0xddf2);
    }
}
