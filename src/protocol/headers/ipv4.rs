use std::io;

use super::internet_checksum;
use crate::{Error, HeaderError, ParseError};

/// IPv4 Datagram Header.
///
/// # Note
///
/// IPv4 options are not supported. Datagrams carrying options are rejected
/// during parsing.
///
/// RFC 791 (3.1)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |Type of Service|          Total Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Version (high nibble) and header length in 32-bit words (low nibble).
    version_ihl: u8,
    /// Type of service.
    tos: u8,
    /// Length of the datagram in octets, header and payload included.
    total_len: u16,
    /// Identification used for fragment reassembly.
    id: u16,
    /// Control flags (reserved, DF, MF) followed by the 13-bit fragment
    /// offset, measured in units of 8 octets.
    flags_and_offset: u16,
    /// Time to live.
    ttl: u8,
    /// Next level protocol carried in the payload.
    protocol: Protocol,
    /// Checksum over the header only.
    header_checksum: u16,
    /// The source address.
    src_addr: [u8; 4],
    /// The destination address.
    dst_addr: [u8; 4],
}

impl Ipv4Header {
    /// Length of an IPv4 header without options in bytes.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Maximum length of an IPv4 header in bytes (IHL of 15).
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Maximum payload length in bytes, accounting for the header length.
    pub const MAX_PAYLOAD_LEN: u16 = u16::MAX - Self::MIN_HEADER_LEN;

    /// Creates a new IPv4 header with the specified source and destination
    /// addresses, payload length, TTL, and protocol. The `DF` bit is set and
    /// all other fields are zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the `payload_len` exceeds the maximum allowed
    /// payload length.
    pub fn new(
        src: [u8; 4],
        dst: [u8; 4],
        payload_len: u16,
        ttl: u8,
        protocol: Protocol,
    ) -> crate::Result<Self> {
        let mut header = Self {
            ttl,
            protocol,
            src_addr: src,
            dst_addr: dst,
            ..Default::default()
        };

        header.set_payload_len(payload_len)?;

        Ok(header)
    }

    /// Returns the `version` field of the IPv4 header.
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Returns the `IHL` field of the IPv4 header, in 32-bit words.
    pub fn ihl(&self) -> u8 {
        self.version_ihl & 0xF
    }

    /// Returns the `type of service` field of the IPv4 header.
    pub fn tos(&self) -> u8 {
        self.tos
    }

    /// Returns the `total length` field of the IPv4 header.
    pub fn total_len(&self) -> u16 {
        self.total_len
    }

    /// Sets the `total length` field of the IPv4 header given a payload length.
    ///
    /// # Errors
    ///
    /// Returns an error if the `payload_len` exceeds the maximum allowed
    /// payload length.
    pub fn set_payload_len(&mut self, payload_len: u16) -> crate::Result<()> {
        if payload_len > Self::MAX_PAYLOAD_LEN {
            return Err(Error::Header(HeaderError::PayloadTooLarge {
                provided: payload_len,
                max: Self::MAX_PAYLOAD_LEN,
            }));
        }

        self.total_len = Self::MIN_HEADER_LEN + payload_len;

        Ok(())
    }

    /// Returns the `identification` field of the IPv4 header.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Sets the `identification` field of the IPv4 header.
    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    /// Returns `true` if the `DF` (Don't Fragment) bit is set.
    pub fn dont_fragment(&self) -> bool {
        (self.flags_and_offset >> 14) & 1 == 1
    }

    /// Returns `true` if the `MF` (More Fragments) bit is set.
    pub fn more_fragments(&self) -> bool {
        (self.flags_and_offset >> 13) & 1 == 1
    }

    /// Returns the `fragment offset` field of the IPv4 header.
    pub fn fragment_offset(&self) -> u16 {
        self.flags_and_offset & 0x1FFF
    }

    /// Returns `true` if this header describes one fragment of a larger
    /// datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() != 0
    }

    /// Returns the `time to live` field of the IPv4 header.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Returns the `protocol` field of the IPv4 header.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the `header checksum` field of the IPv4 header.
    pub fn header_checksum(&self) -> u16 {
        self.header_checksum
    }

    /// Computes and updates the header checksum for the IPv4 header.
    pub fn set_header_checksum(&mut self) {
        self.header_checksum = self.compute_header_checksum();
    }

    /// Returns `true` if the IPv4 header checksum is valid.
    pub fn is_valid_checksum(&self) -> bool {
        self.header_checksum == self.compute_header_checksum()
    }

    /// Returns the `source address` field of the IPv4 header.
    pub fn src(&self) -> [u8; 4] {
        self.src_addr
    }

    /// Returns the `destination address` field of the IPv4 header.
    pub fn dst(&self) -> [u8; 4] {
        self.dst_addr
    }

    /// Returns the length of the IPv4 header in bytes, not including payload.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN as usize
    }

    /// Returns the payload length of the IPv4 datagram.
    pub fn payload_len(&self) -> u16 {
        // total_len >= MIN_HEADER_LEN is checked when parsing and constructing.
        self.total_len - Self::MIN_HEADER_LEN
    }

    /// Returns the computed checksum of the IPv4 header, treating the
    /// checksum field as zero.
    pub fn compute_header_checksum(&self) -> u16 {
        let mut header_bytes = self.to_be_bytes();

        header_bytes[10] = 0x00;
        header_bytes[11] = 0x00;

        internet_checksum(&[&header_bytes[..]])
    }

    /// Returns the memory representation of the IPv4 header as a byte array in
    /// big-endian (network) byte order.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> [u8; Self::MIN_HEADER_LEN as usize] {
        let mut raw_header = [0u8; Self::MIN_HEADER_LEN as usize];

        raw_header[0] = self.version_ihl;
        raw_header[1] = self.tos;
        raw_header[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        raw_header[4..6].copy_from_slice(&self.id.to_be_bytes());
        raw_header[6..8].copy_from_slice(&self.flags_and_offset.to_be_bytes());
        raw_header[8] = self.ttl;
        raw_header[9] = self.protocol.into();
        raw_header[10..12].copy_from_slice(&self.header_checksum.to_be_bytes());
        raw_header[12..16].copy_from_slice(&self.src_addr);
        raw_header[16..20].copy_from_slice(&self.dst_addr);

        raw_header
    }

    /// Writes the IPv4 header to the given output stream.
    ///
    /// # Note
    ///
    /// The caller must ensure the checksum is computed and updated before
    /// writing the header.
    pub fn write<T: io::Write>(&self, output: &mut T) -> crate::Result<()> {
        Ok(output.write_all(&self.to_be_bytes())?)
    }
}

impl TryFrom<&[u8]> for Ipv4Header {
    type Error = Error;

    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::MIN_HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: header_raw.len(),
                min: Self::MIN_HEADER_LEN,
                max: Self::MAX_HEADER_LEN,
            }));
        }

        let version_ihl = header_raw[0];

        if (version_ihl >> 4) != 4 {
            return Err(Error::Parse(ParseError::InvalidVersion {
                provided: version_ihl >> 4,
                expected: 4,
            }));
        }

        if (version_ihl & 0xF) != 5 {
            return Err(Error::Parse(ParseError::InvalidIhl {
                provided: version_ihl & 0xF,
                expected: 5,
            }));
        }

        let total_len = u16::from_be_bytes([header_raw[2], header_raw[3]]);

        if total_len < Self::MIN_HEADER_LEN {
            return Err(Error::Parse(ParseError::InvalidTotalLength {
                provided: total_len,
                expected: Self::MIN_HEADER_LEN as u8,
            }));
        }

        let mut src_addr = [0u8; 4];
        src_addr.copy_from_slice(&header_raw[12..16]);

        let mut dst_addr = [0u8; 4];
        dst_addr.copy_from_slice(&header_raw[16..20]);

        Ok(Self {
            version_ihl,
            tos: header_raw[1],
            total_len,
            id: u16::from_be_bytes([header_raw[4], header_raw[5]]),
            flags_and_offset: u16::from_be_bytes([header_raw[6], header_raw[7]]),
            ttl: header_raw[8],
            protocol: Protocol::try_from(header_raw[9])?,
            header_checksum: u16::from_be_bytes([header_raw[10], header_raw[11]]),
            src_addr,
            dst_addr,
        })
    }
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            // Version = 4, IHL = 5
            version_ihl: 0b0100_0101,
            tos: 0,
            id: 0,
            // DF set, last fragment, offset 0.
            flags_and_offset: 0b010_0000000000000,
            header_checksum: 0,
            total_len: Self::MIN_HEADER_LEN,
            ttl: 0,
            protocol: Protocol::TCP,
            src_addr: [0; 4],
            dst_addr: [0; 4],
        }
    }
}

/// Upper-layer protocols recognized in the IPv4 `protocol` field (RFC 1700).
///
/// Anything else is rejected while parsing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Protocol {
    /// Internet Control Message
    ICMP = 1,
    /// Internet Group Management
    IGMP = 2,
    /// Transmission Control
    TCP = 6,
    /// User Datagram
    UDP = 17,
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        proto as u8
    }
}

impl TryFrom<u8> for Protocol {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            1 => Ok(Protocol::ICMP),
            2 => Ok(Protocol::IGMP),
            6 => Ok(Protocol::TCP),
            17 => Ok(Protocol::UDP),
            _ => Err(Error::Parse(ParseError::InvalidProtocol(val))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: [u8; 20] = [
        0x45, 0x00, 0x00, 0x3c, 0xbe, 0xfa, 0x40, 0x00, 0x40, 0x06, 0xfa, 0x43, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0x2c,
    ];

    proptest! {
        #[test]
        fn ipv4_header_parsing_no_panic(header_bytes in prop::collection::vec(any::<u8>(), 0..Ipv4Header::MAX_HEADER_LEN as usize)) {
            if let Ok(header) = Ipv4Header::try_from(&header_bytes[..]) {
                let bytes = header.to_be_bytes();
                prop_assert_eq!(Ipv4Header::try_from(&bytes[..]).ok(), Some(header));
            }
        }
    }

    #[test]
    fn ipv4_header_sample_fields() {
        let header = Ipv4Header::try_from(&SAMPLE[..]).unwrap();

        assert_eq!(header.version(), 4);
        assert_eq!(header.ihl(), 5);
        assert_eq!(header.total_len(), 60);
        assert_eq!(header.payload_len(), 40);
        assert_eq!(header.id(), 48890);
        assert!(header.dont_fragment());
        assert!(!header.is_fragment());
        assert_eq!(header.ttl(), 64);
        assert_eq!(header.protocol(), Protocol::TCP);
        assert_eq!(header.src(), [192, 168, 0, 1]);
        assert_eq!(header.dst(), [192, 168, 0, 44]);
        assert!(header.is_valid_checksum());
    }

    #[test]
    fn ipv4_header_checksum_tracks_length_changes() {
        let mut header = Ipv4Header::try_from(&SAMPLE[..]).unwrap();

        header.set_payload_len(22).unwrap();
        assert!(!header.is_valid_checksum());

        header.set_header_checksum();
        assert!(header.is_valid_checksum());
    }

    #[test]
    fn ipv4_header_rejects_options_and_bad_versions() {
        let mut with_options = SAMPLE;
        with_options[0] = 0x46;
        assert!(matches!(
            Ipv4Header::try_from(&with_options[..]),
            Err(Error::Parse(ParseError::InvalidIhl { provided: 6, .. }))
        ));

        let mut v6 = SAMPLE;
        v6[0] = 0x65;
        assert!(matches!(
            Ipv4Header::try_from(&v6[..]),
            Err(Error::Parse(ParseError::InvalidVersion { provided: 6, .. }))
        ));

        let mut short_total = SAMPLE;
        short_total[2] = 0x00;
        short_total[3] = 0x10;
        assert!(Ipv4Header::try_from(&short_total[..]).is_err());
    }

    #[test]
    fn ipv4_header_fragment_detection() {
        let mut frag = SAMPLE;
        frag[6] = 0x20;
        frag[7] = 0x00;

        let header = Ipv4Header::try_from(&frag[..]).unwrap();
        assert!(header.more_fragments());
        assert!(header.is_fragment());
    }

    #[test]
    fn ipv4_header_payload_too_large() {
        let res = Ipv4Header::new(
            [10, 0, 0, 1],
            [10, 0, 0, 2],
            Ipv4Header::MAX_PAYLOAD_LEN + 1,
            64,
            Protocol::TCP,
        );

        assert!(matches!(
            res,
            Err(Error::Header(HeaderError::PayloadTooLarge { .. }))
        ));
    }
}
