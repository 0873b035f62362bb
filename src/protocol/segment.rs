//! Parsing, construction, and serialization of whole TCP/IPv4 datagrams.

use std::fmt;
use std::io::Write;

use crate::protocol::Socket;
use crate::protocol::headers::{Ipv4Header, Protocol, TcpHeader};
use crate::{Error, ParseError, Result};

/// Fully constructed TCP segment.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    /// IPv4 header of the segment.
    pub ip: Ipv4Header,
    /// TCP header of the segment.
    pub tcp: TcpHeader,
    /// Payload of the segment.
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Create a new TCP segment given the IPv4/TCP headers and payload.
    pub fn new(ip: Ipv4Header, tcp: TcpHeader, payload: &[u8]) -> Self {
        Self {
            ip,
            tcp,
            payload: payload.into(),
        }
    }

    /// Builds an outbound segment from `sock.local` to `sock.remote`, filling
    /// in the IPv4 header and both checksums.
    ///
    /// # Errors
    ///
    /// Returns an error if the header and payload do not fit in one datagram.
    pub fn build(sock: Socket, mut tcp: TcpHeader, payload: &[u8], ttl: u8) -> Result<Self> {
        let tcp_len = u16::try_from(tcp.header_len() + payload.len()).unwrap_or(u16::MAX);

        let mut ip = Ipv4Header::new(
            sock.local.addr,
            sock.remote.addr,
            tcp_len,
            ttl,
            Protocol::TCP,
        )?;
        ip.set_header_checksum();
        tcp.set_checksum(&ip, payload);

        Ok(Self::new(ip, tcp, payload))
    }

    /// Parses and validates one IPv4 datagram carrying a TCP segment.
    ///
    /// The frame may carry trailing link-layer padding beyond the IPv4 total
    /// length; it is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if either header is malformed, if the datagram is
    /// truncated, fragmented, or not TCP, or if either checksum does not
    /// match.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let ip = Ipv4Header::try_from(frame)?;

        if !ip.is_valid_checksum() {
            return Err(Error::Parse(ParseError::InvalidChecksum {
                provided: ip.header_checksum(),
                expected: ip.compute_header_checksum(),
            }));
        }

        if ip.total_len() as usize > frame.len() {
            return Err(Error::Parse(ParseError::Truncated {
                provided: frame.len(),
                expected: ip.total_len(),
            }));
        }

        if ip.protocol() != Protocol::TCP {
            return Err(Error::Parse(ParseError::InvalidProtocol(
                ip.protocol().into(),
            )));
        }

        if ip.is_fragment() {
            return Err(Error::Parse(ParseError::Fragmented {
                offset: ip.fragment_offset(),
                more: ip.more_fragments(),
            }));
        }

        let datagram = &frame[ip.header_len()..ip.total_len() as usize];

        if datagram.len() < TcpHeader::MIN_HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: datagram.len(),
                min: TcpHeader::MIN_HEADER_LEN,
                max: TcpHeader::MAX_HEADER_LEN,
            }));
        }

        // Slice at the data offset; out-of-range offsets are reported by the
        // header parser.
        let header_len = ((datagram[12] >> 4) as usize * 4)
            .max(TcpHeader::MIN_HEADER_LEN as usize)
            .min(datagram.len());

        let tcp = TcpHeader::try_from(&datagram[..header_len])?;
        let payload = &datagram[header_len..];

        if !tcp.is_valid_checksum(&ip, payload) {
            return Err(Error::Parse(ParseError::InvalidChecksum {
                provided: tcp.checksum(),
                expected: tcp.compute_checksum(&ip, payload),
            }));
        }

        Ok(Self::new(ip, tcp, payload))
    }

    /// Returns the 4-tuple of an inbound segment, from the receiver's point
    /// of view.
    pub fn socket(&self) -> Socket {
        Socket::new(
            (self.ip.dst(), self.tcp.dst_port()).into(),
            (self.ip.src(), self.tcp.src_port()).into(),
        )
    }

    /// Returns the segment's sequence number.
    pub fn seq(&self) -> u32 {
        self.tcp.seq_number()
    }

    /// Returns the segment's acknowledgment number.
    pub fn ack(&self) -> u32 {
        self.tcp.ack_number()
    }

    /// Returns the amount of sequence space the segment occupies: its payload
    /// plus one for each of SYN and FIN.
    pub fn seg_len(&self) -> u32 {
        self.payload.len() as u32 + self.tcp.syn() as u32 + self.tcp.fin() as u32
    }

    /// Returns the sequence number following the last octet of the segment.
    pub fn end_seq(&self) -> u32 {
        self.seq().wrapping_add(self.seg_len())
    }

    /// Builds the `RST` answering this inbound segment when no connection
    /// state accounts for it. Returns `None` for an inbound `RST`.
    ///
    /// (RFC 793 3.4)
    ///
    /// ```text
    ///     If the incoming segment has an ACK field, the reset takes its
    ///     sequence number from the ACK field of the segment, otherwise the
    ///     reset has sequence number zero and the ACK field is set to the sum
    ///     of the sequence number and segment length of the incoming segment.
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the `RST` segment could not be constructed.
    pub fn reset_reply(&self, ttl: u8) -> Result<Option<Self>> {
        if self.tcp.rst() {
            return Ok(None);
        }

        let sock = self.socket();

        let rst = if self.tcp.ack() {
            // <SEQ=SEG.ACK><CTL=RST>
            let mut rst = TcpHeader::new(sock.local.port, sock.remote.port, self.ack(), 0);
            rst.set_rst();
            rst
        } else {
            // <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>
            let mut rst = TcpHeader::new(sock.local.port, sock.remote.port, 0, 0);
            rst.set_ack_number(self.end_seq());
            rst.set_rst();
            rst.set_ack();
            rst
        };

        Self::build(sock, rst, &[], ttl).map(Some)
    }

    /// Returns the memory representation of the TCP segment as a vector of
    /// bytes in big-endian (network) byte order.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.ip.total_len() as usize);

        self.ip.write(&mut buf)?;
        self.tcp.write(&mut buf)?;
        buf.write_all(&self.payload)?;

        Ok(buf)
    }
}

impl fmt::Display for TcpSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 6] = [
            (0b00_0010, "SYN"),
            (0b00_0001, "FIN"),
            (0b00_0100, "RST"),
            (0b00_1000, "PSH"),
            (0b01_0000, "ACK"),
            (0b10_0000, "URG"),
        ];

        let bits = self.tcp.control_bits();
        let mut first = true;

        f.write_str("[")?;
        for (bit, name) in NAMES {
            if bits & bit != 0 {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str("]")?;

        write!(f, " seq={}", self.seq())?;
        if self.tcp.ack() {
            write!(f, " ack={}", self.ack())?;
        }

        write!(f, " win={} len={}", self.tcp.window(), self.payload.len())
    }
}
