use std::io;

use super::{Ipv4Header, internet_checksum};
use crate::{Error, HeaderError, ParseError};

/// TCP Segment Header.
///
/// RFC 793 (3.1)
///
/// ```text
///   0                   1                   2                   3
///     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |          Source Port          |       Destination Port        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                        Sequence Number                        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Acknowledgment Number                      |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |  Data |           |U|A|P|R|S|F|                               |
///    | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
///    |       |           |G|K|H|T|N|N|                               |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |           Checksum            |         Urgent Pointer        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Options                    |    Padding    |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    /// The source port number.
    src_port: u16,
    /// The destination port number.
    dst_port: u16,
    /// The sequence number of the first data octet in this segment, or the
    /// ISN when SYN is present.
    seq_number: u32,
    /// Next sequence number the sender expects to receive (valid when ACK is
    /// set).
    ack_number: u32,
    /// Data offset (4 bits), reserved (6 bits), and the control bits
    /// URG, ACK, PSH, RST, SYN, FIN (6 bits) from high to low.
    offset_and_control_bits: u16,
    /// Number of octets, starting at the acknowledgment number, the sender is
    /// willing to accept.
    window: u16,
    /// One's complement checksum over the pseudo header, header, and text.
    checksum: u16,
    /// Positive offset from the sequence number to the urgent data.
    urgent_pointer: u16,
    /// Options occupying the space between the fixed header and the data.
    options: TcpOptions,
}

const URG: u16 = 1 << 5;
const ACK: u16 = 1 << 4;
const PSH: u16 = 1 << 3;
const RST: u16 = 1 << 2;
const SYN: u16 = 1 << 1;
const FIN: u16 = 1;

impl TcpHeader {
    /// Minimum length of a TCP header in bytes.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Maximum length of a TCP header in bytes (data offset of 15).
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Minimum data offset of a TCP header.
    pub const MIN_DATA_OFFSET: u16 = 5;

    /// Maximum data offset of a TCP header.
    pub const MAX_DATA_OFFSET: u16 = 15;

    /// Creates a new TCP header with the specified ports, sequence number, and
    /// window size. No control bits or options are set.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            window,
            ..Default::default()
        }
    }

    /// Returns the `source port` field of the TCP header.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field of the TCP header.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `sequence number` field of the TCP header.
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Sets the `sequence number` field of the TCP header.
    pub fn set_seq_number(&mut self, seq: u32) {
        self.seq_number = seq;
    }

    /// Returns the `acknowledgment number` field of the TCP header.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Sets the `acknowledgment number` field of the TCP header.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Returns the `data offset` field of the TCP header in 32-bit words.
    ///
    /// To get the header length (including options) in bytes, use
    /// [TcpHeader::header_len].
    pub fn data_offset(&self) -> u8 {
        (self.offset_and_control_bits >> 12) as u8
    }

    /// Returns the six control bits (`URG` through `FIN`).
    pub fn control_bits(&self) -> u8 {
        (self.offset_and_control_bits & 0x3F) as u8
    }

    /// Returns `true` if the URG (Urgent) control bit is set.
    pub fn urg(&self) -> bool {
        self.offset_and_control_bits & URG != 0
    }

    /// Sets the URG (Urgent) control bit.
    pub fn set_urg(&mut self) {
        self.offset_and_control_bits |= URG;
    }

    /// Returns `true` if the ACK (Acknowledgment) control bit is set.
    pub fn ack(&self) -> bool {
        self.offset_and_control_bits & ACK != 0
    }

    /// Sets the ACK (Acknowledgment) control bit.
    pub fn set_ack(&mut self) {
        self.offset_and_control_bits |= ACK;
    }

    /// Returns `true` if the PSH (Push) control bit is set.
    pub fn psh(&self) -> bool {
        self.offset_and_control_bits & PSH != 0
    }

    /// Sets the PSH (Push) control bit.
    pub fn set_psh(&mut self) {
        self.offset_and_control_bits |= PSH;
    }

    /// Returns `true` if the RST (Reset) control bit is set.
    pub fn rst(&self) -> bool {
        self.offset_and_control_bits & RST != 0
    }

    /// Sets the RST (Reset) control bit.
    pub fn set_rst(&mut self) {
        self.offset_and_control_bits |= RST;
    }

    /// Returns `true` if the SYN (Synchronize) control bit is set.
    pub fn syn(&self) -> bool {
        self.offset_and_control_bits & SYN != 0
    }

    /// Sets the SYN (Synchronize) control bit.
    pub fn set_syn(&mut self) {
        self.offset_and_control_bits |= SYN;
    }

    /// Returns `true` if the FIN (Finish) control bit is set.
    pub fn fin(&self) -> bool {
        self.offset_and_control_bits & FIN != 0
    }

    /// Sets the FIN (Finish) control bit.
    pub fn set_fin(&mut self) {
        self.offset_and_control_bits |= FIN;
    }

    /// Returns the `window` field of the TCP header.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Sets the `window` field of the TCP header.
    pub fn set_window(&mut self, window: u16) {
        self.window = window;
    }

    /// Returns the `checksum` field of the TCP header.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Computes and updates the `checksum` field for the TCP header.
    pub fn set_checksum(&mut self, ip_header: &Ipv4Header, payload: &[u8]) {
        self.checksum = self.compute_checksum(ip_header, payload);
    }

    /// Returns `true` if the TCP header checksum is valid.
    pub fn is_valid_checksum(&self, ip_header: &Ipv4Header, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(ip_header, payload)
    }

    /// Returns the `urgent pointer` field of the TCP header.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Returns the options carried by the TCP header.
    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Appends the `Maximum Segment Size` (MSS) option.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space to append
    /// the MSS, or if the provided MSS value is invalid.
    pub fn set_option_mss(&mut self, mss: u16) -> crate::Result<()> {
        self.options.set_mss(mss)?;
        self.sync_data_offset();

        Ok(())
    }

    /// Appends the `SACK-Permitted` option (RFC 2018).
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space.
    pub fn set_option_sack_permitted(&mut self) -> crate::Result<()> {
        self.options.set_sack_permitted()?;
        self.sync_data_offset();

        Ok(())
    }

    /// Appends the `Timestamps` option (RFC 7323).
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space.
    pub fn set_option_timestamps(&mut self, val: u32, ecr: u32) -> crate::Result<()> {
        self.options.set_timestamps(val, ecr)?;
        self.sync_data_offset();

        Ok(())
    }

    /// Appends as many of the given `SACK` blocks as fit in the remaining
    /// option space, returning the number written.
    pub fn set_option_sack(&mut self, blocks: &[SackBlock]) -> usize {
        let written = self.options.set_sack(blocks);
        self.sync_data_offset();

        written
    }

    /// Rewrites the data offset from the current options length.
    fn sync_data_offset(&mut self) {
        debug_assert!(self.options.len() & 0b11 == 0);

        let words = Self::MIN_DATA_OFFSET + (self.options.len() as u16 >> 2);

        // Keep reserved and control bits.
        self.offset_and_control_bits &= 0x0FFF;
        self.offset_and_control_bits |= words << 12;
    }

    /// Returns the length of the TCP header in bytes, including options.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN as usize + self.options.len()
    }

    /// Returns the checksum over the pseudo header, the TCP header (with a
    /// zero checksum field), and the payload.
    ///
    /// ```text
    ///        +--------+--------+--------+--------+
    ///        |           Source Address          |
    ///        +--------+--------+--------+--------+
    ///        |         Destination Address       |
    ///        +--------+--------+--------+--------+
    ///        |  zero  |  PTCL  |    TCP Length   |
    ///        +--------+--------+--------+--------+
    /// ```
    pub fn compute_checksum(&self, ip_header: &Ipv4Header, payload: &[u8]) -> u16 {
        let mut pseudo_header = [0u8; 12];

        pseudo_header[0..4].copy_from_slice(&ip_header.src());
        pseudo_header[4..8].copy_from_slice(&ip_header.dst());
        pseudo_header[9] = ip_header.protocol().into();

        let tcp_len = (self.header_len() + payload.len()) as u16;
        pseudo_header[10..12].copy_from_slice(&tcp_len.to_be_bytes());

        let (mut raw_header, nbytes) = self.to_be_bytes();
        raw_header[16] = 0x00;
        raw_header[17] = 0x00;

        internet_checksum(&[&pseudo_header[..], &raw_header[..nbytes], payload])
    }

    /// Returns the memory representation of the TCP header as a byte array in
    /// big-endian (network) byte order, with the number of bytes used.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> ([u8; Self::MAX_HEADER_LEN as usize], usize) {
        let mut raw_header = [0u8; Self::MAX_HEADER_LEN as usize];
        let size = self.header_len();

        raw_header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw_header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw_header[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        raw_header[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        raw_header[12..14].copy_from_slice(&self.offset_and_control_bits.to_be_bytes());
        raw_header[14..16].copy_from_slice(&self.window.to_be_bytes());
        raw_header[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        raw_header[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        raw_header[20..size].copy_from_slice(self.options.as_slice());

        (raw_header, size)
    }

    /// Writes the TCP header to the given output stream.
    ///
    /// # Note
    ///
    /// The caller must ensure the checksum is computed and updated before
    /// writing the header.
    pub fn write<T: io::Write>(&self, output: &mut T) -> crate::Result<()> {
        let (raw_header, nbytes) = self.to_be_bytes();
        output.write_all(&raw_header[..nbytes])?;

        Ok(())
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = Error;

    /// Parses exactly one TCP header. The slice must end where the data offset
    /// says the header ends.
    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::MIN_HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: header_raw.len(),
                min: Self::MIN_HEADER_LEN,
                max: Self::MAX_HEADER_LEN,
            }));
        }

        let offset_and_control_bits = u16::from_be_bytes([header_raw[12], header_raw[13]]);
        let data_offset = offset_and_control_bits >> 12;

        if data_offset < Self::MIN_DATA_OFFSET {
            return Err(Error::Parse(ParseError::InvalidDataOffset {
                provided: data_offset,
                min: Self::MIN_DATA_OFFSET,
                max: Self::MAX_DATA_OFFSET,
            }));
        }

        if (data_offset << 2) as usize > header_raw.len() {
            return Err(Error::Parse(ParseError::HeaderLengthMismatch {
                provided: header_raw.len(),
                expected: data_offset << 2,
            }));
        }

        let opts_len = ((data_offset - Self::MIN_DATA_OFFSET) << 2) as usize;
        let rest = &header_raw[Self::MIN_HEADER_LEN as usize..];

        if rest.len() != opts_len {
            return Err(Error::Parse(ParseError::OptionsLengthMismatch {
                provided: rest.len(),
                expected: opts_len as u16,
            }));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([header_raw[0], header_raw[1]]),
            dst_port: u16::from_be_bytes([header_raw[2], header_raw[3]]),
            seq_number: u32::from_be_bytes([
                header_raw[4],
                header_raw[5],
                header_raw[6],
                header_raw[7],
            ]),
            ack_number: u32::from_be_bytes([
                header_raw[8],
                header_raw[9],
                header_raw[10],
                header_raw[11],
            ]),
            offset_and_control_bits,
            window: u16::from_be_bytes([header_raw[14], header_raw[15]]),
            checksum: u16::from_be_bytes([header_raw[16], header_raw[17]]),
            urgent_pointer: u16::from_be_bytes([header_raw[18], header_raw[19]]),
            options: TcpOptions::try_from(rest)?,
        })
    }
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq_number: 0,
            ack_number: 0,
            // Data offset 5, no control bits.
            offset_and_control_bits: 0b0101_000000_000000,
            window: 0,
            checksum: 0,
            urgent_pointer: 0,
            options: Default::default(),
        }
    }
}

/// A selective acknowledgment block `[left, right)` in sequence space
/// (RFC 2018).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    /// First sequence number of the block.
    pub left: u32,
    /// Sequence number immediately following the last byte of the block.
    pub right: u32,
}

/// Fixed-capacity list of SACK blocks, at most four fit in a header.
pub type SackBlocks = heapless::Vec<SackBlock, { TcpOptions::MAX_SACK_BLOCKS }>;

/// A decoded TCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    /// Maximum segment size the sender can receive.
    Mss(u16),
    /// Window scale shift count (parsed, not applied).
    WindowScale(u8),
    /// Sender can receive SACK options.
    SackPermitted,
    /// Selective acknowledgment blocks.
    Sack(SackBlocks),
    /// Timestamp value and echo reply.
    Timestamps {
        /// TSval
        val: u32,
        /// TSecr
        ecr: u32,
    },
    /// Option of an unrecognized kind, skipped by length.
    Unknown {
        /// Option kind.
        kind: u8,
        /// Total option length, kind and length octets included.
        len: u8,
    },
}

/// Options within a TCP header.
#[derive(Debug, Clone, Copy)]
pub struct TcpOptions {
    /// The total number of bytes occupying the buffer.
    len: usize,
    /// Fixed-size array of raw options bytes.
    buf: [u8; Self::MAX_OPTIONS_LEN],
}

impl TcpOptions {
    /// Maximum length of TCP options in bytes.
    pub const MAX_OPTIONS_LEN: usize = 40;

    /// Most SACK blocks a single option can carry.
    pub const MAX_SACK_BLOCKS: usize = 4;

    /// Length of MSS option in bytes.
    pub const MSS_LEN: usize = 4;

    /// Bytes used by the NOP-padded SACK-Permitted option.
    pub const SACK_PERMITTED_LEN: usize = 4;

    /// Bytes used by the NOP-padded Timestamps option.
    pub const TIMESTAMPS_LEN: usize = 12;

    /// Creates a new empty TCP options.
    pub fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; Self::MAX_OPTIONS_LEN],
        }
    }

    /// Returns an iterator decoding each option in order.
    ///
    /// `NOP` is skipped and `EOL` ends the iteration. A malformed option
    /// yields one error and ends the iteration.
    pub fn iter(&self) -> OptionsIter<'_> {
        OptionsIter {
            buf: self.as_slice(),
            pos: 0,
        }
    }

    /// Returns the Maximum Segment Size (MSS) value, if present.
    pub fn mss(&self) -> Option<u16> {
        self.iter().find_map(|opt| match opt {
            Ok(TcpOption::Mss(mss)) => Some(mss),
            _ => None,
        })
    }

    /// Returns the window scale shift count, if present.
    pub fn window_scale(&self) -> Option<u8> {
        self.iter().find_map(|opt| match opt {
            Ok(TcpOption::WindowScale(shift)) => Some(shift),
            _ => None,
        })
    }

    /// Returns `true` if the SACK-Permitted option is present.
    pub fn sack_permitted(&self) -> bool {
        self.iter()
            .any(|opt| matches!(opt, Ok(TcpOption::SackPermitted)))
    }

    /// Returns the `(TSval, TSecr)` pair, if present.
    pub fn timestamps(&self) -> Option<(u32, u32)> {
        self.iter().find_map(|opt| match opt {
            Ok(TcpOption::Timestamps { val, ecr }) => Some((val, ecr)),
            _ => None,
        })
    }

    /// Returns the SACK blocks carried, or an empty list.
    pub fn sack_blocks(&self) -> SackBlocks {
        self.iter()
            .find_map(|opt| match opt {
                Ok(TcpOption::Sack(blocks)) => Some(blocks),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Appends the Maximum Segment Size (MSS) option. An MSS that is already
    /// present is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space to append
    /// the MSS, or if the provided MSS value is invalid.
    pub fn set_mss(&mut self, mss: u16) -> crate::Result<()> {
        if self.mss().is_some() {
            return Ok(());
        }

        if mss == 0 {
            return Err(Error::Header(HeaderError::InvalidMssOption));
        }

        let [hi, lo] = mss.to_be_bytes();
        self.append(&[OptionKind::MSS.into(), Self::MSS_LEN as u8, hi, lo])
    }

    /// Appends the SACK-Permitted option, preceded by two `NOP`s.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space.
    pub fn set_sack_permitted(&mut self) -> crate::Result<()> {
        let nop = OptionKind::NOP.into();
        self.append(&[nop, nop, OptionKind::SACK_PERMITTED.into(), 2])
    }

    /// Appends the Timestamps option, preceded by two `NOP`s.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space.
    pub fn set_timestamps(&mut self, val: u32, ecr: u32) -> crate::Result<()> {
        let mut opt = [0u8; Self::TIMESTAMPS_LEN];

        opt[0] = OptionKind::NOP.into();
        opt[1] = OptionKind::NOP.into();
        opt[2] = OptionKind::TIMESTAMPS.into();
        opt[3] = 10;
        opt[4..8].copy_from_slice(&val.to_be_bytes());
        opt[8..12].copy_from_slice(&ecr.to_be_bytes());

        self.append(&opt)
    }

    /// Appends a SACK option with as many of `blocks` as fit, preceded by two
    /// `NOP`s. Returns the number of blocks written, which is zero when not
    /// even one block fits.
    pub fn set_sack(&mut self, blocks: &[SackBlock]) -> usize {
        let free = Self::MAX_OPTIONS_LEN - self.len;
        if free < 4 + 8 || blocks.is_empty() {
            return 0;
        }

        let count = blocks
            .len()
            .min((free - 4) / 8)
            .min(Self::MAX_SACK_BLOCKS);

        let mut opt = [0u8; 4 + 8 * Self::MAX_SACK_BLOCKS];

        opt[0] = OptionKind::NOP.into();
        opt[1] = OptionKind::NOP.into();
        opt[2] = OptionKind::SACK.into();
        opt[3] = (2 + 8 * count) as u8;

        for (i, block) in blocks[..count].iter().enumerate() {
            let at = 4 + 8 * i;
            opt[at..at + 4].copy_from_slice(&block.left.to_be_bytes());
            opt[at + 4..at + 8].copy_from_slice(&block.right.to_be_bytes());
        }

        match self.append(&opt[..4 + 8 * count]) {
            Ok(()) => count,
            Err(_) => 0,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> crate::Result<()> {
        if self.len + bytes.len() > Self::MAX_OPTIONS_LEN {
            return Err(Error::Header(HeaderError::InsufficientOptionSpace {
                attempted_len: self.len + bytes.len(),
                current_len: self.len,
                max_len: Self::MAX_OPTIONS_LEN,
            }));
        }

        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();

        Ok(())
    }

    /// Returns the length of the TCP options in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the TCP options contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns an immutable slice containing the TCP options.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl TryFrom<&[u8]> for TcpOptions {
    type Error = Error;

    fn try_from(opts_slice: &[u8]) -> Result<Self, Self::Error> {
        if opts_slice.len() > Self::MAX_OPTIONS_LEN {
            return Err(Error::Parse(ParseError::InvalidOptionsLength {
                provided: opts_slice.len(),
                max: Self::MAX_OPTIONS_LEN,
            }));
        }

        let mut opts = Self::new();
        opts.buf[..opts_slice.len()].copy_from_slice(opts_slice);
        opts.len = opts_slice.len();

        // Reject structurally malformed option lists up front.
        for opt in opts.iter() {
            opt?;
        }

        Ok(opts)
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the options of a [TcpOptions].
#[derive(Debug)]
pub struct OptionsIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Iterator for OptionsIter<'_> {
    type Item = crate::Result<TcpOption>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let kind = *self.buf.get(self.pos)?;

            match OptionKind::from(kind) {
                OptionKind::EOL => {
                    self.pos = self.buf.len();
                    return None;
                }
                OptionKind::NOP => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }

            let len = self.buf.get(self.pos + 1).copied().unwrap_or(0);

            if len < 2 || self.pos + len as usize > self.buf.len() {
                self.pos = self.buf.len();
                return Some(Err(Error::Header(HeaderError::InvalidOptionLength {
                    kind,
                    len,
                })));
            }

            let body = &self.buf[self.pos + 2..self.pos + len as usize];
            self.pos += len as usize;

            let decoded = decode_option(kind, len, body);
            if decoded.is_err() {
                self.pos = self.buf.len();
            }

            return Some(decoded);
        }
    }
}

fn decode_option(kind: u8, len: u8, body: &[u8]) -> crate::Result<TcpOption> {
    let invalid = || Error::Header(HeaderError::InvalidOptionLength { kind, len });

    match OptionKind::from(kind) {
        OptionKind::MSS => match body {
            [hi, lo] => Ok(TcpOption::Mss(u16::from_be_bytes([*hi, *lo]))),
            _ => Err(invalid()),
        },
        OptionKind::WINDOW_SCALE => match body {
            [shift] => Ok(TcpOption::WindowScale(*shift)),
            _ => Err(invalid()),
        },
        OptionKind::SACK_PERMITTED if body.is_empty() => Ok(TcpOption::SackPermitted),
        OptionKind::SACK => {
            if body.is_empty() || body.len() % 8 != 0 {
                return Err(invalid());
            }

            let mut blocks = SackBlocks::new();
            for chunk in body.chunks_exact(8) {
                let block = SackBlock {
                    left: u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                    right: u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                };

                blocks.push(block).map_err(|_| invalid())?;
            }

            Ok(TcpOption::Sack(blocks))
        }
        OptionKind::TIMESTAMPS if body.len() == 8 => Ok(TcpOption::Timestamps {
            val: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            ecr: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        }),
        OptionKind::Unknown(_) => Ok(TcpOption::Unknown { kind, len }),
        _ => Err(invalid()),
    }
}

/// Kinds of TCP options (RFC 793, RFC 2018, RFC 7323).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum OptionKind {
    /// End of Option List (kind 0).
    EOL,
    /// No-Operation (kind 1), used to align options on a word boundary.
    NOP,
    /// Maximum Segment Size (kind 2, length 4).
    MSS,
    /// Window Scale (kind 3, length 3).
    WINDOW_SCALE,
    /// SACK-Permitted (kind 4, length 2). Only sent on `SYN` segments.
    SACK_PERMITTED,
    /// SACK (kind 5, length 2 + 8n).
    SACK,
    /// Timestamps (kind 8, length 10).
    TIMESTAMPS,
    /// Any other kind.
    Unknown(u8),
}

impl From<u8> for OptionKind {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::EOL,
            1 => Self::NOP,
            2 => Self::MSS,
            3 => Self::WINDOW_SCALE,
            4 => Self::SACK_PERMITTED,
            5 => Self::SACK,
            8 => Self::TIMESTAMPS,
            other => Self::Unknown(other),
        }
    }
}

impl From<OptionKind> for u8 {
    fn from(kind: OptionKind) -> u8 {
        match kind {
            OptionKind::EOL => 0,
            OptionKind::NOP => 1,
            OptionKind::MSS => 2,
            OptionKind::WINDOW_SCALE => 3,
            OptionKind::SACK_PERMITTED => 4,
            OptionKind::SACK => 5,
            OptionKind::TIMESTAMPS => 8,
            OptionKind::Unknown(other) => other,
        }
    }
}
