use std::{fmt, io};

use bitflags::bitflags;

use crate::config::MAX_WINDOW_SCALE;
use crate::protocol::SeqNumber;
use crate::{Error, HeaderError, ParseError};

bitflags! {
    /// TCP control bits.
    ///
    /// ```text
    ///    URG:  Urgent Pointer field significant
    ///    ACK:  Acknowledgment field significant
    ///    PSH:  Push Function
    ///    RST:  Reset the connection
    ///    SYN:  Synchronize sequence numbers
    ///    FIN:  No more data from sender
    /// ```
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// No more data from sender.
        const FIN = 1;
        /// Synchronize sequence numbers.
        const SYN = 1 << 1;
        /// Reset the connection.
        const RST = 1 << 2;
        /// Push function.
        const PSH = 1 << 3;
        /// Acknowledgment field significant.
        const ACK = 1 << 4;
        /// Urgent pointer field significant.
        const URG = 1 << 5;
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }

        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{name}")?;
        }

        Ok(())
    }
}

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
///    |                             data                              |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The checksum is carried as-is. Computing it requires the IP pseudo header,
/// which is the concern of the layer that frames segments for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    /// Sequence number of the first octet (the ISN on a SYN).
    seq_number: u32,
    /// Next sequence number the sender expects; meaningful only with ACK.
    ack_number: u32,
    /// The data offset (4-bits), reserved bits (6-bits), and control bits
    /// (6-bits), as they appear on the wire.
    offset_and_control_bits: u16,
    /// Receive window, unscaled as it appears on the wire.
    window: u16,
    /// Filled in by the framing layer.
    checksum: u16,
    urgent_pointer: u16,
    options: TcpOptions,
}

impl TcpHeader {
    /// Length of a header without options, in bytes.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Length of a header with a full options area, in bytes.
    ///
    /// The data offset is a 4-bit count of 32-bit words, so the largest header
    /// is `0b1111` words, or 60 bytes.
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Data offset (in 32-bit words) of a header without options.
    pub const MIN_DATA_OFFSET: u16 = 5;

    /// Largest data offset the 4-bit field can hold.
    pub const MAX_DATA_OFFSET: u16 = 15;

    /// Creates a new TCP header with the specified ports, sequence number,
    /// control bits, and window size, while setting default values for other
    /// fields.
    pub fn new(src_port: u16, dst_port: u16, seq: SeqNumber, flags: Flags, window: u16) -> Self {
        let mut header = Self {
            src_port,
            dst_port,
            seq_number: seq.get(),
            window,
            ..Default::default()
        };

        header.set_flags(flags);
        header
    }

    /// Returns the source and destination ports from a raw header without
    /// validating the rest of it.
    ///
    /// Used to locate the connection a malformed segment belongs to.
    pub fn peek_ports(header_raw: &[u8]) -> Option<(u16, u16)> {
        if header_raw.len() < 4 {
            return None;
        }

        Some((
            u16::from_be_bytes([header_raw[0], header_raw[1]]),
            u16::from_be_bytes([header_raw[2], header_raw[3]]),
        ))
    }

    /// Returns the source port.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the destination port.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the sequence number.
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber::new(self.seq_number)
    }

    /// Returns the acknowledgment number. Only meaningful when
    /// [TcpHeader::ack] is `true`.
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber::new(self.ack_number)
    }

    /// Sets the acknowledgment number. The ACK bit is left untouched.
    pub fn set_ack_number(&mut self, ack: SeqNumber) {
        self.ack_number = ack.get();
    }

    /// Returns the header length in 32-bit words. See
    /// [TcpHeader::header_len] for bytes.
    pub fn data_offset(&self) -> u8 {
        (self.offset_and_control_bits >> 12) as u8
    }

    /// Returns the control bits of the TCP header.
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate((self.offset_and_control_bits & 0x3F) as u8)
    }

    /// Replaces the control bits of the TCP header, keeping the data offset
    /// and reserved bits.
    pub fn set_flags(&mut self, flags: Flags) {
        self.offset_and_control_bits &= !0x3F;
        self.offset_and_control_bits |= flags.bits() as u16;
    }

    /// URG bit.
    pub fn urg(&self) -> bool {
        self.flags().contains(Flags::URG)
    }

    /// ACK bit.
    pub fn ack(&self) -> bool {
        self.flags().contains(Flags::ACK)
    }

    /// PSH bit.
    pub fn psh(&self) -> bool {
        self.flags().contains(Flags::PSH)
    }

    /// RST bit.
    pub fn rst(&self) -> bool {
        self.flags().contains(Flags::RST)
    }

    /// SYN bit.
    pub fn syn(&self) -> bool {
        self.flags().contains(Flags::SYN)
    }

    /// FIN bit.
    pub fn fin(&self) -> bool {
        self.flags().contains(Flags::FIN)
    }

    /// Returns the raw window field. Any negotiated scale is applied by the
    /// connection, not here.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Sets the raw window field.
    pub fn set_window(&mut self, window: u16) {
        self.window = window;
    }

    /// Returns the checksum as received.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Sets the `checksum` field of the TCP header to an externally computed
    /// value.
    pub fn set_checksum(&mut self, checksum: u16) {
        self.checksum = checksum;
    }

    /// Returns the urgent pointer. Urgent data is not interpreted.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Returns the options area.
    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Appends the `Maximum Segment Size` (MSS) option with the provided value.
    ///
    /// # Errors
    ///
    /// Fails with [HeaderError::InsufficientOptionSpace] when the options area
    /// is full, or [HeaderError::InvalidMssOption] for a zero MSS.
    pub fn set_option_mss(&mut self, mss: u16) -> crate::Result<()> {
        self.options.set_mss(mss)?;
        self.sync_data_offset();

        Ok(())
    }

    /// Appends the `Window Scale` option with the provided shift count.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space or the
    /// shift count exceeds 14.
    pub fn set_option_window_scale(&mut self, shift: u8) -> crate::Result<()> {
        self.options.set_window_scale(shift)?;
        self.sync_data_offset();

        Ok(())
    }

    /// Returns the header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN as usize + self.options.len()
    }

    /// Recomputes the data offset from the current options length.
    fn sync_data_offset(&mut self) {
        let data_offset = (self.header_len() >> 2) as u16;

        self.offset_and_control_bits &= 0x0FFF;
        self.offset_and_control_bits |= data_offset << 12;
    }

    /// Serializes the header in network byte order.
    ///
    /// Returns a buffer sized for the largest header along with the number of
    /// bytes in use.
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

    /// Serializes the header into `output`.
    pub fn write<T: io::Write>(&self, output: &mut T) -> crate::Result<()> {
        let (raw_header, nbytes) = self.to_be_bytes();
        output.write_all(&raw_header[..nbytes])?;

        Ok(())
    }
}

/// Parses a TCP header from the front of a segment. Bytes past the length
/// indicated by the data offset are payload and are not inspected.
impl TryFrom<&[u8]> for TcpHeader {
    type Error = Error;

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

        // There are less bytes in the buffer than advertised by data offset.
        if (data_offset << 2) as usize > header_raw.len() {
            return Err(Error::Parse(ParseError::HeaderLengthMismatch {
                provided: header_raw.len(),
                expected: data_offset << 2,
            }));
        }

        let options = if data_offset > Self::MIN_DATA_OFFSET {
            // Limit range to data offset so payload bytes are not
            // accidentally read as options.
            TcpOptions::try_from(&header_raw[20..(data_offset << 2) as usize])?
        } else {
            TcpOptions::new()
        };

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
            options,
        })
    }
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            ack_number: 0,
            // Data Offset = 5, Reserved = 0, no control bits set.
            offset_and_control_bits: 0b0101_000000_000000,
            checksum: 0,
            urgent_pointer: 0,
            options: Default::default(),

            src_port: 0,
            dst_port: 0,
            seq_number: 0,
            window: 0,
        }
    }
}

/// Options within a TCP header.
///
/// Instances are always well formed: parsing rejects malformed lengths, and
/// the builders only append complete, word-aligned options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    /// The total number of bytes occupying the buffer.
    len: usize,
    /// Fixed-size array of raw options bytes.
    buf: [u8; Self::MAX_OPTIONS_LEN],
}

impl TcpOptions {
    /// Maximum length of TCP options in bytes.
    pub const MAX_OPTIONS_LEN: usize = 40;

    /// Length of MSS option in bytes.
    pub const MSS_LEN: usize = 4;

    /// Length of Window Scale option in bytes.
    pub const WSCALE_LEN: usize = 3;

    /// Creates a new empty TCP options.
    pub fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; Self::MAX_OPTIONS_LEN],
        }
    }

    /// Returns the Maximum Segment Size (MSS) value from the TCP options, if
    /// present.
    pub fn mss(&self) -> Option<u16> {
        // RFC 793 (3.1)
        //
        // ```text
        //          1        2        3         4
        //        +--------+--------+---------+--------+
        //        |00000010|00000100|   max seg size   |
        //        +--------+--------+---------+--------+
        // ```
        self.iter()
            .find(|(kind, _)| *kind == OptionKind::MSS)
            .map(|(_, value)| u16::from_be_bytes([value[0], value[1]]))
    }

    /// Returns the Window Scale shift count from the TCP options, if present.
    ///
    /// Shift counts above 14 are treated as 14 (RFC 7323 2.3).
    pub fn window_scale(&self) -> Option<u8> {
        // RFC 7323 (2.2)
        //
        // ```text
        //        +---------+---------+---------+
        //        | Kind=3  |Length=3 |shift.cnt|
        //        +---------+---------+---------+
        // ```
        self.iter()
            .find(|(kind, _)| *kind == OptionKind::WSCALE)
            .map(|(_, value)| value[0].min(MAX_WINDOW_SCALE))
    }

    /// Appends the Maximum Segment Size (MSS) option in the TCP options using
    /// the provided value.
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

    /// Appends the Window Scale option, preceded by a NOP so the options stay
    /// aligned to a 4-byte boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the options buffer lacks sufficient space or the
    /// shift count exceeds 14.
    pub fn set_window_scale(&mut self, shift: u8) -> crate::Result<()> {
        if self.window_scale().is_some() {
            return Ok(());
        }

        if shift > MAX_WINDOW_SCALE {
            return Err(Error::Header(HeaderError::InvalidWindowScale {
                provided: shift,
                max: MAX_WINDOW_SCALE,
            }));
        }

        self.append(&[
            OptionKind::NOP.into(),
            OptionKind::WSCALE.into(),
            Self::WSCALE_LEN as u8,
            shift,
        ])
    }

    fn append(&mut self, option: &[u8]) -> crate::Result<()> {
        let opts_len = self.len();

        if opts_len + option.len() > Self::MAX_OPTIONS_LEN {
            return Err(Error::Header(HeaderError::InsufficientOptionSpace {
                attempted_len: (opts_len + option.len()),
                current_len: opts_len,
                max_len: Self::MAX_OPTIONS_LEN,
            }));
        }

        self.buf[opts_len..opts_len + option.len()].copy_from_slice(option);
        self.len += option.len();

        Ok(())
    }

    /// Returns an iterator over the `(kind, value)` pairs of the options,
    /// stopping at the end of option list.
    pub fn iter(&self) -> OptionsIter<'_> {
        OptionsIter {
            buf: self.as_slice(),
        }
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
        let len = opts_slice.len();

        if len > Self::MAX_OPTIONS_LEN {
            return Err(Error::Parse(ParseError::InvalidOptionsLength {
                provided: len,
                max: Self::MAX_OPTIONS_LEN,
            }));
        }

        // The options area is covered by the data offset, so it must be a
        // whole number of 32-bit words.
        if len & 0b11 != 0 {
            return Err(Error::Parse(ParseError::MisalignedOptions { provided: len }));
        }

        let mut i = 0;

        while i < len {
            let kind = OptionKind::from(opts_slice[i]);

            match kind {
                OptionKind::EOL => break,
                OptionKind::NOP => {
                    i += 1;
                    continue;
                }
                _ => {}
            }

            let remaining = len - i;

            if remaining < 2 {
                return Err(Error::Parse(ParseError::InvalidOptionLength {
                    kind: kind.into(),
                    provided: 0,
                    remaining,
                }));
            }

            let opt_len = opts_slice[i + 1] as usize;

            if opt_len < 2 || opt_len > remaining {
                return Err(Error::Parse(ParseError::InvalidOptionLength {
                    kind: kind.into(),
                    provided: opt_len,
                    remaining,
                }));
            }

            match kind {
                OptionKind::MSS if opt_len != Self::MSS_LEN => {
                    return Err(Error::Parse(ParseError::InvalidMssLength { provided: opt_len }));
                }
                OptionKind::WSCALE if opt_len != Self::WSCALE_LEN => {
                    return Err(Error::Parse(ParseError::InvalidWindowScaleLength {
                        provided: opt_len,
                    }));
                }
                // Options we do not implement are skipped by their length.
                _ => {}
            }

            i += opt_len;
        }

        let mut buf = [0u8; Self::MAX_OPTIONS_LEN];
        buf[..len].copy_from_slice(opts_slice);

        Ok(Self { len, buf })
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over well-formed TCP options.
#[derive(Debug)]
pub struct OptionsIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for OptionsIter<'a> {
    type Item = (OptionKind, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (&kind, rest) = self.buf.split_first()?;

            match OptionKind::from(kind) {
                OptionKind::EOL => {
                    self.buf = &[];
                    return None;
                }
                OptionKind::NOP => {
                    self.buf = rest;
                }
                kind => {
                    let opt_len = (*rest.first()? as usize).clamp(2, self.buf.len());
                    let value = &self.buf[2.min(opt_len)..opt_len];

                    self.buf = &self.buf[opt_len..];
                    return Some((kind, value));
                }
            }
        }
    }
}

/// Kinds of TCP options (RFC 793 3.1, RFC 7323 2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum OptionKind {
    /// End of Option List
    ///
    /// ```text
    ///        +--------+
    ///        |00000000|
    ///        +--------+
    ///         Kind=0
    /// ```
    EOL,
    /// No-Operation
    ///
    /// ```text
    ///        +--------+
    ///        |00000001|
    ///        +--------+
    ///         Kind=1
    /// ```
    NOP,
    /// Maximum Segment Size
    ///
    /// ```text
    ///        +--------+--------+---------+--------+
    ///        |00000010|00000100|   max seg size   |
    ///        +--------+--------+---------+--------+
    ///         Kind=2   Length=4
    /// ```
    MSS,
    /// Window Scale
    ///
    /// ```text
    ///        +--------+--------+--------+
    ///        |00000011|00000011|shift.cnt|
    ///        +--------+--------+--------+
    ///         Kind=3   Length=3
    /// ```
    WSCALE,
    /// Any other option, skipped using its length byte.
    Unknown(u8),
}

impl From<u8> for OptionKind {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::EOL,
            1 => Self::NOP,
            2 => Self::MSS,
            3 => Self::WSCALE,
            other => Self::Unknown(other),
        }
    }
}

impl From<OptionKind> for u8 {
    fn from(kind: OptionKind) -> Self {
        match kind {
            OptionKind::EOL => 0,
            OptionKind::NOP => 1,
            OptionKind::MSS => 2,
            OptionKind::WSCALE => 3,
            OptionKind::Unknown(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    /// `SYN` captured from a Linux client: MSS 1460, SACK permitted,
    /// timestamps, NOP, window scale 7.
    const SYN_BYTES: [u8; 40] = [
        0xa0, 0x16, 0x01, 0xbb, 0xbc, 0xbb, 0x54, 0xa8, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x02, 0xfa,
        0xf0, 0xbb, 0x4c, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0x04, 0x02, 0x08, 0x0a, 0x78, 0x27,
        0xe4, 0xe7, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x03, 0x07,
    ];

    #[test]
    fn tcp_header_basic_valid() {
        let header = TcpHeader::try_from(&SYN_BYTES[..]);
        assert!(header.is_ok());
        let header = header.unwrap();

        assert_eq!(header.src_port(), 40982);
        assert_eq!(header.dst_port(), 443);
        assert_eq!(header.seq_number(), SeqNumber::new(3166393512));
        assert_eq!(header.ack_number(), SeqNumber::new(0));
        assert_eq!(header.data_offset(), 10);
        assert_eq!(header.flags(), Flags::SYN);
        assert!(header.syn());
        assert!(!header.ack());
        assert_eq!(header.window(), 64240);
        assert_eq!(header.checksum(), 0xBB4C);
        assert_eq!(header.urgent_pointer(), 0);
        assert_eq!(header.options().len(), 20);
        assert_eq!(header.options().mss(), Some(1460));
        assert_eq!(header.options().window_scale(), Some(7));
    }

    #[test]
    fn tcp_header_serialize_matches_capture() {
        let header = TcpHeader::try_from(&SYN_BYTES[..]).unwrap();

        let (buf, nbytes) = header.to_be_bytes();

        assert_eq!(&buf[..nbytes], &SYN_BYTES[..]);
    }

    #[test]
    fn tcp_header_flags_bit_isolation_valid() {
        for bits in 0u8..=0b0011_1111 {
            let mut header_bytes = SYN_BYTES;
            header_bytes[13] = bits;

            let header = TcpHeader::try_from(&header_bytes[..]).unwrap();
            let flags = header.flags();

            assert_eq!(flags.bits(), bits, "flags failed for {bits:06b}");
            assert_eq!(header.urg(), bits & 0b10_0000 != 0);
            assert_eq!(header.ack(), bits & 0b01_0000 != 0);
            assert_eq!(header.psh(), bits & 0b00_1000 != 0);
            assert_eq!(header.rst(), bits & 0b00_0100 != 0);
            assert_eq!(header.syn(), bits & 0b00_0010 != 0);
            assert_eq!(header.fin(), bits & 0b00_0001 != 0);
            assert_eq!(header.data_offset(), 10);
        }
    }

    #[test]
    fn tcp_header_set_flags_keeps_offset() {
        let mut header = TcpHeader::new(1, 2, SeqNumber::new(7), Flags::SYN, 100);
        header.set_option_mss(536).unwrap();
        header.set_flags(Flags::FIN | Flags::ACK);

        assert_eq!(header.data_offset(), 6);
        assert_eq!(header.flags(), Flags::FIN | Flags::ACK);
        assert_eq!(header.flags().to_string(), "FIN|ACK");
    }

    #[test]
    fn tcp_header_set_options_valid() {
        let mut header = TcpHeader::new(4000, 80, SeqNumber::new(100), Flags::SYN, 4096);

        assert_eq!(header.data_offset(), 5);
        assert_eq!(header.options().mss(), None);

        header.set_option_mss(1460).unwrap();
        header.set_option_window_scale(2).unwrap();

        assert!(header.syn());
        assert_eq!(header.data_offset(), 7);
        assert_eq!(header.options().mss(), Some(1460));
        assert_eq!(header.options().window_scale(), Some(2));

        let (buf, nbytes) = header.to_be_bytes();
        let parsed = TcpHeader::try_from(&buf[..nbytes]).unwrap();

        assert_eq!(parsed, header);
    }

    #[test]
    fn tcp_header_payload_not_parsed_as_options() {
        let mut bytes = SYN_BYTES[..20].to_vec();
        bytes[12] = 0x50;
        bytes.extend_from_slice(&[0x02, 0x01, 0xFF]);

        let header = TcpHeader::try_from(&bytes[..]).unwrap();
        assert!(header.options().is_empty());
    }

    #[test]
    fn tcp_header_data_offset_too_small_invalid() {
        let mut bytes = SYN_BYTES;
        bytes[12] = 0x40;

        assert_matches!(
            TcpHeader::try_from(&bytes[..]),
            Err(Error::Parse(ParseError::InvalidDataOffset { provided: 4, .. }))
        );
    }

    #[test]
    fn tcp_header_truncated_invalid() {
        // Data offset claims 40 bytes, only 32 provided.
        assert_matches!(
            TcpHeader::try_from(&SYN_BYTES[..32]),
            Err(Error::Parse(ParseError::HeaderLengthMismatch {
                provided: 32,
                expected: 40
            }))
        );

        assert_matches!(
            TcpHeader::try_from(&SYN_BYTES[..12]),
            Err(Error::Parse(ParseError::InvalidBufferLength { provided: 12, .. }))
        );
    }

    #[test]
    fn tcp_options_length_exceeds_remaining_invalid() {
        // Unknown option kind 8 claims 10 bytes with 4 left.
        let opts = [0x01, 0x01, 0x08, 0x0a, 0x00, 0x00, 0x00, 0x00];

        assert_matches!(
            TcpOptions::try_from(&opts[..]),
            Err(Error::Parse(ParseError::InvalidOptionLength {
                kind: 8,
                provided: 10,
                remaining: 6
            }))
        );
    }

    #[test]
    fn tcp_options_zero_length_invalid() {
        let opts = [0x05, 0x00, 0x01, 0x01];

        assert_matches!(
            TcpOptions::try_from(&opts[..]),
            Err(Error::Parse(ParseError::InvalidOptionLength { provided: 0, .. }))
        );
    }

    #[test]
    fn tcp_options_misaligned_invalid() {
        let opts = [0x01, 0x03, 0x03, 0x07, 0x01, 0x01];

        assert_matches!(
            TcpOptions::try_from(&opts[..]),
            Err(Error::Parse(ParseError::MisalignedOptions { provided: 6 }))
        );
    }

    #[test]
    fn tcp_options_mss_wrong_length_invalid() {
        let opts = [0x02, 0x03, 0x05, 0x01];

        assert_matches!(
            TcpOptions::try_from(&opts[..]),
            Err(Error::Parse(ParseError::InvalidMssLength { provided: 3 }))
        );

        let opts = [0x03, 0x04, 0x05, 0x01];

        assert_matches!(
            TcpOptions::try_from(&opts[..]),
            Err(Error::Parse(ParseError::InvalidWindowScaleLength { provided: 4 }))
        );
    }

    #[test]
    fn tcp_options_end_of_list_stops_parsing() {
        // Garbage after EOL is padding and is not validated.
        let opts = [0x02, 0x04, 0x02, 0x18, 0x00, 0xFF, 0xFF, 0xFF];
        let parsed = TcpOptions::try_from(&opts[..]).unwrap();

        assert_eq!(parsed.mss(), Some(536));
        assert_eq!(parsed.window_scale(), None);
        assert_eq!(parsed.iter().count(), 1);
    }

    #[test]
    fn tcp_options_window_scale_clamped() {
        let opts = [0x01, 0x03, 0x03, 0x1E];
        let parsed = TcpOptions::try_from(&opts[..]).unwrap();

        assert_eq!(parsed.window_scale(), Some(14));
    }

    #[test]
    fn tcp_options_space_exhausted() {
        let mut opts = TcpOptions::try_from(&[0x01; 40][..]).unwrap();

        assert_matches!(
            opts.set_mss(1460),
            Err(Error::Header(HeaderError::InsufficientOptionSpace { .. }))
        );
        assert_matches!(
            TcpOptions::new().set_window_scale(15),
            Err(Error::Header(HeaderError::InvalidWindowScale { provided: 15, .. }))
        );
        assert_matches!(
            TcpOptions::new().set_mss(0),
            Err(Error::Header(HeaderError::InvalidMssOption))
        );
    }
}
