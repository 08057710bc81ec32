//! Construction and serialization of TCP segments.

use std::io::Write;

use super::SeqNumber;
use super::headers::{Flags, TcpHeader};
use crate::Result;

/// Fully constructed TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    /// TCP header of the segment.
    pub tcp: TcpHeader,
    /// Payload of the segment.
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Create a new TCP segment given the TCP header and payload.
    pub fn new(tcp: TcpHeader, payload: &[u8]) -> Self {
        Self {
            tcp,
            payload: payload.into(),
        }
    }

    /// Parses a TCP segment (header followed by payload) from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header or its options are malformed.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let tcp = TcpHeader::try_from(raw)?;
        let payload = &raw[tcp.header_len()..];

        Ok(Self::new(tcp, payload))
    }

    /// Returns the control bits of the segment.
    pub fn flags(&self) -> Flags {
        self.tcp.flags()
    }

    /// Returns the sequence number of the segment.
    pub fn seq(&self) -> SeqNumber {
        self.tcp.seq_number()
    }

    /// Returns the number of sequence numbers the segment occupies
    /// (`SEG.LEN`): the payload length plus one for each of `SYN` and `FIN`.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.tcp.syn()) + u32::from(self.tcp.fin())
    }

    /// Returns the memory representation of the TCP segment as a vector of
    /// bytes in big-endian (network) byte order.
    pub fn to_be_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.tcp.header_len() + self.payload.len());

        self.tcp.write(&mut buf)?;
        buf.write_all(&self.payload)?;

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_parse_splits_payload() {
        let mut header = TcpHeader::new(4000, 80, SeqNumber::new(101), Flags::PSH | Flags::ACK, 512);
        header.set_ack_number(SeqNumber::new(501));

        let seg = TcpSegment::new(header, b"hello");
        let raw = seg.to_be_bytes().unwrap();

        assert_eq!(raw.len(), 25);

        let parsed = TcpSegment::parse(&raw).unwrap();
        assert_eq!(parsed.payload, b"hello");
        assert_eq!(parsed.seq(), SeqNumber::new(101));
        assert_eq!(parsed.tcp.ack_number(), SeqNumber::new(501));
        assert_eq!(parsed.flags(), Flags::PSH | Flags::ACK);
    }

    #[test]
    fn segment_seq_len_counts_control_bits() {
        let syn = TcpSegment::new(TcpHeader::new(1, 2, SeqNumber::new(0), Flags::SYN, 0), &[]);
        let fin = TcpSegment::new(
            TcpHeader::new(1, 2, SeqNumber::new(0), Flags::FIN | Flags::ACK, 0),
            b"abc",
        );
        let ack = TcpSegment::new(TcpHeader::new(1, 2, SeqNumber::new(0), Flags::ACK, 0), &[]);

        assert_eq!(syn.seq_len(), 1);
        assert_eq!(fin.seq_len(), 4);
        assert_eq!(ack.seq_len(), 0);
    }
}
