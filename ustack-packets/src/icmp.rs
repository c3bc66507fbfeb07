use crate::{internet_checksum, ParseError};

/// The size of an ICMP "header", which precedes the data field
pub const ICMP_HEADER_LEN: usize = 4;

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DESTINATION_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO: u8 = 8;

pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

// Bytes of the offending datagram's payload quoted in an error message.
const QUOTED_PAYLOAD_LEN: usize = 8;

/// An ICMPv4 message: type, code, checksum, then everything after the checksum as `data`
/// (for echo that includes identifier and sequence number).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IcmpMessage {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub data: Vec<u8>,
}

impl IcmpMessage {
    pub fn new(icmp_type: u8, code: u8, data: &[u8]) -> Self {
        IcmpMessage {
            icmp_type,
            code,
            checksum: 0,
            data: data.to_vec(),
        }
    }

    /// An echo request or reply; identifier and sequence number lead the data.
    pub fn echo(icmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&identifier.to_be_bytes());
        data.extend_from_slice(&sequence.to_be_bytes());
        data.extend_from_slice(payload);
        IcmpMessage::new(icmp_type, 0, &data)
    }

    /// A Destination Unreachable error quoting the header and first eight payload bytes of the
    /// datagram that caused it. `datagram` is the whole offending packet, header included.
    pub fn destination_unreachable(code: u8, datagram: &[u8], header_len: usize) -> Self {
        let quoted = datagram.len().min(header_len + QUOTED_PAYLOAD_LEN);
        let mut data = vec![0; 4];
        data.extend_from_slice(&datagram[..quoted]);
        IcmpMessage::new(ICMP_TYPE_DESTINATION_UNREACHABLE, code, &data)
    }

    /// Identifier and sequence number of an echo message.
    pub fn echo_id_and_sequence(&self) -> Option<(u16, u16)> {
        if self.data.len() < 4 {
            return None;
        }
        Some((
            u16::from_be_bytes([self.data[0], self.data[1]]),
            u16::from_be_bytes([self.data[2], self.data[3]]),
        ))
    }

    /// The datagram quoted by an error message: its header and leading payload bytes.
    pub fn quoted_datagram(&self) -> &[u8] {
        self.data.get(4..).unwrap_or(&[])
    }

    /// Reads a message without checking its checksum; see `checksum_valid`.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        if payload.len() < ICMP_HEADER_LEN {
            return Err(ParseError::TooShort {
                minimum: ICMP_HEADER_LEN,
                actual: payload.len(),
            });
        }
        Ok(IcmpMessage {
            icmp_type: payload[0],
            code: payload[1],
            checksum: u16::from_be_bytes([payload[2], payload[3]]),
            data: payload[ICMP_HEADER_LEN..].to_vec(),
        })
    }

    /// Whether the checksum over the whole message verifies.
    pub fn checksum_valid(payload: &[u8]) -> bool {
        internet_checksum(payload) == 0
    }

    pub fn is_destination_unreachable(&self) -> bool {
        self.icmp_type == ICMP_TYPE_DESTINATION_UNREACHABLE
    }

    /// Serializes the message and fills in its checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ICMP_HEADER_LEN + self.data.len());
        buf.push(self.icmp_type);
        buf.push(self.code);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&self.data);
        let checksum = internet_checksum(&buf);
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
        buf
    }
}
