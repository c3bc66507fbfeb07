use crate::*;
use std::convert::TryInto;
use std::net::Ipv4Addr;

/// Length of the UDP header: source port, destination port, length, checksum.
pub const UDP_HEADER_LEN: usize = 8;

/// A UDP segment, header and payload in one buffer. The buffer is trimmed to the length field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpSegment {
    pub data: PacketData,
}

impl UdpSegment {
    /// Reads a segment, checking only that the length field fits the buffer.
    pub fn from_buffer(mut data: PacketData) -> Result<UdpSegment, ParseError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(ParseError::TooShort {
                minimum: UDP_HEADER_LEN,
                actual: data.len(),
            });
        }
        let length = usize::from(u16::from_be_bytes(data[4..6].try_into().unwrap()));
        if length < UDP_HEADER_LEN || length > data.len() {
            return Err(ParseError::BadLength);
        }
        data.truncate(length);
        Ok(UdpSegment { data })
    }

    /// Builds a segment with a zero checksum; see `set_checksum`.
    pub fn new(src_port: u16, dest_port: u16, payload: &[u8]) -> UdpSegment {
        let length = (UDP_HEADER_LEN + payload.len()) as u16;
        let mut data = Vec::with_capacity(usize::from(length));
        data.extend_from_slice(&src_port.to_be_bytes());
        data.extend_from_slice(&dest_port.to_be_bytes());
        data.extend_from_slice(&length.to_be_bytes());
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(payload);
        UdpSegment { data }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.data[0..2].try_into().unwrap())
    }

    pub fn dest_port(&self) -> u16 {
        u16::from_be_bytes(self.data[2..4].try_into().unwrap())
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes(self.data[6..8].try_into().unwrap())
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[UDP_HEADER_LEN..]
    }

    /// Fills in the checksum over the pseudo header of `source` and `destination`.
    pub fn set_checksum(&mut self, source: Ipv4Addr, destination: Ipv4Addr) {
        self.data[6..8].copy_from_slice(&[0, 0]);
        let checksum = match self.pseudo_checksum(source, destination) {
            // Zero on the wire means "no checksum".
            0 => 0xFFFF,
            sum => sum,
        };
        self.data[6..8].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Whether the checksum verifies. Segments sent without a checksum always pass.
    pub fn checksum_valid(&self, source: Ipv4Addr, destination: Ipv4Addr) -> bool {
        self.checksum() == 0 || self.pseudo_checksum(source, destination) == 0
    }

    fn pseudo_checksum(&self, source: Ipv4Addr, destination: Ipv4Addr) -> u16 {
        let mut buf = Vec::with_capacity(12 + self.data.len());
        buf.extend_from_slice(&source.octets());
        buf.extend_from_slice(&destination.octets());
        buf.push(0);
        buf.push(IpProtocol::UDP.into());
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        internet_checksum(&buf)
    }
}
