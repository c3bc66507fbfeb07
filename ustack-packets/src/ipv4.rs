use crate::*;
use std::convert::TryInto;
use std::net::Ipv4Addr;

/// Length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// Largest datagram the 16 bit total length field can describe.
pub const IPV4_MAX_PACKET_LEN: usize = 0xFFFF;

/// Most option bytes a header can carry, bounded by the 4 bit IHL.
pub const IPV4_MAX_OPTIONS_LEN: usize = 40;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

/// The 16 bit one's complement of the one's complement sum of all big endian 16 bit words in
/// `data`. A trailing odd byte is padded with a zero. Running this over a header that already
/// carries a valid checksum yields 0.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let chunks = data.chunks_exact(2);
    let trailing = chunks.remainder().first().map(|b| u32::from(*b) << 8);
    let mut sum = chunks.fold(0, |acc: u32, x| {
        acc + u32::from(u16::from_be_bytes([x[0], x[1]]))
    }) + trailing.unwrap_or(0);
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Parsed view of an IPv4 header. It lives only for the processing of one packet; the payload is
/// carried separately.
///
/// The header length is derived from the options, which are only reachable through
/// `set_options`, so the two always agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Offset of this fragment in 8 byte units
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    options: Vec<u8>,
}

impl Ipv4Header {
    /// A header with no options, no fragmentation flags and a TTL of 64. Total length and
    /// checksum are filled in when the header is emitted for a payload.
    pub fn new(protocol: u8, source: Ipv4Addr, destination: Ipv4Addr) -> Ipv4Header {
        Ipv4Header {
            tos: 0,
            total_length: IPV4_HEADER_LEN as u16,
            identification: 0,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            source,
            destination,
            options: Vec::new(),
        }
    }

    /// Parses and validates the header at the start of `data`: at least 20 bytes, version 4, a
    /// header length that fits the buffer, and a checksum that verifies.
    pub fn parse(data: &[u8]) -> Result<Ipv4Header, ParseError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(ParseError::TooShort {
                minimum: IPV4_HEADER_LEN,
                actual: data.len(),
            });
        }

        let version = (data[0] & 0xF0) >> 4;
        if version != 4 {
            return Err(ParseError::BadVersion(version));
        }

        let ihl = data[0] & 0x0F;
        let header_len = usize::from(ihl) * 4;
        if header_len < IPV4_HEADER_LEN || header_len > data.len() {
            return Err(ParseError::BadLength);
        }

        if internet_checksum(&data[..header_len]) != 0 {
            return Err(ParseError::BadChecksum);
        }

        let flags_and_offset = u16::from_be_bytes(data[6..8].try_into().unwrap());
        let source: [u8; 4] = data[12..16].try_into().unwrap();
        let destination: [u8; 4] = data[16..20].try_into().unwrap();

        Ok(Ipv4Header {
            tos: data[1],
            total_length: u16::from_be_bytes(data[2..4].try_into().unwrap()),
            identification: u16::from_be_bytes(data[4..6].try_into().unwrap()),
            dont_fragment: flags_and_offset & FLAG_DONT_FRAGMENT != 0,
            more_fragments: flags_and_offset & FLAG_MORE_FRAGMENTS != 0,
            fragment_offset: flags_and_offset & FRAGMENT_OFFSET_MASK,
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes(data[10..12].try_into().unwrap()),
            source: Ipv4Addr::from(source),
            destination: Ipv4Addr::from(destination),
            options: data[IPV4_HEADER_LEN..header_len].to_vec(),
        })
    }

    /// Header length in 32 bit words
    pub fn ihl(&self) -> u8 {
        (self.header_len() / 4) as u8
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        IPV4_HEADER_LEN + self.options.len()
    }

    /// Number of payload bytes the total length field announces.
    pub fn payload_len(&self) -> usize {
        usize::from(self.total_length).saturating_sub(self.header_len())
    }

    /// True when this packet is one piece of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }

    /// Fragment offset converted from 8 byte units into bytes.
    pub fn fragment_byte_offset(&self) -> usize {
        usize::from(self.fragment_offset) * 8
    }

    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.protocol)
    }

    pub fn options(&self) -> &[u8] {
        &self.options
    }

    /// Sets the options, padding them with zeroes to a 32 bit boundary. More than 40 bytes do
    /// not fit the IHL and leave the header unchanged.
    pub fn set_options(&mut self, options: &[u8]) -> Result<(), ParseError> {
        let padded = (options.len() + 3) / 4 * 4;
        if padded > IPV4_MAX_OPTIONS_LEN {
            return Err(ParseError::OptionsTooLong(options.len()));
        }
        self.options = options.to_vec();
        self.options.resize(padded, 0);
        Ok(())
    }

    /// Serializes the header with a freshly computed checksum. The checksum field of `self` is
    /// not consulted.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0; self.header_len()];
        buf[0] = (4 << 4) | self.ihl();
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let mut flags_and_offset = self.fragment_offset & FRAGMENT_OFFSET_MASK;
        if self.dont_fragment {
            flags_and_offset |= FLAG_DONT_FRAGMENT;
        }
        if self.more_fragments {
            flags_and_offset |= FLAG_MORE_FRAGMENTS;
        }
        buf[6..8].copy_from_slice(&flags_and_offset.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        buf[12..16].copy_from_slice(&self.source.octets());
        buf[16..20].copy_from_slice(&self.destination.octets());
        buf[IPV4_HEADER_LEN..].copy_from_slice(&self.options);

        let checksum = internet_checksum(&buf);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Builds a complete packet: sets the total length for `payload`, then emits the header
    /// followed by the payload.
    pub fn encap(&mut self, payload: &[u8]) -> Vec<u8> {
        self.total_length = (self.header_len() + payload.len()) as u16;
        let mut packet = self.to_bytes();
        self.checksum = u16::from_be_bytes([packet[10], packet[11]]);
        packet.extend_from_slice(payload);
        packet
    }
}
