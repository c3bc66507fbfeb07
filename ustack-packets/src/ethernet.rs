use crate::*;
use std::borrow::Cow;
use std::convert::TryInto;

/// Length of an Ethernet II header: destination MAC, source MAC, EtherType.
pub const ETHERNET_HEADER_LEN: usize = 14;

#[derive(Clone, Debug)]
pub struct EthernetFrame {
    pub data: PacketData,
    pub payload_offset: usize,
}

impl EthernetFrame {
    pub fn from_buffer(frame: PacketData) -> Result<EthernetFrame, ParseError> {
        // Ethernet II frames must be at least the header, which is 14bytes
        // 0                    6                    12                      14
        // |---6 byte Dest_MAC--|---6 byte Src_MAC---|--2 Byte EtherType---|
        if frame.len() < ETHERNET_HEADER_LEN {
            return Err(ParseError::TooShort {
                minimum: ETHERNET_HEADER_LEN,
                actual: frame.len(),
            });
        }

        Ok(EthernetFrame {
            data: frame,
            payload_offset: ETHERNET_HEADER_LEN,
        })
    }

    /// Builds a frame carrying `payload`, allocating header and payload in one buffer.
    pub fn new(dest: MacAddr, src: MacAddr, ether_type: u16, payload: &[u8]) -> EthernetFrame {
        let mut data = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
        data.extend_from_slice(&dest.bytes);
        data.extend_from_slice(&src.bytes);
        data.extend_from_slice(&ether_type.to_be_bytes());
        data.extend_from_slice(payload);
        EthernetFrame {
            data,
            payload_offset: ETHERNET_HEADER_LEN,
        }
    }

    pub fn dest_mac(&self) -> MacAddr {
        MacAddr::new(self.data[0..6].try_into().unwrap())
    }

    pub fn src_mac(&self) -> MacAddr {
        MacAddr::new(self.data[6..12].try_into().unwrap())
    }

    pub fn set_dest_mac(&mut self, mac: MacAddr) {
        self.data[..6].copy_from_slice(&mac.bytes);
    }

    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.data[12..=13].try_into().unwrap())
    }

    // This gives you a cow of a slice of the payload.
    pub fn payload(&self) -> Cow<[u8]> {
        Cow::from(&self.data[self.payload_offset..])
    }

    /// Splits the frame into its payload bytes, dropping the header.
    pub fn into_payload(mut self) -> Vec<u8> {
        self.data.split_off(self.payload_offset)
    }
}

/// EthernetFrames are considered the same if they have the same bytes on the wire.
impl PartialEq for EthernetFrame {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for EthernetFrame {}
