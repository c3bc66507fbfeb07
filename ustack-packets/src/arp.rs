use crate::{MacAddr, ParseError, IPV4_ETHER_TYPE};
use std::convert::{TryFrom, TryInto};
use std::net::Ipv4Addr;

/// Size of an ARP body carrying IPv4-over-Ethernet addresses.
pub const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

pub enum ArpHardwareType {
    Ethernet = 1,
}

const HARDWARE_TYPE_RANGE: (usize, usize) = (0, 2);
const PROTOCOL_TYPE_RANGE: (usize, usize) = (2, 4);
const HARDWARE_ADDR_LEN_RANGE: (usize, usize) = (4, 5);
const PROTOCOL_ADDR_LEN_RANGE: (usize, usize) = (5, 6);
const OPCODE_RANGE: (usize, usize) = (6, 8);
const SENDER_HARDWARE_ADDR_RANGE: (usize, usize) = (8, 14);
const SENDER_PROTOCOL_ADDR_RANGE: (usize, usize) = (14, 18);
const TARGET_HARDWARE_ADDR_RANGE: (usize, usize) = (18, 24);
const TARGET_PROTOCOL_ADDR_RANGE: (usize, usize) = (24, 28);

///
/// Getters/setters over the fixed-size IPv4-over-Ethernet ARP body described in RFC 826
/// https://tools.ietf.org/html/rfc826
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    data: [u8; ARP_PACKET_LEN],
}

impl ArpPacket {
    ///
    /// Constructs a zeroed body with the hardware/protocol type and length fields already set
    /// for IPv4 over Ethernet.
    ///
    pub fn new() -> Self {
        let mut packet = ArpPacket {
            data: [0; ARP_PACKET_LEN],
        };
        packet.set_hardware_type(ArpHardwareType::Ethernet as u16);
        packet.set_protocol_type(IPV4_ETHER_TYPE);
        packet.set_hardware_addr_len(6);
        packet.set_protocol_addr_len(4);
        packet
    }

    /// A request asking who owns `target_ip`. The target hardware address is left zero.
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        let mut packet = ArpPacket::new();
        packet.set_opcode(ArpOp::Request as u16);
        packet.set_sender_hardware_addr(sender_mac);
        packet.set_sender_protocol_addr(sender_ip);
        packet.set_target_hardware_addr(MacAddr::ZERO);
        packet.set_target_protocol_addr(target_ip);
        packet
    }

    /// Builds the reply to `request`, answering that `our_ip` lives at `our_mac`.
    pub fn reply_to(request: &ArpPacket, our_mac: MacAddr, our_ip: Ipv4Addr) -> Self {
        let mut packet = ArpPacket::new();
        packet.set_opcode(ArpOp::Reply as u16);
        packet.set_sender_hardware_addr(our_mac);
        packet.set_sender_protocol_addr(our_ip);
        packet.set_target_hardware_addr(request.sender_hardware_addr());
        packet.set_target_protocol_addr(request.sender_protocol_addr());
        packet
    }

    pub fn hardware_type(&self) -> u16 {
        u16::from_be_bytes(self.arp_data(HARDWARE_TYPE_RANGE).try_into().unwrap())
    }

    pub fn protocol_type(&self) -> u16 {
        u16::from_be_bytes(self.arp_data(PROTOCOL_TYPE_RANGE).try_into().unwrap())
    }

    pub fn hardware_addr_len(&self) -> u8 {
        self.arp_data(HARDWARE_ADDR_LEN_RANGE)[0]
    }

    pub fn protocol_addr_len(&self) -> u8 {
        self.arp_data(PROTOCOL_ADDR_LEN_RANGE)[0]
    }

    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.arp_data(OPCODE_RANGE).try_into().unwrap())
    }

    /// The opcode as a known operation, if it is one.
    pub fn operation(&self) -> Result<ArpOp, ParseError> {
        match self.opcode() {
            1 => Ok(ArpOp::Request),
            2 => Ok(ArpOp::Reply),
            other => Err(ParseError::BadOpcode(other)),
        }
    }

    pub fn sender_hardware_addr(&self) -> MacAddr {
        MacAddr::new(self.arp_data(SENDER_HARDWARE_ADDR_RANGE).try_into().unwrap())
    }

    pub fn sender_protocol_addr(&self) -> Ipv4Addr {
        let octets: [u8; 4] = self.arp_data(SENDER_PROTOCOL_ADDR_RANGE).try_into().unwrap();
        Ipv4Addr::from(octets)
    }

    pub fn target_hardware_addr(&self) -> MacAddr {
        MacAddr::new(self.arp_data(TARGET_HARDWARE_ADDR_RANGE).try_into().unwrap())
    }

    pub fn target_protocol_addr(&self) -> Ipv4Addr {
        let octets: [u8; 4] = self.arp_data(TARGET_PROTOCOL_ADDR_RANGE).try_into().unwrap();
        Ipv4Addr::from(octets)
    }

    pub fn set_hardware_type(&mut self, htype: u16) {
        self.set_arp_data(&htype.to_be_bytes(), HARDWARE_TYPE_RANGE);
    }

    pub fn set_protocol_type(&mut self, ptype: u16) {
        self.set_arp_data(&ptype.to_be_bytes(), PROTOCOL_TYPE_RANGE);
    }

    pub fn set_hardware_addr_len(&mut self, len: u8) {
        self.set_arp_data(&[len], HARDWARE_ADDR_LEN_RANGE);
    }

    pub fn set_protocol_addr_len(&mut self, len: u8) {
        self.set_arp_data(&[len], PROTOCOL_ADDR_LEN_RANGE);
    }

    pub fn set_opcode(&mut self, code: u16) {
        self.set_arp_data(&code.to_be_bytes(), OPCODE_RANGE);
    }

    pub fn set_sender_hardware_addr(&mut self, addr: MacAddr) {
        self.set_arp_data(&addr.bytes, SENDER_HARDWARE_ADDR_RANGE);
    }

    pub fn set_sender_protocol_addr(&mut self, addr: Ipv4Addr) {
        self.set_arp_data(&addr.octets(), SENDER_PROTOCOL_ADDR_RANGE);
    }

    pub fn set_target_hardware_addr(&mut self, addr: MacAddr) {
        self.set_arp_data(&addr.bytes, TARGET_HARDWARE_ADDR_RANGE);
    }

    pub fn set_target_protocol_addr(&mut self, addr: Ipv4Addr) {
        self.set_arp_data(&addr.octets(), TARGET_PROTOCOL_ADDR_RANGE);
    }

    /// Checks the type and length fields describe IPv4 addresses over Ethernet.
    pub fn validate_address_format(&self) -> Result<(), ParseError> {
        if self.hardware_type() != ArpHardwareType::Ethernet as u16
            || self.protocol_type() != IPV4_ETHER_TYPE
            || self.hardware_addr_len() != 6
            || self.protocol_addr_len() != 4
        {
            return Err(ParseError::UnsupportedAddressFormat);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    // Returns the bytes of the body between start and end, exclusive
    fn arp_data(&self, (start, end): (usize, usize)) -> &[u8] {
        &self.data[start..end]
    }

    fn set_arp_data(&mut self, bytes: &[u8], (start, end): (usize, usize)) {
        self.data[start..end].copy_from_slice(bytes);
    }
}

impl Default for ArpPacket {
    fn default() -> Self {
        ArpPacket::new()
    }
}

impl TryFrom<&[u8]> for ArpPacket {
    type Error = ParseError;

    ///
    /// Copies the first 28 bytes of an ARP payload. Anything past them is link padding and is
    /// ignored; field contents are not validated here.
    ///
    fn try_from(payload: &[u8]) -> Result<Self, Self::Error> {
        if payload.len() < ARP_PACKET_LEN {
            return Err(ParseError::TooShort {
                minimum: ARP_PACKET_LEN,
                actual: payload.len(),
            });
        }
        let mut data = [0; ARP_PACKET_LEN];
        data.copy_from_slice(&payload[..ARP_PACKET_LEN]);
        Ok(ArpPacket { data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_empty_arp_packet() {
        let packet = ArpPacket::new();
        assert_eq!(packet.hardware_type(), 1);
        assert_eq!(packet.protocol_type(), 0x0800);
        assert_eq!(packet.hardware_addr_len(), 6);
        assert_eq!(packet.protocol_addr_len(), 4);
        assert_eq!(packet.opcode(), 0);
        assert_eq!(packet.sender_hardware_addr(), MacAddr::ZERO);
        assert_eq!(packet.target_protocol_addr(), Ipv4Addr::UNSPECIFIED);
        assert!(packet.validate_address_format().is_ok());
    }

    #[test]
    fn arp_packet_from_bytes() -> Result<(), ParseError> {
        let arp_payload: Vec<u8> = vec![
            0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01, 1, 2, 3, 4, 5, 6, 10, 0, 0, 1, 10, 9,
            8, 7, 6, 5, 10, 0, 0, 2,
        ];
        let packet = ArpPacket::try_from(arp_payload.as_slice())?;
        assert_eq!(packet.operation()?, ArpOp::Request);
        assert_eq!(packet.sender_hardware_addr(), MacAddr::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(packet.sender_protocol_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(
            packet.target_hardware_addr(),
            MacAddr::new([10, 9, 8, 7, 6, 5])
        );
        assert_eq!(packet.target_protocol_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(packet.as_bytes(), arp_payload.as_slice());
        Ok(())
    }

    #[test]
    fn too_short() {
        let payload = [0u8; 27];
        assert_eq!(
            ArpPacket::try_from(&payload[..]),
            Err(ParseError::TooShort {
                minimum: 28,
                actual: 27
            })
        );
    }

    #[test]
    fn rejects_foreign_address_format() {
        let mut packet = ArpPacket::new();
        packet.set_protocol_type(0x86DD);
        assert_eq!(
            packet.validate_address_format(),
            Err(ParseError::UnsupportedAddressFormat)
        );
        packet.set_protocol_type(0x0800);
        packet.set_hardware_addr_len(8);
        assert!(packet.validate_address_format().is_err());
    }

    #[test]
    fn reply_swaps_roles() {
        let requester = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let ours = MacAddr::new([2, 0, 0, 0, 0, 2]);
        let request = ArpPacket::request(
            requester,
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
        );
        assert_eq!(request.target_hardware_addr(), MacAddr::ZERO);

        let reply = ArpPacket::reply_to(&request, ours, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(reply.operation(), Ok(ArpOp::Reply));
        assert_eq!(reply.sender_hardware_addr(), ours);
        assert_eq!(reply.sender_protocol_addr(), Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(reply.target_hardware_addr(), requester);
        assert_eq!(reply.target_protocol_addr(), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn unknown_opcode() {
        let mut packet = ArpPacket::new();
        packet.set_opcode(9);
        assert_eq!(packet.operation(), Err(ParseError::BadOpcode(9)));
    }
}
