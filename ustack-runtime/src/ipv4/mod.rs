//! The IPv4 engine: validation and dispatch of inbound packets, fragmentation and resolution of
//! outbound ones.

use crate::arp::ResolutionCache;
use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::interface::{Interface, Layer2Packet};
use crate::protocol::ProtocolRegistry;
use crate::route::RoutingTable;
use crate::stats::Stats;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use ustack_packets::{
    EthernetFrame, IcmpMessage, IpProtocol, Ipv4Header, MacAddr, IPV4_ETHER_TYPE,
};

mod fragment;
pub use self::fragment::*;

mod reassembly;
pub use self::reassembly::*;

pub struct Ipv4Engine {
    config: StackConfig,
    routes: Arc<RoutingTable>,
    arp: Arc<ResolutionCache>,
    registry: Arc<ProtocolRegistry>,
    stats: Arc<Stats>,
    reassembly: ReassemblyHandle,
    identification: AtomicU16,
}

impl Ipv4Engine {
    pub fn new(
        config: StackConfig,
        routes: Arc<RoutingTable>,
        arp: Arc<ResolutionCache>,
        registry: Arc<ProtocolRegistry>,
        stats: Arc<Stats>,
        reassembly: ReassemblyHandle,
    ) -> Self {
        Ipv4Engine {
            config,
            routes,
            arp,
            registry,
            stats,
            reassembly,
            identification: AtomicU16::new(rand::random()),
        }
    }

    /// A header for a new datagram to `destination`, with a fresh identification and the
    /// configured TTL. The source is filled in by `send`.
    pub fn header(&self, protocol: u8, destination: Ipv4Addr) -> Ipv4Header {
        let mut header = Ipv4Header::new(protocol, Ipv4Addr::UNSPECIFIED, destination);
        header.identification = self.identification.fetch_add(1, Ordering::Relaxed);
        header.ttl = self.config.default_ttl;
        header
    }

    /// The address `send` would use as the source of a datagram to `destination`.
    pub fn source_for(&self, destination: Ipv4Addr) -> Result<Ipv4Addr> {
        let (interface, _) = self.routes.resolve(destination)?;
        interface_address(&interface)
    }

    /// Handles one packet from the link layer. Invalid packets are counted and dropped,
    /// fragments go to the reassembly actor and everything else straight to its handler.
    pub fn receive(&self, packet: &Layer2Packet) {
        let header = match Ipv4Header::parse(&packet.payload) {
            Ok(header) => header,
            Err(e) => {
                Stats::bump(&self.stats.malformed);
                debug!("dropping IPv4 packet on {}: {}", packet.interface.name(), e);
                return;
            }
        };

        let total_length = usize::from(header.total_length);
        if total_length < header.header_len() || total_length > packet.payload.len() {
            Stats::bump(&self.stats.malformed);
            debug!(
                "dropping IPv4 packet on {}: total length {} of {} byte buffer",
                packet.interface.name(),
                total_length,
                packet.payload.len()
            );
            return;
        }
        // Link padding past the total length is dropped here.
        let start = header.header_len();
        let payload = &packet.payload[start..start + header.payload_len()];

        if header.dont_fragment && header.is_fragment() {
            Stats::bump(&self.stats.invalid_fragment_flags);
            debug!(
                "dropping IPv4 packet from {}: fragment with don't fragment set",
                header.source
            );
            return;
        }

        if header.is_fragment() {
            self.reassembly.submit(header, payload.to_vec());
            return;
        }
        self.deliver(&header, payload);
    }

    /// Hands a whole datagram to its protocol handler.
    pub fn deliver(&self, header: &Ipv4Header, payload: &[u8]) {
        dispatch(&self.registry, &self.stats, header, payload);
    }

    /// Routes, fragments and transmits one datagram. The source address of `header` is replaced
    /// by the address of the egress interface.
    pub fn send(&self, mut header: Ipv4Header, payload: &[u8]) -> Result<()> {
        let (interface, next_hop) = self.routes.resolve(header.destination)?;
        header.source = interface_address(&interface)?;

        let packets = fragment(&header, payload, interface.mtu())?;
        if packets.len() > 1 {
            Stats::add(&self.stats.fragments_sent, packets.len() as u64);
        }
        trace!(
            "sending {} bytes to {} via {} on {}",
            payload.len(),
            header.destination,
            next_hop,
            interface.name()
        );

        let our_mac = interface.hardware_address();
        for packet in packets {
            let frame = EthernetFrame::new(MacAddr::ZERO, our_mac, IPV4_ETHER_TYPE, &packet);
            self.arp.resolve_and_send(&interface, frame, next_hop)?;
        }
        Ok(())
    }
}

fn interface_address(interface: &Arc<dyn Interface>) -> Result<Ipv4Addr> {
    interface
        .ipv4_address()
        .map(|address| address.address)
        .ok_or_else(|| Error::NoAddress(interface.name().to_string()))
}

/// Delivers a complete datagram. ICMP Destination Unreachable messages are offered to every
/// registered handler instead of the ICMP one.
pub(crate) fn dispatch(
    registry: &ProtocolRegistry,
    stats: &Stats,
    header: &Ipv4Header,
    payload: &[u8],
) {
    if header.protocol() == IpProtocol::ICMP {
        let message = match IcmpMessage::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                Stats::bump(&stats.malformed);
                debug!("dropping ICMP message from {}: {}", header.source, e);
                return;
            }
        };
        if message.is_destination_unreachable() {
            if !IcmpMessage::checksum_valid(payload) {
                Stats::bump(&stats.malformed);
                debug!("dropping ICMP message from {}: bad checksum", header.source);
                return;
            }
            trace!(
                "destination unreachable code {} from {}",
                message.code,
                header.source
            );
            for handler in registry.all() {
                handler.destination_unreachable(header, &message);
            }
            return;
        }
    }

    match registry.get(header.protocol) {
        Some(handler) => handler.receive(header, payload),
        None => {
            Stats::bump(&stats.unsupported_protocol);
            debug!(
                "dropping packet from {} for unsupported protocol {}",
                header.source, header.protocol
            );
        }
    }
}
