use super::ResolutionCache;
use crate::error::Result;
use crate::interface::{Interface, Layer2Packet};
use crate::stats::Stats;
use std::convert::TryFrom;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use ustack_packets::{ArpOp, ArpPacket, EthernetFrame, MacAddr, ARP_ETHER_TYPE};

impl ResolutionCache {
    /// Handles one inbound resolution frame. Anything that fails validation is counted and
    /// dropped; valid traffic refreshes the cache and requests for our address are answered.
    pub fn receive(&self, packet: &Layer2Packet) {
        let arp = match ArpPacket::try_from(&packet.payload[..]) {
            Ok(arp) => arp,
            Err(e) => {
                Stats::bump(&self.stats.malformed);
                debug!("dropping resolution frame on {}: {}", packet.interface.name(), e);
                return;
            }
        };

        let sender_mac = arp.sender_hardware_addr();
        if sender_mac != packet.source {
            Stats::bump(&self.stats.spoofed);
            warn!(
                "dropping resolution frame on {} claiming {} from link source {}",
                packet.interface.name(),
                sender_mac,
                packet.source
            );
            return;
        }

        let our_mac = packet.interface.hardware_address();
        if !packet.destination.is_broadcast() && packet.destination != our_mac {
            trace!("resolution frame for {} is not for us", packet.destination);
            return;
        }

        let op = match arp.validate_address_format().and_then(|_| arp.operation()) {
            Ok(op) => op,
            Err(e) => {
                Stats::bump(&self.stats.malformed);
                debug!("dropping resolution frame on {}: {}", packet.interface.name(), e);
                return;
            }
        };

        self.passive_learn(&packet.interface, arp.sender_protocol_addr(), sender_mac);

        if op != ArpOp::Request {
            return;
        }
        let target = arp.target_protocol_addr();
        if target.is_multicast() {
            trace!("ignoring resolution request for multicast {}", target);
            return;
        }
        match packet.interface.ipv4_address() {
            Some(addr) if addr.address == target => {
                let _ = self.send_reply(&packet.interface, &arp, target);
            }
            _ => {}
        }
    }

    pub(crate) fn send_request(&self, interface: &Arc<dyn Interface>, target: Ipv4Addr) -> Result<()> {
        let our_mac = interface.hardware_address();
        let our_ip = interface
            .ipv4_address()
            .map(|a| a.address)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let request = ArpPacket::request(our_mac, our_ip, target);
        trace!("who-has {} tell {} on {}", target, our_ip, interface.name());
        Stats::bump(&self.stats.arp_requests_sent);
        let frame = EthernetFrame::new(MacAddr::BROADCAST, our_mac, ARP_ETHER_TYPE, request.as_bytes());
        self.transmit(interface, frame)
    }

    fn send_reply(
        &self,
        interface: &Arc<dyn Interface>,
        request: &ArpPacket,
        our_ip: Ipv4Addr,
    ) -> Result<()> {
        let our_mac = interface.hardware_address();
        let reply = ArpPacket::reply_to(request, our_mac, our_ip);
        trace!(
            "{} is-at {} for {}",
            our_ip,
            our_mac,
            request.sender_protocol_addr()
        );
        Stats::bump(&self.stats.arp_replies_sent);
        let frame = EthernetFrame::new(
            request.sender_hardware_addr(),
            our_mac,
            ARP_ETHER_TYPE,
            reply.as_bytes(),
        );
        self.transmit(interface, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::error::Error;
    use crate::route::RoutingTable;
    use crate::utils::test::recording::RecordingInterface;
    use ustack_packets::IPV4_ETHER_TYPE;

    const OUR_MAC: [u8; 6] = [2, 0, 0, 0, 0, 1];
    const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER_MAC: MacAddr = MacAddr {
        bytes: [2, 0, 0, 0, 0, 2],
    };
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn setup() -> (ResolutionCache, Arc<RecordingInterface>, Arc<Stats>) {
        let iface = RecordingInterface::with_address("eth0", OUR_MAC, 1500, "10.0.0.1/24");
        let stats = Arc::new(Stats::new());
        let cache = ResolutionCache::new(
            StackConfig::new(),
            Arc::new(RoutingTable::new()),
            stats.clone(),
        );
        (cache, iface, stats)
    }

    fn packet(
        iface: &Arc<RecordingInterface>,
        source: MacAddr,
        destination: MacAddr,
        arp: &ArpPacket,
    ) -> Layer2Packet {
        Layer2Packet {
            interface: iface.clone(),
            source,
            destination,
            ether_type: ARP_ETHER_TYPE,
            payload: arp.as_bytes().to_vec(),
        }
    }

    fn reply_from_peer() -> ArpPacket {
        let request = ArpPacket::request(MacAddr::new(OUR_MAC), OUR_IP, PEER);
        ArpPacket::reply_to(&request, PEER_MAC, PEER)
    }

    fn pend(cache: &ResolutionCache, iface: &Arc<RecordingInterface>) {
        let dyn_iface: Arc<dyn Interface> = iface.clone();
        let frame = EthernetFrame::new(MacAddr::ZERO, MacAddr::new(OUR_MAC), IPV4_ETHER_TYPE, &[1]);
        cache.resolve_and_send(&dyn_iface, frame, PEER).unwrap();
        iface.take();
    }

    #[test]
    fn reply_resolves_pending() {
        let (cache, iface, _stats) = setup();
        pend(&cache, &iface);
        cache.receive(&packet(&iface, PEER_MAC, MacAddr::new(OUR_MAC), &reply_from_peer()));
        assert_eq!(cache.lookup(PEER), Ok(PEER_MAC));
        let flushed = iface.take();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].dest_mac(), PEER_MAC);
    }

    #[test]
    fn spoofed_reply_is_rejected() {
        let (cache, iface, stats) = setup();
        pend(&cache, &iface);
        let imposter = MacAddr::new([2, 0, 0, 0, 0, 66]);
        cache.receive(&packet(&iface, imposter, MacAddr::new(OUR_MAC), &reply_from_peer()));

        assert_eq!(stats.snapshot().spoofed, 1);
        assert_eq!(cache.lookup(PEER), Err(Error::NotFound(PEER)));
        assert_eq!(cache.entries()[0].hardware_address, None);
        assert!(iface.take().is_empty());
    }

    #[test]
    fn short_body_is_malformed() {
        let (cache, iface, stats) = setup();
        let mut p = packet(&iface, PEER_MAC, MacAddr::BROADCAST, &reply_from_peer());
        p.payload.truncate(27);
        cache.receive(&p);
        assert_eq!(stats.snapshot().malformed, 1);
    }

    #[test]
    fn bad_opcode_is_malformed() {
        let (cache, iface, stats) = setup();
        pend(&cache, &iface);
        let mut arp = reply_from_peer();
        arp.set_opcode(7);
        cache.receive(&packet(&iface, PEER_MAC, MacAddr::BROADCAST, &arp));
        assert_eq!(stats.snapshot().malformed, 1);
        assert_eq!(cache.lookup(PEER), Err(Error::NotFound(PEER)));
    }

    #[test]
    fn frame_for_other_host_is_ignored() {
        let (cache, iface, stats) = setup();
        pend(&cache, &iface);
        let elsewhere = MacAddr::new([2, 0, 0, 0, 0, 9]);
        cache.receive(&packet(&iface, PEER_MAC, elsewhere, &reply_from_peer()));
        assert_eq!(cache.lookup(PEER), Err(Error::NotFound(PEER)));
        assert_eq!(stats.snapshot().malformed, 0);
    }

    #[test]
    fn request_for_us_is_answered() {
        let (cache, iface, stats) = setup();
        let request = ArpPacket::request(PEER_MAC, PEER, OUR_IP);
        cache.receive(&packet(&iface, PEER_MAC, MacAddr::BROADCAST, &request));

        let sent = iface.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest_mac(), PEER_MAC);
        assert_eq!(sent[0].src_mac(), MacAddr::new(OUR_MAC));
        let reply = ArpPacket::try_from(&sent[0].payload()[..]).unwrap();
        assert_eq!(reply.operation(), Ok(ArpOp::Reply));
        assert_eq!(reply.sender_protocol_addr(), OUR_IP);
        assert_eq!(reply.target_hardware_addr(), PEER_MAC);
        assert_eq!(reply.target_protocol_addr(), PEER);
        assert_eq!(stats.snapshot().arp_replies_sent, 1);

        // Nobody asked for the peer, so nothing was learned.
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn request_for_someone_else_is_not_answered() {
        let (cache, iface, _stats) = setup();
        let request = ArpPacket::request(PEER_MAC, PEER, Ipv4Addr::new(10, 0, 0, 3));
        cache.receive(&packet(&iface, PEER_MAC, MacAddr::BROADCAST, &request));
        assert!(iface.take().is_empty());
    }
}
