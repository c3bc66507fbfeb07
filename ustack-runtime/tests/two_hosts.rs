use crossbeam::channel::Receiver;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use ustack_packets::{
    ArpPacket, EthernetFrame, IcmpMessage, MacAddr, ARP_ETHER_TYPE, ICMP_TYPE_ECHO,
    ICMP_TYPE_ECHO_REPLY, IPV4_ETHER_TYPE,
};
use ustack_runtime::interface::{ChannelInterface, Interface};
use ustack_runtime::utils::test::harness::{initialize_runtime, patch_cable, wait_until};
use ustack_runtime::utils::test::recording::RecordingProtocol;
use ustack_runtime::{Error, Stack, StackConfig};

const A_MAC: MacAddr = MacAddr {
    bytes: [2, 0, 0, 0, 0, 0xa],
};
const B_MAC: MacAddr = MacAddr {
    bytes: [2, 0, 0, 0, 0, 0xb],
};
const A_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const B_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

struct Host {
    stack: Arc<Stack>,
    iface: Arc<ChannelInterface>,
}

impl Host {
    fn dyn_iface(&self) -> Arc<dyn Interface> {
        self.iface.clone()
    }
}

fn host(mac: MacAddr, cidr: &str, config: StackConfig, mtu: usize) -> (Host, Receiver<Vec<u8>>) {
    let stack = Stack::new(config);
    let (iface, wire) = ChannelInterface::new("eth0", mac, mtu, 256);
    stack.add_interface(iface.clone());
    stack
        .configure_interface_address("eth0", cidr.parse().unwrap())
        .unwrap();
    stack.spawn_reader(iface.clone(), iface.receiver());
    (Host { stack, iface }, wire)
}

fn pair(config: StackConfig, mtu: usize) -> (Host, Host) {
    let (a, a_wire) = host(A_MAC, "10.0.0.1/24", config.clone(), mtu);
    let (b, b_wire) = host(B_MAC, "10.0.0.2/24", config, mtu);
    patch_cable(a_wire, b.iface.clone());
    patch_cable(b_wire, a.iface.clone());
    (a, b)
}

#[test]
fn ping_between_hosts() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        let replies = RecordingProtocol::new();
        a.stack.register_protocol(1, replies.clone());

        let request = IcmpMessage::new(ICMP_TYPE_ECHO, 0, &[0, 1, 0, 1, b'p', b'i', b'n', b'g']);
        let header = a.stack.engine().header(1, B_IP);
        a.stack.engine().send(header, &request.to_bytes()).unwrap();

        assert!(wait_until(TIMEOUT, || replies.received_count() == 1).await);
        let (header, payload) = replies.received().remove(0);
        assert_eq!(header.source, B_IP);
        assert_eq!(header.destination, A_IP);
        let reply = IcmpMessage::parse(&payload).unwrap();
        assert_eq!(reply.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(reply.data, request.data);

        assert_eq!(a.stack.arp().lookup(B_IP), Ok(B_MAC));
        assert_eq!(b.stack.arp().lookup(A_IP), Ok(A_MAC));
    });
}

#[test]
fn fragmented_datagram_is_delivered_once() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        let udp = RecordingProtocol::new();
        b.stack.register_protocol(17, udp.clone());

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        let header = a.stack.engine().header(17, B_IP);
        a.stack.engine().send(header, &payload).unwrap();

        assert!(wait_until(TIMEOUT, || udp.received_count() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let received = udp.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, payload);
        assert_eq!(usize::from(received[0].0.total_length), 20 + payload.len());
        assert!(!received[0].0.is_fragment());

        assert_eq!(a.stack.stats().fragments_sent, 4);
        assert_eq!(b.stack.stats().reassembled, 1);
    });
}

#[test]
fn queued_packets_share_one_request() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        let udp = RecordingProtocol::new();
        b.stack.register_protocol(17, udp.clone());

        for tag in 0..5u8 {
            let header = a.stack.engine().header(17, B_IP);
            a.stack.engine().send(header, &[tag; 16]).unwrap();
        }

        assert!(wait_until(TIMEOUT, || udp.received_count() == 5).await);
        let tags: Vec<u8> = udp.received().iter().map(|(_, p)| p[0]).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
        assert_eq!(a.stack.stats().arp_requests_sent, 1);
    });
}

#[test]
fn waiting_lookup_resolves_over_the_wire() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        let mac = tokio::time::timeout(TIMEOUT, b.stack.arp().lookup_wait(A_IP))
            .await
            .unwrap();
        assert_eq!(mac, Ok(A_MAC));
        assert_eq!(a.stack.stats().arp_replies_sent, 1);
    });
}

#[test]
fn unanswered_resolution_drops_queue() {
    init_tracing();
    initialize_runtime().block_on(async {
        let config = StackConfig::new()
            .arp_retries(0)
            .arp_tick_interval(Duration::from_millis(10))
            .arp_request_timeout(Duration::from_secs(1));
        let (a, wire) = host(A_MAC, "10.0.0.1/24", config, 1500);
        let nobody = Ipv4Addr::new(10, 0, 0, 77);

        for _ in 0..3 {
            let header = a.stack.engine().header(17, nobody);
            a.stack.engine().send(header, b"lost").unwrap();
        }
        assert_eq!(a.stack.arp().entries()[0].queued, 3);

        assert!(wait_until(TIMEOUT, || a.stack.stats().arp_unresolved_dropped == 3).await);
        assert!(a.stack.arp().entries().is_empty());
        assert_eq!(wire.try_iter().count(), 1);
    });
}

#[test]
fn spoofed_reply_leaves_cache_alone() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, wire) = host(A_MAC, "10.0.0.1/24", StackConfig::new(), 1500);
        let header = a.stack.engine().header(17, B_IP);
        a.stack.engine().send(header, b"hi").unwrap();
        assert_eq!(wire.try_iter().count(), 1);

        let request = ArpPacket::request(A_MAC, A_IP, B_IP);
        let reply = ArpPacket::reply_to(&request, B_MAC, B_IP);
        let imposter = MacAddr::new([2, 0, 0, 0, 0, 0x66]);
        let frame = EthernetFrame::new(A_MAC, imposter, ARP_ETHER_TYPE, reply.as_bytes());
        a.stack.receive_frame(&a.dyn_iface(), frame.data);

        assert_eq!(a.stack.stats().spoofed, 1);
        assert_eq!(a.stack.arp().lookup(B_IP), Err(Error::NotFound(B_IP)));
        assert_eq!(a.stack.arp().entries()[0].queued, 1);

        let genuine = EthernetFrame::new(A_MAC, B_MAC, ARP_ETHER_TYPE, reply.as_bytes());
        a.stack.receive_frame(&a.dyn_iface(), genuine.data);
        assert_eq!(a.stack.arp().lookup(B_IP), Ok(B_MAC));
        let flushed: Vec<Vec<u8>> = wire.try_iter().collect();
        assert_eq!(flushed.len(), 1);
        assert_eq!(&flushed[0][..6], &B_MAC.bytes[..]);
    });
}

#[test]
fn link_layer_demultiplexing() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, _wire) = host(A_MAC, "10.0.0.1/24", StackConfig::new(), 1500);
        let udp = RecordingProtocol::new();
        a.stack.register_protocol(17, udp.clone());
        let datagram = ustack_packets::Ipv4Header::new(17, B_IP, A_IP).encap(b"data");

        a.stack.receive_frame(&a.dyn_iface(), vec![0; 10]);
        assert_eq!(a.stack.stats().malformed, 1);

        let elsewhere = MacAddr::new([2, 0, 0, 0, 0, 0x99]);
        let frame = EthernetFrame::new(elsewhere, B_MAC, IPV4_ETHER_TYPE, &datagram);
        a.stack.receive_frame(&a.dyn_iface(), frame.data);
        assert_eq!(udp.received_count(), 0);

        let frame = EthernetFrame::new(A_MAC, B_MAC, 0x86DD, &datagram);
        a.stack.receive_frame(&a.dyn_iface(), frame.data);
        assert_eq!(udp.received_count(), 0);

        let frame = EthernetFrame::new(A_MAC, B_MAC, IPV4_ETHER_TYPE, &datagram);
        a.stack.receive_frame(&a.dyn_iface(), frame.data);
        assert_eq!(udp.received_count(), 1);
        assert_eq!(a.stack.stats().malformed, 1);
    });
}

#[test]
fn admin_commands_on_live_stack() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        ustack_runtime::admin::execute(&a.stack, "arp query 10.0.0.2 eth0 2")
            .await
            .unwrap();
        assert!(wait_until(TIMEOUT, || a.stack.arp().lookup(B_IP).is_ok()).await);
        assert_eq!(
            ustack_runtime::admin::arp_table(&a.stack),
            "10.0.0.2 - 02:00:00:00:00:0b\n"
        );

        let info = ustack_runtime::admin::execute(&b.stack, "iface eth0")
            .await
            .unwrap();
        assert!(info.contains("ether 02:00:00:00:00:0b"));
        assert!(info.contains("RX packets 1"));
    });
}

#[test]
fn ping_command_between_hosts() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, _b) = pair(StackConfig::new(), 1500);
        let out = ustack_runtime::admin::execute(&a.stack, "ping 10.0.0.2 2")
            .await
            .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("64 bytes from 10.0.0.2: icmp_seq=0 time="));
        assert!(lines[1].starts_with("64 bytes from 10.0.0.2: icmp_seq=1 time="));
        assert_eq!(lines[2], "2 packets transmitted, 2 received");
    });
}

#[test]
fn udp_sockets_exchange_datagrams() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        let mut server = b.stack.udp().connect(A_IP, 5353, Some(53)).unwrap();
        let mut client = a.stack.udp().connect(B_IP, 53, Some(5353)).unwrap();

        client.send(b"query").unwrap();
        let query = tokio::time::timeout(TIMEOUT, server.recv()).await.unwrap();
        assert_eq!(query, Ok(b"query".to_vec()));

        server.send(b"answer").unwrap();
        let answer = tokio::time::timeout(TIMEOUT, client.recv()).await.unwrap();
        assert_eq!(answer, Ok(b"answer".to_vec()));

        // Fragmented on the way out, reassembled before it reaches the socket.
        let large: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        client.send(&large).unwrap();
        let received = tokio::time::timeout(TIMEOUT, server.recv()).await.unwrap();
        assert_eq!(received, Ok(large));
        assert_eq!(b.stack.stats().reassembled, 1);
    });
}

#[test]
fn closed_port_refuses_udp() {
    init_tracing();
    initialize_runtime().block_on(async {
        let (a, b) = pair(StackConfig::new(), 1500);
        let mut client = a.stack.udp().connect(B_IP, 9999, None).unwrap();
        client.send(b"anyone?").unwrap();

        let refused = tokio::time::timeout(TIMEOUT, client.recv()).await.unwrap();
        assert_eq!(
            refused,
            Err(Error::ConnectionRefused {
                address: B_IP,
                port: 9999
            })
        );
        assert_eq!(b.stack.stats().udp_no_port, 1);
    });
}
