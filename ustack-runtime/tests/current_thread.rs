use crossbeam::channel::Receiver;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tokio::runtime;
use ustack_packets::{
    EthernetFrame, IcmpMessage, Ipv4Header, MacAddr, ARP_ETHER_TYPE, ICMP_TYPE_ECHO,
    ICMP_TYPE_ECHO_REPLY, IPV4_ETHER_TYPE,
};
use ustack_runtime::interface::{ChannelInterface, Interface};
use ustack_runtime::{Stack, StackConfig};

const OUR_MAC: MacAddr = MacAddr {
    bytes: [2, 0, 0, 0, 0, 1],
};
const PEER_MAC: MacAddr = MacAddr {
    bytes: [2, 0, 0, 0, 0, 2],
};
const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

// The wire is drained only after this long, so every transmit queued behind the one free slot
// has to wait at least as long.
const DRAIN_DELAY: Duration = Duration::from_millis(1500);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Runs `test` on a single-threaded runtime on its own thread. Returns false if it panicked or
/// did not finish within ten seconds.
fn on_current_thread<F, Fut>(test: F) -> bool
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(test());
        runtime.shutdown_timeout(Duration::from_secs(1));
        let _ = done_tx.send(());
    });
    done_rx.recv_timeout(Duration::from_secs(10)).is_ok()
}

/// A stack on one interface whose transmit queue holds a single frame.
fn host(config: StackConfig) -> (Arc<Stack>, Arc<ChannelInterface>, Receiver<Vec<u8>>) {
    let stack = Stack::new(config);
    let (iface, wire) = ChannelInterface::new("eth0", OUR_MAC, 1500, 1);
    stack.add_interface(iface.clone());
    stack
        .configure_interface_address("eth0", "10.0.0.1/24".parse().unwrap())
        .unwrap();
    (stack, iface, wire)
}

async fn drain_after(wire: &Receiver<Vec<u8>>, delay: Duration, count: usize) -> Vec<EthernetFrame> {
    tokio::time::sleep(delay).await;
    let mut frames = Vec::new();
    while frames.len() < count {
        match wire.try_recv() {
            Ok(bytes) => frames.push(EthernetFrame::from_buffer(bytes).unwrap()),
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    frames
}

#[test]
fn retried_request_does_not_stall_the_runtime() {
    init_tracing();
    let finished = on_current_thread(|| async {
        let config = StackConfig::new()
            .arp_tick_interval(Duration::from_millis(10))
            .arp_request_timeout(Duration::from_secs(1));
        let (stack, _iface, wire) = host(config);

        // The first request takes the only slot; the retry a second later has to wait for
        // the drain below.
        let header = stack.engine().header(17, Ipv4Addr::new(10, 0, 0, 77));
        stack.engine().send(header, b"lost").unwrap();

        let frames = drain_after(&wire, DRAIN_DELAY, 2).await;
        assert!(frames.iter().all(|f| f.ether_type() == ARP_ETHER_TYPE));
        assert!(stack.stats().arp_requests_sent >= 2);
        drop(stack);
        drop(wire);
    });
    assert!(finished);
}

#[test]
fn reassembled_echo_reply_does_not_stall_the_runtime() {
    init_tracing();
    let finished = on_current_thread(|| async {
        let (stack, iface, wire) = host(StackConfig::new());
        let dyn_iface: Arc<dyn Interface> = iface.clone();
        stack.arp().pin(&dyn_iface, PEER, PEER_MAC);

        // Occupy the only slot on the wire.
        let filler = stack.engine().header(17, PEER);
        stack.engine().send(filler, b"filler").unwrap();

        let request = IcmpMessage::echo(ICMP_TYPE_ECHO, 7, 1, &[0x5a; 32]);
        let mut header = Ipv4Header::new(1, PEER, OUR_IP);
        header.identification = 0x4242;
        for packet in ustack_runtime::ipv4::fragment(&header, &request.to_bytes(), 36).unwrap() {
            let frame = EthernetFrame::new(OUR_MAC, PEER_MAC, IPV4_ETHER_TYPE, &packet);
            stack.receive_frame(&dyn_iface, frame.data);
        }

        let frames = drain_after(&wire, DRAIN_DELAY, 2).await;
        let payload = frames[1].payload();
        let header = Ipv4Header::parse(&payload).unwrap();
        assert_eq!(header.destination, PEER);
        let reply = IcmpMessage::parse(&payload[header.header_len()..]).unwrap();
        assert_eq!(reply.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(reply.echo_id_and_sequence(), Some((7, 1)));
        assert_eq!(stack.stats().reassembled, 1);
        drop(stack);
        drop(wire);
    });
    assert!(finished);
}
