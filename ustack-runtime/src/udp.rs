use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::ipv4::Ipv4Engine;
use crate::protocol::Protocol;
use crate::stats::Stats;
use rand::Rng;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};
use ustack_packets::{
    IcmpMessage, IpProtocol, Ipv4Header, UdpSegment, ICMP_CODE_PORT_UNREACHABLE, UDP_HEADER_LEN,
};

/// Local ports handed out when a socket does not ask for one.
pub const EPHEMERAL_PORTS: RangeInclusive<u16> = 49152..=65535;

type Delivery = Result<Vec<u8>>;

struct Binding {
    remote: Ipv4Addr,
    remote_port: u16,
    tx: mpsc::Sender<Delivery>,
}

/// Connected UDP sockets, registered as the handler for IP protocol 17.
///
/// Each socket owns one local port and only accepts datagrams from the peer it was connected to.
/// Datagrams for a port nobody holds are answered with an ICMP port unreachable.
pub struct UdpLayer {
    engine: Weak<Ipv4Engine>,
    stats: Arc<Stats>,
    queue_capacity: usize,
    bindings: RwLock<HashMap<u16, Binding>>,
}

impl UdpLayer {
    pub fn new(config: &StackConfig, engine: Weak<Ipv4Engine>, stats: Arc<Stats>) -> Self {
        UdpLayer {
            engine,
            stats,
            queue_capacity: config.udp_queue_capacity,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a socket to `remote:remote_port`. Without a `local_port` a free ephemeral port is
    /// picked at random.
    pub fn connect(
        self: &Arc<Self>,
        remote: Ipv4Addr,
        remote_port: u16,
        local_port: Option<u16>,
    ) -> Result<UdpSocket> {
        if remote_port == 0 {
            return Err(Error::InvalidPort);
        }
        let engine = self.engine.upgrade().ok_or(Error::Shutdown)?;
        let local = engine.source_for(remote)?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let local_port = {
            let mut bindings = self.bindings.write().unwrap();
            let port = match local_port {
                Some(0) => return Err(Error::InvalidPort),
                Some(port) if bindings.contains_key(&port) => return Err(Error::PortInUse(port)),
                Some(port) => port,
                None => free_port(&bindings).ok_or(Error::PortsExhausted)?,
            };
            bindings.insert(
                port,
                Binding {
                    remote,
                    remote_port,
                    tx,
                },
            );
            port
        };
        debug!(
            "udp socket {}:{} connected to {}:{}",
            local, local_port, remote, remote_port
        );
        Ok(UdpSocket {
            layer: self.clone(),
            local_port,
            remote,
            remote_port,
            rx,
        })
    }

    /// Local ports currently bound, in ascending order.
    pub fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.bindings.read().unwrap().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn unbind(&self, port: u16) {
        self.bindings.write().unwrap().remove(&port);
    }

    fn port_unreachable(&self, header: &Ipv4Header, payload: &[u8]) {
        if header.destination.is_broadcast() || header.destination.is_multicast() {
            return;
        }
        let engine = match self.engine.upgrade() {
            Some(engine) => engine,
            None => return,
        };
        let datagram = header.clone().encap(payload);
        let message = IcmpMessage::destination_unreachable(
            ICMP_CODE_PORT_UNREACHABLE,
            &datagram,
            header.header_len(),
        );
        let reply = engine.header(IpProtocol::ICMP.into(), header.source);
        if let Err(e) = engine.send(reply, &message.to_bytes()) {
            debug!("port unreachable to {} failed: {}", header.source, e);
        }
    }
}

// Scans the ephemeral range from a random starting point.
fn free_port(bindings: &HashMap<u16, Binding>) -> Option<u16> {
    let first = u32::from(*EPHEMERAL_PORTS.start());
    let count = u32::from(*EPHEMERAL_PORTS.end()) - first + 1;
    let start = rand::thread_rng().gen_range(0..count);
    (0..count)
        .map(|i| (first + (start + i) % count) as u16)
        .find(|port| !bindings.contains_key(port))
}

impl Protocol for UdpLayer {
    fn receive(&self, header: &Ipv4Header, payload: &[u8]) {
        let segment = match UdpSegment::from_buffer(payload.to_vec()) {
            Ok(segment) => segment,
            Err(e) => {
                Stats::bump(&self.stats.malformed);
                debug!("dropping UDP segment from {}: {}", header.source, e);
                return;
            }
        };
        if !segment.checksum_valid(header.source, header.destination) {
            Stats::bump(&self.stats.malformed);
            debug!("dropping UDP segment from {}: bad checksum", header.source);
            return;
        }

        let port = segment.dest_port();
        let tx = {
            let bindings = self.bindings.read().unwrap();
            bindings
                .get(&port)
                .filter(|b| b.remote == header.source && b.remote_port == segment.src_port())
                .map(|b| b.tx.clone())
        };
        let tx = match tx {
            Some(tx) => tx,
            None => {
                Stats::bump(&self.stats.udp_no_port);
                trace!(
                    "no socket for {}:{} on port {}",
                    header.source,
                    segment.src_port(),
                    port
                );
                self.port_unreachable(header, payload);
                return;
            }
        };
        match tx.try_send(Ok(segment.payload().to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                Stats::bump(&self.stats.udp_queue_overflow);
                debug!("receive queue of port {} is full, dropping datagram", port);
            }
            Err(TrySendError::Closed(_)) => trace!("port {} is closing", port),
        }
    }

    fn destination_unreachable(&self, _header: &Ipv4Header, message: &IcmpMessage) {
        if message.code != ICMP_CODE_PORT_UNREACHABLE {
            return;
        }
        let quoted = message.quoted_datagram();
        let original = match Ipv4Header::parse(quoted) {
            Ok(header) if header.protocol() == IpProtocol::UDP => header,
            _ => return,
        };
        let ports = &quoted[original.header_len()..];
        if ports.len() < UDP_HEADER_LEN / 2 {
            return;
        }
        let local_port = u16::from_be_bytes([ports[0], ports[1]]);
        let remote_port = u16::from_be_bytes([ports[2], ports[3]]);

        let bindings = self.bindings.read().unwrap();
        if let Some(binding) = bindings.get(&local_port) {
            if binding.remote == original.destination && binding.remote_port == remote_port {
                debug!("{}:{} refused port {}", original.destination, remote_port, local_port);
                let _ = binding.tx.try_send(Err(Error::ConnectionRefused {
                    address: original.destination,
                    port: remote_port,
                }));
            }
        }
    }
}

/// One connected UDP socket. The local port is released when the socket is dropped.
pub struct UdpSocket {
    layer: Arc<UdpLayer>,
    local_port: u16,
    remote: Ipv4Addr,
    remote_port: u16,
    rx: mpsc::Receiver<Delivery>,
}

impl UdpSocket {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> (Ipv4Addr, u16) {
        (self.remote, self.remote_port)
    }

    /// Sends one datagram to the connected peer. Like `Ipv4Engine::send` this may block on a
    /// full interface queue.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let engine = self.layer.engine.upgrade().ok_or(Error::Shutdown)?;
        let source = engine.source_for(self.remote)?;
        let mut segment = UdpSegment::new(self.local_port, self.remote_port, data);
        segment.set_checksum(source, self.remote);
        let header = engine.header(IpProtocol::UDP.into(), self.remote);
        engine.send(header, &segment.data)
    }

    /// The next datagram from the peer, or `ConnectionRefused` once it answered one of ours with
    /// a port unreachable.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.unwrap_or(Err(Error::Shutdown))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.layer.unbind(self.local_port);
    }
}
