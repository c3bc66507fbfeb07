use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use ustack_packets::{EthernetFrame, MacAddr};

/// An IPv4 address together with the netmask of its subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceAddress {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        InterfaceAddress {
            address,
            netmask: netmask_from_prefix(prefix_len),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask))
    }

    pub fn prefix_len(&self) -> u8 {
        u32::from(self.netmask).leading_ones() as u8
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(ip) & mask == u32::from(self.address) & mask
    }
}

pub fn netmask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    let prefix_len = prefix_len.min(32);
    if prefix_len == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix_len)))
    }
}

impl FromStr for InterfaceAddress {
    type Err = Error;

    /// Parses `a.b.c.d/len`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidCidr(s.to_string());
        let mut parts = s.trim().splitn(2, '/');
        let address = parts
            .next()
            .and_then(|a| a.parse::<Ipv4Addr>().ok())
            .ok_or_else(invalid)?;
        let prefix_len = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .filter(|p| *p <= 32)
            .ok_or_else(invalid)?;
        Ok(InterfaceAddress::new(address, prefix_len))
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len())
    }
}

/// A link-layer device the stack transmits through. Implementations own their transmit queue;
/// `transmit` may block while that queue is full.
pub trait Interface: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn hardware_address(&self) -> MacAddr;

    fn ipv4_address(&self) -> Option<InterfaceAddress>;

    fn set_ipv4_address(&self, address: Option<InterfaceAddress>);

    fn mtu(&self) -> usize;

    /// Sends one complete Ethernet frame.
    fn transmit(&self, frame: Vec<u8>) -> Result<()>;

    /// Packet counters, for devices that keep them.
    fn stats(&self) -> Option<&DeviceStats> {
        None
    }
}

/// Identity comparison for interface handles.
pub fn same_interface(a: &Arc<dyn Interface>, b: &Arc<dyn Interface>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A frame handed to the network layer by the link-layer dispatch: the Ethernet header has been
/// decoded and stripped.
#[derive(Debug, Clone)]
pub struct Layer2Packet {
    pub interface: Arc<dyn Interface>,
    pub source: MacAddr,
    pub destination: MacAddr,
    pub ether_type: u16,
    pub payload: Vec<u8>,
}

impl Layer2Packet {
    pub fn from_frame(interface: Arc<dyn Interface>, frame: EthernetFrame) -> Self {
        let source = frame.src_mac();
        let destination = frame.dest_mac();
        let ether_type = frame.ether_type();
        Layer2Packet {
            interface,
            source,
            destination,
            ether_type,
            payload: frame.into_payload(),
        }
    }
}

/// Per-device packet and byte counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
}

impl DeviceStats {
    pub fn record_rx(&self, len: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_rx_error(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx(&self, len: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn record_tx_error(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "RX packets {} bytes {} errors {}",
            self.rx_packets.load(Ordering::Relaxed),
            self.rx_bytes.load(Ordering::Relaxed),
            self.rx_errors.load(Ordering::Relaxed)
        )?;
        write!(
            f,
            "TX packets {} bytes {} errors {}",
            self.tx_packets.load(Ordering::Relaxed),
            self.tx_bytes.load(Ordering::Relaxed),
            self.tx_errors.load(Ordering::Relaxed)
        )
    }
}

/// An interface backed by two bounded crossbeam channels, one per direction. The far end of the
/// transmit channel plays the wire; frames injected into the receive channel are read by the
/// stack's reader task for this interface.
pub struct ChannelInterface {
    name: String,
    hardware_address: MacAddr,
    mtu: usize,
    address: RwLock<Option<InterfaceAddress>>,
    tx: Sender<Vec<u8>>,
    rx: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    pub stats: DeviceStats,
}

impl ChannelInterface {
    /// Creates the interface and returns the receiving end of its transmit queue.
    pub fn new(
        name: &str,
        hardware_address: MacAddr,
        mtu: usize,
        queue_capacity: usize,
    ) -> (Arc<ChannelInterface>, Receiver<Vec<u8>>) {
        assert_ne!(queue_capacity, 0, "queue capacity must be non-zero");
        let (tx, wire) = channel::bounded(queue_capacity);
        let interface = ChannelInterface {
            name: name.to_string(),
            hardware_address,
            mtu,
            address: RwLock::new(None),
            tx,
            rx: channel::bounded(queue_capacity),
            stats: DeviceStats::default(),
        };
        (Arc::new(interface), wire)
    }

    /// Queues a frame as if it had arrived from the wire. Blocks while the receive queue is full.
    pub fn inject(&self, frame: Vec<u8>) -> Result<()> {
        self.rx
            .0
            .send(frame)
            .map_err(|_| Error::Transmit(format!("{}: receive queue closed", self.name)))
    }

    /// The receive queue the reader task drains.
    pub fn receiver(&self) -> Receiver<Vec<u8>> {
        self.rx.1.clone()
    }
}

impl fmt::Debug for ChannelInterface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChannelInterface")
            .field("name", &self.name)
            .field("hardware_address", &self.hardware_address)
            .field("mtu", &self.mtu)
            .finish()
    }
}

impl Interface for ChannelInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_address(&self) -> MacAddr {
        self.hardware_address
    }

    fn ipv4_address(&self) -> Option<InterfaceAddress> {
        *self.address.read().unwrap()
    }

    fn set_ipv4_address(&self, address: Option<InterfaceAddress>) {
        *self.address.write().unwrap() = address;
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn transmit(&self, frame: Vec<u8>) -> Result<()> {
        let len = frame.len();
        match self.tx.send(frame) {
            Ok(()) => {
                self.stats.record_tx(len);
                Ok(())
            }
            Err(_) => {
                self.stats.record_tx_error();
                Err(Error::Transmit(format!("{}: transmit queue closed", self.name)))
            }
        }
    }

    fn stats(&self) -> Option<&DeviceStats> {
        Some(&self.stats)
    }
}
