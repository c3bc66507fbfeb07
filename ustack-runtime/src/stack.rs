use crate::arp::{self, ResolutionCache};
use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::icmp::EchoResponder;
use crate::interface::{Interface, InterfaceAddress, Layer2Packet};
use crate::ipv4::{self, Ipv4Engine, ReassemblyWorker};
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::route::{RoutingTable, METRIC_LOCALHOST, METRIC_MIN};
use crate::stats::{Stats, StatsSnapshot};
use crate::udp::UdpLayer;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use ustack_packets::{EthernetFrame, IpProtocol, ARP_ETHER_TYPE, IPV4_ETHER_TYPE};

// How often an idle reader checks whether its stack is still alive.
const READER_POLL: Duration = Duration::from_millis(100);

/// One network stack: routing table, resolution cache, IPv4 engine, reassembly actor, the ICMP
/// and UDP handlers, and the interfaces feeding them.
///
/// `Stack::new` must run inside a tokio runtime; it spawns the resolution ticker, the
/// reassembly actor and its sweep ticker. They stop when the stack is dropped.
pub struct Stack {
    stats: Arc<Stats>,
    routes: Arc<RoutingTable>,
    arp: Arc<ResolutionCache>,
    registry: Arc<ProtocolRegistry>,
    engine: Arc<Ipv4Engine>,
    icmp: Arc<EchoResponder>,
    udp: Arc<UdpLayer>,
    interfaces: RwLock<Vec<Arc<dyn Interface>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    pub fn new(config: StackConfig) -> Arc<Stack> {
        let stats = Arc::new(Stats::new());
        let routes = Arc::new(RoutingTable::new());
        let registry = Arc::new(ProtocolRegistry::new());
        let arp = Arc::new(ResolutionCache::new(
            config.clone(),
            routes.clone(),
            stats.clone(),
        ));
        let (reassembly, worker) = ReassemblyWorker::new(&config, registry.clone(), stats.clone());
        let engine = Arc::new(Ipv4Engine::new(
            config.clone(),
            routes.clone(),
            arp.clone(),
            registry.clone(),
            stats.clone(),
            reassembly.clone(),
        ));
        let icmp = Arc::new(EchoResponder::new(Arc::downgrade(&engine)));
        registry.register(IpProtocol::ICMP.into(), icmp.clone());
        let udp = Arc::new(UdpLayer::new(
            &config,
            Arc::downgrade(&engine),
            stats.clone(),
        ));
        registry.register(IpProtocol::UDP.into(), udp.clone());

        let tasks = vec![
            tokio::spawn(worker.run()),
            tokio::spawn(ipv4::run_sweeper(
                reassembly,
                config.reassembly_sweep_interval,
            )),
            tokio::spawn(arp::run_ticker(Arc::downgrade(&arp))),
        ];
        info!("network stack started");

        Arc::new(Stack {
            stats,
            routes,
            arp,
            registry,
            engine,
            icmp,
            udp,
            interfaces: RwLock::new(Vec::new()),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn arp(&self) -> &Arc<ResolutionCache> {
        &self.arp
    }

    pub fn engine(&self) -> &Arc<Ipv4Engine> {
        &self.engine
    }

    pub fn icmp(&self) -> &Arc<EchoResponder> {
        &self.icmp
    }

    pub fn udp(&self) -> &Arc<UdpLayer> {
        &self.udp
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Installs the handler for an IP protocol number, replacing any previous one.
    pub fn register_protocol(&self, protocol: u8, handler: Arc<dyn Protocol>) {
        self.registry.register(protocol, handler);
    }

    pub fn unregister_protocol(&self, protocol: u8) {
        self.registry.unregister(protocol);
    }

    pub fn add_interface(&self, interface: Arc<dyn Interface>) {
        info!(
            "adding interface {} ({})",
            interface.name(),
            interface.hardware_address()
        );
        self.interfaces.write().unwrap().push(interface);
    }

    pub fn interfaces(&self) -> Vec<Arc<dyn Interface>> {
        self.interfaces.read().unwrap().clone()
    }

    pub fn interface_by_name(&self, name: &str) -> Result<Arc<dyn Interface>> {
        self.interfaces
            .read()
            .unwrap()
            .iter()
            .find(|i| i.name() == name)
            .cloned()
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
    }

    /// Gives the named interface a new address. Routes through the interface are replaced by a
    /// host route to the address and a route to its subnet.
    pub fn configure_interface_address(&self, name: &str, address: InterfaceAddress) -> Result<()> {
        let interface = self.interface_by_name(name)?;
        if interface.ipv4_address().is_some() {
            self.routes.remove_routes_for(&interface);
        }
        interface.set_ipv4_address(Some(address));
        self.routes
            .add_host(address.address, None, METRIC_LOCALHOST, interface.clone());
        self.routes.add_route(
            address.network(),
            address.netmask,
            None,
            METRIC_MIN,
            false,
            interface,
        );
        info!("{} configured with {}", name, address);
        Ok(())
    }

    /// Demultiplexes one received Ethernet frame by its EtherType.
    pub fn receive_frame(&self, interface: &Arc<dyn Interface>, bytes: Vec<u8>) {
        let frame = match EthernetFrame::from_buffer(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                Stats::bump(&self.stats.malformed);
                if let Some(stats) = interface.stats() {
                    stats.record_rx_error();
                }
                debug!("dropping frame on {}: {}", interface.name(), e);
                return;
            }
        };
        let packet = Layer2Packet::from_frame(interface.clone(), frame);
        if packet.destination.is_multicast() && !packet.destination.is_broadcast() {
            trace!("ignoring multicast frame to {}", packet.destination);
            return;
        }

        match packet.ether_type {
            IPV4_ETHER_TYPE => {
                let our_mac = interface.hardware_address();
                if packet.destination != our_mac && !packet.destination.is_broadcast() {
                    trace!(
                        "ignoring IPv4 frame for {} on {}",
                        packet.destination,
                        interface.name()
                    );
                    return;
                }
                self.engine.receive(&packet);
            }
            ARP_ETHER_TYPE => self.arp.receive(&packet),
            other => trace!("ignoring frame with EtherType {:#06x}", other),
        }
    }

    /// Feeds frames from `receiver` into `receive_frame` on a blocking task. The task ends when
    /// the receiver disconnects or the stack is dropped.
    pub fn spawn_reader(
        self: &Arc<Self>,
        interface: Arc<dyn Interface>,
        receiver: Receiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        let stack = Arc::downgrade(self);
        tokio::task::spawn_blocking(move || read_frames(stack, interface, receiver))
    }
}

fn read_frames(stack: Weak<Stack>, interface: Arc<dyn Interface>, receiver: Receiver<Vec<u8>>) {
    loop {
        match receiver.recv_timeout(READER_POLL) {
            Ok(frame) => {
                let stack = match stack.upgrade() {
                    Some(stack) => stack,
                    None => break,
                };
                if let Some(stats) = interface.stats() {
                    stats.record_rx(frame.len());
                }
                stack.receive_frame(&interface, frame);
            }
            Err(RecvTimeoutError::Timeout) => {
                if stack.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("reader for {} stopped", interface.name());
}

impl Drop for Stack {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap().drain(..) {
            task.abort();
        }
    }
}
