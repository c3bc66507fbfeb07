use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use ustack_packets::{IcmpMessage, Ipv4Header};

/// An upper-layer consumer of IPv4 datagrams, registered under its protocol number.
///
/// Handlers run on whichever task delivered the datagram (an interface reader or the
/// reassembly actor), so they should hand long work off elsewhere.
pub trait Protocol: Send + Sync {
    fn receive(&self, header: &Ipv4Header, payload: &[u8]);

    /// Called for every ICMP Destination Unreachable the stack receives. `header` is the header
    /// of the ICMP packet itself.
    fn destination_unreachable(&self, _header: &Ipv4Header, _message: &IcmpMessage) {}
}

/// Protocol number to handler map.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: RwLock<HashMap<u8, Arc<dyn Protocol>>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        ProtocolRegistry::default()
    }

    /// Installs `handler` for `protocol`, returning the one it replaces.
    pub fn register(&self, protocol: u8, handler: Arc<dyn Protocol>) -> Option<Arc<dyn Protocol>> {
        self.handlers.write().unwrap().insert(protocol, handler)
    }

    pub fn unregister(&self, protocol: u8) -> Option<Arc<dyn Protocol>> {
        self.handlers.write().unwrap().remove(&protocol)
    }

    pub fn get(&self, protocol: u8) -> Option<Arc<dyn Protocol>> {
        self.handlers.read().unwrap().get(&protocol).cloned()
    }

    /// Every registered handler. The lock is released before the list is returned, so callers
    /// may invoke handlers freely.
    pub fn all(&self) -> Vec<Arc<dyn Protocol>> {
        self.handlers.read().unwrap().values().cloned().collect()
    }

    pub fn protocols(&self) -> Vec<u8> {
        let mut protocols: Vec<u8> = self.handlers.read().unwrap().keys().copied().collect();
        protocols.sort_unstable();
        protocols
    }
}
