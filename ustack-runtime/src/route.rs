use crate::error::{Error, Result};
use crate::interface::{same_interface, Interface};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Metric of the host route to an interface's own address.
pub const METRIC_LOCALHOST: u32 = 0;
pub const METRIC_MIN: u32 = 1;
pub const METRIC_DEFAULT: u32 = 1024;
pub const METRIC_MAX: u32 = 1 << 20;

/// One destination rule. Entries are never edited in place; changing a route means removing it
/// and adding the replacement.
#[derive(Clone)]
pub struct RouteEntry {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// `0.0.0.0` for directly attached networks
    pub gateway: Ipv4Addr,
    pub metric: u32,
    pub is_host: bool,
    pub is_gateway: bool,
    pub interface: Arc<dyn Interface>,
}

impl RouteEntry {
    pub fn matches(&self, destination: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(destination) & mask == u32::from(self.network) & mask
    }

    pub fn next_hop(&self, destination: Ipv4Addr) -> Ipv4Addr {
        if self.is_gateway {
            self.gateway
        } else {
            destination
        }
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("network", &self.network)
            .field("netmask", &self.netmask)
            .field("gateway", &self.gateway)
            .field("metric", &self.metric)
            .field("is_host", &self.is_host)
            .field("is_gateway", &self.is_gateway)
            .field("interface", &self.interface.name())
            .finish()
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut flags = String::from("U");
        if self.is_gateway {
            flags.push('G');
        }
        if self.is_host {
            flags.push('H');
        }
        write!(
            f,
            "{:<16}{:<16}{:<16}{:<6}{:<8}{}",
            self.network.to_string(),
            self.gateway.to_string(),
            self.netmask.to_string(),
            flags,
            self.metric,
            self.interface.name()
        )
    }
}

/// Shared table of destination rules. Many readers resolve concurrently; configuration changes
/// take the write lock.
#[derive(Default)]
pub struct RoutingTable {
    routes: RwLock<Vec<RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        RoutingTable {
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Adds a route; a `gateway` makes it an indirect route.
    pub fn add_route(
        &self,
        network: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        metric: u32,
        is_host: bool,
        interface: Arc<dyn Interface>,
    ) {
        let entry = RouteEntry {
            network,
            netmask,
            gateway: gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            metric,
            is_host,
            is_gateway: gateway.is_some(),
            interface,
        };
        debug!("adding route {:?}", entry);
        self.routes.write().unwrap().push(entry);
    }

    /// Adds a /32 route to `host`.
    pub fn add_host(
        &self,
        host: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        metric: u32,
        interface: Arc<dyn Interface>,
    ) {
        self.add_route(host, Ipv4Addr::BROADCAST, gateway, metric, true, interface);
    }

    /// Drops every route that egresses through `interface`. Returns how many were removed.
    pub fn remove_routes_for(&self, interface: &Arc<dyn Interface>) -> usize {
        let mut routes = self.routes.write().unwrap();
        let before = routes.len();
        routes.retain(|r| !same_interface(&r.interface, interface));
        before - routes.len()
    }

    /// Deletes the routes for exactly this network through `interface`.
    pub fn remove_route(
        &self,
        network: Ipv4Addr,
        netmask: Ipv4Addr,
        interface: &Arc<dyn Interface>,
    ) -> usize {
        let mut routes = self.routes.write().unwrap();
        let before = routes.len();
        routes.retain(|r| {
            !(r.network == network && r.netmask == netmask && same_interface(&r.interface, interface))
        });
        before - routes.len()
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.routes.read().unwrap().clone()
    }

    /// Picks the egress interface and next hop for `destination`. Among matching entries the
    /// lowest metric wins, and on equal metrics the earliest added.
    pub fn resolve(&self, destination: Ipv4Addr) -> Result<(Arc<dyn Interface>, Ipv4Addr)> {
        let routes = self.routes.read().unwrap();
        let mut best: Option<&RouteEntry> = None;
        for route in routes.iter().filter(|r| r.matches(destination)) {
            match best {
                Some(b) if b.metric <= route.metric => {}
                _ => best = Some(route),
            }
        }
        best.map(|r| (r.interface.clone(), r.next_hop(destination)))
            .ok_or(Error::NotRoutable(destination))
    }
}
