//! Administrative commands over a running stack: inspecting and seeding the resolution cache,
//! listing and adding routes, showing and addressing interfaces, and pinging. Each command
//! returns its printable output; bad arguments come back as `Error`.

use crate::error::{Error, Result};
use crate::icmp::PING_PAYLOAD_LEN;
use crate::interface::{Interface, InterfaceAddress};
use crate::route::METRIC_DEFAULT;
use crate::stack::Stack;
use std::fmt::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// How long `ping` waits for each reply.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);
const PING_COUNT: u16 = 4;

fn parse_ip(s: &str) -> Result<Ipv4Addr> {
    s.parse().map_err(|_| Error::InvalidAddress(s.to_string()))
}

/// The resolution cache, one `ip - mac` line per entry.
pub fn arp_table(stack: &Stack) -> String {
    let mut out = String::new();
    for entry in stack.arp().entries() {
        match entry.hardware_address {
            Some(mac) => {
                let _ = writeln!(out, "{} - {}", entry.address, mac);
            }
            None => {
                let _ = writeln!(out, "{} - (incomplete)", entry.address);
            }
        }
    }
    out
}

/// Sends a resolution request for `ip` out of `interface`, retrying `retries` times.
pub fn arp_query(stack: &Stack, ip: &str, interface: &str, retries: u32) -> Result<()> {
    let ip = parse_ip(ip)?;
    let interface = stack.interface_by_name(interface)?;
    stack.arp().query(&interface, ip, retries)
}

pub fn route_table(stack: &Stack) -> String {
    let mut out = format!(
        "{:<16}{:<16}{:<16}{:<6}{:<8}{}\n",
        "Destination", "Gateway", "Genmask", "Flags", "Metric", "Iface"
    );
    for route in stack.routes().routes() {
        let _ = writeln!(out, "{}", route);
    }
    out
}

/// Adds a route to the network in `cidr` through `interface`, optionally via `gateway`.
pub fn route_add(
    stack: &Stack,
    cidr: &str,
    gateway: Option<&str>,
    metric: Option<u32>,
    interface: &str,
) -> Result<()> {
    let network: InterfaceAddress = cidr.parse()?;
    let gateway = gateway.map(parse_ip).transpose()?;
    let interface = stack.interface_by_name(interface)?;
    stack.routes().add_route(
        network.network(),
        network.netmask,
        gateway,
        metric.unwrap_or(METRIC_DEFAULT),
        network.prefix_len() == 32,
        interface,
    );
    Ok(())
}

fn describe(interface: &Arc<dyn Interface>) -> String {
    let mut out = format!("{}: mtu {}\n", interface.name(), interface.mtu());
    let _ = writeln!(out, "    ether {}", interface.hardware_address());
    if let Some(address) = interface.ipv4_address() {
        let _ = writeln!(out, "    inet {} netmask {}", address, address.netmask);
    }
    if let Some(stats) = interface.stats() {
        for line in stats.to_string().lines() {
            let _ = writeln!(out, "    {}", line);
        }
    }
    out
}

/// Describes one interface, or all of them when `name` is `None`.
pub fn interface_info(stack: &Stack, name: Option<&str>) -> Result<String> {
    match name {
        Some(name) => Ok(describe(&stack.interface_by_name(name)?)),
        None => Ok(stack
            .interfaces()
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

pub fn interface_set_address(stack: &Stack, name: &str, cidr: &str) -> Result<()> {
    let address: InterfaceAddress = cidr.parse()?;
    stack.configure_interface_address(name, address)
}

/// Sends `count` echo requests to `ip` back to back, one line per request and a summary.
pub async fn ping(stack: &Stack, ip: &str, count: u16) -> Result<String> {
    let ip = parse_ip(ip)?;
    let mut out = String::new();
    let mut received = 0;
    for sequence in 0..count {
        match stack.icmp().ping(ip, sequence, PING_TIMEOUT).await {
            Ok(rtt) => {
                received += 1;
                let _ = writeln!(
                    out,
                    "{} bytes from {}: icmp_seq={} time={:.3} ms",
                    PING_PAYLOAD_LEN + 8,
                    ip,
                    sequence,
                    rtt.as_secs_f64() * 1000.0
                );
            }
            Err(Error::Timeout(_)) => {
                let _ = writeln!(out, "Request timeout for icmp_seq {}", sequence);
            }
            Err(e) => return Err(e),
        }
    }
    let _ = writeln!(out, "{} packets transmitted, {} received", count, received);
    Ok(out)
}

/// Runs one command line:
///
/// ```text
/// arp
/// arp query <ip> <interface> [retries]
/// route
/// route add <cidr> <interface> [gateway] [metric]
/// iface [<interface>]
/// iface <interface> addr <cidr>
/// ping <ip> [count]
/// ```
///
/// Commands other than `ping` may transmit and run on the blocking pool.
pub async fn execute(stack: &Arc<Stack>, line: &str) -> Result<String> {
    let args: Vec<&str> = line.split_whitespace().collect();
    if let ["ping", ip, rest @ ..] = args.as_slice() {
        if rest.len() <= 1 {
            let count = match rest.first() {
                Some(c) => c
                    .parse()
                    .map_err(|_| Error::UnknownCommand(line.trim().to_string()))?,
                None => PING_COUNT,
            };
            return ping(stack, ip, count).await;
        }
    }
    let stack = stack.clone();
    let line = line.to_string();
    tokio::task::spawn_blocking(move || execute_blocking(&stack, &line))
        .await
        .unwrap_or(Err(Error::Shutdown))
}

/// `execute` for every command but `ping`, for callers already off the async executor.
pub fn execute_blocking(stack: &Stack, line: &str) -> Result<String> {
    let unknown = || Error::UnknownCommand(line.trim().to_string());
    let args: Vec<&str> = line.split_whitespace().collect();
    match args.as_slice() {
        ["arp"] => Ok(arp_table(stack)),
        ["arp", "query", ip, interface, rest @ ..] if rest.len() <= 1 => {
            // An unparsable retry count means no retries.
            let retries = rest.first().and_then(|r| r.parse().ok()).unwrap_or(0);
            arp_query(stack, ip, interface, retries).map(|_| String::new())
        }
        ["route"] => Ok(route_table(stack)),
        ["route", "add", cidr, interface, rest @ ..] if rest.len() <= 2 => {
            let gateway = rest.first().copied();
            let metric: Option<u32> = match rest.get(1) {
                Some(m) => Some(m.parse().map_err(|_| unknown())?),
                None => None,
            };
            route_add(stack, cidr, gateway, metric, interface).map(|_| String::new())
        }
        ["iface"] => interface_info(stack, None),
        ["iface", name] => interface_info(stack, Some(*name)),
        ["iface", name, "addr", cidr] => {
            interface_set_address(stack, name, cidr).map(|_| String::new())
        }
        _ => Err(unknown()),
    }
}
