use std::net::Ipv4Addr;
use thiserror::Error;
use ustack_packets::ParseError;

/// Errors surfaced to callers of the send path and of the administrative commands. Receive-path
/// problems never show up here; those packets are logged, counted and dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("no route to {0}")]
    NotRoutable(Ipv4Addr),
    #[error("packet of {size} bytes exceeds MTU {mtu} and may not be fragmented")]
    PacketTooBig { size: usize, mtu: usize },
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("interface {0} has no IPv4 address")]
    NoAddress(String),
    #[error("hardware address for {0} could not be resolved")]
    Unresolvable(Ipv4Addr),
    #[error("no cache entry for {0}")]
    NotFound(Ipv4Addr),
    #[error("malformed packet: {0}")]
    Malformed(#[from] ParseError),
    #[error("invalid CIDR notation: {0}")]
    InvalidCidr(String),
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("local port {0} is already bound")]
    PortInUse(u16),
    #[error("port 0 is not a valid remote port")]
    InvalidPort,
    #[error("no free local port")]
    PortsExhausted,
    #[error("{address}:{port} refused the datagram")]
    ConnectionRefused { address: Ipv4Addr, port: u16 },
    #[error("no echo reply from {0}")]
    Timeout(Ipv4Addr),
    #[error("transmit failed: {0}")]
    Transmit(String),
    #[error("stack is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
