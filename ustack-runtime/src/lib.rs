/// Errors returned by the send path and by administrative operations. Receive-path failures never
/// surface as errors; those packets are logged, counted in `Stats` and dropped.
pub mod error;
pub use error::{Error, Result};

/// Tunables for timeouts, retry budgets and queue capacities.
pub mod config;
pub use config::StackConfig;

/// Shared drop and activity counters.
pub mod stats;
pub use stats::{Stats, StatsSnapshot};

/// Link-layer devices as seen by the stack, their addresses, and the decoded frames they hand
/// upwards. `ChannelInterface` is a device backed by in-memory queues.
pub mod interface;

/// The table of destination rules used to pick an egress interface and next hop.
pub mod route;

/// Address resolution: the IPv4 to hardware address cache with its pending queues, expiry
/// ticker and wire protocol.
pub mod arp;

/// The IPv4 engine, fragmentation and the reassembly actor.
pub mod ipv4;

/// Upper-layer handlers keyed by IP protocol number.
pub mod protocol;

/// The ICMP echo responder and `ping` every stack registers.
pub mod icmp;

/// Connected UDP sockets.
pub mod udp;

/// Wires all of the above together and demultiplexes received frames.
pub mod stack;
pub use stack::Stack;

/// Administrative commands.
pub mod admin;

/// Utility module
pub mod utils;
