//! IPv4-over-Ethernet address resolution: the shared binding cache with its pending queues and
//! expiry ticker, and the request/reply protocol that feeds it.

mod cache;
pub use self::cache::*;

mod protocol;
