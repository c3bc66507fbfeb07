use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Drop and activity counters shared by every component of a stack.
        #[derive(Debug, Default)]
        pub struct Stats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of `Stats`.
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Frames or headers that failed to parse
    malformed,
    /// Resolution frames whose sender address disagrees with the link source
    spoofed,
    unsupported_protocol,
    /// Don't-fragment set together with fragment fields
    invalid_fragment_flags,
    /// Packets refused because a pending resolution queue was full
    arp_queue_overflow,
    /// Packets dropped when their resolution gave up
    arp_unresolved_dropped,
    arp_requests_sent,
    arp_replies_sent,
    fragments_sent,
    reassembled,
    fragment_collisions,
    reassembly_expired,
    reassembly_queue_overflow,
    /// Fragments arriving after the reassembly actor stopped
    reassembly_closed,
    /// Datagrams for a port nobody has bound
    udp_no_port,
    /// Datagrams dropped because a socket's receive queue was full
    udp_queue_overflow,
    tx_errors,
}

impl Stats {
    pub fn new() -> Self {
        Stats::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        Stats::add(counter, 1);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
