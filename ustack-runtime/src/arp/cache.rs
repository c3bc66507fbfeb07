use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::interface::Interface;
use crate::route::RoutingTable;
use crate::stats::Stats;
use crossbeam::queue::ArrayQueue;
use futures::channel::oneshot;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, trace, warn};
use ustack_packets::{EthernetFrame, MacAddr};

type Waiter = oneshot::Sender<Option<MacAddr>>;

enum EntryState {
    Pending {
        retries_left: u32,
        queue: ArrayQueue<EthernetFrame>,
        waiters: Vec<Waiter>,
    },
    /// Bound, but frames queued while pending are still being transmitted. New frames keep
    /// joining the queue until it is seen empty.
    Flushing {
        hardware_address: MacAddr,
        queue: ArrayQueue<EthernetFrame>,
    },
    Resolved {
        hardware_address: MacAddr,
    },
}

impl EntryState {
    fn hardware_address(&self) -> Option<MacAddr> {
        match self {
            EntryState::Pending { .. } => None,
            EntryState::Flushing {
                hardware_address, ..
            }
            | EntryState::Resolved { hardware_address } => Some(*hardware_address),
        }
    }
}

struct ResolutionEntry {
    state: EntryState,
    /// Ticker passes left before expiry, or before the next retry while pending
    ttl: u32,
    interface: Arc<dyn Interface>,
}

/// A point-in-time view of one cache entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub address: Ipv4Addr,
    /// `None` while resolution is still pending
    pub hardware_address: Option<MacAddr>,
    pub ttl: u32,
    pub retries_left: Option<u32>,
    pub queued: usize,
    pub interface: String,
}

// Released by a resolution; the queue itself is drained by `ResolutionCache::flush`.
struct Flush {
    address: Ipv4Addr,
    hardware_address: MacAddr,
    waiters: Vec<Waiter>,
}

/// The IPv4 to hardware address binding cache.
///
/// Frames for an address that is not yet known are parked on its pending entry (bounded, never
/// blocking the sender) and flushed in submission order once a binding is learned. Frames sent
/// while that flush is running join the back of the queue, so no frame overtakes one submitted
/// before it. The whole table sits behind one `RwLock`; interfaces are only ever written to after
/// it is released.
///
/// `Interface::transmit` may block, so the methods here that transmit must not be called from an
/// async task. `run_ticker` and `lookup_wait` move their transmits onto the blocking pool.
pub struct ResolutionCache {
    pub(super) config: StackConfig,
    pub(super) routes: Arc<RoutingTable>,
    pub(super) stats: Arc<Stats>,
    entries: RwLock<HashMap<Ipv4Addr, ResolutionEntry>>,
}

impl ResolutionCache {
    pub fn new(config: StackConfig, routes: Arc<RoutingTable>, stats: Arc<Stats>) -> Self {
        ResolutionCache {
            config,
            routes,
            stats,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn pending_entry(&self, interface: Arc<dyn Interface>, retries: u32) -> ResolutionEntry {
        ResolutionEntry {
            state: EntryState::Pending {
                retries_left: retries,
                queue: ArrayQueue::new(self.config.arp_queue_capacity),
                waiters: Vec::new(),
            },
            ttl: self.config.arp_request_timeout_ticks(),
            interface,
        }
    }

    /// Transmits `frame` to `target` on `interface` once its hardware address is known. The
    /// destination MAC of the frame is overwritten; everything else is sent as given.
    ///
    /// An unknown target gets a pending entry and one resolution request. While the target is
    /// pending, or its queue is still being flushed, the frame is queued; a full queue drops it.
    pub fn resolve_and_send(
        &self,
        interface: &Arc<dyn Interface>,
        frame: EthernetFrame,
        target: Ipv4Addr,
    ) -> Result<()> {
        enum Next {
            Transmit(MacAddr, EthernetFrame),
            Queued,
            Request,
        }

        let next = {
            let mut entries = self.entries.write().unwrap();
            match entries.entry(target) {
                Entry::Occupied(mut occupied) => match &mut occupied.get_mut().state {
                    EntryState::Resolved { hardware_address } => {
                        Next::Transmit(*hardware_address, frame)
                    }
                    EntryState::Pending { queue, .. } | EntryState::Flushing { queue, .. } => {
                        if queue.push(frame).is_err() {
                            Stats::bump(&self.stats.arp_queue_overflow);
                            debug!("resolution queue for {} is full, dropping packet", target);
                        }
                        Next::Queued
                    }
                },
                Entry::Vacant(vacant) => {
                    let entry = self.pending_entry(interface.clone(), self.config.arp_retries);
                    if let EntryState::Pending { queue, .. } = &entry.state {
                        let _ = queue.push(frame);
                    }
                    vacant.insert(entry);
                    Next::Request
                }
            }
        };

        match next {
            Next::Transmit(hardware_address, mut frame) => {
                frame.set_dest_mac(hardware_address);
                self.transmit(interface, frame)
            }
            Next::Queued => Ok(()),
            Next::Request => self.send_request(interface, target),
        }
    }

    /// Records that `ip` was seen at `mac`. Only addresses the cache already tracks are updated.
    pub fn passive_learn(&self, interface: &Arc<dyn Interface>, ip: Ipv4Addr, mac: MacAddr) {
        let flush = {
            let mut entries = self.entries.write().unwrap();
            let entry = match entries.get_mut(&ip) {
                Some(entry) => entry,
                None => return,
            };
            match entry.state.hardware_address() {
                Some(known) if known == mac => return,
                Some(known) => {
                    warn!("{} moved from {} to {} on {}", ip, known, mac, interface.name());
                    entry.interface = interface.clone();
                    promote(ip, entry, mac, self.config.arp_entry_ttl_ticks())
                }
                None => {
                    debug!("resolved {} to {}", ip, mac);
                    promote(ip, entry, mac, self.config.arp_entry_ttl_ticks())
                }
            }
        };
        if let Some(flush) = flush {
            self.flush(flush);
        }
    }

    /// The hardware address of `ip`, if resolved.
    pub fn lookup(&self, ip: Ipv4Addr) -> Result<MacAddr> {
        self.entries
            .read()
            .unwrap()
            .get(&ip)
            .and_then(|entry| entry.state.hardware_address())
            .ok_or(Error::NotFound(ip))
    }

    /// Resolves `ip`, waiting for the answer when it is not cached. The request goes out of the
    /// interface the routing table picks for `ip`. Callers waiting on the same address share one
    /// request; all of them fail with `Unresolvable` once its retries run out.
    pub async fn lookup_wait(self: &Arc<Self>, ip: Ipv4Addr) -> Result<MacAddr> {
        let (interface, _) = self.routes.resolve(ip)?;
        let (tx, rx) = oneshot::channel();
        let request = {
            let mut entries = self.entries.write().unwrap();
            match entries.entry(ip) {
                Entry::Occupied(mut occupied) => match &mut occupied.get_mut().state {
                    EntryState::Pending { waiters, .. } => {
                        waiters.push(tx);
                        false
                    }
                    resolved => {
                        return resolved.hardware_address().ok_or(Error::NotFound(ip));
                    }
                },
                Entry::Vacant(vacant) => {
                    let mut entry = self.pending_entry(interface.clone(), self.config.arp_retries);
                    if let EntryState::Pending { waiters, .. } = &mut entry.state {
                        waiters.push(tx);
                    }
                    vacant.insert(entry);
                    true
                }
            }
        };
        if request {
            let cache = self.clone();
            tokio::task::spawn_blocking(move || cache.send_request(&interface, ip))
                .await
                .map_err(|_| Error::Shutdown)??;
        }
        match rx.await {
            Ok(Some(hardware_address)) => Ok(hardware_address),
            Ok(None) => Err(Error::Unresolvable(ip)),
            Err(oneshot::Canceled) => Err(Error::Shutdown),
        }
    }

    /// Starts resolving `ip` on `interface` with its own retry budget. A request is sent unless
    /// the address is already resolved.
    pub fn query(&self, interface: &Arc<dyn Interface>, ip: Ipv4Addr, retries: u32) -> Result<()> {
        let request = {
            let mut entries = self.entries.write().unwrap();
            match entries.entry(ip) {
                Entry::Occupied(occupied) => occupied.get().state.hardware_address().is_none(),
                Entry::Vacant(vacant) => {
                    vacant.insert(self.pending_entry(interface.clone(), retries));
                    true
                }
            }
        };
        if request {
            self.send_request(interface, ip)
        } else {
            Ok(())
        }
    }

    /// Installs a binding with the long-lived TTL, releasing anything queued for `ip`.
    pub fn pin(&self, interface: &Arc<dyn Interface>, ip: Ipv4Addr, mac: MacAddr) {
        let ttl = self.config.arp_pinned_ttl_ticks();
        let flush = {
            let mut entries = self.entries.write().unwrap();
            match entries.get_mut(&ip) {
                Some(entry) => {
                    entry.interface = interface.clone();
                    promote(ip, entry, mac, ttl)
                }
                None => {
                    entries.insert(
                        ip,
                        ResolutionEntry {
                            state: EntryState::Resolved {
                                hardware_address: mac,
                            },
                            ttl,
                            interface: interface.clone(),
                        },
                    );
                    None
                }
            }
        };
        if let Some(flush) = flush {
            self.flush(flush);
        }
    }

    /// All entries, ordered by address.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let entries = self.entries.read().unwrap();
        let mut snapshot: Vec<CacheEntry> = entries
            .iter()
            .map(|(address, entry)| {
                let (retries_left, queued) = match &entry.state {
                    EntryState::Resolved { .. } => (None, 0),
                    EntryState::Flushing { queue, .. } => (None, queue.len()),
                    EntryState::Pending {
                        retries_left,
                        queue,
                        ..
                    } => (Some(*retries_left), queue.len()),
                };
                CacheEntry {
                    address: *address,
                    hardware_address: entry.state.hardware_address(),
                    ttl: entry.ttl,
                    retries_left,
                    queued,
                    interface: entry.interface.name().to_string(),
                }
            })
            .collect();
        snapshot.sort_by_key(|e| e.address);
        snapshot
    }

    /// One pass of the expiry clock. Every entry loses a tick; resolved entries at zero are
    /// deleted, pending ones either retry or give up and drop what they queued.
    pub fn tick(&self) {
        let timeout = self.config.arp_request_timeout_ticks();
        let mut retries = Vec::new();
        {
            let mut entries = self.entries.write().unwrap();
            let stats = &self.stats;
            entries.retain(|ip, entry| {
                entry.ttl = entry.ttl.saturating_sub(1);
                if entry.ttl > 0 {
                    return true;
                }
                match &mut entry.state {
                    EntryState::Resolved { .. } => {
                        trace!("binding for {} expired", ip);
                        false
                    }
                    EntryState::Flushing { queue, .. } => {
                        Stats::add(&stats.arp_unresolved_dropped, queue.len() as u64);
                        trace!("binding for {} expired while flushing", ip);
                        false
                    }
                    EntryState::Pending { retries_left, .. } if *retries_left > 0 => {
                        *retries_left -= 1;
                        entry.ttl = timeout;
                        retries.push((entry.interface.clone(), *ip));
                        true
                    }
                    EntryState::Pending { queue, waiters, .. } => {
                        let dropped = queue.len();
                        Stats::add(&stats.arp_unresolved_dropped, dropped as u64);
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(None);
                        }
                        warn!(
                            "giving up on resolving {}, dropped {} queued packets",
                            ip, dropped
                        );
                        false
                    }
                }
            });
        }
        for (interface, ip) in retries {
            let _ = self.send_request(&interface, ip);
        }
    }

    pub(super) fn transmit(&self, interface: &Arc<dyn Interface>, frame: EthernetFrame) -> Result<()> {
        interface.transmit(frame.data).map_err(|e| {
            Stats::bump(&self.stats.tx_errors);
            debug!("transmit on {} failed: {}", interface.name(), e);
            e
        })
    }

    // Drains the queue of a flushing entry in batches, transmitting each batch after the lock is
    // released. The entry only becomes `Resolved` once a batch comes back empty, so frames sent
    // meanwhile wait their turn behind the queue.
    fn flush(&self, flush: Flush) {
        let Flush {
            address,
            hardware_address,
            waiters,
        } = flush;
        for waiter in waiters {
            let _ = waiter.send(Some(hardware_address));
        }
        loop {
            let (interface, hardware_address, frames) = {
                let mut entries = self.entries.write().unwrap();
                let entry = match entries.get_mut(&address) {
                    Some(entry) => entry,
                    None => return,
                };
                let (hardware_address, frames) = match &entry.state {
                    EntryState::Flushing {
                        hardware_address,
                        queue,
                    } => {
                        let mut frames = Vec::with_capacity(queue.len());
                        while let Some(frame) = queue.pop() {
                            frames.push(frame);
                        }
                        (*hardware_address, frames)
                    }
                    _ => return,
                };
                if frames.is_empty() {
                    entry.state = EntryState::Resolved { hardware_address };
                    return;
                }
                (entry.interface.clone(), hardware_address, frames)
            };
            for mut frame in frames {
                frame.set_dest_mac(hardware_address);
                let _ = self.transmit(&interface, frame);
            }
        }
    }
}

// Binds `entry` to `mac`. A pending entry starts flushing and hands back its waiters; the one
// caller that sees the switch is the one that drains the queue.
fn promote(address: Ipv4Addr, entry: &mut ResolutionEntry, mac: MacAddr, ttl: u32) -> Option<Flush> {
    entry.ttl = ttl;
    match &mut entry.state {
        EntryState::Pending { .. } => {}
        EntryState::Flushing {
            hardware_address, ..
        }
        | EntryState::Resolved { hardware_address } => {
            *hardware_address = mac;
            return None;
        }
    }
    let previous = std::mem::replace(
        &mut entry.state,
        EntryState::Resolved {
            hardware_address: mac,
        },
    );
    match previous {
        EntryState::Pending { queue, waiters, .. } => {
            entry.state = EntryState::Flushing {
                hardware_address: mac,
                queue,
            };
            Some(Flush {
                address,
                hardware_address: mac,
                waiters,
            })
        }
        _ => None,
    }
}

/// Drives `ResolutionCache::tick` at the configured interval until the cache is dropped. Each
/// pass runs on the blocking pool, since retried requests are transmitted from it.
pub async fn run_ticker(cache: Weak<ResolutionCache>) {
    let period = match cache.upgrade() {
        Some(cache) => cache.config.arp_tick_interval,
        None => return,
    };
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let cache = match cache.upgrade() {
            Some(cache) => cache,
            None => break,
        };
        if tokio::task::spawn_blocking(move || cache.tick()).await.is_err() {
            break;
        }
    }
}
