use super::dispatch;
use crate::config::StackConfig;
use crate::error::{Error, Result};
use crate::protocol::ProtocolRegistry;
use crate::stats::Stats;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use ustack_packets::{Ipv4Header, IPV4_HEADER_LEN, IPV4_MAX_PACKET_LEN};

/// Identifies the datagram a fragment belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub identification: u16,
    pub protocol: u8,
}

impl FragmentKey {
    pub fn of(header: &Ipv4Header) -> Self {
        FragmentKey {
            source: header.source,
            destination: header.destination,
            identification: header.identification,
            protocol: header.protocol,
        }
    }
}

struct Piece {
    offset: usize,
    payload: Vec<u8>,
    is_last: bool,
}

impl Piece {
    fn end(&self) -> usize {
        self.offset + self.payload.len()
    }
}

struct PartialDatagram {
    /// Ordered by offset, never overlapping
    pieces: Vec<Piece>,
    /// Header of the offset 0 fragment, once seen
    first: Option<Ipv4Header>,
    last_touched: Instant,
}

impl PartialDatagram {
    fn accepts(&self, piece: &Piece) -> bool {
        let overlaps = self
            .pieces
            .iter()
            .any(|p| piece.offset < p.end() && p.offset < piece.end());
        let known_end = self.pieces.iter().find(|p| p.is_last).map(Piece::end);
        let within_end = match known_end {
            Some(end) => !piece.is_last && piece.end() <= end,
            None => !piece.is_last || self.pieces.iter().all(|p| p.end() <= piece.end()),
        };
        !overlaps && within_end
    }

    fn is_complete(&self) -> bool {
        let mut next = 0;
        for piece in &self.pieces {
            if piece.offset != next {
                return false;
            }
            next = piece.end();
        }
        self.pieces.last().map_or(false, |p| p.is_last)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Stored; more fragments are needed
    Pending,
    /// The datagram is whole: synthesized header and payload
    Complete(Ipv4Header, Vec<u8>),
    /// The fragment contradicts what was received before; the datagram was abandoned
    Collision,
    /// The fragment would make the datagram larger than an IPv4 packet can be
    Oversized,
}

/// Partially received datagrams, keyed by `FragmentKey`. Fragments may arrive in any order and
/// leave gaps that later fragments fill.
#[derive(Default)]
pub struct FragmentMap {
    datagrams: HashMap<FragmentKey, PartialDatagram>,
}

impl FragmentMap {
    pub fn new() -> Self {
        FragmentMap::default()
    }

    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    /// Adds one fragment. `header` is the fragment's own header and `payload` the bytes it
    /// carries.
    pub fn insert(&mut self, header: &Ipv4Header, payload: Vec<u8>, now: Instant) -> Outcome {
        let key = FragmentKey::of(header);
        let piece = Piece {
            offset: header.fragment_byte_offset(),
            payload,
            is_last: !header.more_fragments,
        };
        if IPV4_HEADER_LEN + piece.end() > IPV4_MAX_PACKET_LEN {
            self.datagrams.remove(&key);
            return Outcome::Oversized;
        }

        let datagram = self.datagrams.entry(key).or_insert_with(|| PartialDatagram {
            pieces: Vec::new(),
            first: None,
            last_touched: now,
        });
        if !datagram.accepts(&piece) {
            self.datagrams.remove(&key);
            return Outcome::Collision;
        }

        if piece.offset == 0 {
            datagram.first = Some(header.clone());
        }
        let at = datagram
            .pieces
            .iter()
            .position(|p| p.offset > piece.offset)
            .unwrap_or_else(|| datagram.pieces.len());
        datagram.pieces.insert(at, piece);
        datagram.last_touched = now;

        if !datagram.is_complete() {
            return Outcome::Pending;
        }
        match self.datagrams.remove(&key) {
            Some(datagram) => assemble(key, datagram),
            None => Outcome::Pending,
        }
    }

    /// Forgets datagrams that have not seen a fragment for `timeout`. Returns how many.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.datagrams.len();
        self.datagrams
            .retain(|_, d| now.saturating_duration_since(d.last_touched) < timeout);
        before - self.datagrams.len()
    }
}

fn assemble(key: FragmentKey, datagram: PartialDatagram) -> Outcome {
    let size = datagram.pieces.iter().map(|p| p.payload.len()).sum();
    let mut payload = Vec::with_capacity(size);
    for piece in datagram.pieces {
        payload.extend_from_slice(&piece.payload);
    }

    let mut header = Ipv4Header::new(key.protocol, key.source, key.destination);
    header.identification = key.identification;
    if let Some(first) = datagram.first {
        header.tos = first.tos;
        header.ttl = first.ttl;
        // Options were validated when the fragment was parsed.
        let _ = header.set_options(first.options());
    }
    if header.header_len() + payload.len() > IPV4_MAX_PACKET_LEN {
        return Outcome::Oversized;
    }
    header.total_length = (header.header_len() + payload.len()) as u16;
    let bytes = header.to_bytes();
    header.checksum = u16::from_be_bytes([bytes[10], bytes[11]]);
    Outcome::Complete(header, payload)
}

/// Messages handled by the reassembly actor.
#[derive(Debug)]
pub enum ReassemblyEvent {
    Fragment { header: Ipv4Header, payload: Vec<u8> },
    Sweep,
}

/// Submission side of the reassembly actor.
#[derive(Clone)]
pub struct ReassemblyHandle {
    tx: mpsc::Sender<ReassemblyEvent>,
    stats: Arc<Stats>,
}

impl ReassemblyHandle {
    /// Queues a fragment without waiting. A full queue drops it.
    pub fn submit(&self, header: Ipv4Header, payload: Vec<u8>) {
        use mpsc::error::TrySendError;
        match self.tx.try_send(ReassemblyEvent::Fragment { header, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                Stats::bump(&self.stats.reassembly_queue_overflow);
                debug!("reassembly queue full, dropping fragment");
            }
            Err(TrySendError::Closed(_)) => {
                Stats::bump(&self.stats.reassembly_closed);
                debug!("reassembly worker gone, dropping fragment");
            }
        }
    }

    /// Asks the actor for a sweep, waiting for queue space. Fails once the actor is gone.
    pub async fn sweep(&self) -> Result<()> {
        self.tx
            .send(ReassemblyEvent::Sweep)
            .await
            .map_err(|_| Error::Shutdown)
    }
}

/// The single task that owns the `FragmentMap`. Completed datagrams are dispatched from here, so
/// each one is delivered exactly once.
pub struct ReassemblyWorker {
    rx: mpsc::Receiver<ReassemblyEvent>,
    map: FragmentMap,
    registry: Arc<ProtocolRegistry>,
    stats: Arc<Stats>,
    timeout: Duration,
}

impl ReassemblyWorker {
    pub fn new(
        config: &StackConfig,
        registry: Arc<ProtocolRegistry>,
        stats: Arc<Stats>,
    ) -> (ReassemblyHandle, ReassemblyWorker) {
        let (tx, rx) = mpsc::channel(config.reassembly_queue_capacity);
        let handle = ReassemblyHandle {
            tx,
            stats: stats.clone(),
        };
        let worker = ReassemblyWorker {
            rx,
            map: FragmentMap::new(),
            registry,
            stats,
            timeout: config.reassembly_timeout,
        };
        (handle, worker)
    }

    /// Processes events until every handle is dropped. Handlers of completed datagrams run on
    /// the blocking pool, one at a time, since they may transmit.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if let Some((header, payload)) = self.handle(event, Instant::now()) {
                let registry = self.registry.clone();
                let stats = self.stats.clone();
                let delivery = tokio::task::spawn_blocking(move || {
                    dispatch(&registry, &stats, &header, &payload)
                });
                if let Err(e) = delivery.await {
                    warn!("delivery of reassembled datagram failed: {}", e);
                }
            }
        }
        trace!("reassembly worker stopping");
    }

    // Applies one event, returning a datagram that is ready for delivery.
    fn handle(&mut self, event: ReassemblyEvent, now: Instant) -> Option<(Ipv4Header, Vec<u8>)> {
        match event {
            ReassemblyEvent::Fragment { header, payload } => {
                match self.map.insert(&header, payload, now) {
                    Outcome::Pending => None,
                    Outcome::Complete(header, payload) => {
                        Stats::bump(&self.stats.reassembled);
                        trace!(
                            "reassembled {} bytes from {} id {}",
                            payload.len(),
                            header.source,
                            header.identification
                        );
                        Some((header, payload))
                    }
                    Outcome::Collision => {
                        Stats::bump(&self.stats.fragment_collisions);
                        warn!(
                            "overlapping fragment from {} id {}, abandoning datagram",
                            header.source, header.identification
                        );
                        None
                    }
                    Outcome::Oversized => {
                        Stats::bump(&self.stats.malformed);
                        debug!(
                            "fragment from {} id {} exceeds maximum datagram size",
                            header.source, header.identification
                        );
                        None
                    }
                }
            }
            ReassemblyEvent::Sweep => {
                let expired = self.map.sweep(now, self.timeout);
                if expired > 0 {
                    Stats::add(&self.stats.reassembly_expired, expired as u64);
                    debug!("expired {} incomplete datagrams", expired);
                }
                None
            }
        }
    }
}

/// Sends a sweep request every `period` until the actor stops.
pub async fn run_sweeper(handle: ReassemblyHandle, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if handle.sweep().await.is_err() {
            break;
        }
    }
}
