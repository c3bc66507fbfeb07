use crate::error::{Error, Result};
use crate::ipv4::Ipv4Engine;
use crate::protocol::Protocol;
use futures::channel::oneshot;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use ustack_packets::{IcmpMessage, IpProtocol, Ipv4Header, ICMP_TYPE_ECHO, ICMP_TYPE_ECHO_REPLY};

/// Bytes of filler carried by each echo request `ping` sends.
pub const PING_PAYLOAD_LEN: usize = 56;

struct Outstanding {
    destination: Ipv4Addr,
    done: oneshot::Sender<()>,
}

/// Answers echo requests addressed to one of our unicast addresses, and matches echo replies to
/// the requests `ping` has in flight.
pub struct EchoResponder {
    engine: Weak<Ipv4Engine>,
    identifier: u16,
    outstanding: Mutex<HashMap<u16, Outstanding>>,
}

impl EchoResponder {
    pub fn new(engine: Weak<Ipv4Engine>) -> Self {
        EchoResponder {
            engine,
            identifier: rand::random(),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Sends one echo request and waits up to `timeout` for its reply, returning the round trip
    /// time. An expired wait is `Error::Timeout`.
    pub async fn ping(
        &self,
        destination: Ipv4Addr,
        sequence: u16,
        timeout: Duration,
    ) -> Result<Duration> {
        let engine = self.engine.upgrade().ok_or(Error::Shutdown)?;
        let (done, rx) = oneshot::channel();
        self.outstanding
            .lock()
            .unwrap()
            .insert(sequence, Outstanding { destination, done });

        let request = IcmpMessage::echo(
            ICMP_TYPE_ECHO,
            self.identifier,
            sequence,
            &[0x5a; PING_PAYLOAD_LEN],
        );
        let header = engine.header(IpProtocol::ICMP.into(), destination);
        let started = Instant::now();
        let sent = tokio::task::spawn_blocking(move || engine.send(header, &request.to_bytes()))
            .await
            .unwrap_or(Err(Error::Shutdown));

        let result = match sent {
            Ok(()) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(oneshot::Canceled)) => Err(Error::Shutdown),
                Err(_) => Err(Error::Timeout(destination)),
            },
            Err(e) => Err(e),
        };
        self.outstanding.lock().unwrap().remove(&sequence);
        result
    }

    fn complete(&self, header: &Ipv4Header, reply: &IcmpMessage) {
        let (identifier, sequence) = match reply.echo_id_and_sequence() {
            Some(fields) => fields,
            None => return,
        };
        if identifier != self.identifier {
            trace!("echo reply from {} is not ours", header.source);
            return;
        }
        let mut outstanding = self.outstanding.lock().unwrap();
        match outstanding.get(&sequence) {
            Some(request) if request.destination == header.source => {
                if let Some(request) = outstanding.remove(&sequence) {
                    let _ = request.done.send(());
                }
            }
            _ => trace!("unexpected echo reply {} from {}", sequence, header.source),
        }
    }

    fn answer(&self, header: &Ipv4Header, request: &IcmpMessage) {
        if header.destination.is_broadcast() || header.destination.is_multicast() {
            trace!("not answering echo to {}", header.destination);
            return;
        }
        let engine = match self.engine.upgrade() {
            Some(engine) => engine,
            None => return,
        };
        let reply = IcmpMessage::new(ICMP_TYPE_ECHO_REPLY, 0, &request.data);
        let reply_header = engine.header(IpProtocol::ICMP.into(), header.source);
        if let Err(e) = engine.send(reply_header, &reply.to_bytes()) {
            debug!("echo reply to {} failed: {}", header.source, e);
        }
    }
}

impl Protocol for EchoResponder {
    fn receive(&self, header: &Ipv4Header, payload: &[u8]) {
        if !IcmpMessage::checksum_valid(payload) {
            debug!("dropping ICMP message from {}: bad checksum", header.source);
            return;
        }
        match IcmpMessage::parse(payload) {
            Ok(message) if message.icmp_type == ICMP_TYPE_ECHO => self.answer(header, &message),
            Ok(message) if message.icmp_type == ICMP_TYPE_ECHO_REPLY => {
                self.complete(header, &message)
            }
            Ok(message) => {
                trace!("ignoring ICMP type {} from {}", message.icmp_type, header.source);
            }
            Err(e) => debug!("dropping ICMP message from {}: {}", header.source, e),
        }
    }
}
