//! In-memory network joining engines in one process.
//!
//! [Link] stands in for the network layer: it queues every segment the
//! engines transmit and hands them to the engine owning the destination
//! address when pumped. It can shuffle and duplicate segments to exercise
//! reassembly and retransmission. [Collector] records what connections
//! deliver.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;

use log::{debug, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::{Consumer, ConnectionId, Engine, Output};
use crate::protocol::{CloseReason, Socket, TcpSegment};

#[derive(Debug)]
struct Faults {
    rng: StdRng,
    reorder: f64,
    duplicate: f64,
}

#[derive(Debug, Default)]
struct Wire {
    queue: VecDeque<(Socket, Vec<u8>)>,
    faults: Option<Faults>,
}

/// Lossless segment queue shared by every attached engine.
#[derive(Debug, Default)]
pub struct Link {
    wire: Mutex<Wire>,
}

impl Link {
    /// Creates a link that delivers segments in order, exactly once.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a link that delivers a segment out of order with probability
    /// `reorder` and twice with probability `duplicate`. Runs with the same
    /// `seed` see the same faults.
    pub fn with_faults(seed: u64, reorder: f64, duplicate: f64) -> Self {
        Self {
            wire: Mutex::new(Wire {
                queue: VecDeque::new(),
                faults: Some(Faults {
                    rng: StdRng::seed_from_u64(seed),
                    reorder: reorder.clamp(0.0, 1.0),
                    duplicate: duplicate.clamp(0.0, 1.0),
                }),
            }),
        }
    }

    /// Returns the number of segments in flight.
    pub fn len(&self) -> usize {
        self.wire.lock().queue.len()
    }

    /// Returns `true` if no segment is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the next segment off the link without delivering it.
    ///
    /// Segments that no longer parse are skipped.
    pub fn pop(&self) -> Option<(Socket, TcpSegment)> {
        loop {
            let (socket, raw) = self.next()?;

            match TcpSegment::parse(&raw) {
                Ok(seg) => return Some((socket, seg)),
                Err(err) => warn!("[{socket}] dropping unparsable segment: {err}"),
            }
        }
    }

    /// Delivers queued segments to the engine whose address matches their
    /// destination until the link is empty, including segments transmitted
    /// in response. Returns the number of segments delivered.
    pub fn pump(&self, hosts: &[(IpAddr, &Engine)]) -> usize {
        let mut delivered = 0;

        // The wire lock is not held across `accept_input`, which transmits
        // back into this link.
        while let Some((socket, raw)) = self.next() {
            let Some((_, engine)) = hosts.iter().find(|(addr, _)| *addr == socket.dst.addr) else {
                debug!("[{socket}] no host at destination, dropping segment");
                continue;
            };

            if let Err(err) = engine.accept_input(socket.src.addr, socket.dst.addr, &raw) {
                warn!("[{socket}] segment rejected: {err}");
            }

            delivered += 1;
        }

        delivered
    }

    fn next(&self) -> Option<(Socket, Vec<u8>)> {
        let mut wire = self.wire.lock();
        let Wire { queue, faults } = &mut *wire;

        let index = match faults {
            Some(faults) if queue.len() > 1 => {
                if faults.rng.gen_bool(faults.reorder) {
                    faults.rng.gen_range(1..queue.len())
                } else {
                    0
                }
            }
            _ => 0,
        };

        queue.remove(index)
    }
}

impl Output for Link {
    fn send_segment(&self, socket: &Socket, segment: &TcpSegment) -> io::Result<()> {
        let raw = segment.to_be_bytes()?;

        let mut wire = self.wire.lock();
        let Wire { queue, faults } = &mut *wire;

        if let Some(faults) = faults {
            if faults.rng.gen_bool(faults.duplicate) {
                queue.push_back((*socket, raw.clone()));
            }
        }

        queue.push_back((*socket, raw));

        Ok(())
    }
}

/// Records delivered payload and close notices per connection.
#[derive(Debug, Default)]
pub struct Collector {
    received: Mutex<HashMap<ConnectionId, Vec<u8>>>,
    closed: Mutex<HashMap<ConnectionId, CloseReason>>,
}

impl Collector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything received on `id` so far.
    pub fn take(&self, id: ConnectionId) -> Vec<u8> {
        self.received.lock().remove(&id).unwrap_or_default()
    }

    /// Returns a copy of everything received on `id` so far.
    pub fn peek(&self, id: ConnectionId) -> Vec<u8> {
        self.received.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Returns the number of bytes received on `id` and not yet taken.
    pub fn len(&self, id: ConnectionId) -> usize {
        self.received.lock().get(&id).map_or(0, Vec::len)
    }

    /// Returns why `id` closed, if it has.
    pub fn closed_reason(&self, id: ConnectionId) -> Option<CloseReason> {
        self.closed.lock().get(&id).copied()
    }
}

impl Consumer for Collector {
    fn deliver(&self, id: ConnectionId, data: Vec<u8>) {
        self.received.lock().entry(id).or_default().extend(data);
    }

    fn closed(&self, id: ConnectionId, reason: CloseReason) {
        self.closed.lock().insert(id, reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Config;
    use crate::protocol::SeqNumber;
    use crate::protocol::headers::{Flags, TcpHeader};

    fn socket(port: u16) -> Socket {
        Socket::new(([10, 0, 0, 1], port).into(), ([10, 0, 0, 2], 80).into()).unwrap()
    }

    fn syn(port: u16) -> TcpSegment {
        TcpSegment::new(
            TcpHeader::new(port, 80, SeqNumber::new(u32::from(port)), Flags::SYN, 1024),
            &[],
        )
    }

    #[test]
    fn link_preserves_order_without_faults() {
        let link = Link::new();

        for port in 1..=3 {
            link.send_segment(&socket(port), &syn(port)).unwrap();
        }

        assert_eq!(link.len(), 3);

        for port in 1..=3 {
            let (sock, seg) = link.pop().unwrap();
            assert_eq!(sock, socket(port));
            assert_eq!(seg.seq(), SeqNumber::new(u32::from(port)));
            assert_eq!(seg.flags(), Flags::SYN);
        }

        assert!(link.is_empty());
        assert!(link.pop().is_none());
    }

    #[test]
    fn link_faults_duplicate_and_reorder() {
        let link = Link::with_faults(3, 1.0, 1.0);

        for port in 1..=4 {
            link.send_segment(&socket(port), &syn(port)).unwrap();
        }

        assert_eq!(link.len(), 8);

        let mut ports: Vec<u16> = std::iter::from_fn(|| link.pop())
            .map(|(_, seg)| seg.tcp.src_port())
            .collect();

        ports.sort_unstable();
        assert_eq!(ports, vec![1, 1, 2, 2, 3, 3, 4, 4]);
    }

    #[test]
    fn pump_drops_segments_without_a_host() {
        let link = Link::new();
        link.send_segment(&socket(1), &syn(1)).unwrap();

        assert_eq!(link.pump(&[]), 0);
        assert!(link.is_empty());
    }

    #[test]
    fn collector_accumulates_per_connection() {
        let link = Arc::new(Link::new());
        let collector = Arc::new(Collector::new());
        let engine = Engine::with_manual_timers(Config::default(), link, collector.clone()).unwrap();

        let id = engine
            .open(([10, 0, 0, 1], 1).into(), ([10, 0, 0, 2], 80).into())
            .unwrap();

        collector.deliver(id, b"hello ".to_vec());
        collector.deliver(id, b"world".to_vec());

        assert_eq!(collector.len(id), 11);
        assert_eq!(collector.peek(id), b"hello world");
        assert_eq!(collector.take(id), b"hello world");
        assert_eq!(collector.len(id), 0);

        collector.closed(id, CloseReason::Reset);
        assert_eq!(collector.closed_reason(id), Some(CloseReason::Reset));
    }
}
