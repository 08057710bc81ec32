//! Engine-wide timer queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::ConnectionId;
use crate::protocol::TimerKind;

/// Min-heap of `(deadline, connection, timer)` entries.
///
/// Entries are never removed when a connection cancels or re-arms a timer;
/// the connection discards expiries that no longer match its own deadlines.
#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<(Instant, ConnectionId, TimerKind)>>,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues an expiry. Returns `true` if it is now the earliest one.
    pub(crate) fn schedule(&mut self, id: ConnectionId, kind: TimerKind, deadline: Instant) -> bool {
        let earliest = self.next_deadline().is_none_or(|next| deadline < next);

        self.heap.push(Reverse((deadline, id, kind)));

        earliest
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((deadline, ..))| *deadline)
    }

    /// Removes and returns every expiry due at `now`, earliest first.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<(ConnectionId, TimerKind)> {
        let mut expired = Vec::new();

        while let Some(Reverse((deadline, ..))) = self.heap.peek() {
            if *deadline > now {
                break;
            }

            if let Some(Reverse((_, id, kind))) = self.heap.pop() {
                expired.push((id, kind));
            }
        }

        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::pool::Pool;

    #[test]
    fn wheel_pops_in_deadline_order() {
        let pool = Pool::with_capacity(2);
        let (a, _) = pool.insert(()).unwrap();
        let (b, _) = pool.insert(()).unwrap();

        let t0 = Instant::now();
        let mut wheel = TimerWheel::new();

        assert!(wheel.schedule(a, TimerKind::Retransmit, t0 + Duration::from_millis(300)));
        assert!(wheel.schedule(b, TimerKind::DelayedAck, t0 + Duration::from_millis(100)));
        assert!(!wheel.schedule(a, TimerKind::Persist, t0 + Duration::from_millis(200)));

        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_millis(100)));
        assert!(wheel.pop_expired(t0).is_empty());

        assert_eq!(
            wheel.pop_expired(t0 + Duration::from_millis(250)),
            vec![(b, TimerKind::DelayedAck), (a, TimerKind::Persist)]
        );
        assert_eq!(wheel.len(), 1);
    }
}
