//! Per-connection timer deadlines.
//!
//! A connection only records *when* each of its timers expires. Scheduling
//! is left to the engine, which is told about every newly armed deadline and
//! later hands expiries back. An expiry whose deadline was cancelled or moved
//! in the meantime is recognized as stale and ignored.

use std::fmt;
use std::time::Instant;

/// The timers a connection can arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Retransmission of the head of the control-segment queue.
    Control,
    /// Retransmission of in-flight data.
    Retransmit,
    /// Zero-window probe.
    Persist,
    /// Delayed acknowledgment while the receive window is short.
    DelayedAck,
    /// Three-way handshake deadline.
    Handshake,
    /// Deadline for the peer to finish an active close.
    Fin,
    /// End of the `TIME_WAIT` quiet period.
    TimeWait,
    /// Expiry of out-of-order data.
    Reassembly,
}

impl TimerKind {
    /// Every timer kind.
    pub const ALL: [TimerKind; 8] = [
        TimerKind::Control,
        TimerKind::Retransmit,
        TimerKind::Persist,
        TimerKind::DelayedAck,
        TimerKind::Handshake,
        TimerKind::Fin,
        TimerKind::TimeWait,
        TimerKind::Reassembly,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::Control => "control",
            TimerKind::Retransmit => "retransmit",
            TimerKind::Persist => "persist",
            TimerKind::DelayedAck => "delayed-ack",
            TimerKind::Handshake => "handshake",
            TimerKind::Fin => "fin",
            TimerKind::TimeWait => "time-wait",
            TimerKind::Reassembly => "reassembly",
        };

        f.write_str(name)
    }
}

/// Deadlines of a connection's timers.
#[derive(Debug, Default)]
pub struct Timers {
    deadlines: [Option<Instant>; TimerKind::ALL.len()],
    /// Deadlines armed since the last [Timers::drain_armed].
    armed: Vec<(TimerKind, Instant)>,
}

impl Timers {
    /// Arms `kind` to expire at `deadline`, replacing any earlier arming.
    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.index()] = Some(deadline);
        self.armed.push((kind, deadline));
    }

    /// Arms `kind` only if it is not already pending.
    pub fn arm_if_idle(&mut self, kind: TimerKind, deadline: Instant) {
        if !self.is_armed(kind) {
            self.arm(kind, deadline);
        }
    }

    /// Cancels `kind`.
    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    /// Cancels every timer.
    pub fn cancel_all(&mut self) {
        self.deadlines = Default::default();
        self.armed.clear();
    }

    /// Returns `true` if `kind` is pending.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    /// Returns `true` if any timer is pending.
    pub fn any_armed(&self) -> bool {
        self.deadlines.iter().any(Option::is_some)
    }

    /// Returns the deadline of `kind`, if armed.
    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// Returns the earliest pending deadline and its timer.
    pub fn next_expiry(&self) -> Option<(TimerKind, Instant)> {
        TimerKind::ALL
            .iter()
            .filter_map(|&kind| self.deadline(kind).map(|deadline| (kind, deadline)))
            .min_by_key(|&(_, deadline)| deadline)
    }

    /// Disarms and returns `true` if `kind` is pending and due at `now`.
    pub fn take_expired(&mut self, kind: TimerKind, now: Instant) -> bool {
        match self.deadlines[kind.index()] {
            Some(deadline) if deadline <= now => {
                self.deadlines[kind.index()] = None;
                true
            }
            _ => false,
        }
    }

    /// Returns the deadlines armed since the last call.
    pub fn drain_armed(&mut self) -> Vec<(TimerKind, Instant)> {
        std::mem::take(&mut self.armed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timers_arm_cancel_expire() {
        let t0 = Instant::now();
        let mut timers = Timers::default();

        timers.arm(TimerKind::Retransmit, t0 + Duration::from_millis(200));
        timers.arm(TimerKind::DelayedAck, t0 + Duration::from_millis(100));

        assert_eq!(
            timers.next_expiry(),
            Some((TimerKind::DelayedAck, t0 + Duration::from_millis(100)))
        );

        assert!(!timers.take_expired(TimerKind::Retransmit, t0));
        assert!(timers.take_expired(TimerKind::Retransmit, t0 + Duration::from_millis(200)));
        assert!(!timers.is_armed(TimerKind::Retransmit));

        timers.cancel(TimerKind::DelayedAck);
        assert!(!timers.any_armed());
        assert_eq!(timers.drain_armed().len(), 2);
        assert!(timers.drain_armed().is_empty());
    }

    #[test]
    fn timers_arm_if_idle_keeps_deadline() {
        let t0 = Instant::now();
        let mut timers = Timers::default();

        timers.arm_if_idle(TimerKind::DelayedAck, t0 + Duration::from_millis(100));
        timers.arm_if_idle(TimerKind::DelayedAck, t0 + Duration::from_millis(300));

        assert_eq!(
            timers.deadline(TimerKind::DelayedAck),
            Some(t0 + Duration::from_millis(100))
        );
    }

    #[test]
    fn timers_rearm_makes_old_expiry_stale() {
        let t0 = Instant::now();
        let mut timers = Timers::default();

        timers.arm(TimerKind::Persist, t0 + Duration::from_millis(100));
        timers.arm(TimerKind::Persist, t0 + Duration::from_millis(500));

        // The first scheduled expiry arrives but the deadline moved.
        assert!(!timers.take_expired(TimerKind::Persist, t0 + Duration::from_millis(100)));
        assert!(timers.is_armed(TimerKind::Persist));
    }
}
