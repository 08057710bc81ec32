//! Retransmission bookkeeping: the RTO estimate, the control-segment retry
//! queue, and the data transmission mode.

use std::collections::VecDeque;
use std::time::Duration;

use super::headers::Flags;
use super::{SeqNumber, TcpSegment};

/// How queued data is being transmitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    /// New data is sent as the window and Nagle's algorithm allow.
    #[default]
    Send,
    /// The retransmission timer fired. One segment is resent from `SND.UNA`
    /// per timeout and no new data goes out until an acknowledgment arrives.
    Resend,
}

/// Retransmission timeout estimate.
///
/// No round-trip sampling is done: the estimate is the configured initial
/// RTO, optionally stretched by a random factor in `[1.0, 1.5)` so that many
/// connections do not retransmit in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct Rto {
    base: Duration,
    jitter: bool,
    current: Duration,
}

impl Rto {
    /// Creates an estimate and derives its first value.
    pub fn new(base: Duration, jitter: bool) -> Self {
        let mut rto = Self {
            base,
            jitter,
            current: base,
        };

        rto.derive();
        rto
    }

    /// Recomputes the estimate from the configured initial RTO.
    pub fn derive(&mut self) {
        self.current = if self.jitter {
            jittered(self.base, rand::random::<u8>())
        } else {
            self.base
        };
    }

    /// Returns the current estimate.
    pub fn get(&self) -> Duration {
        self.current
    }

    /// Returns the timeout to use after `retries` retransmissions: the
    /// estimate grown by half for every retry, while retries remain.
    pub fn backoff(&self, retries: u32, max_retries: u32) -> Duration {
        let mut exp = self.current;

        if retries < max_retries {
            for _ in 0..retries {
                exp += exp / 2;
            }
        }

        exp
    }
}

/// Scales `base` by `(512 + gain) / 512`.
fn jittered(base: Duration, gain: u8) -> Duration {
    let gain = 512 + u32::from(gain);
    base * gain / 512
}

/// State of the control-segment retry timer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ControlRetry {
    /// No control segment awaits acknowledgment.
    #[default]
    Idle,
    /// The queue head is being retransmitted.
    Retrying {
        /// Retransmissions left before the connection is aborted.
        retries_left: u32,
    },
}

/// Outcome of a control retry timer expiry.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlExpiry {
    /// Nothing is waiting for acknowledgment.
    Idle,
    /// Retransmit this segment and re-arm the timer.
    Resend(TcpSegment),
    /// Retries are exhausted.
    Exhausted,
}

/// FIFO of `SYN` and `FIN` bearing segments awaiting acknowledgment.
///
/// Only the head is timed; once it is acknowledged the next segment gets a
/// fresh retry budget.
#[derive(Debug, Default)]
pub struct ControlQueue {
    queue: VecDeque<TcpSegment>,
    retry: ControlRetry,
}

impl ControlQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a segment with these flags must be kept for
    /// retransmission. Pure acknowledgments, data pushes, and resets are
    /// sent once; data is retransmitted from the send buffer instead.
    pub fn tracks(flags: Flags) -> bool {
        flags.intersects(Flags::SYN | Flags::FIN)
    }

    /// Queues a transmitted control segment. Returns `true` if the retry
    /// timer must be armed because the queue was idle.
    pub fn push(&mut self, segment: TcpSegment, max_retries: u32) -> bool {
        self.queue.push_back(segment);

        if self.retry == ControlRetry::Idle {
            self.retry = ControlRetry::Retrying {
                retries_left: max_retries,
            };
            return true;
        }

        false
    }

    /// Returns the segment currently being timed.
    pub fn head(&self) -> Option<&TcpSegment> {
        self.queue.front()
    }

    /// Returns `true` if nothing awaits acknowledgment.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns `true` if a queued segment carries `FIN`.
    pub fn has_fin(&self) -> bool {
        self.queue.iter().any(|seg| seg.tcp.fin())
    }

    /// Returns the retry state.
    pub fn retry(&self) -> ControlRetry {
        self.retry
    }

    /// Handles expiry of the retry timer.
    pub fn on_expiry(&mut self) -> ControlExpiry {
        match self.retry {
            ControlRetry::Idle => ControlExpiry::Idle,
            ControlRetry::Retrying { retries_left: 0 } => ControlExpiry::Exhausted,
            ControlRetry::Retrying { retries_left } => match self.queue.front() {
                Some(head) => {
                    self.retry = ControlRetry::Retrying {
                        retries_left: retries_left - 1,
                    };
                    ControlExpiry::Resend(head.clone())
                }
                None => {
                    self.retry = ControlRetry::Idle;
                    ControlExpiry::Idle
                }
            },
        }
    }

    /// Drops every queued segment fully covered by `ack`. Returns `true` if
    /// the head changed and another segment still needs timing, so the timer
    /// must be re-armed.
    pub fn acknowledge(&mut self, ack: SeqNumber, max_retries: u32) -> bool {
        let mut popped = false;

        while let Some(head) = self.queue.front() {
            let end = head.seq() + head.seq_len();

            if end.gt(ack) {
                break;
            }

            self.queue.pop_front();
            popped = true;
        }

        if !popped {
            return false;
        }

        if self.queue.is_empty() {
            self.retry = ControlRetry::Idle;
            false
        } else {
            self.retry = ControlRetry::Retrying {
                retries_left: max_retries,
            };
            true
        }
    }

    /// Forgets every queued segment.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.retry = ControlRetry::Idle;
    }
}
