//! Tunables for the transport engine.

use std::time::Duration;

use crate::protocol::isn::IsnStrategy;
use crate::{Error, Result};

/// Initial Retransmission Timeout (`RTO`) in seconds.
pub const RTO: u64 = 1;

/// Maximum Segment Lifetime (`MSL`) in seconds.
///
/// Represents the maximum time a segment can exist within the network before
/// being discarded.
pub const MSL: u64 = 60;

/// The maximum retry limit for retransmissions before giving up on the
/// connection.
pub const MAX_RETRANSMIT_LIMIT: u32 = 5;

/// Our window size advertised to the peer.
pub const RCV_WND_SIZE: u16 = 4096;

/// Upper bound applied to the peer's advertised window.
pub const SND_WND_MAX: u32 = 8192;

/// Smallest allowed clamp for the peer's advertised window (IPv6 minimum MTU).
pub const SND_WND_MIN: u32 = 1280;

/// Largest shift count allowed for the window scale option (RFC 7323 2.3).
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Configuration shared by every connection of an engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retransmission timeout used before any backoff.
    pub initial_rto: Duration,
    /// Number of retransmissions attempted before the connection is aborted.
    pub max_retries: u32,
    /// Ceiling, and initial value, of the receive window we advertise.
    pub recv_window_max: u16,
    /// Ceiling applied to the peer's advertised window.
    pub send_window_max: u32,
    /// Capacity of each connection's pending-send buffer in bytes.
    pub send_buffer_size: usize,
    /// MSS we advertise, and the upper bound for segments we send.
    pub mss: u16,
    /// Window scale shift we offer in our `SYN`, if any.
    pub window_scale: Option<u8>,
    /// Multiply the RTO by a random factor in `[1.0, 1.5)`.
    pub rto_jitter: bool,
    /// Disable Nagle's algorithm on new connections.
    pub no_delay: bool,
    /// How initial sequence numbers are chosen.
    pub isn: IsnStrategy,
    /// Lifetime of out-of-order data awaiting the missing bytes. Zero
    /// disables out-of-order queueing.
    pub reassembly_timeout: Duration,
    /// Delay applied to acknowledgments while the receive window is short.
    pub ack_delay: Duration,
    /// Time allowed for the three-way handshake.
    pub handshake_timeout: Duration,
    /// Quiet time spent in `TIME_WAIT`.
    pub time_wait: Duration,
    /// Number of connection slots in the pool.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_secs(RTO),
            max_retries: MAX_RETRANSMIT_LIMIT,
            recv_window_max: RCV_WND_SIZE,
            send_window_max: SND_WND_MAX,
            send_buffer_size: 16 * 1024,
            mss: 1460,
            window_scale: None,
            rto_jitter: true,
            no_delay: false,
            isn: IsnStrategy::Keyed,
            reassembly_timeout: Duration::from_secs(2),
            ack_delay: Duration::from_millis(100),
            handshake_timeout: Duration::from_secs(10),
            time_wait: Duration::from_secs(2 * MSL),
            max_connections: 64,
        }
    }
}

impl Config {
    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.initial_rto.is_zero() {
            return Err(Error::InvalidInput("initial_rto must be non-zero"));
        }

        if self.recv_window_max == 0 {
            return Err(Error::InvalidInput("recv_window_max must be non-zero"));
        }

        if self.send_window_max < SND_WND_MIN {
            return Err(Error::InvalidInput("send_window_max must be at least 1280"));
        }

        if self.send_buffer_size == 0 {
            return Err(Error::InvalidInput("send_buffer_size must be non-zero"));
        }

        if self.mss == 0 {
            return Err(Error::InvalidInput("mss must be non-zero"));
        }

        if self.window_scale.is_some_and(|shift| shift > MAX_WINDOW_SCALE) {
            return Err(Error::InvalidInput("window_scale must not exceed 14"));
        }

        if self.max_connections == 0 {
            return Err(Error::InvalidInput("max_connections must be non-zero"));
        }

        Ok(())
    }

    /// Returns how long an actively closing connection waits for the peer to
    /// finish the close sequence.
    ///
    /// This covers every retransmission of the `FIN` with backoff, plus one
    /// more RTO for the final acknowledgment.
    pub fn fin_timeout(&self) -> Duration {
        let rto = self.initial_rto.as_millis() as u64;

        let mut total = 0u64;
        let mut step = rto;

        for _ in 0..self.max_retries {
            total += step;
            step += step >> 1;
        }

        total += rto;

        if self.rto_jitter {
            total += total >> 1;
        }

        Duration::from_millis(total)
    }
}

/// Returns the largest payload that fits a single segment for the given
/// link MTU, after IP and TCP headers.
pub fn supported_mss(mtu: u16, ipv6: bool) -> u16 {
    /// Minimum MTU every IPv6 link must support (RFC 8200 5).
    const IPV6_MIN_MTU: u16 = 1280;

    if ipv6 {
        mtu.max(IPV6_MIN_MTU) - 60
    } else {
        mtu.saturating_sub(40)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn config_default_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_window_scale_invalid() {
        let config = Config {
            window_scale: Some(15),
            ..Default::default()
        };

        assert_matches!(config.validate(), Err(Error::InvalidInput(_)));
    }

    #[test]
    fn config_send_window_too_small_invalid() {
        let config = Config {
            send_window_max: 512,
            ..Default::default()
        };

        assert_matches!(config.validate(), Err(Error::InvalidInput(_)));
    }

    #[test]
    fn fin_timeout_sums_backoff() {
        let config = Config {
            initial_rto: Duration::from_millis(200),
            max_retries: 3,
            rto_jitter: false,
            ..Default::default()
        };

        // 200 + 300 + 450 + 200
        assert_eq!(config.fin_timeout(), Duration::from_millis(1150));

        let jittered = Config {
            rto_jitter: true,
            ..config
        };

        assert_eq!(jittered.fin_timeout(), Duration::from_millis(1725));
    }

    #[test]
    fn supported_mss_per_family() {
        assert_eq!(supported_mss(1500, false), 1460);
        assert_eq!(supported_mss(1500, true), 1440);
        assert_eq!(supported_mss(576, true), 1220);
    }
}
