//! Initial sequence number generation.
//!
//! The keyed strategy follows RFC 6528:
//!
//! ```text
//!     ISN = M + F(localip, localport, remoteip, remoteport, secretkey)
//! ```
//!
//! where `M` is a timer ticking every 64 nanoseconds since the generator was
//! created and `F` is SipHash-2-4 keyed with a 128-bit per-process secret.

use std::net::IpAddr;
use std::time::Instant;

use super::{SeqNumber, Socket};

/// How initial sequence numbers are chosen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IsnStrategy {
    /// Uniformly random for every connection.
    Random,
    /// Keyed hash of the four-tuple plus a monotonic time component.
    #[default]
    Keyed,
}

/// Produces initial sequence numbers for new connections.
#[derive(Debug)]
pub struct IsnGenerator {
    strategy: IsnStrategy,
    keys: (u64, u64),
    epoch: Instant,
}

impl IsnGenerator {
    /// Creates a generator with a freshly drawn random secret.
    pub fn new(strategy: IsnStrategy) -> Self {
        Self::with_secret(strategy, rand::random())
    }

    /// Creates a generator using the provided secret.
    pub fn with_secret(strategy: IsnStrategy, secret: [u8; 16]) -> Self {
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&secret[..8]);
        k1.copy_from_slice(&secret[8..]);

        Self {
            strategy,
            keys: (u64::from_le_bytes(k0), u64::from_le_bytes(k1)),
            epoch: Instant::now(),
        }
    }

    /// Returns the strategy in use.
    pub fn strategy(&self) -> IsnStrategy {
        self.strategy
    }

    /// Returns an initial sequence number for the connection.
    pub fn generate(&self, sock: &Socket, now: Instant) -> SeqNumber {
        match self.strategy {
            IsnStrategy::Random => SeqNumber::new(rand::random()),
            IsnStrategy::Keyed => {
                let ticks = now.saturating_duration_since(self.epoch).as_nanos() >> 6;
                SeqNumber::new(self.keyed_hash(sock)) + ticks as u32
            }
        }
    }

    fn keyed_hash(&self, sock: &Socket) -> u32 {
        let mut msg = Vec::with_capacity(36);

        for addr in [sock.src.addr, sock.dst.addr] {
            match addr {
                IpAddr::V4(addr) => msg.extend_from_slice(&addr.octets()),
                IpAddr::V6(addr) => msg.extend_from_slice(&addr.octets()),
            }
        }

        msg.extend_from_slice(&sock.src.port.to_be_bytes());
        msg.extend_from_slice(&sock.dst.port.to_be_bytes());

        let digest = siphash24(self.keys, &msg);

        // Fold the 64-bit digest so every output bit is used.
        (digest ^ (digest >> 32)) as u32
    }
}

/// SipHash-2-4 over an arbitrary message.
///
/// > SipHash: a fast short-input PRF, Jean-Philippe Aumasson and Daniel J.
/// > Bernstein
fn siphash24((k0, k1): (u64, u64), msg: &[u8]) -> u64 {
    let mut state = State::init(k0, k1);

    let mut chunks = msg.chunks_exact(8);

    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        state.absorb(u64::from_le_bytes(word));
    }

    // Final block holds the tail bytes and the message length in the top byte.
    let mut tail = [0u8; 8];
    let rest = chunks.remainder();
    tail[..rest.len()].copy_from_slice(rest);
    tail[7] = msg.len() as u8;

    state.absorb(u64::from_le_bytes(tail));
    state.finalize()
}

// Yes, that's the initial values.
const IV: [&[u8; 8]; 4] = [b"somepseu", b"dorandom", b"lygenera", b"tedbytes"];

struct State {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

impl State {
    const SIP_C: usize = 2;
    const SIP_D: usize = 4;

    fn init(k0: u64, k1: u64) -> Self {
        State {
            v0: u64::from_be_bytes(*IV[0]) ^ k0,
            v1: u64::from_be_bytes(*IV[1]) ^ k1,
            v2: u64::from_be_bytes(*IV[2]) ^ k0,
            v3: u64::from_be_bytes(*IV[3]) ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(13);
        self.v1 ^= self.v0;
        self.v0 = self.v0.rotate_left(32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = self.v3.rotate_left(21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = self.v1.rotate_left(17);
        self.v1 ^= self.v2;
        self.v2 = self.v2.rotate_left(32);
    }

    /// Process a single portion of the message.
    fn absorb(&mut self, m: u64) {
        self.v3 ^= m;
        (0..Self::SIP_C).for_each(|_| self.round());
        self.v0 ^= m;
    }

    fn finalize(mut self) -> u64 {
        self.v2 ^= 0xff;
        (0..Self::SIP_D).for_each(|_| self.round());
        self.v0 ^ self.v1 ^ self.v2 ^ self.v3
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::SocketAddr;

    fn sock(local_port: u16) -> Socket {
        Socket::new(
            SocketAddr::from(([10, 0, 0, 1], local_port)),
            SocketAddr::from(([10, 0, 0, 2], 80)),
        )
        .unwrap()
    }

    /// See the paper, Appendix A: key `00..0f`, message `00..0e`.
    #[test]
    fn siphash_reference_vector() {
        let mut secret = [0u8; 16];
        secret.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);

        let generator = IsnGenerator::with_secret(IsnStrategy::Keyed, secret);
        let msg: Vec<u8> = (0u8..15).collect();

        assert_eq!(siphash24(generator.keys, &msg), 0xa129ca6149be45e5);
    }

    #[test]
    fn keyed_isn_depends_on_tuple_and_secret() {
        let a = IsnGenerator::with_secret(IsnStrategy::Keyed, [7; 16]);
        let b = IsnGenerator::with_secret(IsnStrategy::Keyed, [8; 16]);
        let now = a.epoch;

        assert_ne!(a.keyed_hash(&sock(4000)), a.keyed_hash(&sock(4001)));
        assert_ne!(a.keyed_hash(&sock(4000)), b.keyed_hash(&sock(4000)));
        assert_eq!(a.generate(&sock(4000), now), SeqNumber::new(a.keyed_hash(&sock(4000))));
    }

    #[test]
    fn keyed_isn_advances_with_time() {
        let generator = IsnGenerator::with_secret(IsnStrategy::Keyed, [1; 16]);
        let t0 = generator.epoch;

        let first = generator.generate(&sock(4000), t0);
        let later = generator.generate(&sock(4000), t0 + Duration::from_micros(64));

        // 64 us is 1000 ticks of 64 ns.
        assert_eq!(later.distance(first), 1000);
    }

    #[test]
    fn random_isn_strategy() {
        let generator = IsnGenerator::new(IsnStrategy::Random);
        let now = Instant::now();

        // Two uniformly random 32-bit draws colliding three times in a row
        // is practically impossible.
        let distinct = (0..3)
            .map(|_| generator.generate(&sock(4000), now) != generator.generate(&sock(4000), now))
            .any(|ne| ne);

        assert!(distinct);
        assert_eq!(generator.strategy(), IsnStrategy::Random);
    }
}
