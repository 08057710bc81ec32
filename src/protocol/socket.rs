//! Representing unique TCP connections through socket addresses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{ParseError, Result};

/// An IP address and a port number.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct SocketAddr {
    /// IPv4 or IPv6 address.
    pub addr: IpAddr,
    /// Port number.
    pub port: u16,
}

impl SocketAddr {
    /// Creates a socket address from an IP address and a port.
    pub fn new(addr: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }

    /// Returns `true` if the address is an IPv6 address.
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl From<std::net::SocketAddr> for SocketAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<([u8; 4], u16)> for SocketAddr {
    fn from((addr, port): ([u8; 4], u16)) -> Self {
        Self::new(Ipv4Addr::from(addr), port)
    }
}

impl From<([u16; 8], u16)> for SocketAddr {
    fn from((addr, port): ([u16; 8], u16)) -> Self {
        Self::new(Ipv6Addr::from(addr), port)
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{}:{}", addr, self.port),
            IpAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
        }
    }
}

/// Unique TCP connection, identified by both the source and destination
/// socket addresses.
///
/// Stored from the local host's perspective: `src` is the local endpoint and
/// `dst` is the remote one.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Socket {
    /// The source socket address (local IP and port).
    pub src: SocketAddr,
    /// The destination socket address (remote IP and port).
    pub dst: SocketAddr,
}

impl Socket {
    /// Pairs a local and a remote socket address.
    ///
    /// # Errors
    ///
    /// Returns an error if the two addresses belong to different families.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Result<Self> {
        if src.is_ipv6() != dst.is_ipv6() {
            return Err(ParseError::AddressFamilyMismatch.into());
        }

        Ok(Self { src, dst })
    }

    /// Returns the same connection seen from the peer's perspective.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    use crate::Error;

    #[test]
    fn socket_display() {
        let v4 = Socket::new(
            SocketAddr::from(([10, 0, 0, 1], 4000)),
            SocketAddr::from(([10, 0, 0, 2], 80)),
        )
        .unwrap();

        assert_eq!(v4.to_string(), "10.0.0.1:4000 -> 10.0.0.2:80");

        let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST, 443);
        assert_eq!(v6.to_string(), "[::1]:443");
    }

    #[test]
    fn socket_address_family_mismatch_invalid() {
        let res = Socket::new(
            SocketAddr::from(([10, 0, 0, 1], 4000)),
            SocketAddr::new(Ipv6Addr::LOCALHOST, 80),
        );

        assert_matches!(res, Err(Error::Parse(ParseError::AddressFamilyMismatch)));
    }

    #[test]
    fn socket_reversed() {
        let sock = Socket::new(
            SocketAddr::from(([10, 0, 0, 1], 4000)),
            SocketAddr::from(([10, 0, 0, 2], 80)),
        )
        .unwrap();

        let rev = sock.reversed();
        assert_eq!(rev.src, sock.dst);
        assert_eq!(rev.dst, sock.src);
        assert_eq!(rev.reversed(), sock);
    }
}
