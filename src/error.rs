//! Error types for the transport engine, covering malformed segments, header
//! construction, and connection-level failures surfaced to the application.

use std::{error, fmt, io, result};

use crate::protocol::SocketAddr;

/// A convenience wrapper around `Result` for `tcp_engine::Error`.
pub type Result<T> = result::Result<T, Error>;

/// Set of errors that can occur while driving TCP connections.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Error reported by an external collaborator (e.g., the segment output).
    Io(io::Error),
    /// Error parsing a TCP segment (protocol violation).
    Parse(ParseError),
    /// Error creating or manipulating a TCP header.
    Header(HeaderError),
    /// The peer reset the connection with an acceptable `RST`.
    Reset,
    /// The connection was reset after the peer violated the protocol.
    ProtocolViolation,
    /// The connection was torn down after a timer expired.
    TimedOut(Timeout),
    /// A bounded resource is exhausted. The operation may be retried.
    Exhausted(Resource),
    /// The operation cannot complete right now. The operation may be retried.
    WouldBlock(Pending),
    /// The connection is not in a state that allows the operation.
    NotConnected,
    /// The connection handle does not refer to a live connection.
    InvalidHandle,
    /// A provided argument is out of range.
    InvalidInput(&'static str),
    /// A listener is already registered for the address.
    AddrInUse(SocketAddr),
    /// The connection is closing and accepts no more data.
    Closing,
}

impl Error {
    /// Returns `true` if the failed operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Exhausted(_) | Error::WouldBlock(_))
    }

    /// Returns the closest matching [io::ErrorKind] for this error.
    pub fn kind(&self) -> io::ErrorKind {
        match *self {
            Error::Io(ref err) => err.kind(),
            Error::Parse(_) | Error::Header(_) => io::ErrorKind::InvalidData,
            Error::Reset => io::ErrorKind::ConnectionReset,
            Error::ProtocolViolation => io::ErrorKind::ConnectionAborted,
            Error::TimedOut(_) => io::ErrorKind::TimedOut,
            Error::Exhausted(_) => io::ErrorKind::OutOfMemory,
            Error::WouldBlock(_) => io::ErrorKind::WouldBlock,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::InvalidHandle => io::ErrorKind::NotFound,
            Error::InvalidInput(_) => io::ErrorKind::InvalidInput,
            Error::AddrInUse(_) => io::ErrorKind::AddrInUse,
            Error::Closing => io::ErrorKind::BrokenPipe,
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            Error::Parse(ref err) => Some(err),
            Error::Header(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Error {
        Error::Parse(err)
    }
}

impl From<HeaderError> for Error {
    fn from(err: HeaderError) -> Error {
        Error::Header(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(err) => err,
            err => io::Error::new(err.kind(), err),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref err) => fmt::Display::fmt(err, f),
            Error::Parse(ref err) => fmt::Display::fmt(err, f),
            Error::Header(ref err) => fmt::Display::fmt(err, f),
            Error::Reset => write!(f, "connection reset by peer"),
            Error::ProtocolViolation => write!(f, "connection reset after a protocol violation"),
            Error::TimedOut(ref timeout) => write!(f, "connection timed out: {timeout}"),
            Error::Exhausted(ref resource) => write!(f, "resource exhausted: {resource}"),
            Error::WouldBlock(ref pending) => write!(f, "operation would block: {pending}"),
            Error::NotConnected => write!(f, "connection is not established"),
            Error::InvalidHandle => write!(f, "connection handle is stale or unknown"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::AddrInUse(addr) => write!(f, "address already in use: {addr}"),
            Error::Closing => write!(f, "connection is closing"),
        }
    }
}

/// Timer that expired and tore down a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// The three-way handshake did not complete in time.
    Handshake,
    /// Data or control segments were retransmitted the maximum number of
    /// times without being acknowledged.
    Retransmission,
    /// The peer did not finish the close sequence in time.
    Close,
    /// A blocking connect gave up waiting.
    Connect,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timeout::Handshake => write!(f, "handshake did not complete"),
            Timeout::Retransmission => write!(f, "retransmission limit reached"),
            Timeout::Close => write!(f, "peer did not complete connection termination"),
            Timeout::Connect => write!(f, "gave up waiting for connection establishment"),
        }
    }
}

/// Bounded resource that could not satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Every slot of the connection pool is in use.
    ConnectionSlots,
    /// The connection's pending-send buffer is full.
    SendBuffer,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Resource::ConnectionSlots => write!(f, "no free connection slot"),
            Resource::SendBuffer => write!(f, "no send buffer space"),
        }
    }
}

/// Reason an operation could not make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// The peer's advertised window is fully used.
    WindowFull,
    /// The connection has not completed its handshake yet.
    Connecting,
}

impl fmt::Display for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Pending::WindowFull => write!(f, "send window is full"),
            Pending::Connecting => write!(f, "connection establishment in progress"),
        }
    }
}

/// Error occurred while trying to parse a TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ParseError {
    /// Input buffer not within the valid range for a TCP header.
    InvalidBufferLength { provided: usize, min: u16, max: u16 },
    /// Invalid TCP data offset.
    InvalidDataOffset { provided: u16, min: u16, max: u16 },
    /// Mismatch between the provided and expected TCP header length.
    ///
    /// Value provided is less than `data_offset << 2`.
    HeaderLengthMismatch { provided: usize, expected: u16 },
    /// Invalid TCP options length.
    InvalidOptionsLength { provided: usize, max: usize },
    /// TCP options length is not a multiple of 4 bytes.
    MisalignedOptions { provided: usize },
    /// A TCP option length byte is missing, too small, or runs past the end
    /// of the options.
    InvalidOptionLength {
        kind: u8,
        provided: usize,
        remaining: usize,
    },
    /// The `MSS` option length must be 4.
    InvalidMssLength { provided: usize },
    /// The `Window Scale` option length must be 3.
    InvalidWindowScaleLength { provided: usize },
    /// Source and destination addresses belong to different families.
    AddressFamilyMismatch,
}

impl error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ParseError::InvalidBufferLength { provided, min, max } => {
                write!(
                    f,
                    "invalid header length: {provided} bytes (not within the valid range: {min}..={max} bytes)"
                )
            }
            ParseError::InvalidDataOffset { provided, min, max } => {
                write!(
                    f,
                    "invalid TCP data offset: {provided} (not within the valid range: {min}..={max})"
                )
            }
            ParseError::HeaderLengthMismatch { provided, expected } => {
                write!(
                    f,
                    "invalid TCP header length: {provided} bytes (less than indicated by data offset: {expected} bytes)"
                )
            }
            ParseError::InvalidOptionsLength { provided, max } => {
                write!(
                    f,
                    "invalid TCP options length: {provided} bytes (exceeds maximum allowed {max} bytes)"
                )
            }
            ParseError::MisalignedOptions { provided } => {
                write!(
                    f,
                    "invalid TCP options length: {provided} bytes (not a multiple of 4)"
                )
            }
            ParseError::InvalidOptionLength {
                kind,
                provided,
                remaining,
            } => {
                write!(
                    f,
                    "invalid TCP option (kind {kind}) length: {provided} bytes ({remaining} bytes remaining)"
                )
            }
            ParseError::InvalidMssLength { provided } => {
                write!(f, "invalid TCP MSS option length: {provided} bytes (must be 4)")
            }
            ParseError::InvalidWindowScaleLength { provided } => {
                write!(
                    f,
                    "invalid TCP window scale option length: {provided} bytes (must be 3)"
                )
            }
            ParseError::AddressFamilyMismatch => {
                write!(f, "source and destination address families differ")
            }
        }
    }
}

/// Error occurred while trying to create or manipulate a TCP header.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum HeaderError {
    /// Insufficient space to append TCP option.
    InsufficientOptionSpace {
        attempted_len: usize,
        current_len: usize,
        max_len: usize,
    },
    /// Invalid TCP `MSS` option value.
    InvalidMssOption,
    /// Invalid TCP `Window Scale` shift count.
    InvalidWindowScale { provided: u8, max: u8 },
}

impl error::Error for HeaderError {}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeaderError::InsufficientOptionSpace {
                attempted_len,
                current_len,
                max_len,
            } => {
                write!(
                    f,
                    "failed to append TCP option to header: appending would result in {attempted_len} bytes, but current length is {current_len} (exceeds maximum allowed {max_len} bytes)"
                )
            }
            HeaderError::InvalidMssOption => {
                write!(f, "invalid TCP MSS option: value must be greater than 0")
            }
            HeaderError::InvalidWindowScale { provided, max } => {
                write!(
                    f,
                    "invalid TCP window scale option: shift count {provided} (exceeds maximum {max})"
                )
            }
        }
    }
}
