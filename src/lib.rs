//! A user-space implementation of the Transmission Control Protocol (TCP)
//! transport layer, based on [RFC 793], built to sit inside an embedded-style
//! network stack.
//!
//! The crate stops at the segment boundary: it consumes raw TCP segments and
//! produces framed ones through an [Output] collaborator, leaving IP framing,
//! checksums and the link layer to the host. Delivered payload and connection
//! lifecycle notices reach the application through a [Consumer].
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("This crate is only compatible with Linux systems that support timerfd and epoll.");

pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod log;
pub mod protocol;

pub use config::Config;
pub use engine::{ConnectionId, Consumer, Engine, Output};
pub use error::{Error, HeaderError, ParseError, Pending, Resource, Result, Timeout};

/// Creates an [Error::Io] with a message prefixed to the `errno` value.
#[macro_export]
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);

        let msg = format!("{prefix}: {errno}");

        $crate::Error::Io(::std::io::Error::new(errno.kind(), msg))
    }};
}
