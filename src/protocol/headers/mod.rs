//! TCP header codec.

mod tcp;
pub use tcp::{Flags, OptionKind, OptionsIter, TcpHeader, TcpOptions};
