//! Sans-I/O implementation of the transport protocol: wire codec, sequence
//! arithmetic, and the per-connection state machine with its windows,
//! queues, and timers.

pub mod fsm;
pub mod headers;
pub mod isn;
pub mod reassembly;
pub mod retransmit;
pub mod segment;
pub mod seq;
pub mod socket;
pub mod timer;
pub mod window;

pub use fsm::{CloseReason, ConnectionState, Event, OpenKind, Outbox, TCB};
pub use isn::{IsnGenerator, IsnStrategy};
pub use segment::TcpSegment;
pub use seq::SeqNumber;
pub use socket::{Socket, SocketAddr};
pub use timer::TimerKind;
