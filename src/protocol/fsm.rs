//! TCP finite state machine (FSM), as described in [RFC 793].
//!
//! A [TCB] never performs I/O. Every entry point takes the current time and an
//! [Outbox] collecting the segments to transmit, the in-order payload to hand
//! to the consumer, and lifecycle [Event]s. Timer deadlines armed during the
//! call are collected with [TCB::take_armed_timers]; expiries come back
//! through [TCB::on_timer].
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use super::headers::{Flags, TcpHeader};
use super::reassembly::ReassemblyQueue;
use super::retransmit::{ControlExpiry, ControlQueue, ControlRetry, DataMode, Rto};
use super::timer::{TimerKind, Timers};
use super::window::{RecvWindow, SendWindow};
use super::{SeqNumber, Socket, TcpSegment};
use crate::config::Config;
use crate::error::{Pending, Resource, Timeout};
use crate::{Error, Result};

/// RFC 1122 (4.2.2.6)
///
/// If an MSS option is not received at connection setup, TCP MUST assume a
/// default send MSS of 536 (576-40).
pub const DEFAULT_TCP_MSS: u16 = 536;

/// Different TCP connection states.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum ConnectionState {
    /// Waiting for a connection request from the remote TCP.
    LISTEN,
    /// Waiting for a matching connection request after having sent one.
    SYN_SENT,
    /// Waiting for the peer to acknowledge our connection request after both
    /// sides sent one.
    SYN_RECEIVED,
    /// Open connection; the data transfer phase.
    ESTABLISHED,
    /// Our `FIN` is sent; waiting for its acknowledgment or the peer's `FIN`.
    FIN_WAIT_1,
    /// Our `FIN` is acknowledged; waiting for the peer's `FIN`.
    FIN_WAIT_2,
    /// The peer's `FIN` arrived; waiting for the local user to close.
    CLOSE_WAIT,
    /// Both sides sent `FIN`; waiting for the acknowledgment of ours.
    CLOSING,
    /// Waiting for the acknowledgment of our `FIN` after the peer closed
    /// first.
    LAST_ACK,
    /// Absorbing stray duplicates before the connection is released.
    TIME_WAIT,
    /// No connection state at all.
    CLOSED,
}

impl ConnectionState {
    /// Returns `true` once both sides have exchanged initial sequence numbers.
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            ConnectionState::LISTEN | ConnectionState::SYN_SENT | ConnectionState::CLOSED
        )
    }
}

/// States a TCP connection could be opened from.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
pub enum OpenKind {
    /// TCP connection was opened in a "passive" state (`LISTEN` -> `SYN_RECEIVED`).
    PASSIVE_OPEN,
    /// TCP connection was opened in an "active" state (`CLOSED` -> `SYN_SENT`).
    ACTIVE_OPEN,
}

/// Why a connection reached `CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly termination.
    Normal,
    /// The peer sent an acceptable `RST`.
    Reset,
    /// A timer expired.
    Timeout(Timeout),
    /// We reset the connection after the peer violated the protocol.
    ProtocolViolation,
    /// The local user aborted the connection.
    Aborted,
}

impl CloseReason {
    /// Returns the error reported to operations on the closed connection, if
    /// the close was not orderly.
    pub fn error(self) -> Option<Error> {
        match self {
            CloseReason::Normal | CloseReason::Aborted => None,
            CloseReason::Reset => Some(Error::Reset),
            CloseReason::Timeout(timeout) => Some(Error::TimedOut(timeout)),
            CloseReason::ProtocolViolation => Some(Error::ProtocolViolation),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CloseReason::Normal => write!(f, "closed"),
            CloseReason::Reset => write!(f, "reset by peer"),
            CloseReason::Timeout(timeout) => write!(f, "timed out: {timeout}"),
            CloseReason::ProtocolViolation => write!(f, "protocol violation"),
            CloseReason::Aborted => write!(f, "aborted"),
        }
    }
}

/// Lifecycle notifications raised by a [TCB].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An actively opened connection reached `ESTABLISHED`.
    Connected,
    /// A passively opened connection reached `ESTABLISHED`.
    Accepted,
    /// The connection reached `CLOSED`.
    Closed(CloseReason),
    /// No more data may be queued until the peer acknowledges some.
    WindowFull,
    /// Window or buffer space is available again.
    WindowOpen,
}

/// Side effects of a single call into a [TCB].
#[derive(Debug, Default)]
pub struct Outbox {
    /// Segments to transmit, in order.
    pub segments: Vec<TcpSegment>,
    /// In-order payload for the consumer, in order.
    pub delivered: Vec<Vec<u8>>,
    /// Lifecycle notifications.
    pub events: Vec<Event>,
}

impl Outbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the call produced no side effects.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.delivered.is_empty() && self.events.is_empty()
    }
}

/// Send Sequence Space.
///
/// ```text
///                   1         2          3          4
///              ----------|----------|----------|----------
///                     SND.UNA    SND.NXT    SND.UNA
///                                          +SND.WND
/// ```
///
/// `SND.NXT` is not stored: it is `una` plus the bytes in flight. `SYN` and
/// `FIN` advance `una` as soon as they are sent; their acknowledgment is
/// tracked by the control queue instead.
#[derive(Debug)]
struct SendSeqSpace {
    /// ISS     - initial send sequence number
    iss: SeqNumber,
    /// SND.UNA - sequence number of the first byte in the send buffer
    una: SeqNumber,
    /// Highest sequence number sent plus one.
    max: SeqNumber,
    /// SND.WL1 - segment sequence number used for last window update
    wl1: SeqNumber,
    /// SND.WL2 - segment acknowledgment number used for last window update
    wl2: SeqNumber,
    /// Shift applied to the window field of the peer's segments.
    wnd_shift: u8,
}

/// Receive Sequence Space.
///
/// ```text
///                       1          2          3
///                   ----------|----------|----------
///                          RCV.NXT    RCV.NXT
///                                    +RCV.WND
/// ```
#[derive(Debug)]
struct RecvSeqSpace {
    /// IRS     - initial receive sequence number
    irs: SeqNumber,
    /// RCV.NXT - receive next
    nxt: SeqNumber,
    /// RCV.WND - receive window
    wnd: RecvWindow,
    /// Shift applied to the window we advertise.
    wnd_shift: u8,
}

/// Transmission Control Block (TCB).
#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub struct TCB {
    /// Current state of the TCP connection.
    state: ConnectionState,
    /// Socket addresses of the host and remote TCPs.
    sock: Socket,
    /// State the current TCP connection was opened in.
    open_kind: OpenKind,
    snd: SendSeqSpace,
    rcv: RecvSeqSpace,
    /// Application data awaiting transmission or acknowledgment.
    send_buf: SendWindow,
    /// Data received ahead of `RCV.NXT`.
    ooo: ReassemblyQueue,
    /// `SYN` and `FIN` segments awaiting acknowledgment.
    control: ControlQueue,
    rto: Rto,
    mode: DataMode,
    /// Data retransmissions in the current episode.
    retries: u32,
    timers: Timers,
    /// Effective MSS: the peer's, capped by ours.
    mss: u16,
    /// `close` was requested while data was still queued.
    close_pending: bool,
    /// Our `FIN` has been sent.
    fin_sent: bool,
    /// The engine holds the connection's transmit permit.
    window_full: bool,
    reason: Option<CloseReason>,
    config: Arc<Config>,
}

impl TCB {
    fn new(
        sock: Socket,
        iss: SeqNumber,
        open_kind: OpenKind,
        state: ConnectionState,
        config: Arc<Config>,
    ) -> Self {
        TCB {
            state,
            sock,
            open_kind,
            snd: SendSeqSpace {
                iss,
                una: iss,
                max: iss,
                wl1: SeqNumber::default(),
                wl2: iss,
                wnd_shift: 0,
            },
            rcv: RecvSeqSpace {
                // Updated once the peer's SYN arrives.
                irs: SeqNumber::default(),
                nxt: SeqNumber::default(),
                wnd: RecvWindow::new(config.recv_window_max),
                wnd_shift: 0,
            },
            send_buf: SendWindow::new(
                config.send_window_max,
                config.send_buffer_size,
                config.no_delay,
            ),
            ooo: ReassemblyQueue::new(),
            control: ControlQueue::new(),
            rto: Rto::new(config.initial_rto, config.rto_jitter),
            mode: DataMode::Send,
            retries: 0,
            timers: Timers::default(),
            mss: DEFAULT_TCP_MSS.min(config.mss),
            close_pending: false,
            fin_sent: false,
            window_full: false,
            reason: None,
            config,
        }
    }

    /// Initiates a new TCP connection, queueing the `SYN` segment on `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SYN` options could not be constructed.
    pub fn open_active(
        sock: Socket,
        iss: SeqNumber,
        config: Arc<Config>,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<Self> {
        let mut conn = Self::new(
            sock,
            iss,
            OpenKind::ACTIVE_OPEN,
            ConnectionState::CLOSED,
            config,
        );

        // <SEQ=ISS><CTL=SYN>
        let mut syn = TcpHeader::new(
            sock.src.port,
            sock.dst.port,
            iss,
            Flags::SYN,
            conn.rcv.wnd.window(),
        );
        syn.set_option_mss(conn.config.mss)?;

        if let Some(shift) = conn.config.window_scale {
            syn.set_option_window_scale(shift)?;
        }

        conn.snd.una = iss + 1;
        conn.snd.max = conn.snd.una;

        conn.transmit_control(TcpSegment::new(syn, &[]), now, out);
        conn.timers
            .arm(TimerKind::Handshake, now + conn.config.handshake_timeout);

        conn.set_state(ConnectionState::SYN_SENT, "active open, sent SYN");

        Ok(conn)
    }

    /// Creates a connection in `LISTEN` that answers the first `SYN` passed
    /// to [TCB::on_segment].
    pub fn listen(sock: Socket, iss: SeqNumber, config: Arc<Config>) -> Self {
        Self::new(
            sock,
            iss,
            OpenKind::PASSIVE_OPEN,
            ConnectionState::LISTEN,
            config,
        )
    }

    /// Returns the current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the socket addresses of the connection.
    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    /// Returns how the connection was opened.
    pub fn open_kind(&self) -> OpenKind {
        self.open_kind
    }

    /// Returns why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason
    }

    /// Returns the error to report for operations on a closed connection.
    pub fn closed_error(&self) -> Error {
        self.reason
            .and_then(CloseReason::error)
            .unwrap_or(Error::NotConnected)
    }

    /// Returns the initial send sequence number.
    pub fn iss(&self) -> SeqNumber {
        self.snd.iss
    }

    /// Returns the peer's initial sequence number.
    pub fn irs(&self) -> SeqNumber {
        self.rcv.irs
    }

    /// Returns the sequence number of the first byte in the send buffer.
    pub fn snd_una(&self) -> SeqNumber {
        self.snd.una
    }

    /// Returns the next sequence number to transmit.
    pub fn snd_nxt(&self) -> SeqNumber {
        self.snd.una + self.send_buf.unacked()
    }

    /// Returns the next sequence number expected from the peer.
    pub fn rcv_nxt(&self) -> SeqNumber {
        self.rcv.nxt
    }

    /// Returns the peer's advertised window, after scaling and clamping.
    pub fn send_window(&self) -> u32 {
        self.send_buf.window()
    }

    /// Returns the receive window we advertise.
    pub fn recv_window(&self) -> u16 {
        self.rcv.wnd.window()
    }

    /// Returns the number of bytes sent but not acknowledged.
    pub fn unacked(&self) -> u32 {
        self.send_buf.unacked()
    }

    /// Returns the number of bytes queued for sending, sent or not.
    pub fn queued(&self) -> usize {
        self.send_buf.total()
    }

    /// Returns the negotiated maximum segment size.
    pub fn mss(&self) -> u16 {
        self.mss
    }

    /// Returns the data transmission mode.
    pub fn data_mode(&self) -> DataMode {
        self.mode
    }

    /// Returns the number of data retransmissions in the current episode.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns `true` if Nagle's algorithm is disabled.
    pub fn no_delay(&self) -> bool {
        self.send_buf.no_delay()
    }

    /// Returns `true` if the window has room for more data.
    pub fn is_writable(&self) -> bool {
        !self.window_full
    }

    /// Returns the connection's timers.
    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Returns the timer deadlines armed since the last call.
    pub fn take_armed_timers(&mut self) -> Vec<(TimerKind, Instant)> {
        self.timers.drain_armed()
    }

    /// Queues application data and transmits as much of it as the window and
    /// Nagle's algorithm allow. Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// - [Error::WouldBlock] if the handshake is in progress or the send
    ///   window is full.
    /// - [Error::Exhausted] if the send buffer has no room.
    /// - [Error::Closing] once the local side has closed.
    /// - The stored close error (or [Error::NotConnected]) once `CLOSED`.
    pub fn send(&mut self, data: &[u8], now: Instant, out: &mut Outbox) -> Result<usize> {
        match self.state {
            ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT => {}
            ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED => {
                return Err(Error::WouldBlock(Pending::Connecting));
            }
            ConnectionState::LISTEN => return Err(Error::NotConnected),
            ConnectionState::CLOSED => return Err(self.closed_error()),
            _ => return Err(Error::Closing),
        }

        if self.close_pending {
            return Err(Error::Closing);
        }

        if data.is_empty() {
            return Ok(0);
        }

        if self.send_buf.is_full() {
            return Err(Error::WouldBlock(Pending::WindowFull));
        }

        let n = self.send_buf.push(data);
        if n == 0 {
            warn!("[{}] ({:?}) send buffer full", self.sock, self.state);
            return Err(Error::Exhausted(Resource::SendBuffer));
        }

        self.send_queued_data(now, out);
        self.update_permit(out);

        Ok(n)
    }

    /// Starts a graceful close.
    ///
    /// With data still queued, the `FIN` is deferred until all of it has been
    /// acknowledged.
    pub fn close(&mut self, now: Instant, out: &mut Outbox) {
        match self.state {
            ConnectionState::LISTEN | ConnectionState::SYN_SENT => {
                debug!(
                    "[{}] ({:?}) close call received: {:?} -> CLOSED",
                    self.sock, self.state, self.state
                );
                self.terminate(CloseReason::Normal, out);
            }
            ConnectionState::SYN_RECEIVED => self.send_fin(now, out),
            ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT => {
                if self.close_pending {
                    return;
                }

                if self.send_buf.total() > 0 {
                    debug!(
                        "[{}] ({:?}) close call received, deferring FIN until {} queued bytes are acknowledged",
                        self.sock,
                        self.state,
                        self.send_buf.total()
                    );

                    self.close_pending = true;
                    self.send_queued_data(now, out);
                } else {
                    self.send_fin(now, out);
                }
            }
            _ => {
                debug!(
                    "[{}] ({:?}) close call received: ignoring",
                    self.sock, self.state
                );
            }
        }
    }

    /// Tears the connection down at once, resetting the peer if it holds
    /// state for it.
    pub fn abort(&mut self, out: &mut Outbox) {
        match self.state {
            ConnectionState::CLOSED => {}
            ConnectionState::LISTEN | ConnectionState::SYN_SENT => {
                self.terminate(CloseReason::Aborted, out);
            }
            _ => self.reset(CloseReason::Aborted, out),
        }
    }

    /// Resets the connection after a malformed segment was received for it.
    pub fn reset_on_violation(&mut self, out: &mut Outbox) {
        if self.state == ConnectionState::CLOSED {
            return;
        }

        warn!(
            "[{}] ({:?}) malformed segment received, sending RST: {:?} -> CLOSED",
            self.sock, self.state, self.state
        );

        self.reset(CloseReason::ProtocolViolation, out);
    }

    /// Grows (positive `delta`) or shrinks the receive window. Growing it back
    /// above the short-window threshold immediately advertises the new
    /// window.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if the window would leave
    /// `0..=recv_window_max`.
    pub fn update_recv_window(&mut self, delta: i32, out: &mut Outbox) -> Result<()> {
        let was_short = self.rcv.wnd.is_short(self.mss);

        self.rcv.wnd.update(delta)?;

        if was_short && !self.rcv.wnd.is_short(self.mss) && self.state.is_synchronized() {
            debug!(
                "[{}] ({:?}) receive window recovered to {}: sending ACK",
                self.sock,
                self.state,
                self.rcv.wnd.window()
            );

            self.send_ack(out);
        }

        Ok(())
    }

    /// Enables or disables Nagle's algorithm, flushing deferred data when it
    /// is disabled.
    pub fn set_no_delay(&mut self, no_delay: bool, now: Instant, out: &mut Outbox) {
        self.send_buf.set_no_delay(no_delay);

        if no_delay
            && matches!(
                self.state,
                ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT
            )
        {
            self.send_queued_data(now, out);
            self.update_permit(out);
        }
    }

    /// Processes an incoming segment for this connection.
    ///
    /// ```text
    ///                              +---------+ ---------\      active OPEN
    ///                              |  CLOSED |            \    -----------
    ///                              +---------+<---------\   \   create TCB
    ///                                |     ^              \   \  snd SYN
    ///                   passive OPEN |     |   CLOSE        \   \
    ///                   ------------ |     | ----------       \   \
    ///                    create TCB  |     | delete TCB         \   \
    ///                                V     |                      \   \
    ///                              +---------+            CLOSE    |    \
    ///                              |  LISTEN |          ---------- |     |
    ///                              +---------+          delete TCB |     |
    ///                   rcv SYN      |     |     SEND              |     |
    ///                  -----------   |     |    -------            |     V
    /// +---------+      snd SYN,ACK  /       \   snd SYN          +---------+
    /// |         |<-----------------           ------------------>|         |
    /// |   SYN   |                    rcv SYN                     |   SYN   |
    /// |   RCVD  |<-----------------------------------------------|   SENT  |
    /// |         |                    snd ACK                     |         |
    /// |         |------------------           -------------------|         |
    /// +---------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +---------+
    ///   |           --------------   |     |   -----------
    ///   |                  x         |     |     snd ACK
    ///   |                            V     V
    ///   |  CLOSE                   +---------+
    ///   | -------                  |  ESTAB  |
    ///   | snd FIN                  +---------+
    ///   |                   CLOSE    |     |    rcv FIN
    ///   V                  -------   |     |    -------
    /// +---------+          snd FIN  /       \   snd ACK          +---------+
    /// |  FIN    |<-----------------           ------------------>|  CLOSE  |
    /// | WAIT-1  |------------------                              |   WAIT  |
    /// +---------+          rcv FIN  \                            +---------+
    ///   | rcv ACK of FIN   -------   |                            CLOSE  |
    ///   | --------------   snd ACK   |                           ------- |
    ///   V        x                   V                           snd FIN V
    /// +---------+                  +---------+                   +---------+
    /// |FINWAIT-2|                  | CLOSING |                   | LAST-ACK|
    /// +---------+                  +---------+                   +---------+
    ///   |                rcv ACK of FIN |                 rcv ACK of FIN |
    ///   |  rcv FIN       -------------- |    Timeout=2MSL -------------- |
    ///   |  -------              x       V    ------------        x       V
    ///    \ snd ACK                 +---------+delete TCB         +---------+
    ///     ------------------------>|TIME WAIT|------------------>| CLOSED  |
    ///                              +---------+                   +---------+
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if a `SYN_ACK` answering a connection request could
    /// not be constructed.
    pub fn on_segment(&mut self, seg: &TcpSegment, now: Instant, out: &mut Outbox) -> Result<()> {
        log_segment(&self.sock, seg);

        match self.state {
            ConnectionState::LISTEN => self.on_listen(seg, now, out),
            ConnectionState::SYN_SENT => self.on_syn_sent(seg, now, out),
            ConnectionState::CLOSED => {
                debug!("[{}] (CLOSED) received segment: ignoring", self.sock);
                Ok(())
            }
            _ => {
                self.on_synchronized(seg, now, out);
                Ok(())
            }
        }
    }

    /// Handles expiry of `kind`. Expiries for timers that were cancelled or
    /// re-armed since are ignored.
    pub fn on_timer(&mut self, kind: TimerKind, now: Instant, out: &mut Outbox) {
        if !self.timers.take_expired(kind, now) {
            return;
        }

        match kind {
            TimerKind::Control => self.on_control_timeout(now, out),
            TimerKind::Retransmit => self.on_retransmit_timeout(now, out),
            TimerKind::Persist => self.on_persist_timeout(now, out),
            TimerKind::DelayedAck => {
                trace!("[{}] ({:?}) delayed ACK expired", self.sock, self.state);
                self.send_ack(out);
            }
            TimerKind::Handshake => {
                if matches!(
                    self.state,
                    ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED
                ) {
                    warn!(
                        "[{}] ({:?}) handshake timed out: {:?} -> CLOSED",
                        self.sock, self.state, self.state
                    );

                    let reason = CloseReason::Timeout(Timeout::Handshake);
                    if self.state == ConnectionState::SYN_RECEIVED {
                        self.reset(reason, out);
                    } else {
                        self.terminate(reason, out);
                    }
                }
            }
            TimerKind::Fin => {
                warn!(
                    "[{}] ({:?}) peer did not finish closing: {:?} -> CLOSED",
                    self.sock, self.state, self.state
                );

                self.terminate(CloseReason::Timeout(Timeout::Close), out);
            }
            TimerKind::TimeWait => {
                debug!(
                    "[{}] (TIME_WAIT) timer expired: TIME_WAIT -> CLOSED",
                    self.sock
                );

                self.terminate(CloseReason::Normal, out);
            }
            TimerKind::Reassembly => {
                debug!(
                    "[{}] ({:?}) discarding {} out-of-order bytes",
                    self.sock,
                    self.state,
                    self.ooo.queued_bytes()
                );

                self.ooo.clear();
            }
        }
    }

    fn on_listen(&mut self, seg: &TcpSegment, now: Instant, out: &mut Outbox) -> Result<()> {
        let tcph = &seg.tcp;

        // An incoming RST should be ignored.
        if tcph.rst() {
            debug!("[{}] (LISTEN) received RST: ignoring", self.sock);
            return Ok(());
        }

        // Any acknowledgment is bad if it arrives on a connection still in the
        // LISTEN state.
        if tcph.ack() {
            // <SEQ=SEG.ACK><CTL=RST>
            out.segments.push(self.rst(tcph.ack_number(), None));

            debug!("[{}] (LISTEN) received ACK: sending RST", self.sock);
            return Ok(());
        }

        if tcph.flags() != Flags::SYN {
            debug!("[{}] (LISTEN) did not receive SYN: ignoring", self.sock);
            return Ok(());
        }

        self.rcv.irs = tcph.seq_number();
        self.rcv.nxt = self.rcv.irs + 1;
        self.negotiate(tcph);

        // <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
        let syn_ack = self.syn_ack(tcph.options().window_scale().is_some())?;

        self.snd.una = self.snd.iss + 1;
        self.snd.max = self.snd.una;

        self.transmit_control(syn_ack, now, out);
        self.timers
            .arm(TimerKind::Handshake, now + self.config.handshake_timeout);

        self.set_state(ConnectionState::SYN_RECEIVED, "received SYN, sent SYN_ACK");

        Ok(())
    }

    fn on_syn_sent(&mut self, seg: &TcpSegment, now: Instant, out: &mut Outbox) -> Result<()> {
        let tcph = &seg.tcp;

        // Only an ACK of exactly our SYN is acceptable.
        if tcph.ack() && tcph.ack_number() != self.snd.una {
            if !tcph.rst() {
                // <SEQ=SEG.ACK><CTL=RST>
                out.segments.push(self.rst(tcph.ack_number(), None));
            }

            debug!(
                "[{}] (SYN_SENT) unacceptable ACK number {}: ignoring",
                self.sock,
                tcph.ack_number()
            );
            return Ok(());
        }

        if tcph.rst() {
            if tcph.ack() {
                warn!(
                    "[{}] (SYN_SENT) received RST, connection refused: SYN_SENT -> CLOSED",
                    self.sock
                );
                self.terminate(CloseReason::Reset, out);
            } else {
                debug!("[{}] (SYN_SENT) received RST without ACK: ignoring", self.sock);
            }

            return Ok(());
        }

        if !tcph.syn() {
            debug!("[{}] (SYN_SENT) did not receive SYN: ignoring", self.sock);
            return Ok(());
        }

        self.rcv.irs = tcph.seq_number();
        self.rcv.nxt = self.rcv.irs + 1;
        self.negotiate(tcph);

        if tcph.ack() {
            if !self.control.acknowledge(tcph.ack_number(), self.config.max_retries) {
                self.timers.cancel(TimerKind::Control);
            }
            self.timers.cancel(TimerKind::Handshake);

            self.set_state(ConnectionState::ESTABLISHED, "received SYN_ACK, sent ACK");

            // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
            self.send_ack(out);
            out.events.push(Event::Connected);
            self.update_permit(out);

            self.on_text(seg, now, out);
            return Ok(());
        }

        // Simultaneous open: repeat our SYN, now acknowledging theirs.
        let syn_ack = self.syn_ack(tcph.options().window_scale().is_some())?;

        self.control.clear();
        self.timers.cancel(TimerKind::Control);
        self.transmit_control(syn_ack, now, out);

        self.set_state(ConnectionState::SYN_RECEIVED, "received SYN, sent SYN_ACK");

        Ok(())
    }

    fn on_synchronized(&mut self, seg: &TcpSegment, now: Instant, out: &mut Outbox) {
        let tcph = &seg.tcp;
        let seqn = tcph.seq_number();

        if tcph.rst() {
            // A reset is only believed if it falls in the receive window.
            let wnd = u32::from(self.rcv.wnd.window()).max(1);

            if seqn.in_window(self.rcv.nxt, wnd) {
                warn!(
                    "[{}] ({:?}) received RST, connection reset: {:?} -> CLOSED",
                    self.sock, self.state, self.state
                );
                self.terminate(CloseReason::Reset, out);
            } else {
                debug!(
                    "[{}] ({:?}) received RST outside the window (seq {}): ignoring",
                    self.sock, self.state, seqn
                );
            }

            return;
        }

        // A retransmission of the peer's SYN is harmless; any other SYN is not.
        let dup_syn = tcph.syn() && seqn == self.rcv.irs;

        if tcph.syn() && !dup_syn {
            warn!(
                "[{}] ({:?}) received SYN in synchronized state, sending RST: {:?} -> CLOSED",
                self.sock, self.state, self.state
            );
            self.reset(CloseReason::ProtocolViolation, out);
            return;
        }

        if !tcph.ack() {
            if dup_syn {
                self.answer_dup_syn(out);
            } else {
                debug!("[{}] ({:?}) segment without ACK: ignoring", self.sock, self.state);
            }
            return;
        }

        if !self.on_ack(seg, now, out) {
            return;
        }

        match self.state {
            ConnectionState::ESTABLISHED
            | ConnectionState::FIN_WAIT_1
            | ConnectionState::FIN_WAIT_2 => self.on_text(seg, now, out),
            ConnectionState::CLOSE_WAIT | ConnectionState::CLOSING | ConnectionState::LAST_ACK => {
                // Only a retransmitted FIN can arrive here.
                if tcph.fin() {
                    self.send_ack(out);
                }
            }
            ConnectionState::TIME_WAIT => {
                // The only thing that can arrive in this state is a
                // retransmission of the remote FIN. Acknowledge it, and
                // restart the 2 MSL timeout.
                if tcph.fin() {
                    debug!("[{}] (TIME_WAIT) received FIN: restarting timer", self.sock);

                    self.send_ack(out);
                    self.timers
                        .arm(TimerKind::TimeWait, now + self.config.time_wait);
                }
            }
            _ => {}
        }

        if dup_syn {
            self.answer_dup_syn(out);
        }
    }

    /// Processes the acknowledgment and window fields of a segment. Returns
    /// `false` if the rest of the segment must be ignored.
    fn on_ack(&mut self, seg: &TcpSegment, now: Instant, out: &mut Outbox) -> bool {
        let tcph = &seg.tcp;
        let ackn = tcph.ack_number();

        if self.state == ConnectionState::SYN_RECEIVED {
            if ackn.le(self.snd.iss) || ackn.gt(self.snd.max) {
                // <SEQ=SEG.ACK><CTL=RST>
                out.segments.push(self.rst(ackn, None));

                debug!(
                    "[{}] (SYN_RECEIVED) unacceptable ACK number {}: sending RST",
                    self.sock, ackn
                );
                return false;
            }

            self.timers.cancel(TimerKind::Handshake);
            self.set_state(ConnectionState::ESTABLISHED, "received ACK");

            out.events.push(match self.open_kind {
                OpenKind::PASSIVE_OPEN => Event::Accepted,
                OpenKind::ACTIVE_OPEN => Event::Connected,
            });
        }

        if ackn.gt(self.snd.max) {
            debug!(
                "[{}] ({:?}) ACK {} for data not yet sent: ignoring",
                self.sock, self.state, ackn
            );

            self.send_ack(out);
            return false;
        }

        if self.control.acknowledge(ackn, self.config.max_retries) {
            self.timers
                .arm(TimerKind::Control, now + self.rto.get());
        } else if self.control.is_empty() {
            self.timers.cancel(TimerKind::Control);
        }

        if ackn.gt(self.snd.una) {
            let len_acked = ackn.distance(self.snd.una);

            if self.send_buf.acknowledge(len_acked).is_err() {
                warn!(
                    "[{}] ({:?}) peer acknowledged {} bytes but only {} are queued, sending RST: {:?} -> CLOSED",
                    self.sock,
                    self.state,
                    len_acked,
                    self.send_buf.total(),
                    self.state
                );

                self.reset(CloseReason::ProtocolViolation, out);
                return false;
            }

            self.snd.una = ackn;
            self.retries = 0;
            self.timers.cancel(TimerKind::Retransmit);

            if self.mode == DataMode::Resend {
                self.send_buf.rewind();
                self.rto.derive();
            }

            self.mode = DataMode::Send;
        }

        // Only a segment at least as recent as the last window update may
        // change the window: SND.WL1 < SEG.SEQ or (SND.WL1 = SEG.SEQ and
        // SND.WL2 =< SEG.ACK).
        let seqn = tcph.seq_number();
        if self.snd.wl1.lt(seqn) || (self.snd.wl1 == seqn && self.snd.wl2.le(ackn)) {
            let wnd = if tcph.syn() {
                // The window field of a SYN is never scaled.
                u32::from(tcph.window())
            } else {
                u32::from(tcph.window()) << self.snd.wnd_shift
            };

            self.send_buf.set_window(wnd);
            self.snd.wl1 = seqn;
            self.snd.wl2 = ackn;
        } else {
            trace!(
                "[{}] ({:?}) stale window {} in segment {}: ignoring",
                self.sock,
                self.state,
                tcph.window(),
                seqn
            );
        }

        let can_send = matches!(
            self.state,
            ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT
        );

        if can_send && self.send_buf.window() == 0 {
            self.timers
                .arm_if_idle(TimerKind::Persist, now + self.rto.get());
        } else {
            self.timers.cancel(TimerKind::Persist);
        }

        let fin_acked = self.fin_sent && !self.control.has_fin();

        match self.state {
            ConnectionState::FIN_WAIT_1 if fin_acked => {
                self.set_state(ConnectionState::FIN_WAIT_2, "received ACK of FIN");
            }
            ConnectionState::CLOSING if fin_acked => {
                self.enter_time_wait(now, "received ACK of FIN");
            }
            ConnectionState::LAST_ACK if fin_acked => {
                debug!(
                    "[{}] (LAST_ACK) received ACK of FIN: LAST_ACK -> CLOSED",
                    self.sock
                );

                self.terminate(CloseReason::Normal, out);
                return false;
            }
            _ => {}
        }

        if can_send {
            if self.close_pending && self.send_buf.total() == 0 {
                self.send_fin(now, out);
            } else {
                self.send_queued_data(now, out);
            }

            self.update_permit(out);
        }

        true
    }

    /// Processes the payload and `FIN` of a segment.
    fn on_text(&mut self, seg: &TcpSegment, now: Instant, out: &mut Outbox) {
        let tcph = &seg.tcp;
        let payload = seg.payload.as_slice();
        let fin = tcph.fin();

        if payload.is_empty() && !fin {
            return;
        }

        let mut seqn = tcph.seq_number();
        if tcph.syn() {
            seqn += 1;
        }

        let len = payload.len() as u32;
        let wnd = u32::from(self.rcv.wnd.window());

        if seqn.gt(self.rcv.nxt) {
            let offset = seqn.distance(self.rcv.nxt);

            if offset < wnd && !payload.is_empty() && !self.config.reassembly_timeout.is_zero() {
                let fits = (wnd - offset).min(len) as usize;

                self.ooo.insert(seqn, &payload[..fits]);
                self.timers
                    .arm_if_idle(TimerKind::Reassembly, now + self.config.reassembly_timeout);

                debug!(
                    "[{}] ({:?}) queued {} out-of-order bytes at {} (expecting {})",
                    self.sock, self.state, fits, seqn, self.rcv.nxt
                );
            } else {
                debug!(
                    "[{}] ({:?}) segment at {} outside the receive window: sending ACK",
                    self.sock, self.state, seqn
                );

                self.send_ack(out);
            }

            return;
        }

        let skip = self.rcv.nxt.distance(seqn);

        // Everything in the segment was received before.
        if skip > len || (skip == len && !fin) {
            debug!(
                "[{}] ({:?}) duplicate segment at {}: sending ACK",
                self.sock, self.state, seqn
            );

            self.send_ack(out);
            return;
        }

        let fresh = &payload[skip as usize..];
        let accepted = self.deliver(fresh, out);

        if fin && accepted == fresh.len() {
            self.on_fin(now, out);
        } else if accepted < fresh.len() {
            // The segment overran the window; advertise what is left.
            self.send_ack(out);
        } else {
            self.ack_delivery(now, out);
        }
    }

    /// Hands in-order data to the consumer, splicing on any queued data that
    /// now continues it. Returns how many bytes of `data` fit the window.
    fn deliver(&mut self, data: &[u8], out: &mut Outbox) -> usize {
        let take = data.len().min(usize::from(self.rcv.wnd.window()));

        if take == 0 {
            return 0;
        }

        self.accept_in_order(&data[..take], out);

        if take == data.len() {
            if let Some(queued) = self.ooo.take_contiguous(self.rcv.nxt) {
                let n = queued.len().min(usize::from(self.rcv.wnd.window()));

                if n > 0 {
                    self.accept_in_order(&queued[..n], out);
                }
            }

            if self.ooo.is_empty() {
                self.timers.cancel(TimerKind::Reassembly);
            }
        }

        take
    }

    fn accept_in_order(&mut self, data: &[u8], out: &mut Outbox) {
        self.rcv.nxt += data.len() as u32;

        // Callers never pass more than the window holds.
        let _ = self.rcv.wnd.update(-(data.len() as i32));

        out.delivered.push(data.to_vec());
    }

    /// Acknowledges delivered data, delaying the ACK while the window is
    /// short.
    fn ack_delivery(&mut self, now: Instant, out: &mut Outbox) {
        if self.rcv.wnd.is_short(self.mss) {
            self.timers
                .arm_if_idle(TimerKind::DelayedAck, now + self.config.ack_delay);
        } else {
            self.send_ack(out);
        }
    }

    fn on_fin(&mut self, now: Instant, out: &mut Outbox) {
        self.rcv.nxt += 1;
        self.send_ack(out);

        match self.state {
            ConnectionState::ESTABLISHED => {
                self.set_state(ConnectionState::CLOSE_WAIT, "received FIN");
            }
            ConnectionState::FIN_WAIT_1 => {
                // Our FIN is not acknowledged yet, otherwise we would be in
                // FIN_WAIT_2 by now.
                self.set_state(ConnectionState::CLOSING, "received FIN");
            }
            ConnectionState::FIN_WAIT_2 => {
                self.enter_time_wait(now, "received FIN");
            }
            _ => {}
        }
    }

    /// Transmits queued data as the window and Nagle's algorithm allow.
    fn send_queued_data(&mut self, now: Instant, out: &mut Outbox) {
        // Nothing new goes out until the resent data is acknowledged.
        if self.mode == DataMode::Resend {
            return;
        }

        while !self.send_buf.nagle_defers(self.mss) {
            let Some((offset, chunk)) = self.send_buf.next_chunk(self.mss) else {
                break;
            };

            let seq = self.snd.una + offset;
            self.snd.max = self.snd.max.max_wrapped(seq + chunk.len() as u32);

            out.segments
                .push(self.segment(seq, Flags::PSH | Flags::ACK, &chunk));
        }

        if self.send_buf.unacked() > 0 {
            self.timers
                .arm_if_idle(TimerKind::Retransmit, now + self.rto.get());
        }
    }

    fn send_fin(&mut self, now: Instant, out: &mut Outbox) {
        // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=FIN,ACK>
        let fin = self.segment(self.snd_nxt(), Flags::FIN | Flags::ACK, &[]);

        self.snd.una += 1;
        self.snd.max = self.snd.max.max_wrapped(self.snd.una);
        self.fin_sent = true;
        self.close_pending = false;

        self.transmit_control(fin, now, out);
        self.timers
            .arm(TimerKind::Fin, now + self.config.fin_timeout());

        let next = if self.state == ConnectionState::CLOSE_WAIT {
            ConnectionState::LAST_ACK
        } else {
            ConnectionState::FIN_WAIT_1
        };

        self.set_state(next, "sent FIN");
    }

    fn on_control_timeout(&mut self, now: Instant, out: &mut Outbox) {
        match self.control.on_expiry() {
            ControlExpiry::Idle => {}
            ControlExpiry::Resend(mut seg) => {
                if seg.tcp.ack() {
                    seg.tcp.set_ack_number(self.rcv.nxt);
                }

                let attempt = match self.control.retry() {
                    ControlRetry::Retrying { retries_left } => {
                        self.config.max_retries - retries_left
                    }
                    ControlRetry::Idle => 0,
                };

                warn!(
                    "[{}] ({:?}) retransmitting {} (seq {}), attempt {}/{}",
                    self.sock,
                    self.state,
                    seg.flags(),
                    seg.seq(),
                    attempt,
                    self.config.max_retries
                );

                out.segments.push(seg);
                self.timers.arm(
                    TimerKind::Control,
                    now + self.rto.backoff(attempt, self.config.max_retries),
                );
            }
            ControlExpiry::Exhausted => {
                warn!(
                    "[{}] ({:?}) control segment retries exhausted: {:?} -> CLOSED",
                    self.sock, self.state, self.state
                );

                let reason = CloseReason::Timeout(Timeout::Retransmission);
                if self.state == ConnectionState::SYN_SENT {
                    self.terminate(reason, out);
                } else {
                    self.reset(reason, out);
                }
            }
        }
    }

    fn on_retransmit_timeout(&mut self, now: Instant, out: &mut Outbox) {
        if self.retries >= self.config.max_retries {
            warn!(
                "[{}] ({:?}) data retransmission limit reached: {:?} -> CLOSED",
                self.sock, self.state, self.state
            );

            self.reset(CloseReason::Timeout(Timeout::Retransmission), out);
            return;
        }

        if self.send_buf.total() == 0 {
            self.mode = DataMode::Send;
            return;
        }

        self.mode = DataMode::Resend;
        self.send_buf.rewind();

        let Some((offset, chunk)) = self.send_buf.next_chunk(self.mss) else {
            // The window closed; the persist timer takes over.
            self.mode = DataMode::Send;
            return;
        };

        self.retries += 1;

        let seq = self.snd.una + offset;

        warn!(
            "[{}] ({:?}) retransmitting {} bytes at {}, attempt {}/{}",
            self.sock,
            self.state,
            chunk.len(),
            seq,
            self.retries,
            self.config.max_retries
        );

        out.segments
            .push(self.segment(seq, Flags::PSH | Flags::ACK, &chunk));

        self.timers.arm(
            TimerKind::Retransmit,
            now + self.rto.backoff(self.retries, self.config.max_retries),
        );
    }

    fn on_persist_timeout(&mut self, now: Instant, out: &mut Outbox) {
        if self.send_buf.window() != 0
            || !matches!(
                self.state,
                ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT
            )
        {
            return;
        }

        let probe = match self.send_buf.probe_byte() {
            Some(byte) => {
                let seq = self.snd_nxt();
                self.snd.max = self.snd.max.max_wrapped(seq + 1);

                self.segment(seq, Flags::PSH | Flags::ACK, &[byte])
            }
            // Nothing queued: an old sequence number still draws an ACK
            // carrying the current window.
            None => self.segment(self.snd.una - 1, Flags::ACK, &[]),
        };

        debug!(
            "[{}] ({:?}) zero window, sending probe at {}",
            self.sock,
            self.state,
            probe.seq()
        );

        out.segments.push(probe);

        self.rto.derive();
        self.timers
            .arm(TimerKind::Persist, now + self.rto.get());
    }

    /// Records the peer's connection options from its `SYN`.
    fn negotiate(&mut self, syn: &TcpHeader) {
        // A zero MSS would stall the sender; treat it as absent.
        let peer_mss = syn
            .options()
            .mss()
            .filter(|&mss| mss > 0)
            .unwrap_or(DEFAULT_TCP_MSS);
        self.mss = peer_mss.min(self.config.mss);

        // Scaling applies only when both sides offered it.
        if let (Some(ours), Some(theirs)) =
            (self.config.window_scale, syn.options().window_scale())
        {
            self.snd.wnd_shift = theirs;
            self.rcv.wnd_shift = ours;
        }

        self.send_buf.set_window(u32::from(syn.window()));
        self.snd.wl1 = syn.seq_number();
        self.snd.wl2 = if syn.ack() {
            syn.ack_number()
        } else {
            self.snd.iss
        };
    }

    fn syn_ack(&self, offer_scale: bool) -> Result<TcpSegment> {
        let mut syn_ack = TcpHeader::new(
            self.sock.src.port,
            self.sock.dst.port,
            self.snd.iss,
            Flags::SYN | Flags::ACK,
            self.rcv.wnd.window(),
        );

        // Acknowledge the peer's SYN.
        syn_ack.set_ack_number(self.rcv.nxt);
        syn_ack.set_option_mss(self.config.mss)?;

        if let (true, Some(shift)) = (offer_scale, self.config.window_scale) {
            syn_ack.set_option_window_scale(shift)?;
        }

        Ok(TcpSegment::new(syn_ack, &[]))
    }

    /// Builds a segment from this end, acknowledging `RCV.NXT` if `flags`
    /// carries `ACK`.
    fn segment(&self, seq: SeqNumber, flags: Flags, payload: &[u8]) -> TcpSegment {
        let mut tcph = TcpHeader::new(
            self.sock.src.port,
            self.sock.dst.port,
            seq,
            flags,
            self.rcv.wnd.advertised(self.rcv.wnd_shift),
        );

        if flags.contains(Flags::ACK) {
            tcph.set_ack_number(self.rcv.nxt);
        }

        TcpSegment::new(tcph, payload)
    }

    fn rst(&self, seq: SeqNumber, ack: Option<SeqNumber>) -> TcpSegment {
        let mut rst = TcpHeader::new(self.sock.src.port, self.sock.dst.port, seq, Flags::RST, 0);

        if let Some(ack) = ack {
            rst.set_flags(Flags::RST | Flags::ACK);
            rst.set_ack_number(ack);
        }

        TcpSegment::new(rst, &[])
    }

    fn send_ack(&mut self, out: &mut Outbox) {
        self.timers.cancel(TimerKind::DelayedAck);

        // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
        out.segments
            .push(self.segment(self.snd_nxt(), Flags::ACK, &[]));
    }

    fn answer_dup_syn(&mut self, out: &mut Outbox) {
        debug!(
            "[{}] ({:?}) received retransmitted SYN",
            self.sock, self.state
        );

        if self.state == ConnectionState::SYN_RECEIVED {
            if let Some(head) = self.control.head() {
                out.segments.push(head.clone());
                return;
            }
        }

        self.send_ack(out);
    }

    /// Transmits a `SYN` or `FIN` bearing segment and keeps it for
    /// retransmission.
    fn transmit_control(&mut self, seg: TcpSegment, now: Instant, out: &mut Outbox) {
        debug_assert!(ControlQueue::tracks(seg.flags()));

        if self.control.push(seg.clone(), self.config.max_retries) {
            self.timers
                .arm(TimerKind::Control, now + self.rto.get());
        }

        out.segments.push(seg);
    }

    /// Raises a backpressure event when writability changes.
    fn update_permit(&mut self, out: &mut Outbox) {
        let full = self.send_buf.is_full() || self.send_buf.room() == 0;

        if full != self.window_full {
            self.window_full = full;
            out.events.push(if full {
                Event::WindowFull
            } else {
                Event::WindowOpen
            });
        }
    }

    fn enter_time_wait(&mut self, now: Instant, event: &str) {
        self.timers.cancel_all();
        self.control.clear();
        self.send_buf.clear();
        self.ooo.clear();

        self.timers
            .arm(TimerKind::TimeWait, now + self.config.time_wait);

        self.set_state(ConnectionState::TIME_WAIT, event);
    }

    /// Sends `RST` and closes.
    fn reset(&mut self, reason: CloseReason, out: &mut Outbox) {
        // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=RST,ACK>
        out.segments
            .push(self.rst(self.snd.max, Some(self.rcv.nxt)));

        self.terminate(reason, out);
    }

    /// Moves to `CLOSED`, cancelling every timer and flushing every buffer.
    fn terminate(&mut self, reason: CloseReason, out: &mut Outbox) {
        self.timers.cancel_all();
        self.control.clear();
        self.send_buf.clear();
        self.ooo.clear();

        self.close_pending = false;
        self.window_full = false;
        self.reason = Some(reason);
        self.state = ConnectionState::CLOSED;

        out.events.push(Event::Closed(reason));
    }

    fn set_state(&mut self, next: ConnectionState, event: &str) {
        debug!(
            "[{}] ({:?}) {event}: {:?} -> {:?}",
            self.sock, self.state, self.state, next
        );

        self.state = next;
    }
}

/// Logs an incoming TCP segment (debug builds only).
#[cfg(debug_assertions)]
fn log_segment(sock: &Socket, seg: &TcpSegment) {
    let tcph = &seg.tcp;

    trace!(
        "[{}] received tcp segment | seq num: {}, ack num: {}, flags: {}, window: {}, mss: {:?}, wscale: {:?}, {} bytes of payload",
        sock,
        tcph.seq_number(),
        tcph.ack_number(),
        tcph.flags(),
        tcph.window(),
        tcph.options().mss(),
        tcph.options().window_scale(),
        seg.payload.len()
    );
}

#[cfg(not(debug_assertions))]
fn log_segment(_: &Socket, _: &TcpSegment) {}
