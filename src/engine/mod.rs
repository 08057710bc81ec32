//! The connection engine: owns every connection, routes incoming segments to
//! them, runs their timers, and hands their output to the collaborators.
//!
//! Each connection's [TCB] sits behind its own lock. Segments a call produces
//! are transmitted while that lock is held, so they reach the [Output] in
//! order; payload and close notices are handed to the [Consumer] only after
//! the lock is released.

mod permit;
mod pool;
mod wheel;
mod worker;

pub use pool::ConnectionId;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::Config;
use crate::error::Timeout;
use crate::protocol::headers::{Flags, TcpHeader};
use crate::protocol::{
    CloseReason, ConnectionState, Event, IsnGenerator, Outbox, Socket, SocketAddr, TCB,
    TcpSegment,
};
use crate::{Error, Result};

use permit::TxPermit;
use pool::Pool;
use wheel::TimerWheel;
use worker::Waker;

/// Transmits segments on behalf of the engine.
///
/// Implementations frame the segment for the network layer (addresses,
/// checksum) and must not call back into the engine.
pub trait Output: Send + Sync {
    /// Sends `segment` from `socket.src` to `socket.dst`.
    fn send_segment(&self, socket: &Socket, segment: &TcpSegment) -> io::Result<()>;
}

/// Receives what connections deliver to the application.
///
/// Called without any connection lock held, so implementations may call back
/// into the engine.
pub trait Consumer: Send + Sync {
    /// In-order payload received on `id`.
    fn deliver(&self, id: ConnectionId, data: Vec<u8>);

    /// `id` reached `CLOSED`.
    fn closed(&self, id: ConnectionId, reason: CloseReason);
}

/// Connection record stored in the pool.
struct Connection {
    tcb: Mutex<TCB>,
    /// Protocol and application references still held.
    refs: AtomicUsize,
    protocol_ref: AtomicBool,
    app_ref: AtomicBool,
    /// Signalled when the handshake completes or fails.
    established: Condvar,
    permit: TxPermit,
    /// Listener a passively opened connection is accepted through.
    listener: Option<SocketAddr>,
}

impl Connection {
    /// Passively opened records hold no application reference until they
    /// are taken off their listener's backlog.
    fn new(tcb: TCB, listener: Option<SocketAddr>) -> Self {
        let active = listener.is_none();

        Self {
            tcb: Mutex::new(tcb),
            refs: AtomicUsize::new(if active { 2 } else { 1 }),
            protocol_ref: AtomicBool::new(true),
            app_ref: AtomicBool::new(active),
            established: Condvar::new(),
            permit: TxPermit::new(),
            listener,
        }
    }
}

/// Passive endpoint and its queue of established, unaccepted connections.
#[derive(Debug)]
struct Listener {
    backlog: Mutex<VecDeque<ConnectionId>>,
    ready: Condvar,
    open: AtomicBool,
}

/// State shared between the engine handle and the timer worker.
struct Inner {
    config: Arc<Config>,
    pool: Pool<Connection>,
    sockets: Mutex<HashMap<Socket, ConnectionId>>,
    listeners: Mutex<HashMap<SocketAddr, Arc<Listener>>>,
    isn: IsnGenerator,
    wheel: Mutex<TimerWheel>,
    output: Arc<dyn Output>,
    consumer: Arc<dyn Consumer>,
    waker: Option<Arc<Waker>>,
    shutdown: AtomicBool,
}

/// Reliable-transport engine.
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use tcp_engine::link::{Collector, Link};
/// use tcp_engine::{Config, Engine};
///
/// # fn main() -> tcp_engine::Result<()> {
/// let link = Arc::new(Link::new());
/// let inbox = Arc::new(Collector::new());
/// let engine = Engine::new(Config::default(), link.clone(), inbox)?;
///
/// let id = engine.open(([10, 0, 0, 1], 4000).into(), ([10, 0, 0, 2], 80).into())?;
/// engine.wait_writable(id, Duration::from_secs(1))?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("connections", &self.inner.pool.len())
            .field("capacity", &self.inner.pool.capacity())
            .field("timers", &self.inner.wheel.lock().len())
            .field("threaded", &self.worker.is_some())
            .finish()
    }
}

impl Engine {
    /// Creates an engine whose timers are fired by a dedicated worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the worker could not be
    /// started.
    pub fn new(
        config: Config,
        output: Arc<dyn Output>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Self> {
        let waker = Arc::new(Waker::new()?);
        let inner = Arc::new(Inner::new(config, output, consumer, Some(Arc::clone(&waker)))?);

        let worker = worker::spawn(Arc::clone(&inner), waker)?;

        info!(
            "engine started: {} connection slots, timer worker running",
            inner.pool.capacity()
        );

        Ok(Self {
            inner,
            worker: Some(worker),
        })
    }

    /// Creates an engine without a timer thread. Timers only fire when
    /// [Engine::poll_timers] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn with_manual_timers(
        config: Config,
        output: Arc<dyn Output>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner::new(config, output, consumer, None)?);

        Ok(Self {
            inner,
            worker: None,
        })
    }

    /// Returns the engine's configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts an active open from `local` to `remote` without waiting for
    /// the handshake to finish.
    ///
    /// # Errors
    ///
    /// - [Error::Parse] if the addresses belong to different families.
    /// - [Error::AddrInUse] if a connection with the same endpoints exists.
    /// - [Error::Exhausted] if the pool is full.
    pub fn open(&self, local: SocketAddr, remote: SocketAddr) -> Result<ConnectionId> {
        let socket = Socket::new(local, remote)?;
        let now = Instant::now();
        let inner = &self.inner;

        let mut sockets = inner.sockets.lock();

        if sockets.contains_key(&socket) {
            return Err(Error::AddrInUse(local));
        }

        let iss = inner.isn.generate(&socket, now);
        let mut out = Outbox::new();
        let tcb = TCB::open_active(socket, iss, Arc::clone(&inner.config), now, &mut out)?;

        let (id, conn) = inner.pool.insert(Connection::new(tcb, None))?;
        sockets.insert(socket, id);
        drop(sockets);

        debug!("[{socket}] connection {id} allocated (active open)");

        inner.settle(id, &conn, conn.tcb.lock(), out);

        Ok(id)
    }

    /// Opens a connection and blocks until it is established.
    ///
    /// # Errors
    ///
    /// Fails like [Engine::open], with the error that closed the connection
    /// if the handshake fails, or with [Error::TimedOut] if it does not
    /// finish within `timeout` (the connection is then aborted).
    pub fn connect(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        timeout: Duration,
    ) -> Result<ConnectionId> {
        let id = self.open(local, remote)?;
        let conn = self.inner.lookup(id)?;

        let deadline = Instant::now() + timeout;
        let mut tcb = conn.tcb.lock();

        loop {
            match tcb.state() {
                ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED => {}
                ConnectionState::CLOSED => {
                    let err = tcb.closed_error();
                    drop(tcb);

                    self.inner.release_app(id, &conn);
                    return Err(err);
                }
                _ => return Ok(id),
            }

            if conn.established.wait_until(&mut tcb, deadline).timed_out()
                && matches!(
                    tcb.state(),
                    ConnectionState::SYN_SENT | ConnectionState::SYN_RECEIVED
                )
            {
                warn!(
                    "[{}] ({:?}) gave up waiting for connection establishment",
                    tcb.socket(),
                    tcb.state()
                );

                let mut out = Outbox::new();
                tcb.abort(&mut out);
                self.inner.settle(id, &conn, tcb, out);
                self.inner.release_app(id, &conn);

                return Err(Error::TimedOut(Timeout::Connect));
            }
        }
    }

    /// Accepts connection requests addressed to `local`.
    ///
    /// # Errors
    ///
    /// Returns [Error::AddrInUse] if a listener is already registered.
    pub fn listen(&self, local: SocketAddr) -> Result<()> {
        let mut listeners = self.inner.listeners.lock();

        if listeners.contains_key(&local) {
            return Err(Error::AddrInUse(local));
        }

        listeners.insert(
            local,
            Arc::new(Listener {
                backlog: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
                open: AtomicBool::new(true),
            }),
        );

        info!("listening on {local}");

        Ok(())
    }

    /// Stops listening on `local`, aborting connections that were
    /// established but never accepted.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if nothing listens on `local`.
    pub fn unlisten(&self, local: SocketAddr) -> Result<()> {
        let listener = self
            .inner
            .listeners
            .lock()
            .remove(&local)
            .ok_or(Error::InvalidInput("no listener bound to address"))?;

        listener.open.store(false, Ordering::Release);
        listener.ready.notify_all();

        let backlog: Vec<_> = listener.backlog.lock().drain(..).collect();

        for id in backlog {
            self.inner.abort_unclaimed(id);
        }

        info!("stopped listening on {local}");

        Ok(())
    }

    /// Waits up to `timeout` for an established connection on `local`.
    /// Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if nothing listens on `local`, or
    /// [Error::NotConnected] if the listener is removed while waiting.
    pub fn accept(&self, local: SocketAddr, timeout: Duration) -> Result<Option<ConnectionId>> {
        let listener = self.inner.listener(local)?;

        let deadline = Instant::now() + timeout;
        let mut backlog = listener.backlog.lock();

        loop {
            if let Some(id) = self.inner.claim(&mut backlog) {
                return Ok(Some(id));
            }

            if !listener.open.load(Ordering::Acquire) {
                return Err(Error::NotConnected);
            }

            if listener.ready.wait_until(&mut backlog, deadline).timed_out() {
                return Ok(self.inner.claim(&mut backlog));
            }
        }
    }

    /// Returns an established connection on `local` if one is waiting.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if nothing listens on `local`.
    pub fn try_accept(&self, local: SocketAddr) -> Result<Option<ConnectionId>> {
        let listener = self.inner.listener(local)?;
        let id = self.inner.claim(&mut listener.backlog.lock());

        Ok(id)
    }

    /// Processes a raw segment (TCP header and payload) received from `src`
    /// for `dst`.
    ///
    /// # Errors
    ///
    /// Returns [Error::Parse] if the segment is malformed. The connection it
    /// belongs to, if any, is reset; other connections are unaffected.
    pub fn accept_input(&self, src: IpAddr, dst: IpAddr, segment: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let now = Instant::now();

        let seg = match TcpSegment::parse(segment) {
            Ok(seg) => seg,
            Err(err) => {
                warn!("invalid TCP segment received from {src}: {err}");

                if let Some((src_port, dst_port)) = TcpHeader::peek_ports(segment) {
                    let local = SocketAddr::new(dst, dst_port);
                    let remote = SocketAddr::new(src, src_port);

                    if let Ok(socket) = Socket::new(local, remote) {
                        inner.reset_connection(&socket);
                    }
                }

                return Err(err);
            }
        };

        // Stored from our perspective: the segment's destination is local.
        let socket = Socket::new(
            SocketAddr::new(dst, seg.tcp.dst_port()),
            SocketAddr::new(src, seg.tcp.src_port()),
        )?;

        let mut sockets = inner.sockets.lock();
        let existing = sockets.get(&socket).copied();

        if let Some(id) = existing {
            drop(sockets);

            let Some(conn) = inner.pool.get(id) else {
                return Ok(());
            };

            let mut tcb = conn.tcb.lock();
            let mut out = Outbox::new();
            let res = tcb.on_segment(&seg, now, &mut out);
            inner.settle(id, &conn, tcb, out);

            return res;
        }

        let listening = inner.listeners.lock().contains_key(&socket.src);

        if !listening || seg.flags() != Flags::SYN {
            drop(sockets);
            inner.refuse(&socket, &seg);
            return Ok(());
        }

        let iss = inner.isn.generate(&socket, now);
        let mut tcb = TCB::listen(socket, iss, Arc::clone(&inner.config));
        let mut out = Outbox::new();
        tcb.on_segment(&seg, now, &mut out)?;

        let (id, conn) = match inner.pool.insert(Connection::new(tcb, Some(socket.src))) {
            Ok(allocated) => allocated,
            Err(err) => {
                warn!("[{socket}] dropping connection request: {err}");
                return Err(err);
            }
        };

        sockets.insert(socket, id);
        drop(sockets);

        debug!("[{socket}] connection {id} allocated (passive open)");

        inner.settle(id, &conn, conn.tcb.lock(), out);

        Ok(())
    }

    /// Queues `data` on `id` and transmits what the window allows. Returns
    /// the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// [Error::WouldBlock] and [Error::Exhausted] are retryable; see
    /// [Engine::wait_writable].
    pub fn send(&self, id: ConnectionId, data: &[u8]) -> Result<usize> {
        let conn = self.inner.lookup(id)?;
        let mut tcb = conn.tcb.lock();

        let mut out = Outbox::new();
        let res = tcb.send(data, Instant::now(), &mut out);
        self.inner.settle(id, &conn, tcb, out);

        res
    }

    /// Blocks until `id` can take more data or `timeout` elapses. Returns
    /// `false` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `id` is stale.
    pub fn wait_writable(&self, id: ConnectionId, timeout: Duration) -> Result<bool> {
        let conn = self.inner.lookup(id)?;

        Ok(conn.permit.wait(timeout))
    }

    /// Reports that the application consumed `n` delivered bytes of `id`,
    /// reopening the receive window by as much.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if the window would exceed its maximum.
    pub fn consume(&self, id: ConnectionId, n: usize) -> Result<()> {
        let delta =
            i32::try_from(n).map_err(|_| Error::InvalidInput("consumed length out of range"))?;

        let conn = self.inner.lookup(id)?;
        let mut tcb = conn.tcb.lock();

        let mut out = Outbox::new();
        let res = tcb.update_recv_window(delta, &mut out);
        self.inner.settle(id, &conn, tcb, out);

        res
    }

    /// Starts a graceful close of `id` and gives up the handle. Queued data
    /// is still delivered before the `FIN`.
    ///
    /// # Errors
    ///
    /// Returns the error that tore the connection down if it had already
    /// closed because of a reset or timeout. The handle is released either
    /// way.
    pub fn close(&self, id: ConnectionId) -> Result<()> {
        let conn = self.inner.lookup(id)?;
        let mut tcb = conn.tcb.lock();

        let res = match tcb.close_reason() {
            Some(reason) => reason.error().map_or(Ok(()), Err),
            None => Ok(()),
        };

        let mut out = Outbox::new();
        tcb.close(Instant::now(), &mut out);
        self.inner.settle(id, &conn, tcb, out);

        self.inner.release_app(id, &conn);

        res
    }

    /// Resets `id` at once, discarding queued data, and gives up the handle.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `id` is stale.
    pub fn abort(&self, id: ConnectionId) -> Result<()> {
        let conn = self.inner.lookup(id)?;
        let mut tcb = conn.tcb.lock();

        let mut out = Outbox::new();
        tcb.abort(&mut out);
        self.inner.settle(id, &conn, tcb, out);

        self.inner.release_app(id, &conn);

        Ok(())
    }

    /// Returns the state of `id`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `id` is stale.
    pub fn state(&self, id: ConnectionId) -> Result<ConnectionState> {
        Ok(self.inner.lookup(id)?.tcb.lock().state())
    }

    /// Returns the endpoints of `id`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `id` is stale.
    pub fn socket(&self, id: ConnectionId) -> Result<Socket> {
        Ok(*self.inner.lookup(id)?.tcb.lock().socket())
    }

    /// Enables or disables Nagle's algorithm on `id`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `id` is stale.
    pub fn set_nodelay(&self, id: ConnectionId, no_delay: bool) -> Result<()> {
        let conn = self.inner.lookup(id)?;
        let mut tcb = conn.tcb.lock();

        let mut out = Outbox::new();
        tcb.set_no_delay(no_delay, Instant::now(), &mut out);
        self.inner.settle(id, &conn, tcb, out);

        Ok(())
    }

    /// Returns `true` if Nagle's algorithm is disabled on `id`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `id` is stale.
    pub fn nodelay(&self, id: ConnectionId) -> Result<bool> {
        Ok(self.inner.lookup(id)?.tcb.lock().no_delay())
    }

    /// Returns the number of allocated connection records.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.len()
    }

    /// Fires every timer due at `now`. Returns how many fired.
    pub fn poll_timers(&self, now: Instant) -> usize {
        self.inner.poll_timers(now)
    }

    /// Returns the earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.next_deadline()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);

        if let Some(waker) = &self.inner.waker {
            waker.wake();
        }

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("timer worker panicked");
            }
        }

        debug!(
            "engine stopped, connections remaining: {}",
            self.inner.pool.ids().len()
        );
    }
}

impl Inner {
    fn new(
        config: Config,
        output: Arc<dyn Output>,
        consumer: Arc<dyn Consumer>,
        waker: Option<Arc<Waker>>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            pool: Pool::with_capacity(config.max_connections),
            isn: IsnGenerator::new(config.isn),
            config: Arc::new(config),
            sockets: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            wheel: Mutex::new(TimerWheel::new()),
            output,
            consumer,
            waker,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Returns the connection behind an application handle.
    fn lookup(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        self.pool
            .get(id)
            .filter(|conn| conn.app_ref.load(Ordering::Acquire))
            .ok_or(Error::InvalidHandle)
    }

    /// Pops the next live connection off a listener's backlog and gives the
    /// application its reference. Runs under the backlog lock, which a
    /// closing connection also takes before dropping its last reference.
    fn claim(&self, backlog: &mut VecDeque<ConnectionId>) -> Option<ConnectionId> {
        while let Some(id) = backlog.pop_front() {
            let Some(conn) = self.pool.get(id) else {
                continue;
            };

            let live = conn
                .refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                    (refs > 0).then_some(refs + 1)
                })
                .is_ok();

            if live {
                conn.app_ref.store(true, Ordering::Release);
                return Some(id);
            }
        }

        None
    }

    /// Resets a passively opened connection nobody accepted.
    fn abort_unclaimed(&self, id: ConnectionId) {
        let Some(conn) = self.pool.get(id) else {
            return;
        };

        let mut tcb = conn.tcb.lock();
        let mut out = Outbox::new();
        tcb.abort(&mut out);
        self.settle(id, &conn, tcb, out);
    }

    fn listener(&self, local: SocketAddr) -> Result<Arc<Listener>> {
        self.listeners
            .lock()
            .get(&local)
            .cloned()
            .ok_or(Error::InvalidInput("no listener bound to address"))
    }

    /// Applies the side effects of a call into `tcb`, releasing its lock
    /// before anything reaches the consumer.
    fn settle(
        &self,
        id: ConnectionId,
        conn: &Arc<Connection>,
        mut tcb: MutexGuard<'_, TCB>,
        out: Outbox,
    ) {
        let socket = *tcb.socket();

        for seg in &out.segments {
            if let Err(err) = self.output.send_segment(&socket, seg) {
                error!("[{socket}] failed to send segment: {err}");
            }
        }

        let armed = tcb.take_armed_timers();
        drop(tcb);

        if !armed.is_empty() {
            let earliest = {
                let mut wheel = self.wheel.lock();
                armed
                    .into_iter()
                    .fold(false, |acc, (kind, deadline)| {
                        wheel.schedule(id, kind, deadline) || acc
                    })
            };

            if earliest {
                if let Some(waker) = &self.waker {
                    waker.wake();
                }
            }
        }

        for data in out.delivered {
            self.consumer.deliver(id, data);
        }

        for event in out.events {
            self.on_event(id, conn, &socket, event);
        }
    }

    fn on_event(&self, id: ConnectionId, conn: &Arc<Connection>, socket: &Socket, event: Event) {
        match event {
            Event::Connected => {
                conn.established.notify_all();
            }
            Event::Accepted => {
                conn.established.notify_all();

                let listener = conn
                    .listener
                    .and_then(|local| self.listeners.lock().get(&local).cloned());

                match listener {
                    Some(listener) => {
                        listener.backlog.lock().push_back(id);
                        listener.ready.notify_one();

                        debug!("[{socket}] connection {id} ready to be accepted");
                    }
                    None => {
                        warn!("[{socket}] listener went away, aborting connection {id}");

                        self.abort_unclaimed(id);
                    }
                }
            }
            Event::WindowFull => conn.permit.take(),
            Event::WindowOpen => conn.permit.give(),
            Event::Closed(reason) => {
                conn.established.notify_all();
                conn.permit.give();

                {
                    let mut sockets = self.sockets.lock();
                    if sockets.get(socket) == Some(&id) {
                        sockets.remove(socket);
                    }
                }

                if !conn.app_ref.load(Ordering::Acquire) {
                    self.unqueue(id, conn);
                }

                debug!("[{socket}] connection {id} closed: {reason}");

                self.consumer.closed(id, reason);

                if conn.protocol_ref.swap(false, Ordering::AcqRel) {
                    self.release(id, conn);
                }
            }
        }
    }

    /// Takes a closed, unaccepted connection off its listener's backlog so
    /// that its slot can be freed.
    fn unqueue(&self, id: ConnectionId, conn: &Connection) {
        let listener = conn
            .listener
            .and_then(|local| self.listeners.lock().get(&local).cloned());

        if let Some(listener) = listener {
            listener.backlog.lock().retain(|&queued| queued != id);
        }
    }

    fn release_app(&self, id: ConnectionId, conn: &Arc<Connection>) {
        if conn.app_ref.swap(false, Ordering::AcqRel) {
            self.release(id, conn);
        }
    }

    /// Drops one reference; the last one frees the slot.
    fn release(&self, id: ConnectionId, conn: &Arc<Connection>) {
        if conn.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        // Both references are gone only once the connection is CLOSED, which
        // cancels every timer.
        debug_assert!(!conn.tcb.lock().timers().any_armed());

        if self.pool.remove(id).is_some() {
            debug!(
                "connection {id} released, active connections remaining: {}",
                self.pool.len()
            );
        }
    }

    /// Resets the connection on `socket` after it sent a malformed segment.
    fn reset_connection(&self, socket: &Socket) {
        let Some(id) = self.sockets.lock().get(socket).copied() else {
            return;
        };

        let Some(conn) = self.pool.get(id) else {
            return;
        };

        let mut tcb = conn.tcb.lock();
        let mut out = Outbox::new();
        tcb.reset_on_violation(&mut out);
        self.settle(id, &conn, tcb, out);
    }

    /// Answers a segment that matches no connection.
    fn refuse(&self, socket: &Socket, seg: &TcpSegment) {
        if seg.tcp.rst() || !seg.tcp.ack() {
            debug!("[{socket}] segment for unknown connection: ignoring");
            return;
        }

        // <SEQ=SEG.ACK><CTL=RST>
        let rst = TcpHeader::new(
            socket.src.port,
            socket.dst.port,
            seg.tcp.ack_number(),
            Flags::RST,
            0,
        );

        debug!("[{socket}] segment for unknown connection: sending RST");

        if let Err(err) = self
            .output
            .send_segment(socket, &TcpSegment::new(rst, &[]))
        {
            error!("[{socket}] failed to send RST: {err}");
        }
    }

    fn poll_timers(&self, now: Instant) -> usize {
        let expired = self.wheel.lock().pop_expired(now);
        let mut fired = 0;

        for (id, kind) in expired {
            let Some(conn) = self.pool.get(id) else {
                continue;
            };

            let mut tcb = conn.tcb.lock();

            if tcb.timers().deadline(kind).is_some_and(|deadline| deadline <= now) {
                fired += 1;
            }

            let mut out = Outbox::new();
            tcb.on_timer(kind, now, &mut out);
            self.settle(id, &conn, tcb, out);
        }

        fired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.wheel.lock().next_deadline()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;
    use crate::error::{Pending, Resource};
    use crate::link::{Collector, Link};
    use crate::protocol::SeqNumber;

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn config() -> Config {
        Config {
            rto_jitter: false,
            ..Config::default()
        }
    }

    fn client_addr(port: u16) -> SocketAddr {
        SocketAddr::from((CLIENT, port))
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from((SERVER, 80))
    }

    struct Net {
        link: Arc<Link>,
        client: Engine,
        client_inbox: Arc<Collector>,
        server: Engine,
        server_inbox: Arc<Collector>,
    }

    impl Net {
        fn new(link: Link, config: Config) -> Self {
            let link = Arc::new(link);
            let client_inbox = Arc::new(Collector::new());
            let server_inbox = Arc::new(Collector::new());

            let client =
                Engine::with_manual_timers(config.clone(), link.clone(), client_inbox.clone())
                    .unwrap();
            let server =
                Engine::with_manual_timers(config, link.clone(), server_inbox.clone()).unwrap();

            server.listen(server_addr()).unwrap();

            Self {
                link,
                client,
                client_inbox,
                server,
                server_inbox,
            }
        }

        fn pump(&self) {
            self.link.pump(&[
                (IpAddr::from(CLIENT), &self.client),
                (IpAddr::from(SERVER), &self.server),
            ]);
        }

        fn establish(&self, port: u16) -> (ConnectionId, ConnectionId) {
            let a = self.client.open(client_addr(port), server_addr()).unwrap();
            self.pump();

            let b = self.server.try_accept(server_addr()).unwrap().unwrap();

            assert_eq!(self.client.state(a).unwrap(), ConnectionState::ESTABLISHED);
            assert_eq!(self.server.state(b).unwrap(), ConnectionState::ESTABLISHED);

            (a, b)
        }
    }

    #[test]
    fn handshake_and_transfer() {
        let net = Net::new(Link::new(), config());
        let (a, b) = net.establish(4000);

        assert_eq!(net.client.connection_count(), 1);
        assert_eq!(net.server.connection_count(), 1);
        assert_eq!(net.server.socket(b).unwrap().dst, client_addr(4000));

        assert_eq!(net.client.send(a, b"ping").unwrap(), 4);
        net.pump();
        assert_eq!(net.server_inbox.take(b), b"ping");

        assert_eq!(net.server.send(b, b"pong").unwrap(), 4);
        net.pump();
        assert_eq!(net.client_inbox.take(a), b"pong");
    }

    #[test]
    fn transfer_survives_reordering_and_duplication() {
        let net = Net::new(Link::with_faults(7, 0.3, 0.2), config());
        let (a, b) = net.establish(4001);
        net.client.set_nodelay(a, true).unwrap();
        assert!(net.client.nodelay(a).unwrap());

        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut sent = 0;
        let mut consumed = 0;

        for _ in 0..100 {
            if sent == data.len() {
                break;
            }

            match net.client.send(a, &data[sent..(sent + 700).min(data.len())]) {
                Ok(n) => sent += n,
                Err(err) => assert!(err.is_retryable(), "{err}"),
            }

            net.pump();

            let received = net.server_inbox.len(b);
            net.server.consume(b, received - consumed).unwrap();
            consumed = received;
        }

        assert_eq!(sent, data.len());

        // Reordered segments may still be waiting on a retransmission.
        for _ in 0..20 {
            if net.server_inbox.len(b) == data.len() {
                break;
            }

            let Some(deadline) = net.client.next_deadline() else {
                break;
            };
            net.client.poll_timers(deadline);
            net.pump();
        }

        assert_eq!(net.server_inbox.peek(b), data);
    }

    #[test]
    fn graceful_close_releases_both_ends() {
        let net = Net::new(Link::new(), config());
        let (a, b) = net.establish(4002);

        net.client.close(a).unwrap();
        net.pump();
        assert_eq!(net.server.state(b).unwrap(), ConnectionState::CLOSE_WAIT);

        net.server.close(b).unwrap();
        net.pump();

        // The passive side is gone; the active side lingers in TIME_WAIT.
        assert_eq!(net.server.connection_count(), 0);
        assert_eq!(net.server_inbox.closed_reason(b), Some(CloseReason::Normal));
        assert_eq!(net.client.connection_count(), 1);

        // Earlier, cancelled expiries are still queued ahead of TIME_WAIT.
        let mut fired = 0;
        while let Some(deadline) = net.client.next_deadline() {
            fired += net.client.poll_timers(deadline);
        }
        assert_eq!(fired, 1);

        assert_eq!(net.client.connection_count(), 0);
        assert_eq!(net.client_inbox.closed_reason(a), Some(CloseReason::Normal));
        assert_matches!(net.client.state(a), Err(Error::InvalidHandle));
    }

    #[test]
    fn abort_resets_peer() {
        let net = Net::new(Link::new(), config());
        let (a, b) = net.establish(4003);

        net.client.abort(a).unwrap();
        net.pump();

        assert_eq!(net.client.connection_count(), 0);
        assert_eq!(net.server_inbox.closed_reason(b), Some(CloseReason::Reset));
        assert_matches!(net.server.send(b, b"late"), Err(Error::Reset));

        // The handle is still owned until the application lets go of it.
        assert_eq!(net.server.connection_count(), 1);
        assert_matches!(net.server.close(b), Err(Error::Reset));
        assert_eq!(net.server.connection_count(), 0);
    }

    #[test]
    fn unknown_connection_is_refused() {
        let net = Net::new(Link::new(), config());

        let a = net.client.open(client_addr(4004), SocketAddr::from((SERVER, 81))).unwrap();
        net.pump();

        // A bare SYN to a closed port is dropped; the handshake times out.
        assert_eq!(net.client.state(a).unwrap(), ConnectionState::SYN_SENT);

        let mut syn_ack = TcpHeader::new(81, 4005, SeqNumber::new(9), Flags::SYN | Flags::ACK, 0);
        syn_ack.set_ack_number(SeqNumber::new(1234));
        let raw = TcpSegment::new(syn_ack, &[]).to_be_bytes().unwrap();

        net.client
            .accept_input(IpAddr::from(SERVER), IpAddr::from(CLIENT), &raw)
            .unwrap();

        let (socket, rst) = net.link.pop().unwrap();
        assert_eq!(socket.src, client_addr(4005));
        assert!(rst.tcp.rst());
        assert_eq!(rst.seq(), SeqNumber::new(1234));
    }

    #[test]
    fn malformed_segment_resets_its_connection() {
        let net = Net::new(Link::new(), config());
        let (a, b) = net.establish(4006);

        // Data offset of 5 words but only 12 bytes present.
        let mut raw = vec![0u8; 12];
        raw[0..2].copy_from_slice(&80u16.to_be_bytes());
        raw[2..4].copy_from_slice(&4006u16.to_be_bytes());

        assert_matches!(
            net.client
                .accept_input(IpAddr::from(SERVER), IpAddr::from(CLIENT), &raw),
            Err(Error::Parse(_))
        );

        assert_eq!(
            net.client_inbox.closed_reason(a),
            Some(CloseReason::ProtocolViolation)
        );

        net.pump();
        assert_eq!(net.server_inbox.closed_reason(b), Some(CloseReason::Reset));
    }

    #[test]
    fn address_family_mismatch_is_rejected() {
        let net = Net::new(Link::new(), config());
        let raw = TcpSegment::new(
            TcpHeader::new(1, 2, SeqNumber::new(0), Flags::SYN, 0),
            &[],
        )
        .to_be_bytes()
        .unwrap();

        assert_matches!(
            net.server.accept_input(
                IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]),
                IpAddr::from(SERVER),
                &raw
            ),
            Err(Error::Parse(crate::ParseError::AddressFamilyMismatch))
        );
    }

    #[test]
    fn pool_exhaustion_is_retryable() {
        let net = Net::new(
            Link::new(),
            Config {
                max_connections: 1,
                ..config()
            },
        );

        net.client.open(client_addr(5000), server_addr()).unwrap();

        let err = net.client.open(client_addr(5001), server_addr()).unwrap_err();
        assert_matches!(err, Error::Exhausted(Resource::ConnectionSlots));
        assert!(err.is_retryable());

        assert_matches!(
            net.client.open(client_addr(5000), server_addr()),
            Err(Error::AddrInUse(_))
        );
    }

    #[test]
    fn send_backpressure_and_permit() {
        let net = Net::new(
            Link::new(),
            Config {
                send_buffer_size: 100,
                ..config()
            },
        );
        let (a, _) = net.establish(4007);

        assert_eq!(net.client.send(a, &[1u8; 150]).unwrap(), 100);
        assert_matches!(
            net.client.send(a, &[1u8; 10]),
            Err(Error::Exhausted(Resource::SendBuffer))
        );

        // Nothing was acknowledged yet.
        assert!(!net.client.wait_writable(a, Duration::ZERO).unwrap());

        net.pump();
        assert!(net.client.wait_writable(a, Duration::ZERO).unwrap());
    }

    #[test]
    fn send_before_handshake_would_block() {
        let net = Net::new(Link::new(), config());
        let a = net.client.open(client_addr(4008), server_addr()).unwrap();

        assert_matches!(
            net.client.send(a, b"early"),
            Err(Error::WouldBlock(Pending::Connecting))
        );
    }

    #[test]
    fn handshake_timeout_reports_error() {
        let net = Net::new(Link::new(), config());
        let a = net.client.open(client_addr(4009), server_addr()).unwrap();

        // Nothing is pumped: the SYN is never answered.
        while let Some(deadline) = net.client.next_deadline() {
            net.client.poll_timers(deadline);
        }

        assert_matches!(
            net.client_inbox.closed_reason(a),
            Some(CloseReason::Timeout(_))
        );
        assert_matches!(net.client.send(a, b"x"), Err(Error::TimedOut(_)));
    }

    #[test]
    fn unaccepted_half_open_is_freed() {
        let net = Net::new(Link::new(), config());

        let syn = TcpHeader::new(4013, 80, SeqNumber::new(700), Flags::SYN, 4096);
        let raw = TcpSegment::new(syn, &[]).to_be_bytes().unwrap();

        net.server
            .accept_input(IpAddr::from(CLIENT), IpAddr::from(SERVER), &raw)
            .unwrap();
        assert_eq!(net.server.connection_count(), 1);

        // The SYN-ACK is never answered.
        while let Some(deadline) = net.server.next_deadline() {
            net.server.poll_timers(deadline);
        }

        assert_eq!(net.server.connection_count(), 0);
        assert_matches!(net.server.try_accept(server_addr()), Ok(None));
    }

    #[test]
    fn reset_before_accept_frees_backlog_slot() {
        let net = Net::new(Link::new(), config());

        let a = net.client.open(client_addr(4014), server_addr()).unwrap();
        net.pump();
        assert_eq!(net.server.connection_count(), 1);

        net.client.abort(a).unwrap();
        net.pump();

        assert_eq!(net.server.connection_count(), 0);
        assert_matches!(net.server.try_accept(server_addr()), Ok(None));

        // The freed slot takes a new connection.
        let (_, b) = net.establish(4015);
        assert_eq!(net.server.state(b).unwrap(), ConnectionState::ESTABLISHED);
    }

    #[test]
    fn unlisten_aborts_backlog() {
        let net = Net::new(Link::new(), config());

        net.client.open(client_addr(4010), server_addr()).unwrap();
        net.pump();

        net.server.unlisten(server_addr()).unwrap();
        assert_matches!(
            net.server.try_accept(server_addr()),
            Err(Error::InvalidInput(_))
        );

        net.pump();
        assert_eq!(net.server.connection_count(), 0);
        assert_eq!(net.client.connection_count(), 1);
        assert_matches!(net.server.listen(server_addr()), Ok(()));
        assert_matches!(net.server.listen(server_addr()), Err(Error::AddrInUse(_)));
    }

    #[test]
    fn blocking_connect_and_accept_with_timer_thread() {
        let link = Arc::new(Link::new());
        let client_inbox = Arc::new(Collector::new());
        let server_inbox = Arc::new(Collector::new());

        let client = Arc::new(Engine::new(config(), link.clone(), client_inbox.clone()).unwrap());
        let server = Arc::new(Engine::new(config(), link.clone(), server_inbox.clone()).unwrap());
        server.listen(server_addr()).unwrap();

        let done = Arc::new(AtomicBool::new(false));

        let pump = {
            let (link, client, server, done) =
                (link.clone(), client.clone(), server.clone(), done.clone());

            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    link.pump(&[
                        (IpAddr::from(CLIENT), &*client),
                        (IpAddr::from(SERVER), &*server),
                    ]);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let a = client
            .connect(client_addr(4011), server_addr(), Duration::from_secs(5))
            .unwrap();
        let b = server
            .accept(server_addr(), Duration::from_secs(5))
            .unwrap()
            .unwrap();

        client.send(a, b"over the wire").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while server_inbox.len(b) < 13 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(server_inbox.take(b), b"over the wire");

        done.store(true, Ordering::Release);
        pump.join().unwrap();
    }

    #[test]
    fn connect_times_out_without_peer() {
        let link = Arc::new(Link::new());
        let inbox = Arc::new(Collector::new());
        let engine = Engine::new(config(), link, inbox).unwrap();

        assert_matches!(
            engine.connect(client_addr(4012), server_addr(), Duration::from_millis(50)),
            Err(Error::TimedOut(Timeout::Connect))
        );
        assert_eq!(engine.connection_count(), 0);
    }
}
