//! Send and receive window bookkeeping.

use std::collections::VecDeque;

use crate::{Error, Result};

/// Send-side flow control: the pending-send buffer and the peer's window.
///
/// The buffer starts at the oldest unacknowledged byte. The first `unacked`
/// bytes have been transmitted at least once; the rest are waiting for window
/// space or for Nagle's algorithm to release them.
#[derive(Debug)]
pub struct SendWindow {
    /// Data queued by the application, starting at `SND.UNA`.
    buf: VecDeque<u8>,
    /// Bytes at the front of `buf` that are in flight.
    unacked: u32,
    /// Peer's advertised window after scaling and clamping.
    wnd: u32,
    /// Clamp applied to the peer's window.
    max_wnd: u32,
    /// Capacity of `buf`.
    capacity: usize,
    /// Nagle's algorithm disabled.
    no_delay: bool,
}

impl SendWindow {
    /// Creates an empty send window.
    pub fn new(max_wnd: u32, capacity: usize, no_delay: bool) -> Self {
        Self {
            buf: VecDeque::new(),
            unacked: 0,
            wnd: 0,
            max_wnd,
            capacity,
            no_delay,
        }
    }

    /// Returns the number of queued bytes, sent or not.
    pub fn total(&self) -> usize {
        self.buf.len()
    }

    /// Returns the number of bytes sent but not yet acknowledged.
    pub fn unacked(&self) -> u32 {
        self.unacked
    }

    /// Returns the peer's advertised window, after clamping.
    pub fn window(&self) -> u32 {
        self.wnd
    }

    /// Records the peer's advertised window, clamped to the configured
    /// maximum.
    pub fn set_window(&mut self, wnd: u32) {
        self.wnd = wnd.min(self.max_wnd);
    }

    /// Returns `true` if no more data may be put in flight.
    pub fn is_full(&self) -> bool {
        self.unacked >= self.wnd
    }

    /// Returns `true` if Nagle's algorithm is disabled.
    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    /// Enables or disables Nagle's algorithm.
    pub fn set_no_delay(&mut self, no_delay: bool) {
        self.no_delay = no_delay;
    }

    /// Returns how many queued bytes may be transmitted now.
    pub fn unsent(&self) -> u32 {
        if self.unacked >= self.wnd {
            return 0;
        }

        let queued = self.total() as u32 - self.unacked;
        queued.min(self.wnd - self.unacked)
    }

    /// Returns `true` if Nagle's algorithm defers the next chunk: data is
    /// already outstanding and less than a full segment is ready.
    pub fn nagle_defers(&self, mss: u16) -> bool {
        !self.no_delay && self.unacked > 0 && self.unsent() < u32::from(mss)
    }

    /// Returns the number of bytes that can still be queued.
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.total())
    }

    /// Queues as much of `data` as fits, returning the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.room());
        self.buf.extend(&data[..n]);
        n
    }

    /// Takes the next chunk to transmit, at most `mss` bytes, and marks it in
    /// flight. Returns the chunk's offset from `SND.UNA`.
    pub fn next_chunk(&mut self, mss: u16) -> Option<(u32, Vec<u8>)> {
        let len = self.unsent().min(u32::from(mss));

        if len == 0 {
            return None;
        }

        let offset = self.unacked;
        let chunk = self
            .buf
            .range(offset as usize..(offset + len) as usize)
            .copied()
            .collect();

        self.unacked += len;

        Some((offset, chunk))
    }

    /// Returns the first byte past the data in flight, for a zero-window
    /// probe. Does not mark it in flight.
    pub fn probe_byte(&self) -> Option<u8> {
        self.buf.get(self.unacked as usize).copied()
    }

    /// Drops `n` acknowledged bytes from the front of the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `n` exceeds the queued data.
    pub fn acknowledge(&mut self, n: u32) -> Result<()> {
        if n as usize > self.total() {
            return Err(Error::InvalidInput("acknowledged more data than was queued"));
        }

        self.buf.drain(..n as usize);
        self.unacked = self.unacked.saturating_sub(n);

        Ok(())
    }

    /// Forgets what was put in flight, so the next chunk starts again at
    /// `SND.UNA`.
    pub fn rewind(&mut self) {
        self.unacked = 0;
    }

    /// Discards all queued data.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.unacked = 0;
    }
}

/// Receive-side flow control: the window we advertise to the peer.
#[derive(Debug)]
pub struct RecvWindow {
    /// Bytes we can currently accept.
    wnd: u16,
    /// Initial value and ceiling of `wnd`.
    max: u16,
}

impl RecvWindow {
    /// Creates a fully open receive window.
    pub fn new(max: u16) -> Self {
        Self { wnd: max, max }
    }

    /// Returns the current receive window.
    pub fn window(&self) -> u16 {
        self.wnd
    }

    /// Returns the configured ceiling.
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Returns `true` if the window is at or below the silly-window threshold:
    /// one MSS or half the maximum, whichever is smaller.
    pub fn is_short(&self, mss: u16) -> bool {
        self.wnd <= mss.min(self.max / 2)
    }

    /// Grows (positive `delta`) or shrinks (negative `delta`) the window.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the window unchanged, if the result would
    /// fall outside `0..=max`.
    pub fn update(&mut self, delta: i32) -> Result<()> {
        let new = i32::from(self.wnd) + delta;

        if new < 0 || new > i32::from(self.max) {
            return Err(Error::InvalidInput("receive window out of range"));
        }

        self.wnd = new as u16;
        Ok(())
    }

    /// Returns the window field to advertise given our scale shift.
    pub fn advertised(&self, shift: u8) -> u16 {
        self.wnd >> shift
    }
}
