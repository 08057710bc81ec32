//! Send backpressure.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Binary permit signalling that a connection can take more data.
///
/// The permit starts out available. The engine takes it when the send window
/// fills up and gives it back once an acknowledgment or window update frees
/// room, or when the connection closes.
#[derive(Debug)]
pub(crate) struct TxPermit {
    available: Mutex<bool>,
    cond: Condvar,
}

impl TxPermit {
    pub(crate) fn new() -> Self {
        Self {
            available: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn take(&self) {
        *self.available.lock() = false;
    }

    pub(crate) fn give(&self) {
        *self.available.lock() = true;
        self.cond.notify_all();
    }

    /// Blocks until the permit is available or `timeout` elapses. Returns
    /// whether the permit is available.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock();

        while !*available {
            if self.cond.wait_until(&mut available, deadline).timed_out() {
                break;
            }
        }

        *available
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn permit_wait_times_out_while_taken() {
        let permit = TxPermit::new();
        assert!(permit.wait(Duration::ZERO));

        permit.take();
        assert!(!permit.wait(Duration::ZERO));
        assert!(!permit.wait(Duration::from_millis(10)));
    }

    #[test]
    fn permit_give_wakes_waiter() {
        let permit = Arc::new(TxPermit::new());
        permit.take();

        let waiter = {
            let permit = Arc::clone(&permit);
            thread::spawn(move || permit.wait(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        permit.give();

        assert!(waiter.join().unwrap());
    }
}
