//! Timer worker: a dedicated thread that fires connection timers as they
//! come due.
//!
//! The thread sleeps in `epoll_wait()` on two file descriptors: a `timerfd`
//! armed for the earliest pending deadline, and an `eventfd` written whenever
//! an earlier deadline is scheduled or the engine shuts down.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::{io, ptr};

use log::{debug, error};

use super::Inner;
use crate::{Result, errno};

/// Total number of events returned each tick (event loop cycle).
const EPOLL_MAX_EVENTS: i32 = 2;

/// The number of milliseconds that `epoll_wait()` will block for. -1 will
/// block indefinitely until an event occurs.
const EPOLL_TIMEOUT_MS: i32 = -1;

/// Wakes the worker out of `epoll_wait()`.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd == -1 {
            return Err(errno!("failed to create event_fd"));
        }

        Ok(Self { fd })
    }

    pub(crate) fn wake(&self) {
        let x: u64 = 1;

        // A full counter already guarantees a wakeup, so errors are moot.
        let _ = unsafe { libc::write(self.fd, &raw const x as *const libc::c_void, 8) };
    }

    fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.fd);
        }
    }
}

/// Starts the worker thread.
pub(super) fn spawn(inner: Arc<Inner>, waker: Arc<Waker>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("tcp-timers".into())
        .spawn(move || {
            debug!("timer worker started");

            if let Err(err) = run(&inner, &waker) {
                error!("timer worker stopped: {err}");
            } else {
                debug!("timer worker stopped");
            }
        })?;

    Ok(handle)
}

fn run(inner: &Inner, waker: &Waker) -> Result<()> {
    let timer_fd = init_timer_fd()?;

    let epoll_fd = match init_epoll_fd([timer_fd, waker.fd()]) {
        Ok(fd) => fd,
        Err(err) => {
            unsafe {
                let _ = libc::close(timer_fd);
            }
            return Err(err);
        }
    };

    let res = event_loop(inner, timer_fd, epoll_fd);

    unsafe {
        let _ = libc::close(epoll_fd);
        let _ = libc::close(timer_fd);
    }

    res
}

fn event_loop(inner: &Inner, timer_fd: RawFd, epoll_fd: RawFd) -> Result<()> {
    // Stores events for ready file descriptors.
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; EPOLL_MAX_EVENTS as usize];

    while !inner.shutdown.load(Ordering::Acquire) {
        inner.poll_timers(Instant::now());

        let delay = inner
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        arm_timer_fd(timer_fd, delay)?;

        let rdfs = unsafe {
            libc::epoll_wait(
                epoll_fd,
                events.as_mut_ptr(),
                EPOLL_MAX_EVENTS,
                EPOLL_TIMEOUT_MS,
            )
        };

        if rdfs == -1 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }

            return Err(errno!("failed to wait on epoll"));
        }

        for event in events.iter().take(rdfs as usize) {
            // Both descriptors hold an 8-byte counter; reading clears it.
            let fd = event.u64 as RawFd;
            let mut buf = [0u8; 8];
            let _ = unsafe { libc::read(fd, &raw mut buf as *mut libc::c_void, buf.len()) };
        }
    }

    Ok(())
}

/// Creates a non-blocking, disarmed `timer_fd`.
fn init_timer_fd() -> Result<RawFd> {
    let timer_fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK) };
    if timer_fd == -1 {
        return Err(errno!("failed to create timer_fd"));
    }

    Ok(timer_fd)
}

/// Arms the timer to expire after `delay`, or disarms it.
fn arm_timer_fd(timer_fd: RawFd, delay: Option<Duration>) -> Result<()> {
    let value = match delay {
        // A zero `it_value` disarms the timer, so a due deadline waits 1ns.
        Some(delay) => libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos().max(u32::from(delay.is_zero())) as libc::c_long,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    };

    let time_spec = libc::itimerspec {
        // The interval for periodic expirations.
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        // The initial expiration time.
        it_value: value,
    };

    if unsafe { libc::timerfd_settime(timer_fd, 0, &raw const time_spec, ptr::null_mut()) } == -1 {
        return Err(errno!("failed to arm timer"));
    }

    Ok(())
}

/// Creates an `epoll_fd` and registers the given file descriptors.
fn init_epoll_fd(fds: [RawFd; 2]) -> Result<RawFd> {
    unsafe {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };

        let epoll_fd = libc::epoll_create1(0);
        if epoll_fd == -1 {
            return Err(errno!("failed to create epoll_fd"));
        }

        for fd in fds {
            ev.events = libc::EPOLLIN as u32;
            ev.u64 = fd as u64;
            // Add the file descriptor to the epoll interest list to be notified
            // on ready events.
            if libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &raw mut ev) == -1 {
                let err = errno!("failed to add to epoll interest list");
                let _ = libc::close(epoll_fd);
                return Err(err);
            }
        }

        Ok(epoll_fd)
    }
}
