//! Platform-specific readiness polling.
//!
//! One [`Poller`] owns one OS poll handle and drives one event loop on a
//! dedicated thread. Owners register fds for read readiness, toggle write
//! interest, and wake the loop across threads with
//! [`Poller::trigger`]. The concrete backend is selected at compile time:
//! epoll plus an eventfd trigger on Linux, kqueue plus an `EVFILT_USER`
//! trigger on BSD/Darwin.

use rivet_rpc_core::error::Error;
use std::os::fd::RawFd;

/// Callbacks fired by the event loop, set once at [`Poller::run_loop`].
///
/// All of them run on the loop thread and must not block; spurious wakes
/// produce no callbacks. A readable-and-writable event is delivered as two
/// separate callbacks in unspecified order.
pub trait PollEvents: Send + Sync + 'static {
    fn on_error(&self, err: Error);

    /// A cross-thread [`Poller::trigger`] fired.
    fn on_trigger(&self);

    fn on_fd_read(&self, fd: RawFd);

    fn on_fd_write(&self, fd: RawFd);

    /// Error/hangup condition on `fd`.
    fn on_fd_close(&self, fd: RawFd);
}

pub(crate) const POLL_EVENT_CAP: usize = 128;

const STATUS_CLOSED: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_CLOSING: u8 = 2;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::Poller;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountEvents {
        triggers: AtomicUsize,
        errors: AtomicUsize,
    }

    impl PollEvents for CountEvents {
        fn on_error(&self, _err: Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_trigger(&self) {
            self.triggers.fetch_add(1, Ordering::SeqCst);
        }
        fn on_fd_read(&self, _fd: RawFd) {}
        fn on_fd_write(&self, _fd: RawFd) {}
        fn on_fd_close(&self, _fd: RawFd) {}
    }

    #[test]
    fn test_trigger_and_close() {
        let poller = Arc::new(Poller::new().expect("poller"));
        let events = Arc::new(CountEvents::default());
        let p = poller.clone();
        let ev = events.clone();
        let th = std::thread::spawn(move || {
            p.run_loop(ev.as_ref());
        });
        // Triggers from a foreign thread wake the loop.
        for _ in 0..3 {
            poller.trigger().expect("trigger");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(events.triggers.load(Ordering::SeqCst) >= 1);
        poller.close().expect("close");
        th.join().unwrap();
        // Second close reports not running.
        assert!(poller.close().is_err());
    }
}
