//! The kqueue backend, with `EVFILT_USER` as the user-wake trigger.

use super::{POLL_EVENT_CAP, PollEvents, STATUS_CLOSED, STATUS_CLOSING, STATUS_RUNNING};
use crate::errno_err;
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use rivet_rpc_core::error::{ERR_CONN_FD, ERR_NOT_RUNNING, Error};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

// The ident of the user trigger event; fds are never 0 here.
const TRIGGER_IDENT: usize = 0;

pub struct Poller {
    kq: Kqueue,
    status: AtomicU8,
    loop_entered: AtomicBool,
    exit: Mutex<bool>,
    exit_cond: Condvar,
}

fn kev(ident: usize, filter: EventFilter, flags: EventFlag, fflags: FilterFlag) -> KEvent {
    KEvent::new(ident as _, filter, flags, fflags, 0 as _, 0 as _)
}

impl Poller {
    pub fn new() -> Result<Self, Error> {
        let kq = Kqueue::new().map_err(|e| errno_err(&ERR_CONN_FD, "kqueue", e))?;
        let user = kev(
            TRIGGER_IDENT,
            EventFilter::EVFILT_USER,
            EventFlag::EV_ADD | EventFlag::EV_CLEAR,
            FilterFlag::empty(),
        );
        kq.kevent(&[user], &mut [], None)
            .map_err(|e| errno_err(&ERR_CONN_FD, "kevent add trigger", e))?;
        Ok(Self {
            kq,
            status: AtomicU8::new(STATUS_RUNNING),
            loop_entered: AtomicBool::new(false),
            exit: Mutex::new(false),
            exit_cond: Condvar::new(),
        })
    }

    fn change(&self, ev: KEvent, ctx: &str) -> Result<(), Error> {
        self.kq
            .kevent(&[ev], &mut [], None)
            .map(|_| ())
            .map_err(|e| errno_err(&ERR_CONN_FD, ctx, e))
    }

    pub fn register_fd(&self, fd: RawFd) -> Result<(), Error> {
        self.change(
            kev(fd as usize, EventFilter::EVFILT_READ, EventFlag::EV_ADD, FilterFlag::empty()),
            "kevent add read",
        )
    }

    pub fn unregister_fd(&self, fd: RawFd) {
        let _ = self.change(
            kev(fd as usize, EventFilter::EVFILT_READ, EventFlag::EV_DELETE, FilterFlag::empty()),
            "kevent del read",
        );
        let _ = self.change(
            kev(fd as usize, EventFilter::EVFILT_WRITE, EventFlag::EV_DELETE, FilterFlag::empty()),
            "kevent del write",
        );
    }

    pub fn add_write(&self, fd: RawFd) -> Result<(), Error> {
        self.change(
            kev(fd as usize, EventFilter::EVFILT_WRITE, EventFlag::EV_ADD, FilterFlag::empty()),
            "kevent add write",
        )
    }

    pub fn del_write(&self, fd: RawFd) -> Result<(), Error> {
        self.change(
            kev(fd as usize, EventFilter::EVFILT_WRITE, EventFlag::EV_DELETE, FilterFlag::empty()),
            "kevent del write",
        )
    }

    /// Async cross-thread wake via `NOTE_TRIGGER` on the user filter.
    pub fn trigger(&self) -> Result<(), Error> {
        self.change(
            kev(
                TRIGGER_IDENT,
                EventFilter::EVFILT_USER,
                EventFlag::empty(),
                FilterFlag::NOTE_TRIGGER,
            ),
            "kevent trigger",
        )
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    /// The blocking event loop. Exactly one thread may call this.
    pub fn run_loop(&self, h: &dyn PollEvents) {
        if self.loop_entered.swap(true, Ordering::AcqRel) {
            h.on_error(Error::temp("poller loop entered twice"));
            return;
        }
        let zero = kev(0, EventFilter::EVFILT_READ, EventFlag::empty(), FilterFlag::empty());
        let mut events = [zero; POLL_EVENT_CAP];
        while self.is_running() {
            let n = match self.kq.kevent(&[], &mut events, None) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    h.on_error(errno_err(&ERR_CONN_FD, "kevent wait", e));
                    continue;
                }
            };
            for ev in events.iter().take(n) {
                let filter = ev.filter();
                if filter == Ok(EventFilter::EVFILT_USER) {
                    // EV_CLEAR drains the trigger for us.
                    h.on_trigger();
                    continue;
                }
                let fd = ev.ident() as RawFd;
                if ev.flags().intersects(EventFlag::EV_EOF | EventFlag::EV_ERROR) {
                    h.on_fd_close(fd);
                    continue;
                }
                match filter {
                    Ok(EventFilter::EVFILT_READ) => h.on_fd_read(fd),
                    Ok(EventFilter::EVFILT_WRITE) => h.on_fd_write(fd),
                    _ => {}
                }
            }
        }
        let mut exited = self.exit.lock().unwrap();
        *exited = true;
        self.exit_cond.notify_all();
    }

    /// Stop the loop and wait (bounded) for it to exit its blocking wait.
    pub fn close(&self) -> Result<(), Error> {
        if self
            .status
            .compare_exchange(STATUS_RUNNING, STATUS_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(&ERR_NOT_RUNNING).with_debug("poller close"));
        }
        let _ = self.trigger();
        if self.loop_entered.load(Ordering::Acquire) {
            let exited = self.exit.lock().unwrap();
            if !*exited {
                let _ = self
                    .exit_cond
                    .wait_timeout(exited, Duration::from_secs(1))
                    .unwrap();
            }
        }
        self.status.store(STATUS_CLOSED, Ordering::Release);
        Ok(())
    }
}
