//! The epoll backend, with an eventfd as the user-wake trigger.

use super::{POLL_EVENT_CAP, PollEvents, STATUS_CLOSED, STATUS_CLOSING, STATUS_RUNNING};
use crate::errno_err;
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use rivet_rpc_core::error::{ERR_CONN_FD, ERR_NOT_RUNNING, Error};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Poller {
    epoll: Epoll,
    wake: EventFd,
    wake_fd: RawFd,
    status: AtomicU8,
    loop_entered: AtomicBool,
    exit: Mutex<bool>,
    exit_cond: Condvar,
}

impl Poller {
    pub fn new() -> Result<Self, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| errno_err(&ERR_CONN_FD, "epoll_create", e))?;
        let wake = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )
        .map_err(|e| errno_err(&ERR_CONN_FD, "eventfd", e))?;
        let wake_fd = wake.as_fd().as_raw_fd();
        epoll
            .add(wake.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, wake_fd as u64))
            .map_err(|e| errno_err(&ERR_CONN_FD, "epoll_ctl add trigger", e))?;
        Ok(Self {
            epoll,
            wake,
            wake_fd,
            status: AtomicU8::new(STATUS_RUNNING),
            loop_entered: AtomicBool::new(false),
            exit: Mutex::new(false),
            exit_cond: Condvar::new(),
        })
    }

    /// Subscribe `fd` for read readiness. The event payload is the fd.
    pub fn register_fd(&self, fd: RawFd) -> Result<(), Error> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(
                borrowed,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, fd as u64),
            )
            .map_err(|e| errno_err(&ERR_CONN_FD, "epoll_ctl add", e))
    }

    pub fn unregister_fd(&self, fd: RawFd) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        // ENOENT just means the close path already raced us here.
        let _ = self.epoll.delete(borrowed);
    }

    pub fn add_write(&self, fd: RawFd) -> Result<(), Error> {
        self.mod_interest(
            fd,
            EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLOUT,
        )
    }

    pub fn del_write(&self, fd: RawFd) -> Result<(), Error> {
        self.mod_interest(fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP)
    }

    fn mod_interest(&self, fd: RawFd, flags: EpollFlags) -> Result<(), Error> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(flags, fd as u64);
        self.epoll
            .modify(borrowed, &mut event)
            .map_err(|e| errno_err(&ERR_CONN_FD, "epoll_ctl mod", e))
    }

    /// Async cross-thread wake: 8 bytes onto the eventfd.
    pub fn trigger(&self) -> Result<(), Error> {
        match nix::unistd::write(self.wake.as_fd(), &1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            // Counter saturated: a wake is already pending.
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(errno_err(&ERR_CONN_FD, "eventfd write", e)),
        }
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
        let mut events = [EpollEvent::empty(); POLL_EVENT_CAP];
        while self.is_running() {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    h.on_error(errno_err(&ERR_CONN_FD, "epoll_wait", e));
                    continue;
                }
            };
            for ev in events.iter().take(n) {
                let fd = ev.data() as RawFd;
                if fd == self.wake_fd {
                    self.drain_wake();
                    h.on_trigger();
                    continue;
                }
                let flags = ev.events();
                if flags
                    .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP)
                {
                    h.on_fd_close(fd);
                    continue;
                }
                if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
                    h.on_fd_read(fd);
                }
                if flags.intersects(EpollFlags::EPOLLOUT) {
                    h.on_fd_write(fd);
                }
            }
        }
        let mut exited = self.exit.lock().unwrap();
        *exited = true;
        self.exit_cond.notify_all();
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.wake.as_fd(), &mut buf);
    }

    /// Stop the loop and wait (bounded) for it to exit its blocking wait.
    ///
    /// The poll fd and the trigger fd are released on drop, never from the
    /// event thread.
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
