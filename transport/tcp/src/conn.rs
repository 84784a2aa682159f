//! Byte-level TCP connections.
//!
//! [`RawConn`] is the nonblocking server-side variant driven by a channel's
//! poller thread. [`SyncConn`] is the blocking client-side variant with a
//! dedicated reader thread. Both sit below a [`StreamConn`] and feed it raw
//! bytes; framing and dispatch live up there.

use crate::addr::{ParsedAddr, storage_to_socketaddr};
use crate::errno_err;
use crate::poller::Poller;
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrStorage, Shutdown, connect, getpeername,
    getsockname, shutdown, socket,
};
use nix::unistd;
use rivet_rpc_core::error::{ERR_CONN_CLOSE, ERR_CONN_FD, ERR_CONN_READ, ERR_CONN_WRITE, Error};
use rivet_stream::receiver::HandshakeAdapter;
use rivet_stream::{ByteConn, ClientConfig, ServerConfig, StreamConn};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// What a server-side conn needs from its owning channel: drop me from the
/// fd map once I am gone.
pub(crate) trait ConnHost: Send + Sync + 'static {
    fn detach(&self, fd: RawFd);
}

struct WriteBuf {
    buf: Vec<u8>,
    w_start: usize,
    w_end: usize,
}

impl WriteBuf {
    fn new(size: usize) -> Self {
        Self { buf: vec![0u8; size], w_start: 0, w_end: 0 }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.w_start >= self.w_end
    }
}

fn conn_addrs(fd: RawFd) -> (Option<SocketAddr>, Option<SocketAddr>) {
    let local = getsockname::<SockaddrStorage>(fd).ok().as_ref().and_then(storage_to_socketaddr);
    let remote = getpeername::<SockaddrStorage>(fd).ok().as_ref().and_then(storage_to_socketaddr);
    (local, remote)
}

/// Nonblocking server-side conn, owned by a channel.
///
/// All reads and writes happen on the channel's poller thread; producers from
/// other threads only flip write interest through [`ByteConn::trigger_write`].
pub struct RawConn {
    fd_owner: OwnedFd,
    fd: RawFd,
    next: Arc<StreamConn>,
    running: AtomicBool,
    poller: Arc<Poller>,
    host: Weak<dyn ConnHost>,
    want_write: AtomicBool,
    read_buf_size: usize,
    write_buf: Mutex<WriteBuf>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl RawConn {
    pub(crate) fn new(
        fd_owner: OwnedFd, next: Arc<StreamConn>, poller: Arc<Poller>, host: Weak<dyn ConnHost>,
        config: &ServerConfig,
    ) -> Arc<Self> {
        let fd = fd_owner.as_raw_fd();
        let (local, remote) = conn_addrs(fd);
        let conn = Arc::new(Self {
            fd_owner,
            fd,
            next,
            running: AtomicBool::new(true),
            poller,
            host,
            want_write: AtomicBool::new(false),
            read_buf_size: config.read_buf_size,
            write_buf: Mutex::new(WriteBuf::new(config.write_buf_size)),
            local,
            remote,
        });
        let as_dyn: Arc<dyn ByteConn> = conn.clone();
        conn.next.set_prev(Arc::downgrade(&as_dyn));
        conn
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Announce the open upward once the channel has adopted the fd.
    pub(crate) fn open(&self) {
        self.next.on_open();
    }

    /// Peer hangup. A hangup that truncates a half-assembled inbound
    /// message is a transport error, not a quiet goodbye.
    pub(crate) fn peer_close(&self) {
        if self.is_running() && self.next.has_partial_read() {
            self.next.on_error(
                Error::new(&ERR_CONN_CLOSE).with_debug("peer closed mid-stream"),
            );
        }
        self.close();
    }

    /// One readiness-worth of reading. The poller is level-triggered, so
    /// leftover kernel data just reports again on the next wait.
    pub(crate) fn do_read(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= self.read_buf_size);
        match unistd::read(self.fd_owner.as_fd(), &mut buf[..self.read_buf_size]) {
            Ok(0) => self.peer_close(),
            Ok(n) => self.next.on_read_bytes(&buf[..n]),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(e) => {
                self.next.on_error(errno_err(&ERR_CONN_READ, "read", e));
                self.close();
            }
        }
    }

    /// Drain the outbound queue through the write buffer. Keeps write
    /// interest registered while the socket pushes back, drops it once
    /// everything is flushed.
    pub(crate) fn do_write(&self) {
        let mut state = self.write_buf.lock().unwrap();
        loop {
            if state.is_empty() {
                state.w_start = 0;
                let buf_len = state.buf.len();
                state.w_end = self.next.on_fill_write(&mut state.buf[..buf_len]);
                if state.w_end == 0 {
                    // Queue looks drained. Clear interest, then look once
                    // more: a producer may have enqueued while we cleared.
                    self.want_write.store(false, Ordering::Release);
                    let _ = self.poller.del_write(self.fd);
                    state.w_end = self.next.on_fill_write(&mut state.buf[..buf_len]);
                    if state.w_end == 0 {
                        return;
                    }
                    self.set_want_write();
                }
            }
            let (s, e) = (state.w_start, state.w_end);
            match unistd::write(self.fd_owner.as_fd(), &state.buf[s..e]) {
                Ok(n) => state.w_start += n,
                Err(Errno::EAGAIN) => {
                    self.set_want_write();
                    return;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    drop(state);
                    self.next.on_error(errno_err(&ERR_CONN_WRITE, "write", e));
                    self.close();
                    return;
                }
            }
        }
    }

    fn set_want_write(&self) {
        if !self.want_write.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.poller.add_write(self.fd) {
                warn!("conn fd={} add write interest: {}", self.fd, e);
            }
        }
    }
}

impl ByteConn for RawConn {
    fn trigger_write(&self) {
        if self.is_running() {
            self.set_want_write();
        }
    }

    fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.poller.unregister_fd(self.fd);
        if let Some(host) = self.host.upgrade() {
            host.detach(self.fd);
        }
        let _ = shutdown(self.fd, Shutdown::Both);
        self.next.on_close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

/// Blocking client-side conn. Reads happen in [`SyncConn::read_loop`] on a
/// dedicated thread; writes drain inline on the producer thread.
pub struct SyncConn {
    fd_owner: OwnedFd,
    fd: RawFd,
    next: Arc<StreamConn>,
    running: AtomicBool,
    read_buf_size: usize,
    write_buf: Mutex<WriteBuf>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl SyncConn {
    /// Blocking connect, then the optional protocol upgrade (ws schemes).
    pub fn connect(
        parsed: &ParsedAddr, next: Arc<StreamConn>, config: &ClientConfig,
        handshake: Option<&Arc<dyn HandshakeAdapter>>,
    ) -> Result<Arc<Self>, Error> {
        let family = if parsed.addr.is_ipv6() { AddressFamily::Inet6 } else { AddressFamily::Inet };
        let fd_owner = socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
            .map_err(|e| errno_err(&ERR_CONN_FD, "socket", e))?;
        let fd = fd_owner.as_raw_fd();
        let sa = SockaddrStorage::from(parsed.addr);
        connect(fd, &sa).map_err(|e| errno_err(&ERR_CONN_FD, "connect", e))?;
        if let Some(adapter) = handshake {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            adapter.client_upgrade(borrowed, &parsed.host, config.handshake_timeout)?;
        }
        let (local, remote) = conn_addrs(fd);
        let conn = Arc::new(Self {
            fd_owner,
            fd,
            next,
            running: AtomicBool::new(true),
            read_buf_size: config.read_buf_size,
            write_buf: Mutex::new(WriteBuf::new(config.write_buf_size)),
            local,
            remote,
        });
        let as_dyn: Arc<dyn ByteConn> = conn.clone();
        conn.next.set_prev(Arc::downgrade(&as_dyn));
        conn.next.on_open();
        Ok(conn)
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Blocking read loop; runs until the peer closes, an error hits, or
    /// [`ByteConn::close`] shuts the socket down under us.
    pub fn read_loop(&self) {
        let mut buf = vec![0u8; self.read_buf_size];
        while self.is_running() {
            match unistd::read(self.fd_owner.as_fd(), &mut buf) {
                Ok(0) => {
                    if self.is_running() && self.next.has_partial_read() {
                        self.next.on_error(
                            Error::new(&ERR_CONN_CLOSE).with_debug("peer closed mid-stream"),
                        );
                    }
                    break;
                }
                Ok(n) => self.next.on_read_bytes(&buf[..n]),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    if self.is_running() {
                        self.next.on_error(errno_err(&ERR_CONN_READ, "read", e));
                    }
                    break;
                }
            }
        }
        self.close();
    }

    fn drain_write(&self) -> Result<(), Error> {
        let mut state = self.write_buf.lock().unwrap();
        loop {
            if state.is_empty() {
                state.w_start = 0;
                let buf_len = state.buf.len();
                state.w_end = self.next.on_fill_write(&mut state.buf[..buf_len]);
                if state.w_end == 0 {
                    return Ok(());
                }
            }
            let (s, e) = (state.w_start, state.w_end);
            match unistd::write(self.fd_owner.as_fd(), &state.buf[s..e]) {
                Ok(n) => state.w_start += n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno_err(&ERR_CONN_WRITE, "write", e)),
            }
        }
    }
}

impl ByteConn for SyncConn {
    fn trigger_write(&self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.drain_write() {
            self.next.on_error(e);
            self.close();
        }
    }

    fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Kicks the reader thread out of its blocking read.
        let _ = shutdown(self.fd, Shutdown::Both);
        self.next.on_close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}
