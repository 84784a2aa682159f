//! Nonblocking TCP listener with its own poller thread.
//!
//! Accepted fds are pushed into an [`AcceptSink`]; the listener itself knows
//! nothing about framing or channels.

use crate::addr::{ParsedAddr, storage_to_socketaddr};
use crate::errno_err;
use crate::poller::Poller;
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, accept4, bind, getsockname,
    listen, setsockopt, socket, sockopt,
};
use rivet_rpc_core::error::{ERR_BIND, ERR_CONN_FD, Error};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Where accepted connections go.
pub trait AcceptSink: Send + Sync + 'static {
    fn on_accept(&self, fd: OwnedFd);
    fn on_accept_error(&self, err: Error);
}

struct AcceptCore {
    listen_fd: OwnedFd,
    sink: Arc<dyn AcceptSink>,
}

impl crate::poller::PollEvents for AcceptCore {
    fn on_error(&self, err: Error) {
        self.sink.on_accept_error(err);
    }

    fn on_trigger(&self) {}

    fn on_fd_read(&self, _fd: RawFd) {
        // Level-triggered, but accepting the whole backlog here keeps the
        // wakeup count down under connect bursts.
        loop {
            match accept4(self.listen_fd.as_raw_fd(), SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC)
            {
                Ok(fd) => {
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    self.sink.on_accept(owned);
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => return,
                Err(Errno::ECONNABORTED) => continue,
                Err(e) => {
                    self.sink.on_accept_error(errno_err(&ERR_CONN_FD, "accept", e));
                    return;
                }
            }
        }
    }

    fn on_fd_write(&self, _fd: RawFd) {}

    fn on_fd_close(&self, fd: RawFd) {
        self.sink.on_accept_error(
            Error::new(&ERR_BIND).with_debug(&format!("listen fd={} closed by kernel", fd)),
        );
    }
}

pub struct Listener {
    poller: Arc<Poller>,
    thread: Mutex<Option<JoinHandle<()>>>,
    local: SocketAddr,
}

impl Listener {
    /// Bind, listen and start the accept thread.
    pub fn start(parsed: &ParsedAddr, sink: Arc<dyn AcceptSink>) -> Result<Self, Error> {
        let family =
            if parsed.addr.is_ipv6() { AddressFamily::Inet6 } else { AddressFamily::Inet };
        let listen_fd = socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| errno_err(&ERR_BIND, "socket", e))?;
        setsockopt(&listen_fd, sockopt::ReuseAddr, &true)
            .map_err(|e| errno_err(&ERR_BIND, "setsockopt", e))?;
        let sa = SockaddrStorage::from(parsed.addr);
        bind(listen_fd.as_raw_fd(), &sa).map_err(|e| {
            errno_err(&ERR_BIND, "bind", e).with_message(format!("bind {}", parsed.addr))
        })?;
        let backlog = Backlog::new(128).map_err(|e| errno_err(&ERR_BIND, "backlog", e))?;
        listen(&listen_fd, backlog).map_err(|e| errno_err(&ERR_BIND, "listen", e))?;
        let local = getsockname::<SockaddrStorage>(listen_fd.as_raw_fd())
            .ok()
            .as_ref()
            .and_then(storage_to_socketaddr)
            .unwrap_or(parsed.addr);

        let poller = Arc::new(Poller::new()?);
        poller.register_fd(listen_fd.as_raw_fd())?;
        let core = Arc::new(AcceptCore { listen_fd, sink });
        let run_poller = poller.clone();
        let thread = std::thread::Builder::new()
            .name(format!("rivet-listen-{}", local.port()))
            .spawn(move || run_poller.run_loop(core.as_ref()))
            .map_err(|e| Error::temp(format!("spawn listener thread: {}", e)))?;
        info!("listening on {}", local);
        Ok(Self { poller, thread: Mutex::new(Some(thread)), local })
    }

    /// The bound address, with the kernel-chosen port for `:0` binds.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop accepting and release the listen socket.
    pub fn close(&self) -> Result<(), Error> {
        self.poller.close()?;
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
        debug!("listener {} closed", self.local);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::parse_url;
    use std::net::TcpStream;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect {
        fds: Mutex<Vec<OwnedFd>>,
        errors: Mutex<Vec<Error>>,
    }

    impl AcceptSink for Collect {
        fn on_accept(&self, fd: OwnedFd) {
            self.fds.lock().unwrap().push(fd);
        }
        fn on_accept_error(&self, err: Error) {
            self.errors.lock().unwrap().push(err);
        }
    }

    #[test]
    fn test_accept_and_close() {
        let parsed = parse_url("tcp://127.0.0.1:0").unwrap();
        let sink = Arc::new(Collect::default());
        let listener = Listener::start(&parsed, sink.clone()).unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();
        for _ in 0..200 {
            if sink.fds.lock().unwrap().len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.fds.lock().unwrap().len(), 2);
        assert!(sink.errors.lock().unwrap().is_empty());

        listener.close().unwrap();
        assert!(listener.close().is_err());
        assert!(TcpStream::connect(addr).is_err() || sink.fds.lock().unwrap().len() == 2);
    }

    #[test]
    fn test_bind_conflict() {
        let parsed = parse_url("tcp://127.0.0.1:0").unwrap();
        let sink = Arc::new(Collect::default());
        let listener = Listener::start(&parsed, sink).unwrap();
        let taken = parse_url(&format!("tcp://{}", listener.local_addr())).unwrap();
        let sink2 = Arc::new(Collect::default());
        let err = match Listener::start(&taken, sink2) {
            Ok(_) => panic!("second bind on a taken port must fail"),
            Err(e) => e,
        };
        assert_eq!(err.code(), rivet_rpc_core::error::ERR_BIND.code());
        listener.close().unwrap();
    }
}
