//! A channel is one poller thread plus the set of conns it drives.
//!
//! Conns are handed over through a bounded pending queue and adopted on the
//! poller thread itself, so the fd map is only ever touched from that thread
//! (plus the brief close path).

use crate::conn::{ConnHost, RawConn};
use crate::poller::Poller;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use rivet_rpc_core::error::{ERR_NOT_RUNNING, Error};
use rivet_rpc_core::utils::CoarseClock;
use rivet_stream::{ByteConn, ServerConfig, StreamConn};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type PendingConn = (OwnedFd, Arc<StreamConn>);

pub(crate) struct ChannelCore {
    id: usize,
    poller: Arc<Poller>,
    pending_tx: Sender<PendingConn>,
    pending_rx: Receiver<PendingConn>,
    conns: Mutex<HashMap<RawFd, Arc<RawConn>>>,
    active: AtomicUsize,
    config: Arc<ServerConfig>,
    clock: CoarseClock,
    read_buf: Mutex<Vec<u8>>,
}

impl ChannelCore {
    fn adopt(self: &Arc<Self>, fd_owner: OwnedFd, stream: Arc<StreamConn>) {
        let fd = fd_owner.as_raw_fd();
        let conn_id = stream.id();
        let host = Arc::downgrade(self) as std::sync::Weak<dyn ConnHost>;
        let conn = RawConn::new(fd_owner, stream, self.poller.clone(), host, &self.config);
        if let Err(e) = self.poller.register_fd(fd) {
            warn!("channel {} register fd={}: {}", self.id, fd, e);
            conn.close();
            return;
        }
        self.conns.lock().unwrap().insert(fd, conn.clone());
        self.active.fetch_add(1, Ordering::AcqRel);
        debug!("channel {} adopt conn {} fd={} at {}ms", self.id, conn_id, fd, self.clock.now_ms());
        conn.open();
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<RawConn>> {
        self.conns.lock().unwrap().get(&fd).cloned()
    }
}

impl crate::poller::PollEvents for Arc<ChannelCore> {
    fn on_error(&self, err: Error) {
        warn!("channel {} poller: {}", self.id, err);
    }

    fn on_trigger(&self) {
        self.clock.refresh();
        while let Ok((fd_owner, stream)) = self.pending_rx.try_recv() {
            self.adopt(fd_owner, stream);
        }
    }

    fn on_fd_read(&self, fd: RawFd) {
        if let Some(conn) = self.lookup(fd) {
            let mut buf = self.read_buf.lock().unwrap();
            conn.do_read(&mut buf);
        }
    }

    fn on_fd_write(&self, fd: RawFd) {
        if let Some(conn) = self.lookup(fd) {
            conn.do_write();
        }
    }

    fn on_fd_close(&self, fd: RawFd) {
        if let Some(conn) = self.lookup(fd) {
            conn.peer_close();
        }
    }
}

impl ConnHost for ChannelCore {
    fn detach(&self, fd: RawFd) {
        if self.conns.lock().unwrap().remove(&fd).is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
            debug!("channel {} detach fd={}", self.id, fd);
        }
    }
}

/// Handle over one poller thread and its conns.
pub struct Channel {
    core: Arc<ChannelCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    pub fn new(id: usize, config: Arc<ServerConfig>) -> Result<Self, Error> {
        let poller = Arc::new(Poller::new()?);
        let (pending_tx, pending_rx) = bounded(config.pending_conn_cap);
        let read_buf_size = config.read_buf_size;
        let core = Arc::new(ChannelCore {
            id,
            poller,
            pending_tx,
            pending_rx,
            conns: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            config,
            clock: CoarseClock::new(),
            read_buf: Mutex::new(vec![0u8; read_buf_size]),
        });
        let run_core = core.clone();
        let thread = std::thread::Builder::new()
            .name(format!("rivet-chan-{}", id))
            .spawn(move || {
                let poller = run_core.poller.clone();
                poller.run_loop(&run_core);
            })
            .map_err(|e| Error::temp(format!("spawn channel thread: {}", e)))?;
        Ok(Self { core, thread: Mutex::new(Some(thread)) })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.core.id
    }

    /// Conns currently attached (pending handovers not counted).
    #[inline]
    pub fn active(&self) -> usize {
        self.core.active.load(Ordering::Acquire)
    }

    /// Hand a freshly accepted fd over to the poller thread. The stream conn
    /// will see `on_conn_open` once the channel adopts it.
    pub fn add_conn(&self, fd_owner: OwnedFd, stream: Arc<StreamConn>) -> Result<(), Error> {
        if !self.core.poller.is_running() {
            return Err(Error::new(&ERR_NOT_RUNNING).with_debug("channel add_conn"));
        }
        match self.core.pending_tx.try_send((fd_owner, stream)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(Error::temp(format!("channel {} pending queue full", self.core.id)));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::new(&ERR_NOT_RUNNING).with_debug("channel add_conn"));
            }
        }
        self.core.poller.trigger()
    }

    /// Stop the poller thread, then close every conn it was driving.
    pub fn close(&self) -> Result<(), Error> {
        self.core.poller.close()?;
        if let Some(t) = self.thread.lock().unwrap().take() {
            let _ = t.join();
        }
        // Pending fds never adopted: dropping the OwnedFd closes them.
        while self.core.pending_rx.try_recv().is_ok() {}
        let conns: Vec<_> = self.core.conns.lock().unwrap().values().cloned().collect();
        for conn in conns {
            conn.close();
        }
        debug!("channel {} closed", self.core.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
    use nix::unistd;
    use rivet_rpc_core::error::Error;
    use rivet_stream::proto::RpcStream;
    use rivet_stream::{StreamConn, StreamReceiver};
    use std::os::fd::AsFd;
    use std::time::Duration;

    #[derive(Default)]
    struct Collector {
        opened: Mutex<usize>,
        closed: Mutex<usize>,
        bodies: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<Error>>,
    }

    impl StreamReceiver for Collector {
        fn on_conn_open(&self, _conn: &Arc<StreamConn>) {
            *self.opened.lock().unwrap() += 1;
        }
        fn on_conn_close(&self, _conn: &Arc<StreamConn>) {
            *self.closed.lock().unwrap() += 1;
        }
        fn on_conn_read_stream(&self, _conn: &Arc<StreamConn>, stream: RpcStream) {
            self.bodies.lock().unwrap().push(stream.body().to_vec());
        }
        fn on_conn_error(&self, _conn: Option<&Arc<StreamConn>>, err: Error) {
            self.errors.lock().unwrap().push(err);
        }
    }

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_channel_adopt_read_close() {
        let config = Arc::new(ServerConfig::default());
        let channel = Channel::new(0, config.clone()).unwrap();
        let (ours, theirs) = pair();
        let receiver = Arc::new(Collector::default());
        let stream = StreamConn::new(receiver.clone(), config.write_queue_cap);
        channel.add_conn(ours, stream).unwrap();
        assert!(wait_until(|| channel.active() == 1));
        assert_eq!(*receiver.opened.lock().unwrap(), 1);

        let mut msg = RpcStream::new();
        msg.write_bytes(b"ping");
        msg.seal();
        let mut sent = 0;
        while sent < msg.as_bytes().len() {
            match unistd::write(theirs.as_fd(), &msg.as_bytes()[sent..]) {
                Ok(n) => sent += n,
                Err(nix::errno::Errno::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("write: {}", e),
            }
        }
        assert!(wait_until(|| !receiver.bodies.lock().unwrap().is_empty()));
        assert_eq!(receiver.bodies.lock().unwrap()[0], b"ping");

        // Peer hangup between messages tears the conn down quietly.
        drop(theirs);
        assert!(wait_until(|| channel.active() == 0));
        assert_eq!(*receiver.closed.lock().unwrap(), 1);
        assert!(receiver.errors.lock().unwrap().is_empty());
        channel.close().unwrap();
    }

    #[test]
    fn test_peer_close_mid_stream_is_an_error() {
        let config = Arc::new(ServerConfig::default());
        let channel = Channel::new(3, config.clone()).unwrap();
        let (ours, theirs) = pair();
        let receiver = Arc::new(Collector::default());
        let stream = StreamConn::new(receiver.clone(), config.write_queue_cap);
        channel.add_conn(ours, stream.clone()).unwrap();
        assert!(wait_until(|| channel.active() == 1));

        // Head plus a slice of a much larger body, then hang up: the
        // truncated message must surface as a transport error, and never
        // as a delivered stream.
        let mut msg = RpcStream::new();
        msg.write_bytes(&vec![0x5au8; 2 * 1024 * 1024]);
        msg.seal();
        let part = &msg.as_bytes()[..rivet_stream::STREAM_HEAD_SIZE + 1024];
        let mut sent = 0;
        while sent < part.len() {
            match unistd::write(theirs.as_fd(), &part[sent..]) {
                Ok(n) => sent += n,
                Err(nix::errno::Errno::EAGAIN) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("write: {}", e),
            }
        }
        assert!(wait_until(|| stream.has_partial_read()));
        drop(theirs);
        assert!(wait_until(|| *receiver.closed.lock().unwrap() == 1));

        let errors = receiver.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), rivet_rpc_core::error::ERR_CONN_CLOSE.code());
        assert!(receiver.bodies.lock().unwrap().is_empty());
        channel.close().unwrap();
    }

    #[test]
    fn test_channel_close_closes_conns() {
        let config = Arc::new(ServerConfig::default());
        let channel = Channel::new(1, config.clone()).unwrap();
        let (ours, _theirs) = pair();
        let receiver = Arc::new(Collector::default());
        let stream = StreamConn::new(receiver.clone(), config.write_queue_cap);
        channel.add_conn(ours, stream).unwrap();
        assert!(wait_until(|| channel.active() == 1));

        channel.close().unwrap();
        assert_eq!(*receiver.closed.lock().unwrap(), 1);
        assert!(channel.close().is_err());
    }

    #[test]
    fn test_add_conn_after_close() {
        let config = Arc::new(ServerConfig::default());
        let channel = Channel::new(2, config.clone()).unwrap();
        channel.close().unwrap();
        let (ours, _theirs) = pair();
        let receiver = Arc::new(Collector::default());
        let stream = StreamConn::new(receiver, config.write_queue_cap);
        assert!(channel.add_conn(ours, stream).is_err());
    }
}
