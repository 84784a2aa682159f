//! The stream connection: byte chunks in, framed messages out.
//!
//! A `StreamConn` sits on top of a byte-level connection (the transport's
//! raw conn, reachable through the [`ByteConn`] seam) and below the
//! receiver. Inbound, it reassembles the self-delimited wire format across
//! arbitrary read boundaries; outbound, it serializes a bounded queue of
//! sealed streams into whatever buffer the raw conn offers.
//!
//! Concurrency contract: `on_read_bytes` is only ever invoked by the one
//! thread that delivers bytes for this connection, and `on_fill_write` is
//! serialized by the raw conn's write mutex. The internal mutexes are
//! therefore uncontended on the hot path.

use crate::proto::{RpcStream, STREAM_HEAD_SIZE};
use crate::receiver::StreamReceiver;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use rivet_rpc_core::error::{ERR_STREAM, Error};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

const STATUS_CLOSED: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_CLOSING: u8 = 2;

/// The byte-level side of a connection pipeline.
///
/// `StreamConn` holds this link weakly; the raw conn owns the fd and is
/// destroyed first.
pub trait ByteConn: Send + Sync {
    /// Prompt the writer to start draining `on_fill_write`.
    fn trigger_write(&self);

    fn close(&self);

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;
}

struct ReadState {
    head_buf: [u8; STREAM_HEAD_SIZE],
    head_pos: usize,
    stream: Option<RpcStream>,
}

struct WriteState {
    stream: Option<RpcStream>,
    pos: usize,
}

pub struct StreamConn {
    id: u64,
    status: AtomicU8,
    receiver: Arc<dyn StreamReceiver>,
    prev: OnceLock<Weak<dyn ByteConn>>,
    read_state: Mutex<ReadState>,
    write_state: Mutex<WriteState>,
    write_tx: Sender<RpcStream>,
    write_rx: Receiver<RpcStream>,
}

impl StreamConn {
    pub fn new(receiver: Arc<dyn StreamReceiver>, write_queue_cap: usize) -> Arc<Self> {
        let (write_tx, write_rx) = crossbeam_channel::bounded(write_queue_cap);
        Arc::new(Self {
            id: rivet_rpc_core::utils::next_seed(),
            status: AtomicU8::new(STATUS_CLOSED),
            receiver,
            prev: OnceLock::new(),
            read_state: Mutex::new(ReadState {
                head_buf: [0u8; STREAM_HEAD_SIZE],
                head_pos: 0,
                stream: None,
            }),
            write_state: Mutex::new(WriteState { stream: None, pos: 0 }),
            write_tx,
            write_rx,
        })
    }

    /// Process-unique connection id, stamped from the seed counter.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attach the byte-level side. Called once during pipeline assembly.
    pub fn set_prev(&self, prev: Weak<dyn ByteConn>) {
        let _ = self.prev.set(prev);
    }

    fn prev_conn(&self) -> Option<Arc<dyn ByteConn>> {
        self.prev.get().and_then(|w| w.upgrade())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status.load(Ordering::Acquire) == STATUS_RUNNING
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.prev_conn().and_then(|p| p.local_addr())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.prev_conn().and_then(|p| p.remote_addr())
    }

    /// Transition to Running and announce the connection.
    pub fn on_open(self: &Arc<Self>) {
        if self
            .status
            .compare_exchange(STATUS_CLOSED, STATUS_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.receiver.on_conn_open(self);
        }
    }

    /// Announce the close and settle in Closed. Exactly once.
    pub fn on_close(self: &Arc<Self>) {
        let prev = self.status.swap(STATUS_CLOSED, Ordering::AcqRel);
        if prev != STATUS_CLOSED {
            self.receiver.on_conn_close(self);
        }
    }

    /// Surface a byte-level error to the receiver, attributed to this conn.
    pub fn on_error(self: &Arc<Self>, err: Error) {
        self.receiver.on_conn_error(Some(self), err);
    }

    /// Whether an inbound message is only partially assembled. A peer that
    /// hangs up in this state truncated a stream mid-flight.
    pub fn has_partial_read(&self) -> bool {
        let st = self.read_state.lock().unwrap();
        st.head_pos > 0 || st.stream.is_some()
    }

    /// Idempotent close: Running -> Closing, stop accepting enqueues, then
    /// delegate to the byte-level side (which owns the fd and will call
    /// [`StreamConn::on_close`] back).
    pub fn close(self: &Arc<Self>) {
        if self
            .status
            .compare_exchange(STATUS_RUNNING, STATUS_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(
            "stream conn {} closing: peer {}",
            self.id,
            rivet_rpc_core::utils::addr_repr(self.remote_addr().as_ref())
        );
        // Unblock any producer stuck on a full queue.
        while self.write_rx.try_recv().is_ok() {}
        match self.prev_conn() {
            Some(prev) => prev.close(),
            // No byte-level side attached (not yet wired, or already gone):
            // finish the lifecycle ourselves.
            None => self.on_close(),
        }
    }

    /// Enqueue a sealed outbound stream and prompt the writer.
    ///
    /// Queue order is preserved; enqueues after close surface an error
    /// through the receiver instead of panicking.
    pub fn write_stream_and_release(self: &Arc<Self>, stream: RpcStream) {
        if !self.is_running() {
            self.receiver
                .on_conn_error(Some(self), Error::temp("write on closed stream conn"));
            return;
        }
        match self.write_tx.try_send(stream) {
            Ok(_) => {}
            Err(TrySendError::Full(stream)) => {
                // Bounded backpressure: wait for the writer to drain, but
                // never forever (close drains the queue and we re-check).
                if self
                    .write_tx
                    .send_timeout(stream, Duration::from_secs(5))
                    .is_err()
                {
                    self.receiver
                        .on_conn_error(Some(self), Error::temp("write queue stalled"));
                    return;
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.receiver
                    .on_conn_error(Some(self), Error::temp("write on closed stream conn"));
                return;
            }
        }
        if let Some(prev) = self.prev_conn() {
            prev.trigger_write();
        }
    }

    fn finish_stream(self: &Arc<Self>, stream: RpcStream) -> bool {
        if !stream.check() {
            warn!(
                "stream check failed: peer {}",
                rivet_rpc_core::utils::addr_repr(self.remote_addr().as_ref())
            );
            self.receiver.on_conn_error(Some(self), Error::new(&ERR_STREAM));
            self.close();
            return false;
        }
        // No delivery once close has started.
        if self.is_running() {
            self.receiver.on_conn_read_stream(self, stream);
        }
        true
    }

    /// Inbound entry point: consume one read's worth of bytes.
    ///
    /// Iterative over `b`; one call may complete any number of messages. A
    /// malformed head or failed check emits a single stream error and
    /// starts close, with no partial delivery.
    pub fn on_read_bytes(self: &Arc<Self>, b: &[u8]) {
        let mut st = self.read_state.lock().unwrap();
        let mut rest = b;
        loop {
            // Finish an in-progress message first.
            if st.stream.is_some() {
                let in_progress = st.stream.as_mut().unwrap();
                let n = in_progress.append(rest);
                rest = &rest[n..];
                if !in_progress.is_complete() {
                    debug_assert!(rest.is_empty());
                    return;
                }
                let stream = st.stream.take().unwrap();
                if !self.finish_stream(stream) {
                    return;
                }
                continue;
            }
            if rest.is_empty() {
                return;
            }
            if st.head_pos == 0 && rest.len() >= STREAM_HEAD_SIZE {
                // Fast path: the head is fully visible in this chunk.
                let Some(total) = RpcStream::length_from_head(rest) else {
                    self.receiver.on_conn_error(Some(self), Error::new(&ERR_STREAM));
                    self.close();
                    return;
                };
                let mut stream = RpcStream::with_total(total);
                let n = stream.append(rest);
                rest = &rest[n..];
                if stream.is_complete() {
                    if !self.finish_stream(stream) {
                        return;
                    }
                    continue;
                }
                st.stream = Some(stream);
                debug_assert!(rest.is_empty());
                return;
            }
            // Slow path: accumulate the head byte by byte.
            let take = (STREAM_HEAD_SIZE - st.head_pos).min(rest.len());
            let head_pos = st.head_pos;
            st.head_buf[head_pos..head_pos + take].copy_from_slice(&rest[..take]);
            st.head_pos += take;
            rest = &rest[take..];
            if st.head_pos < STREAM_HEAD_SIZE {
                debug_assert!(rest.is_empty());
                return;
            }
            let Some(total) = RpcStream::length_from_head(&st.head_buf) else {
                self.receiver.on_conn_error(Some(self), Error::new(&ERR_STREAM));
                self.close();
                return;
            };
            let mut stream = RpcStream::with_total(total);
            stream.append(&st.head_buf);
            st.head_pos = 0;
            st.stream = Some(stream);
            // Loop: completion (total == HEAD) and leftover bytes are
            // handled by the in-progress branch.
        }
    }

    /// Outbound entry point: fill `buf` from the current stream, pulling
    /// the next one off the queue when idle.
    ///
    /// Returns how much of `buf` was written; 0 means the queue is drained
    /// for now. A partial stream keeps its cursor for the next call.
    pub fn on_fill_write(self: &Arc<Self>, buf: &mut [u8]) -> usize {
        let mut ws = self.write_state.lock().unwrap();
        if ws.stream.is_none() {
            match self.write_rx.try_recv() {
                Ok(s) => {
                    ws.stream = Some(s);
                    ws.pos = 0;
                }
                Err(_) => return 0,
            }
        }
        let (copied, finished) = {
            let stream = ws.stream.as_ref().unwrap();
            let (slice, finished) = stream.peek_buffer_slice(ws.pos, buf.len());
            if slice.is_empty() {
                self.receiver
                    .on_conn_error(Some(self), Error::temp("OnFillWrite internal error"));
                return 0;
            }
            buf[..slice.len()].copy_from_slice(slice);
            (slice.len(), finished)
        };
        ws.pos += copied;
        if finished {
            ws.stream = None;
            ws.pos = 0;
        }
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::STREAM_MAGIC;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockReceiver {
        opens: StdMutex<usize>,
        closes: StdMutex<usize>,
        streams: StdMutex<Vec<RpcStream>>,
        errors: StdMutex<Vec<Error>>,
    }

    impl StreamReceiver for MockReceiver {
        fn on_conn_open(&self, _conn: &Arc<StreamConn>) {
            *self.opens.lock().unwrap() += 1;
        }
        fn on_conn_close(&self, _conn: &Arc<StreamConn>) {
            *self.closes.lock().unwrap() += 1;
        }
        fn on_conn_read_stream(&self, _conn: &Arc<StreamConn>, stream: RpcStream) {
            self.streams.lock().unwrap().push(stream);
        }
        fn on_conn_error(&self, _conn: Option<&Arc<StreamConn>>, err: Error) {
            self.errors.lock().unwrap().push(err);
        }
    }

    struct MockByteConn;

    impl ByteConn for MockByteConn {
        fn trigger_write(&self) {}
        fn close(&self) {}
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn new_conn() -> (Arc<StreamConn>, Arc<MockReceiver>, Arc<MockByteConn>) {
        let receiver = Arc::new(MockReceiver::default());
        let conn = StreamConn::new(receiver.clone(), 16);
        let byte_conn: Arc<MockByteConn> = Arc::new(MockByteConn);
        let as_dyn: Arc<dyn ByteConn> = byte_conn.clone();
        conn.set_prev(Arc::downgrade(&as_dyn));
        conn.on_open();
        (conn, receiver, byte_conn)
    }

    fn wire(bodies: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for body in bodies {
            out.extend_from_slice(RpcStream::from_body(body).as_bytes());
        }
        out
    }

    #[test]
    fn test_whole_message_single_read() {
        let (conn, receiver, _bc) = new_conn();
        conn.on_read_bytes(&wire(&[b"hello"]));
        let streams = receiver.streams.lock().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].body(), b"hello");
    }

    #[test]
    fn test_multiple_messages_single_read() {
        let (conn, receiver, _bc) = new_conn();
        conn.on_read_bytes(&wire(&[b"one", b"two", b"three", b""]));
        let streams = receiver.streams.lock().unwrap();
        let bodies: Vec<&[u8]> = streams.iter().map(|s| s.body()).collect();
        assert_eq!(bodies, vec![b"one" as &[u8], b"two", b"three", b""]);
    }

    #[test]
    fn test_chunk_invariance_every_split() {
        let raw = wire(&[b"alpha", b"beta-longer-payload", b"", b"g"]);
        for chunk in 1..=raw.len() {
            let (conn, receiver, _bc) = new_conn();
            for piece in raw.chunks(chunk) {
                conn.on_read_bytes(piece);
            }
            let streams = receiver.streams.lock().unwrap();
            let bodies: Vec<&[u8]> = streams.iter().map(|s| s.body()).collect();
            assert_eq!(
                bodies,
                vec![b"alpha" as &[u8], b"beta-longer-payload", b"", b"g"],
                "chunk size {}",
                chunk
            );
            assert!(receiver.errors.lock().unwrap().is_empty());
        }
    }

    #[test]
    fn test_head_split_at_every_boundary() {
        let raw = wire(&[b"payload"]);
        for split in 1..STREAM_HEAD_SIZE {
            let (conn, receiver, _bc) = new_conn();
            conn.on_read_bytes(&raw[..split]);
            assert!(receiver.streams.lock().unwrap().is_empty());
            conn.on_read_bytes(&raw[split..]);
            let streams = receiver.streams.lock().unwrap();
            assert_eq!(streams.len(), 1, "split {}", split);
            assert_eq!(streams[0].body(), b"payload");
        }
    }

    #[test]
    fn test_head_exact_read_minimal_message() {
        let (conn, receiver, _bc) = new_conn();
        let raw = wire(&[b""]);
        assert_eq!(raw.len(), STREAM_HEAD_SIZE);
        conn.on_read_bytes(&raw);
        assert_eq!(receiver.streams.lock().unwrap().len(), 1);
        // Parser is idle again: a following message still parses.
        conn.on_read_bytes(&wire(&[b"next"]));
        assert_eq!(receiver.streams.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_head_exact_read_longer_message_pends() {
        let (conn, receiver, _bc) = new_conn();
        let raw = wire(&[b"pending body"]);
        conn.on_read_bytes(&raw[..STREAM_HEAD_SIZE]);
        assert!(receiver.streams.lock().unwrap().is_empty());
        conn.on_read_bytes(&raw[STREAM_HEAD_SIZE..]);
        assert_eq!(receiver.streams.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_tail_plus_next_head_in_one_read() {
        let m1 = wire(&[b"first-message"]);
        let m2 = wire(&[b"second"]);
        let (conn, receiver, _bc) = new_conn();
        let cut = m1.len() - 3;
        conn.on_read_bytes(&m1[..cut]);
        let mut joined = m1[cut..].to_vec();
        joined.extend_from_slice(&m2[..5]);
        conn.on_read_bytes(&joined);
        conn.on_read_bytes(&m2[5..]);
        let streams = receiver.streams.lock().unwrap();
        let bodies: Vec<&[u8]> = streams.iter().map(|s| s.body()).collect();
        assert_eq!(bodies, vec![b"first-message" as &[u8], b"second"]);
    }

    #[test]
    fn test_bad_check_single_error_no_delivery() {
        let (conn, receiver, _bc) = new_conn();
        let mut raw = wire(&[b"corrupt-me"]);
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        conn.on_read_bytes(&raw);
        assert!(receiver.streams.lock().unwrap().is_empty());
        let errors = receiver.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code(), ERR_STREAM.code());
        assert!(!conn.is_running());
    }

    #[test]
    fn test_bad_magic_single_error() {
        let (conn, receiver, _bc) = new_conn();
        let mut raw = wire(&[b"x"]);
        raw[0] = STREAM_MAGIC ^ 0xff;
        conn.on_read_bytes(&raw);
        let errors = receiver.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(receiver.streams.lock().unwrap().is_empty());
    }

    #[test]
    fn test_conn_ids_are_unique_and_ordered() {
        let (first, _r1, _b1) = new_conn();
        let (second, _r2, _b2) = new_conn();
        assert_ne!(first.id(), second.id());
        assert!(second.id() > first.id());
    }

    #[test]
    fn test_open_close_exactly_once() {
        let (conn, receiver, _bc) = new_conn();
        conn.on_open();
        conn.close();
        conn.on_close();
        conn.on_close();
        assert_eq!(*receiver.opens.lock().unwrap(), 1);
        assert_eq!(*receiver.closes.lock().unwrap(), 1);
    }

    #[test]
    fn test_no_delivery_after_close() {
        let (conn, receiver, _bc) = new_conn();
        let raw = wire(&[b"late"]);
        conn.close();
        conn.on_read_bytes(&raw);
        assert!(receiver.streams.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fill_write_round_trip_small_buffer() {
        let (conn, receiver, _bc) = new_conn();
        conn.write_stream_and_release(RpcStream::from_body(b"first"));
        conn.write_stream_and_release(RpcStream::from_body(b"second, a bit longer"));
        assert!(receiver.errors.lock().unwrap().is_empty());
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let n = conn.on_fill_write(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        let expected = wire(&[b"first", b"second, a bit longer"]);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_has_partial_read_tracks_assembly() {
        let (conn, _receiver, _bc) = new_conn();
        assert!(!conn.has_partial_read());
        let raw = wire(&[b"split me"]);
        // Mid-head.
        conn.on_read_bytes(&raw[..3]);
        assert!(conn.has_partial_read());
        // Head done, body pending.
        conn.on_read_bytes(&raw[3..STREAM_HEAD_SIZE + 2]);
        assert!(conn.has_partial_read());
        // Complete: idle again.
        conn.on_read_bytes(&raw[STREAM_HEAD_SIZE + 2..]);
        assert!(!conn.has_partial_read());
    }

    #[test]
    fn test_fill_write_empty_queue() {
        let (conn, _receiver, _bc) = new_conn();
        let mut buf = [0u8; 64];
        assert_eq!(conn.on_fill_write(&mut buf), 0);
    }

    #[test]
    fn test_write_after_close_reports_error() {
        let (conn, receiver, _bc) = new_conn();
        conn.close();
        conn.write_stream_and_release(RpcStream::from_body(b"too late"));
        let errors = receiver.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
    }
}
