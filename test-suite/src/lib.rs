//! End-to-end tests for the rivet-rpc transport core.
//!
//! Scenarios live under [`transport`]; this module holds the shared runner
//! and the receiver doubles used on both sides of a connection.

pub mod transport;

extern crate captains_log;
extern crate log;
pub use captains_log::logfn;
pub use captains_log::*;
pub use rstest::*;
use std::fmt;

use rivet_rpc_core::error::Error;
use rivet_stream::{RpcStream, StreamConn, StreamReceiver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

pub struct TestRunner {}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/rivet_rpc_test.log", Level::Trace)
            .test()
            .build()
            .expect("log");
        Self {}
    }
}

/// Poll `cond` for up to `timeout`, in small slices.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Server-side receiver that echoes every message back on its conn.
#[derive(Default)]
pub struct EchoReceiver {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub received: AtomicUsize,
    pub errors: Mutex<Vec<Error>>,
}

impl StreamReceiver for EchoReceiver {
    fn on_conn_open(&self, _conn: &Arc<StreamConn>) {
        self.opened.fetch_add(1, Ordering::AcqRel);
    }

    fn on_conn_close(&self, _conn: &Arc<StreamConn>) {
        self.closed.fetch_add(1, Ordering::AcqRel);
    }

    fn on_conn_read_stream(&self, conn: &Arc<StreamConn>, stream: RpcStream) {
        self.received.fetch_add(1, Ordering::AcqRel);
        let mut reply = RpcStream::new();
        reply.write_bytes(stream.body());
        reply.seal();
        conn.write_stream_and_release(reply);
    }

    fn on_conn_error(&self, _conn: Option<&Arc<StreamConn>>, err: Error) {
        warn!("echo receiver error: {}", err);
        self.errors.lock().unwrap().push(err);
    }
}

/// Client-side receiver that collects bodies and tracks the live conn.
#[derive(Default)]
pub struct CollectReceiver {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub bodies: Mutex<Vec<Vec<u8>>>,
    pub errors: Mutex<Vec<Error>>,
    pub conn: Mutex<Option<Arc<StreamConn>>>,
}

impl CollectReceiver {
    /// Frame and enqueue `body` on the live conn. Panics when disconnected.
    pub fn send(&self, body: &[u8]) {
        let conn = self.conn.lock().unwrap().clone().expect("not connected");
        let mut stream = RpcStream::new();
        stream.write_bytes(body);
        stream.seal();
        conn.write_stream_and_release(stream);
    }
}

impl StreamReceiver for CollectReceiver {
    fn on_conn_open(&self, conn: &Arc<StreamConn>) {
        self.opened.fetch_add(1, Ordering::AcqRel);
        *self.conn.lock().unwrap() = Some(conn.clone());
    }

    fn on_conn_close(&self, _conn: &Arc<StreamConn>) {
        self.closed.fetch_add(1, Ordering::AcqRel);
        self.conn.lock().unwrap().take();
    }

    fn on_conn_read_stream(&self, _conn: &Arc<StreamConn>, stream: RpcStream) {
        self.bodies.lock().unwrap().push(stream.body().to_vec());
    }

    fn on_conn_error(&self, _conn: Option<&Arc<StreamConn>>, err: Error) {
        debug!("collect receiver error: {}", err);
        self.errors.lock().unwrap().push(err);
    }
}
