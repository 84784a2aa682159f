//! The dialing endpoint: blocking connect with automatic reconnect under an
//! open/run/close lifecycle.

use crate::addr::{ParsedAddr, parse_url};
use crate::conn::SyncConn;
use rivet_rpc_core::error::{ERR_WS_HANDSHAKE, Error};
use rivet_rpc_core::orc::OrcManager;
use rivet_rpc_core::panic_bus::PanicBus;
use rivet_stream::{ByteConn, ClientConfig, HandshakeAdapter, StreamConn, StreamReceiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(50);

/// A dialing endpoint. `run` owns the reconnect loop and blocks until close;
/// the receiver sees conn open/close and inbound streams as they happen.
pub struct ClientAdapter {
    orc: OrcManager,
    config: Arc<ClientConfig>,
    receiver: Arc<dyn StreamReceiver>,
    handshake: Option<Arc<dyn HandshakeAdapter>>,
    panic_bus: Option<Arc<PanicBus>>,
    target: Mutex<Option<ParsedAddr>>,
    current: Mutex<Option<Arc<SyncConn>>>,
}

impl ClientAdapter {
    pub fn new(
        config: ClientConfig, receiver: Arc<dyn StreamReceiver>,
        handshake: Option<Arc<dyn HandshakeAdapter>>, panic_bus: Option<Arc<PanicBus>>,
    ) -> Self {
        Self {
            orc: OrcManager::new(),
            config: Arc::new(config),
            receiver,
            handshake,
            panic_bus,
            target: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    /// Record the dial target and arm the lifecycle. Does not connect yet;
    /// the first attempt happens in [`ClientAdapter::run`].
    pub fn open(&self, url: &str) -> Result<(), Error> {
        let parsed = parse_url(url)?;
        if parsed.scheme.is_websocket() && self.handshake.is_none() {
            let err = Error::new(&ERR_WS_HANDSHAKE)
                .with_message(format!("no handshake adapter for {}", url));
            if let Some(bus) = &self.panic_bus {
                bus.publish(&err);
            }
            return Err(err);
        }
        let mut opened = false;
        self.orc.open(|| {
            *self.target.lock().unwrap() = Some(parsed);
            opened = true;
            true
        });
        if opened { Ok(()) } else { Err(Error::temp("client already open or closing")) }
    }

    /// Connect, pump reads, reconnect on loss. Blocks until closed. Connect
    /// attempts are spaced at least `reconnect_min` apart.
    pub fn run(&self) -> bool {
        self.orc.run(|is_running| {
            let target = match self.target.lock().unwrap().clone() {
                Some(t) => t,
                None => return false,
            };
            while is_running() {
                let attempt_at = Instant::now();
                let stream = StreamConn::new(self.receiver.clone(), self.config.write_queue_cap);
                let handshake =
                    if target.scheme.is_websocket() { self.handshake.as_ref() } else { None };
                match SyncConn::connect(&target, stream, &self.config, handshake) {
                    Ok(conn) => {
                        *self.current.lock().unwrap() = Some(conn.clone());
                        // A close may have raced the connect; it only saw
                        // `current` as it was before our store.
                        if !is_running() {
                            conn.close();
                        }
                        // Blocks until peer loss or our own close.
                        conn.read_loop();
                        self.current.lock().unwrap().take();
                    }
                    Err(e) => {
                        debug!("connect {} failed: {}", target.host, e);
                        self.receiver.on_conn_error(None, e);
                    }
                }
                while is_running() && attempt_at.elapsed() < self.config.reconnect_min {
                    std::thread::sleep(POLL_SLICE);
                }
            }
            true
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.orc.is_running()
    }

    /// Whether a live connection is currently attached.
    pub fn is_connected(&self) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(c) => c.is_running(),
            None => false,
        }
    }

    /// Stop reconnecting and drop the live connection, if any.
    pub fn close(&self) -> bool {
        // The live conn must go down before the run loop can release its
        // lock: `read_loop` blocks until the socket is shut down.
        self.orc.close(
            || {
                if let Some(conn) = self.current.lock().unwrap().take() {
                    conn.close();
                }
                true
            },
            || {
                self.target.lock().unwrap().take();
            },
        )
    }
}
