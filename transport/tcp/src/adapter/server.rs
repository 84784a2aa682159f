//! The server endpoint: listener + channel manager under an open/run/close
//! lifecycle.

use crate::addr::parse_url;
use crate::listener::{AcceptSink, Listener};
use crate::manager::ChannelManager;
use rivet_rpc_core::error::{ERR_UNSUPPORTED_PROTOCOL, Error, ErrorLevel};
use rivet_rpc_core::orc::OrcManager;
use rivet_rpc_core::panic_bus::PanicBus;
use rivet_stream::{ServerConfig, StreamConn, StreamReceiver};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(50);

/// Bridges accepted fds into stream conns on the channel pool.
struct ServerSink {
    manager: Arc<ChannelManager>,
    receiver: Arc<dyn StreamReceiver>,
    write_queue_cap: usize,
    panic_bus: Option<Arc<PanicBus>>,
}

impl AcceptSink for ServerSink {
    fn on_accept(&self, fd: OwnedFd) {
        let stream = StreamConn::new(self.receiver.clone(), self.write_queue_cap);
        if let Err(e) = self.manager.add_conn(fd, stream) {
            self.receiver.on_conn_error(None, e);
        }
    }

    fn on_accept_error(&self, err: Error) {
        if err.level() == ErrorLevel::Fatal {
            if let Some(bus) = &self.panic_bus {
                bus.publish(&err);
                return;
            }
        }
        self.receiver.on_conn_error(None, err);
    }
}

struct Running {
    listener: Listener,
    manager: Arc<ChannelManager>,
}

/// A serving endpoint. `open` binds, `run` blocks, `close` drains.
pub struct ServerAdapter {
    orc: OrcManager,
    config: Arc<ServerConfig>,
    receiver: Arc<dyn StreamReceiver>,
    panic_bus: Option<Arc<PanicBus>>,
    running: Mutex<Option<Running>>,
}

impl ServerAdapter {
    pub fn new(
        config: ServerConfig, receiver: Arc<dyn StreamReceiver>,
        panic_bus: Option<Arc<PanicBus>>,
    ) -> Self {
        Self {
            orc: OrcManager::new(),
            config: Arc::new(config),
            receiver,
            panic_bus,
            running: Mutex::new(None),
        }
    }

    /// Bind and start accepting. Returns the bound address (useful for
    /// `:0` listens). Websocket schemes are dial-side only.
    pub fn open(&self, url: &str) -> Result<SocketAddr, Error> {
        let parsed = parse_url(url)?;
        if parsed.scheme.is_websocket() {
            return Err(Error::new(&ERR_UNSUPPORTED_PROTOCOL)
                .with_message("websocket schemes are client-side only"));
        }
        let mut result: Result<SocketAddr, Error> =
            Err(Error::temp("server already open or closing"));
        self.orc.open(|| {
            let manager = match ChannelManager::new(self.config.clone()) {
                Ok(m) => Arc::new(m),
                Err(e) => {
                    result = Err(e);
                    return false;
                }
            };
            let sink = Arc::new(ServerSink {
                manager: manager.clone(),
                receiver: self.receiver.clone(),
                write_queue_cap: self.config.write_queue_cap,
                panic_bus: self.panic_bus.clone(),
            });
            let listener = match Listener::start(&parsed, sink) {
                Ok(l) => l,
                Err(e) => {
                    let _ = manager.close();
                    result = Err(e);
                    return false;
                }
            };
            result = Ok(listener.local_addr());
            *self.running.lock().unwrap() = Some(Running { listener, manager });
            true
        });
        result
    }

    /// Block the calling thread until the endpoint is closed.
    pub fn run(&self) -> bool {
        self.orc.run(|is_running| {
            while is_running() {
                std::thread::sleep(POLL_SLICE);
            }
            true
        })
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.orc.is_running()
    }

    pub fn active_conns(&self) -> usize {
        match self.running.lock().unwrap().as_ref() {
            Some(r) => r.manager.total_active(),
            None => 0,
        }
    }

    /// Stop accepting, wait up to `server_close_wait` for conns to drain,
    /// then tear the channels down.
    pub fn close(&self) -> bool {
        self.orc.close(
            || true,
            || {
                let taken = self.running.lock().unwrap().take();
                if let Some(r) = taken {
                    if let Err(e) = r.listener.close() {
                        warn!("server close: {}", e);
                    }
                    let deadline = Instant::now() + self.config.server_close_wait;
                    while r.manager.total_active() > 0 && Instant::now() < deadline {
                        std::thread::sleep(POLL_SLICE);
                    }
                    let remain = r.manager.total_active();
                    if remain > 0 {
                        warn!("server close: {} conns still active, forcing", remain);
                    }
                    if let Err(e) = r.manager.close() {
                        warn!("server close: {}", e);
                    }
                }
            },
        )
    }
}
