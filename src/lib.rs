//! # rivet-rpc
//!
//! The network transport core of the rivet RPC framework. This facade crate
//! re-exports the pieces most applications need:
//!
//! - [`core`](rivet_rpc_core): typed errors, the panic bus, the
//!   open/run/close lifecycle controller and small clock/seed services.
//! - [`stream`](rivet_stream): the message framing layer turning raw byte
//!   streams into self-delimited RPC messages.
//! - [`tcp`](rivet_rpc_tcp): the TCP transport with per-core epoll/kqueue
//!   pollers on the server side and a blocking reconnect loop on the client
//!   side.
//!
//! A server is a [`ServerAdapter`] fed by a [`StreamReceiver`]; a client is
//! a [`ClientAdapter`] with the same receiver seam. Both speak the framing
//! protocol from [`rivet_stream::proto`].

pub use rivet_rpc_core as core;
pub use rivet_rpc_tcp as tcp;
pub use rivet_stream as stream;

pub use rivet_rpc_core::error::{Error, ErrorLevel};
pub use rivet_rpc_core::orc::OrcManager;
pub use rivet_rpc_core::panic_bus::PanicBus;
pub use rivet_rpc_core::{AllocPolicy, ClientConfig, ServerConfig};
pub use rivet_rpc_tcp::adapter::{ClientAdapter, ServerAdapter};
pub use rivet_stream::{HandshakeAdapter, RpcStream, StreamConn, StreamReceiver};
