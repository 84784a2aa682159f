//! # rivet-stream
//!
//! This crate provides the message framing layer of `rivet-rpc`.
//! It is used by the transport crates to turn raw byte streams into
//! self-delimited RPC messages and back.
//!
//! ## Components
//!
//! `rivet-rpc` is designed to be modular and pluggable:
//!
//! - [`rivet-rpc-core`](https://docs.rs/rivet-rpc-core): typed errors, the
//!   panic bus and the open/run/close lifecycle controller.
//! - [`rivet-rpc-tcp`](https://docs.rs/rivet-rpc-tcp): kqueue/epoll pollers,
//!   the listener/channel machinery and the server/client adapters.
//!
//! ## The Design
//!
//! Each connection is a two-stage pipeline. The byte-level side (the
//! transport's raw conn) owns the fd and its buffers; the
//! [`StreamConn`](crate::conn::StreamConn) on top owns the framing state
//! and a bounded queue of outbound streams. Inbound bytes flow up through
//! [`on_read_bytes`](crate::conn::StreamConn::on_read_bytes) and complete
//! messages are handed to the
//! [`StreamReceiver`](crate::receiver::StreamReceiver). Outbound streams
//! are pulled down by the writer through
//! [`on_fill_write`](crate::conn::StreamConn::on_fill_write) in enqueue
//! order.
//!
//! ## Protocol
//!
//! The wire format is described in [`crate::proto`]: a fixed head with a
//! little-endian length covering the whole message, an opaque body, and a
//! trailing check byte.

#[macro_use]
extern crate captains_log;

pub mod conn;
pub mod proto;
pub mod receiver;

pub use conn::{ByteConn, StreamConn};
pub use proto::{RpcStream, STREAM_HEAD_SIZE};
pub use receiver::{HandshakeAdapter, StreamReceiver};
pub use rivet_rpc_core::{ClientConfig, ServerConfig};
