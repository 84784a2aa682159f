//! # rivet-rpc-tcp
//!
//! This crate provides the TCP transport for [`rivet-stream`](https://docs.rs/rivet-stream).
//! It is used for both client and server communication over TCP.
//!
//! The server side multiplexes connections over per-core
//! [`Poller`](crate::poller::Poller) event loops (epoll on Linux, kqueue on
//! BSD/Darwin); the client side is a blocking reconnect loop. Both feed the
//! same framing pipeline from `rivet-stream`.

#[macro_use]
extern crate captains_log;

mod addr;
pub use addr::{ParsedAddr, Scheme, parse_url};
pub mod adapter;
mod channel;
pub use channel::Channel;
mod conn;
pub use conn::{RawConn, SyncConn};
mod listener;
pub use listener::{AcceptSink, Listener};
mod manager;
pub use manager::ChannelManager;
pub mod poller;

use rivet_rpc_core::error::{Error, ErrorDef};

/// Wrap an errno into a typed error with a context debug line.
pub(crate) fn errno_err(def: &'static ErrorDef, ctx: &str, e: nix::errno::Errno) -> Error {
    Error::new(def).with_debug(&format!("{}: {}", ctx, e))
}
