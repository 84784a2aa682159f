//! The callback surface between the transport and the upper layer.

use crate::conn::StreamConn;
use rivet_rpc_core::error::Error;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

/// The four callbacks the transport exposes to the RPC layer.
///
/// All callbacks fire on transport threads and must not block; hand off to
/// your own pool for real work. Per connection, `on_conn_close` is
/// delivered exactly once after `on_conn_open`, and no
/// `on_conn_read_stream` follows the close.
pub trait StreamReceiver: Send + Sync + 'static {
    fn on_conn_open(&self, conn: &Arc<StreamConn>);

    fn on_conn_close(&self, conn: &Arc<StreamConn>);

    fn on_conn_read_stream(&self, conn: &Arc<StreamConn>, stream: crate::proto::RpcStream);

    /// `conn` is None for errors that precede a connection (connect or
    /// scheme failures on the client).
    fn on_conn_error(&self, conn: Option<&Arc<StreamConn>>, err: Error);
}

/// Client-side protocol upgrade hook for `ws` / `wss` style schemes.
///
/// Runs on a freshly connected blocking socket before the framed pipeline
/// attaches. Implementations must complete within `timeout` (the adapter
/// configures 5 seconds) and must only accept binary frames afterwards;
/// the error registry carries the codes for both violations.
pub trait HandshakeAdapter: Send + Sync + 'static {
    fn client_upgrade(&self, fd: BorrowedFd, host: &str, timeout: Duration) -> Result<(), Error>;
}
