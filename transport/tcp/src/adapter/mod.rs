//! Lifecycle adapters binding the transport pieces into open/run/close
//! endpoints.

mod client;
mod server;

pub use client::ClientAdapter;
pub use server::ServerAdapter;
