//! # rivet-rpc-core
//!
//! This crate provides the core utilities for [`rivet-rpc`](https://docs.rs/rivet-rpc).
//! It includes the typed error registry, the process panic bus, the
//! open/run/close lifecycle controller, and the clock/seed services shared
//! by the transport crates.

mod config;
pub use config::*;
pub mod error;
pub mod orc;
pub mod panic_bus;
pub mod utils;
