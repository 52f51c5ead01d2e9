//! # SKEIN Transport
//!
//! Datagram connection capability consumed by the SKEIN protocol core.
//!
//! This crate provides:
//! - The [`Connection`] trait: a bound datagram endpoint with a mutable
//!   notion of the peer's current remote address
//! - [`UdpConnection`]: a Tokio UDP implementation
//! - [`MemoryConnection`]: an in-process pair with configurable loss,
//!   used by integration tests
//!
//! Socket tuning, NAT traversal and address discovery are out of scope;
//! a `Connection` is handed to a session fully plumbed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod memory;
pub mod udp;

pub use connection::{ConnError, ConnResult, Connection, Datagram};
pub use memory::MemoryConnection;
pub use udp::UdpConnection;
