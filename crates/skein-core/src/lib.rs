//! # SKEIN Core
//!
//! Core protocol implementation for SKEIN (Striped Kinetic Exchange over
//! Independent Networks), a multipath QUIC-like transport for time-stamped
//! media. A single logical session is spread over several independently
//! congestion-controlled datagram paths, and offers both reliable and
//! *unreliable* ordered streams: unreliable streams never retransmit lost
//! data, and the receiver forward-fills aged holes with zero bytes.
//!
//! This crate provides:
//! - Frame model and ACK ranges
//! - Per-path RTT estimation, loss detection and congestion control
//!   (CUBIC single-path, OLIA coupled multipath)
//! - Per-path received-packet tracking and ACK generation
//! - Stream reassembly with gap tracking and zero-fill
//! - Stream registry, path scheduler and session glue
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Session                             │
//! │   (stream registry, scheduler, frame fan-out)                 │
//! ├───────────────┬───────────────────────────────┬───────────────┤
//! │    Path 0     │            Path 1             │    Path N     │
//! │  rtt / cc /   │   sent + received handlers,   │      ...      │
//! │  pn gen       │   timer task                  │               │
//! ├───────────────┴───────────────────────────────┴───────────────┤
//! │                      Connection capability                    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cryptographic packet protection is a collaborator, not a component:
//! the session consumes an [`session::Unpacker`] capability and ships a
//! passthrough [`session::NullSealer`] for tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ackhandler;
pub mod congestion;
pub mod error;
pub mod frame;
pub mod pn;
pub mod protocol;
pub mod rtt;
pub mod session;
pub mod sorter;

pub use error::{Error, ErrorCode};
pub use frame::{AckRange, Frame, StreamFrame};
pub use protocol::{ByteCount, PacketNumber, PathId, Perspective, StreamId, Version};
pub use rtt::RttStats;
pub use session::{SchedulerStrategy, Session, SessionConfig, Stream};
