//! Per-path packet acknowledgment handling.
//!
//! Every path owns one [`SentPacketHandler`] that archives in-flight
//! packets, ingests ACKs, detects losses and drives the TLP/RTO alarm
//! ladder, and one [`ReceivedPacketHandler`] that tracks received packet
//! numbers and decides when an ACK is due.

mod history;
mod received;
mod sent;

pub use history::ReceivedPacketHistory;
pub use received::ReceivedPacketHandler;
pub use sent::{SentPacketHandler, StopWaitingManager};

use crate::frame::Frame;
use crate::protocol::{ByteCount, EncryptionLevel, PacketNumber};
use std::time::Instant;

/// A packet archived by the sent-packet handler.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet number on its path.
    pub pn: PacketNumber,
    /// Frames the packet carried. Non-retransmittable frames are stripped
    /// when the packet is archived.
    pub frames: Vec<Frame>,
    /// Wire length in bytes.
    pub length: ByteCount,
    /// Protection level the packet was sealed at.
    pub encryption_level: EncryptionLevel,
    /// When the packet was handed to the connection.
    pub send_time: Instant,
}

impl Packet {
    /// Whether any carried frame still requires retransmission on loss.
    #[must_use]
    pub fn is_retransmittable(&self) -> bool {
        crate::frame::has_retransmittable(&self.frames)
    }

    /// Frames that must be replayed if this packet is lost.
    #[must_use]
    pub fn frames_for_retransmission(&self) -> &[Frame] {
        &self.frames
    }
}
