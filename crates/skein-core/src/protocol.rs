//! Protocol-wide types and tunables.

use std::time::Duration;

/// Packet number, 64-bit monotonic within a path.
pub type PacketNumber = u64;

/// Stream identifier. Client-initiated streams are odd (1, 3, ...),
/// server-initiated streams are even (2, 4, ...).
pub type StreamId = u64;

/// Path identifier within a session.
pub type PathId = u8;

/// Byte count or byte offset within a stream.
pub type ByteCount = u64;

/// The initial path every session starts with.
pub const INITIAL_PATH_ID: PathId = 0;

/// Maximum byte offset, used as the open end of the first sorter gap.
pub const MAX_BYTE_COUNT: ByteCount = ByteCount::MAX - 1;

/// Which side of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// The connecting side; allocates odd stream ids starting at 1.
    Client,
    /// The accepting side; allocates even stream ids starting at 2.
    Server,
}

impl Perspective {
    /// The opposite side.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Protection level a packet was sealed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Cleartext, pre-handshake.
    Unencrypted,
    /// Protected with handshake keys.
    Secure,
    /// Protected with forward-secure keys; the steady state.
    ForwardSecure,
}

/// Protocol version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(
    /// Raw version number.
    pub u32,
);

impl Version {
    /// First version that no longer requires an ACK every 20 packets.
    pub const V39: Version = Version(39);
    /// First version with coupled multipath congestion control.
    pub const MULTIPATH: Version = Version(40);
    /// Default version spoken by this implementation.
    pub const DEFAULT: Version = Version(40);
}

/// Cap on per-path in-flight plus retransmit-queued archived packets.
pub const MAX_TRACKED_SENT_PACKETS: usize = 5000;

/// Cap on skipped packet numbers kept for optimistic-ACK detection.
pub const MAX_TRACKED_SKIPPED_PACKETS: usize = 10;

/// Cap on disjoint ACK ranges kept per path.
pub const MAX_TRACKED_RECEIVED_ACK_RANGES: usize = 1000;

/// Pre-v39 versions ACK at least every this many packets.
pub const MAX_PACKETS_RECEIVED_BEFORE_ACK_SEND: usize = 20;

/// Retransmittable packets received before an ACK is queued.
pub const RETRANSMITTABLE_PACKETS_BEFORE_ACK: usize = 2;

/// Delay before a pending ACK is sent without further triggers.
pub const ACK_SEND_DELAY: Duration = Duration::from_millis(25);

/// Lower clamp for a path timer deadline.
pub const MIN_PATH_TIMER: Duration = Duration::from_millis(10);

/// Upper clamp for a path timer deadline, to avoid idling.
pub const MAX_PATH_TIMER: Duration = Duration::from_secs(1);

/// Cap on gaps tracked by a stream frame sorter.
pub const MAX_STREAM_FRAME_SORTER_GAPS: usize = 1000;

/// Arrival-time spread after which an unreliable stream zero-fills its
/// first gap.
pub const UNRELIABLE_GAP_AGE_THRESHOLD: Duration = Duration::from_millis(70);

/// Average period between deliberately skipped packet numbers.
pub const SKIP_PACKET_AVERAGE_PERIOD: PacketNumber = 500;

/// Non-retransmittable packets sent in a row before a PING is forced.
pub const MAX_NON_RETRANSMITTABLE_PACKETS: usize = 19;

/// Largest forward jump in peer-initiated stream ids that will be
/// materialized implicitly.
pub const MAX_NEW_STREAM_ID_DELTA: StreamId = 110;

/// Default cap on locally-initiated open streams.
pub const DEFAULT_MAX_OUTGOING_STREAMS: usize = 100;

/// Default cap on peer-initiated open streams.
pub const DEFAULT_MAX_INCOMING_STREAMS: usize = 100;

/// Initial per-stream receive window.
pub const RECEIVE_STREAM_FLOW_CONTROL_WINDOW: ByteCount = 1 << 20;

/// Initial connection-level receive window.
pub const RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW: ByteCount = 1 << 21;

/// Maximum bytes of stream data packed into one packet.
pub const MAX_PACKET_PAYLOAD: ByteCount = 1350;
