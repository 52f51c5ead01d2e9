//! Error types for the SKEIN protocol core.

use crate::protocol::StreamId;
use thiserror::Error;

/// QUIC-style error codes carried on protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Peer acknowledged data it could not have received.
    InvalidAckData,
    /// Stream id violates parity or range rules.
    InvalidStreamId,
    /// Stream limit exhausted.
    TooManyOpenStreams,
    /// Peer exceeded an advertised flow control window.
    FlowControlReceivedTooMuchData,
    /// Packet failed authenticated decryption.
    DecryptionFailure,
    /// Connection or path idled past its timeout.
    NetworkIdleTimeout,
    /// Internal invariant violated.
    InternalError,
}

/// Top-level protocol error.
#[derive(Debug, Error)]
pub enum Error {
    /// ACK bookkeeping error
    #[error("ack error: {0}")]
    Ack(#[from] AckError),

    /// Stream reassembly error
    #[error("sorter error: {0}")]
    Sorter(#[from] SorterError),

    /// Stream state error
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Stream registry error
    #[error("streams map error: {0}")]
    StreamMap(#[from] StreamMapError),

    /// Datagram connection error
    #[error("connection error: {0}")]
    Conn(#[from] skein_transport::ConnError),

    /// Fatal protocol violation with a QUIC-style code
    #[error("protocol violation ({code:?}): {reason}")]
    Protocol {
        /// Error code reported to the peer
        code: ErrorCode,
        /// Human-readable detail
        reason: String,
    },
}

impl Error {
    /// Construct a protocol violation.
    #[must_use]
    pub fn protocol(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            reason: reason.into(),
        }
    }

    /// Whether this error must tear down the whole session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol { .. } => true,
            Self::Ack(e) => e.is_fatal(),
            Self::Sorter(e) => matches!(e, SorterError::TooManyGaps),
            Self::Stream(_) | Self::StreamMap(_) | Self::Conn(_) => false,
        }
    }
}

/// Errors raised by the sent/received packet handlers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckError {
    /// A packet was submitted with a non-increasing packet number.
    #[error("already sent a packet with a higher packet number")]
    PacketNumberNotIncreasing,

    /// The archive of unacked and retransmit-queued packets is full.
    #[error("too many outstanding non-acked and non-retransmitted packets")]
    TooManyTrackedSentPackets,

    /// An ACK arrived for a packet number that was never sent.
    #[error("received ACK for an unsent packet")]
    AckForUnsentPacket,

    /// An ACK arrived inside a packet older than one already processed.
    #[error("duplicate or out-of-order ACK")]
    DuplicateOrOutOfOrderAck,

    /// An ACK covered a deliberately skipped packet number.
    #[error("received an ACK for a skipped packet number")]
    AckForSkippedPacket,

    /// Received packet number zero.
    #[error("invalid packet number 0")]
    InvalidPacketNumber,

    /// The received-packet history holds too many disjoint ranges.
    #[error("too many disjoint ranges in received packet history")]
    TooManyOutstandingReceivedAckRanges,
}

impl AckError {
    /// Whether this error is a session-fatal protocol violation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AckForUnsentPacket | Self::AckForSkippedPacket | Self::InvalidPacketNumber
        )
    }

    /// The QUIC-style code for fatal variants.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AckForUnsentPacket | Self::AckForSkippedPacket => ErrorCode::InvalidAckData,
            Self::InvalidPacketNumber => ErrorCode::InternalError,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Errors raised by the stream frame sorter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SorterError {
    /// Frame carries data already delivered or queued.
    #[error("duplicate stream data")]
    DuplicateStreamData,

    /// Frame carries no data and no FIN.
    #[error("stream data empty")]
    EmptyStreamData,

    /// The gap list exceeded its cap; the peer is sending pathological
    /// reordering.
    #[error("too many gaps in received stream data")]
    TooManyGaps,
}

/// Errors surfaced on stream I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A read or write deadline elapsed. Transient.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The stream was cancelled by session teardown.
    #[error("stream {0} was cancelled: {1}")]
    Cancelled(StreamId, String),

    /// The stream was reset locally.
    #[error("stream {0} was reset locally")]
    ResetLocal(StreamId),

    /// The peer reset the stream.
    #[error("stream {0} was reset by the peer")]
    ResetRemote(StreamId),

    /// Write on a stream that was already closed for writing.
    #[error("write on closed stream {0}")]
    WriteOnClosedStream(StreamId),
}

impl StreamError {
    /// True for errors that a caller may retry after.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// True for deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

/// Errors raised by the stream registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamMapError {
    /// Local or remote stream limit reached. Transient; retry after
    /// streams close.
    #[error("too many open streams")]
    TooManyOpenStreams,

    /// Peer used a stream id with the wrong parity or out of range.
    #[error("invalid stream id {0}: {1}")]
    InvalidStreamId(StreamId, String),

    /// The registry was shut down with an error.
    #[error("streams map closed: {0}")]
    Closed(String),
}

/// Packet-level receive errors that stay local to a path.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// Authenticated decryption failed; possibly attacker-injected.
    #[error("packet decryption failed")]
    DecryptionFailure,

    /// Malformed plaintext after successful decryption.
    #[error("malformed packet payload: {0}")]
    Malformed(String),
}

/// Convenience alias for results with [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
