//! Session configuration.

use crate::protocol::{
    Perspective, Version, ACK_SEND_DELAY, DEFAULT_MAX_INCOMING_STREAMS,
    DEFAULT_MAX_OUTGOING_STREAMS,
};
use std::time::Duration;

/// Path selection strategy used by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerStrategy {
    /// Prefer the path with the smallest smoothed RTT.
    #[default]
    LowLatency,
    /// Rotate over usable paths by dispatch quota.
    RoundRobin,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which side of the connection this session is.
    pub perspective: Perspective,

    /// Protocol version to speak.
    pub version: Version,

    /// Cap on locally-initiated open streams.
    pub max_outgoing_streams: usize,

    /// Cap on peer-initiated open streams.
    pub max_incoming_streams: usize,

    /// Idle timeout per path.
    pub idle_timeout: Duration,

    /// Timeout while the handshake is incomplete.
    pub handshake_timeout: Duration,

    /// Delay before a pending ACK is sent without further triggers.
    pub ack_send_delay: Duration,

    /// Path selection strategy.
    pub scheduler: SchedulerStrategy,

    /// Couple non-initial paths through OLIA. Off by default; single-path
    /// sessions and sessions that merely speak a multipath-capable
    /// version stay on per-path CUBIC.
    pub multipath: bool,
}

impl SessionConfig {
    /// Default configuration for one perspective.
    #[must_use]
    pub fn new(perspective: Perspective) -> Self {
        Self {
            perspective,
            version: Version::DEFAULT,
            max_outgoing_streams: DEFAULT_MAX_OUTGOING_STREAMS,
            max_incoming_streams: DEFAULT_MAX_INCOMING_STREAMS,
            idle_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            ack_send_delay: ACK_SEND_DELAY,
            scheduler: SchedulerStrategy::default(),
            multipath: false,
        }
    }
}
