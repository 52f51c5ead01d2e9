//! Congestion control for SKEIN paths.
//!
//! Two senders behind one trait: [`CubicSender`] for single-path sessions
//! and the initial path, and [`OliaSender`] for the non-initial paths of a
//! multipath session. OLIA senders of one session share an
//! [`OliaRegistry`] so each path's window growth couples on its peers.

mod cubic;
mod olia;

pub use cubic::CubicSender;
pub use olia::{OliaRegistry, OliaSender};

use crate::protocol::{ByteCount, PacketNumber};
use std::time::Duration;

/// Bytes assumed per packet for window arithmetic.
pub const MAX_SEGMENT_SIZE: ByteCount = 1350;

/// Initial congestion window, in packets.
pub const INITIAL_CONGESTION_WINDOW: ByteCount = 32;

/// Hard cap on the congestion window, in packets.
pub const DEFAULT_MAX_CONGESTION_WINDOW: ByteCount = 1000;

/// Smallest window a sender may shrink to, in packets.
pub const MIN_CONGESTION_WINDOW: ByteCount = 2;

/// Floor for the retransmission delay hint.
pub const MIN_RETRANSMISSION_DELAY: Duration = Duration::from_millis(200);

/// Ceiling for the retransmission delay hint.
pub const MAX_RETRANSMISSION_DELAY: Duration = Duration::from_secs(60);

/// Congestion control hooks invoked by a path's sent-packet handler.
pub trait SendAlgorithm: Send {
    /// A packet left the path.
    fn on_packet_sent(
        &mut self,
        bytes_in_flight: ByteCount,
        pn: PacketNumber,
        bytes: ByteCount,
        is_retransmittable: bool,
    );

    /// A packet was acknowledged. `bytes_in_flight` is the value after
    /// the acked packet was removed.
    fn on_packet_acked(&mut self, pn: PacketNumber, bytes: ByteCount, bytes_in_flight: ByteCount);

    /// A packet was declared lost.
    fn on_packet_lost(&mut self, pn: PacketNumber, bytes: ByteCount, bytes_in_flight: ByteCount);

    /// The RTO alarm fired. `packets_retransmitted` is false when there
    /// was nothing to retransmit.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Called when an ACK updated the RTT estimate, giving delay-based
    /// slow start exit a chance to trigger.
    fn maybe_exit_slow_start(&mut self);

    /// Current congestion window in bytes.
    fn congestion_window(&self) -> ByteCount;

    /// RTO base: `smoothed + 4 * mean_deviation`, clamped to
    /// [`MIN_RETRANSMISSION_DELAY`, `MAX_RETRANSMISSION_DELAY`]. Zero
    /// before the first RTT sample. Callers apply `<< rto_count` backoff.
    fn retransmission_delay(&self) -> Duration;

    /// The path's smoothed RTT.
    fn smoothed_rtt(&self) -> Duration;
}

/// Shared RTT handle: the sent-packet handler writes samples, the sender
/// and the scheduler read them.
pub type SharedRtt = std::sync::Arc<std::sync::RwLock<crate::rtt::RttStats>>;

pub(crate) fn retransmission_delay_from(rtt: &crate::rtt::RttStats) -> Duration {
    if rtt.smoothed().is_zero() {
        return Duration::ZERO;
    }
    (rtt.smoothed() + 4 * rtt.mean_deviation())
        .clamp(MIN_RETRANSMISSION_DELAY, MAX_RETRANSMISSION_DELAY)
}
