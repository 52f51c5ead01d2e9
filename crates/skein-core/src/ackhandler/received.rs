//! Received-packet tracking and ACK generation for one path.

use super::history::ReceivedPacketHistory;
use crate::error::AckError;
use crate::frame::{AckFrame, ClosePathFrame, Frame};
use crate::protocol::{
    PacketNumber, PathId, Version, MAX_PACKETS_RECEIVED_BEFORE_ACK_SEND,
    RETRANSMITTABLE_PACKETS_BEFORE_ACK,
};
use std::time::{Duration, Instant};

/// Decides when ACKs are queued and emits them for one path.
pub struct ReceivedPacketHandler {
    path_id: PathId,
    largest_observed: PacketNumber,
    largest_observed_rcv_time: Option<Instant>,
    lower_limit: PacketNumber,
    history: ReceivedPacketHistory,

    ack_send_delay: Duration,
    packets_since_last_ack: usize,
    retransmittable_since_last_ack: usize,
    ack_queued: bool,
    ack_alarm: Option<Instant>,
    last_ack: Option<AckFrame>,

    version: Version,
    packets: u64,
}

impl ReceivedPacketHandler {
    /// Create a handler for `path_id` speaking `version`, delaying
    /// unforced ACKs by `ack_send_delay`.
    #[must_use]
    pub fn new(path_id: PathId, version: Version, ack_send_delay: Duration) -> Self {
        Self {
            path_id,
            largest_observed: 0,
            largest_observed_rcv_time: None,
            lower_limit: 0,
            history: ReceivedPacketHistory::new(),
            ack_send_delay,
            packets_since_last_ack: 0,
            retransmittable_since_last_ack: 0,
            ack_queued: false,
            ack_alarm: None,
            last_ack: None,
            version,
            packets: 0,
        }
    }

    /// Total packets accepted on this path.
    #[must_use]
    pub fn statistics(&self) -> u64 {
        self.packets
    }

    /// Record a received packet.
    ///
    /// `should_instigate_ack` is true when the packet carried at least one
    /// frame that counts toward the ACK policy.
    ///
    /// # Errors
    /// Returns [`AckError::InvalidPacketNumber`] for packet number zero and
    /// propagates history capacity errors.
    pub fn received_packet(
        &mut self,
        pn: PacketNumber,
        should_instigate_ack: bool,
    ) -> Result<(), AckError> {
        if pn == 0 {
            return Err(AckError::InvalidPacketNumber);
        }
        self.packets += 1;

        if pn > self.largest_observed {
            self.largest_observed = pn;
            self.largest_observed_rcv_time = Some(Instant::now());
        }

        if pn <= self.lower_limit {
            return Ok(());
        }

        self.history.received_packet(pn)?;
        self.maybe_queue_ack(pn, should_instigate_ack);
        Ok(())
    }

    /// Stop acknowledging packets at or below `pn` (stop-waiting
    /// reception).
    pub fn set_lower_limit(&mut self, pn: PacketNumber) {
        self.lower_limit = pn;
        self.history.delete_up_to(pn);
    }

    fn maybe_queue_ack(&mut self, pn: PacketNumber, should_instigate_ack: bool) {
        self.packets_since_last_ack += 1;
        if should_instigate_ack {
            self.retransmittable_since_last_ack += 1;
        }

        // Always ack the very first packet.
        if self.last_ack.is_none() {
            self.ack_queued = true;
        }

        if self.version < Version::V39
            && self.packets_since_last_ack >= MAX_PACKETS_RECEIVED_BEFORE_ACK_SEND
        {
            self.ack_queued = true;
        }

        // Out-of-order reception: the packet was reported missing in the
        // last ACK, so correct that promptly.
        if let Some(last) = &self.last_ack {
            if pn < last.largest_acked {
                self.ack_queued = true;
            }
        }

        // A new missing range appeared above the previously acked largest.
        if let (Some(last), Some(highest)) = (&self.last_ack, self.history.highest_range()) {
            if highest.first > last.largest_acked {
                self.ack_queued = true;
            }
        }

        if !self.ack_queued && should_instigate_ack {
            if self.retransmittable_since_last_ack >= RETRANSMITTABLE_PACKETS_BEFORE_ACK {
                self.ack_queued = true;
            } else if self.ack_alarm.is_none() {
                self.ack_alarm = Some(Instant::now() + self.ack_send_delay);
            }
        }

        if self.ack_queued {
            self.ack_alarm = None;
        }
    }

    /// Emit an ACK frame if one is queued or the ack alarm elapsed.
    #[must_use]
    pub fn get_ack_frame(&mut self) -> Option<Frame> {
        let alarm_elapsed = self
            .ack_alarm
            .map(|t| t <= Instant::now())
            .unwrap_or(false);
        if !self.ack_queued && !alarm_elapsed {
            return None;
        }

        let ranges = self.history.ack_ranges();
        let lowest_acked = ranges.last().map(|r| r.first)?;
        let delay_time = self
            .largest_observed_rcv_time
            .map(|t| t.elapsed())
            .unwrap_or_default();

        let ack = AckFrame {
            largest_acked: self.largest_observed,
            lowest_acked,
            delay_time,
            ranges: if ranges.len() > 1 { ranges } else { Vec::new() },
            path_id: self.path_id,
        };

        self.last_ack = Some(ack.clone());
        self.ack_alarm = None;
        self.ack_queued = false;
        self.packets_since_last_ack = 0;
        self.retransmittable_since_last_ack = 0;

        Some(Frame::Ack(ack))
    }

    /// Emit the final ACK snapshot used when this path is being closed.
    #[must_use]
    pub fn get_close_path_frame(&self) -> Frame {
        let ranges = self.history.ack_ranges();
        let lowest_acked = ranges.last().map(|r| r.first).unwrap_or(0);
        Frame::ClosePath(ClosePathFrame {
            path_id: self.path_id,
            largest_acked: self.largest_observed,
            lowest_acked,
            ranges: if ranges.len() > 1 { ranges } else { Vec::new() },
        })
    }

    /// Deadline of the pending delayed ACK, if armed.
    #[must_use]
    pub fn alarm_timeout(&self) -> Option<Instant> {
        self.ack_alarm
    }
}
