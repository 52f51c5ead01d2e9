//! Compact history of received packet numbers.

use crate::error::AckError;
use crate::frame::AckRange;
use crate::protocol::{PacketNumber, MAX_TRACKED_RECEIVED_ACK_RANGES};

/// Received packet numbers, stored as ordered disjoint inclusive ranges.
#[derive(Debug, Default)]
pub struct ReceivedPacketHistory {
    /// Ascending, disjoint, non-adjacent ranges.
    ranges: Vec<AckRange>,
    /// Highest bound of a `delete_up_to` call; packets at or below are
    /// not recorded again.
    lowest_in_history: PacketNumber,
}

impl ReceivedPacketHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received packet number.
    ///
    /// # Errors
    /// Returns [`AckError::TooManyOutstandingReceivedAckRanges`] when the
    /// peer's sending pattern would grow the range list past its cap.
    pub fn received_packet(&mut self, pn: PacketNumber) -> Result<(), AckError> {
        if self.ranges.len() >= MAX_TRACKED_RECEIVED_ACK_RANGES {
            return Err(AckError::TooManyOutstandingReceivedAckRanges);
        }
        if pn <= self.lowest_in_history && self.lowest_in_history != 0 {
            return Ok(());
        }

        // First range that could contain pn or be extended up to it.
        let pos = self.ranges.partition_point(|r| r.last + 1 < pn);

        if pos == self.ranges.len() {
            // Strictly beyond every existing range.
            self.ranges.push(AckRange { first: pn, last: pn });
            return Ok(());
        }

        let range = self.ranges[pos];
        if range.first <= pn && pn <= range.last {
            return Ok(()); // duplicate
        }

        if range.last + 1 == pn {
            // Extends `range` upward; may bridge to the next range.
            self.ranges[pos].last = pn;
            if pos + 1 < self.ranges.len() && self.ranges[pos + 1].first == pn + 1 {
                self.ranges[pos].last = self.ranges[pos + 1].last;
                self.ranges.remove(pos + 1);
            }
            return Ok(());
        }
        if pn + 1 == range.first {
            // Extends `range` downward. The previous range ends at least
            // two below pn, so no bridge is possible on that side.
            self.ranges[pos].first = pn;
            return Ok(());
        }

        // A fresh isolated range before `range`.
        self.ranges.insert(pos, AckRange { first: pn, last: pn });
        Ok(())
    }

    /// Drop all history at or below `pn` (stop-waiting reception).
    pub fn delete_up_to(&mut self, pn: PacketNumber) {
        self.lowest_in_history = self.lowest_in_history.max(pn);
        self.ranges.retain_mut(|r| {
            if r.last <= pn {
                return false;
            }
            if r.first <= pn {
                r.first = pn + 1;
            }
            true
        });
    }

    /// Snapshot the ranges, largest first, as an ACK frame expects them.
    #[must_use]
    pub fn ack_ranges(&self) -> Vec<AckRange> {
        self.ranges.iter().rev().copied().collect()
    }

    /// The range containing the largest received packet number.
    #[must_use]
    pub fn highest_range(&self) -> Option<AckRange> {
        self.ranges.last().copied()
    }

    /// Number of disjoint ranges currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no packet number is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges_of(h: &ReceivedPacketHistory) -> Vec<(u64, u64)> {
        h.ranges.iter().map(|r| (r.first, r.last)).collect()
    }

    #[test]
    fn test_history_single_range() {
        let mut h = ReceivedPacketHistory::new();
        for pn in 1..=5 {
            h.received_packet(pn).unwrap();
        }
        assert_eq!(ranges_of(&h), vec![(1, 5)]);
    }

    #[test]
    fn test_history_gap_creates_ranges() {
        let mut h = ReceivedPacketHistory::new();
        h.received_packet(1).unwrap();
        h.received_packet(2).unwrap();
        h.received_packet(5).unwrap();
        assert_eq!(ranges_of(&h), vec![(1, 2), (5, 5)]);
    }

    #[test]
    fn test_history_fill_bridges_ranges() {
        let mut h = ReceivedPacketHistory::new();
        h.received_packet(1).unwrap();
        h.received_packet(3).unwrap();
        assert_eq!(ranges_of(&h), vec![(1, 1), (3, 3)]);
        h.received_packet(2).unwrap();
        assert_eq!(ranges_of(&h), vec![(1, 3)]);
    }

    #[test]
    fn test_history_downward_extension() {
        let mut h = ReceivedPacketHistory::new();
        h.received_packet(5).unwrap();
        h.received_packet(4).unwrap();
        assert_eq!(ranges_of(&h), vec![(4, 5)]);
    }

    #[test]
    fn test_history_out_of_order_insert() {
        let mut h = ReceivedPacketHistory::new();
        h.received_packet(10).unwrap();
        h.received_packet(3).unwrap();
        h.received_packet(7).unwrap();
        assert_eq!(ranges_of(&h), vec![(3, 3), (7, 7), (10, 10)]);
    }

    #[test]
    fn test_history_duplicates_ignored() {
        let mut h = ReceivedPacketHistory::new();
        h.received_packet(4).unwrap();
        h.received_packet(4).unwrap();
        assert_eq!(ranges_of(&h), vec![(4, 4)]);
    }

    #[test]
    fn test_history_delete_up_to() {
        let mut h = ReceivedPacketHistory::new();
        for pn in [1, 2, 3, 6, 7, 10] {
            h.received_packet(pn).unwrap();
        }
        h.delete_up_to(6);
        assert_eq!(ranges_of(&h), vec![(7, 7), (10, 10)]);

        // Deleted packet numbers are not re-recorded.
        h.received_packet(2).unwrap();
        assert_eq!(ranges_of(&h), vec![(7, 7), (10, 10)]);
    }

    #[test]
    fn test_history_delete_inside_range() {
        let mut h = ReceivedPacketHistory::new();
        for pn in 1..=10 {
            h.received_packet(pn).unwrap();
        }
        h.delete_up_to(4);
        assert_eq!(ranges_of(&h), vec![(5, 10)]);
    }

    #[test]
    fn test_history_ack_ranges_largest_first() {
        let mut h = ReceivedPacketHistory::new();
        h.received_packet(1).unwrap();
        h.received_packet(5).unwrap();
        let ranges = h.ack_ranges();
        assert_eq!(ranges[0], AckRange { first: 5, last: 5 });
        assert_eq!(ranges[1], AckRange { first: 1, last: 1 });
        assert_eq!(h.highest_range(), Some(AckRange { first: 5, last: 5 }));
    }

    #[test]
    fn test_history_range_cap() {
        let mut h = ReceivedPacketHistory::new();
        // Every second packet number: each reception is a new range.
        for i in 0..MAX_TRACKED_RECEIVED_ACK_RANGES as u64 {
            h.received_packet(2 * i + 1).unwrap();
        }
        assert_eq!(
            h.received_packet(2 * MAX_TRACKED_RECEIVED_ACK_RANGES as u64 + 1),
            Err(AckError::TooManyOutstandingReceivedAckRanges)
        );
    }
}
