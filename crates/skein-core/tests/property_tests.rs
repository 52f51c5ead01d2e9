//! Property-based tests for the SKEIN protocol core.
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Stream frame sorter properties
// ============================================================================

mod sorter_properties {
    use super::*;
    use proptest::test_runner::TestCaseError;
    use skein_core::frame::StreamFrame;
    use skein_core::sorter::StreamFrameSorter;

    fn frame(offset: u64, data: Vec<u8>) -> StreamFrame {
        StreamFrame {
            stream_id: 5,
            offset,
            data,
            fin: false,
            unreliable: false,
        }
    }

    /// Gaps must stay ordered, disjoint and non-empty, and together with
    /// the queued frames partition the byte space exactly.
    fn assert_gap_soundness(
        sorter: &StreamFrameSorter,
        probe_limit: u64,
    ) -> Result<(), TestCaseError> {
        let gaps = sorter.gaps();
        for pair in gaps.windows(2) {
            prop_assert!(pair[0].end <= pair[1].start, "gaps out of order: {gaps:?}");
        }
        for gap in gaps {
            prop_assert!(gap.start < gap.end, "empty gap: {gaps:?}");
        }

        let queued = sorter.queued_ranges();
        for byte in sorter.read_position()..probe_limit {
            let in_gap = gaps.iter().any(|g| g.start <= byte && byte < g.end);
            let in_queue = queued
                .iter()
                .any(|(off, len)| *off <= byte && byte < off + len);
            prop_assert!(
                in_gap != in_queue,
                "byte {byte} covered by {} (gaps {gaps:?}, queued {queued:?})",
                if in_gap { "both" } else { "neither" }
            );
        }
        Ok(())
    }

    proptest! {
        /// Any push sequence leaves the gap list sound.
        #[test]
        fn gap_list_soundness(
            pushes in prop::collection::vec((0u64..200, 1usize..40), 1..60)
        ) {
            let mut sorter = StreamFrameSorter::new(5, false);
            for (offset, len) in pushes {
                let data = vec![0xAB; len];
                let _ = sorter.push(frame(offset, data), true);
            }
            assert_gap_soundness(&sorter, 260)?;
        }

        /// Frames carrying the bytes of [0, n) arriving in any order read
        /// back as exactly n in-order bytes.
        #[test]
        fn reliable_read_equals_write(
            n in 1usize..200,
            seed in any::<u64>(),
        ) {
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();

            // Deterministic chunking and shuffle from the seed.
            let mut chunks: Vec<(usize, usize)> = Vec::new();
            let mut start = 0usize;
            let mut state = seed | 1;
            while start < n {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                let len = (1 + state as usize % 17).min(n - start);
                chunks.push((start, len));
                start += len;
            }
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                order.swap(i, state as usize % (i + 1));
            }

            let mut sorter = StreamFrameSorter::new(5, false);
            for &idx in &order {
                let (off, len) = chunks[idx];
                let _ = sorter.push(frame(off as u64, payload[off..off + len].to_vec()), true);
            }

            let mut read = Vec::new();
            while let Some(f) = sorter.pop() {
                read.extend_from_slice(&f.data);
            }
            prop_assert_eq!(read, payload);
        }

        /// The read position never moves backwards.
        #[test]
        fn read_position_monotonic(
            pushes in prop::collection::vec((0u64..100, 1usize..20), 1..30)
        ) {
            let mut sorter = StreamFrameSorter::new(5, false);
            let mut last_pos = 0;
            for (offset, len) in pushes {
                let _ = sorter.push(frame(offset, vec![1; len]), true);
                while sorter.pop().is_some() {}
                let pos = sorter.read_position();
                prop_assert!(pos >= last_pos);
                last_pos = pos;
            }
        }
    }
}

// ============================================================================
// Received packet history properties
// ============================================================================

mod ack_range_properties {
    use super::*;
    use skein_core::ackhandler::ReceivedPacketHistory;

    proptest! {
        /// Emitted ACK ranges are disjoint, descending (largest first),
        /// well-formed, and agree exactly with the set of received
        /// packet numbers.
        #[test]
        fn ack_ranges_well_formed(
            pns in prop::collection::btree_set(1u64..500, 1..100)
        ) {
            let mut history = ReceivedPacketHistory::new();
            for &pn in &pns {
                history.received_packet(pn).unwrap();
            }

            let ranges = history.ack_ranges();
            for range in &ranges {
                prop_assert!(range.first <= range.last);
            }
            for pair in ranges.windows(2) {
                // Largest first, with a real hole between ranges.
                prop_assert!(pair[0].first > pair[1].last + 1);
            }

            for pn in 1u64..500 {
                let in_ranges = ranges.iter().any(|r| r.first <= pn && pn <= r.last);
                prop_assert_eq!(in_ranges, pns.contains(&pn));
            }
        }

        /// Deleting a prefix never corrupts the remaining ranges.
        #[test]
        fn ack_ranges_survive_lower_limit(
            pns in prop::collection::btree_set(1u64..200, 1..60),
            cut in 1u64..200,
        ) {
            let mut history = ReceivedPacketHistory::new();
            for &pn in &pns {
                history.received_packet(pn).unwrap();
            }
            history.delete_up_to(cut);

            let ranges = history.ack_ranges();
            for pn in 1u64..200 {
                let in_ranges = ranges.iter().any(|r| r.first <= pn && pn <= r.last);
                prop_assert_eq!(in_ranges, pns.contains(&pn) && pn > cut);
            }
        }
    }
}

// ============================================================================
// Packet number generator properties
// ============================================================================

mod pn_properties {
    use super::*;
    use skein_core::pn::PacketNumberGenerator;

    proptest! {
        /// Packet numbers are strictly increasing for any skip period.
        #[test]
        fn pn_strictly_increasing(period in 0u64..64, draws in 1usize..500) {
            let mut generator = PacketNumberGenerator::new(period);
            let mut last = 0;
            for _ in 0..draws {
                let pn = generator.pop();
                prop_assert!(pn > last);
                prop_assert!(pn <= last + 2, "more than one number skipped");
                last = pn;
            }
        }
    }
}
