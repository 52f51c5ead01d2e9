//! Out-of-order stream frame reassembly.
//!
//! The sorter tracks the byte positions that are still missing as an
//! ordered list of disjoint half-open gaps, initially one gap covering
//! the whole stream. Arriving frames are trimmed against queued data and
//! the gap list so that queued frames and gaps always partition the
//! stream exactly.
//!
//! For unreliable streams the sorter additionally remembers when frames
//! arrived: once the spread between the oldest and newest queued arrival
//! exceeds a threshold, a missing range is given up on and replaced with
//! zero bytes so the reader can make progress.

use crate::error::SorterError;
use crate::frame::StreamFrame;
use crate::protocol::{
    ByteCount, StreamId, MAX_BYTE_COUNT, MAX_STREAM_FRAME_SORTER_GAPS,
    UNRELIABLE_GAP_AGE_THRESHOLD,
};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// A half-open interval of missing bytes `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteInterval {
    /// First missing byte.
    pub start: ByteCount,
    /// First byte past the missing range.
    pub end: ByteCount,
}

/// Reassembles stream frames into in-order reads.
pub struct StreamFrameSorter {
    stream_id: StreamId,
    queued_frames: HashMap<ByteCount, StreamFrame>,
    gaps: Vec<ByteInterval>,
    read_position: ByteCount,
    unreliable: bool,

    /// Arrival bookkeeping for unreliable zero-fill. Only real frames at
    /// or past `max_offset` are recorded.
    queued_time: HashMap<ByteCount, Instant>,
    sorted_offsets: VecDeque<ByteCount>,
    max_offset: ByteCount,
    gap_age_threshold: Duration,

    bytes_queued: ByteCount,
    bytes_zero_filled: ByteCount,
}

impl StreamFrameSorter {
    /// Create a sorter for `stream_id`. `unreliable` enables zero-fill.
    #[must_use]
    pub fn new(stream_id: StreamId, unreliable: bool) -> Self {
        Self {
            stream_id,
            queued_frames: HashMap::new(),
            gaps: vec![ByteInterval {
                start: 0,
                end: MAX_BYTE_COUNT,
            }],
            read_position: 0,
            unreliable,
            queued_time: HashMap::with_capacity(10),
            sorted_offsets: VecDeque::with_capacity(10),
            max_offset: 0,
            gap_age_threshold: UNRELIABLE_GAP_AGE_THRESHOLD,
            bytes_queued: 0,
            bytes_zero_filled: 0,
        }
    }

    /// Next byte offset the reader will consume.
    #[must_use]
    pub fn read_position(&self) -> ByteCount {
        self.read_position
    }

    /// The current gap list, ordered and disjoint.
    #[must_use]
    pub fn gaps(&self) -> &[ByteInterval] {
        &self.gaps
    }

    /// Byte ranges currently queued, as `(offset, len)` pairs in no
    /// particular order.
    #[must_use]
    pub fn queued_ranges(&self) -> Vec<(ByteCount, ByteCount)> {
        self.queued_frames
            .values()
            .map(|f| (f.offset, f.data_len()))
            .collect()
    }

    /// Total zero bytes synthesized so far.
    #[must_use]
    pub fn bytes_zero_filled(&self) -> ByteCount {
        self.bytes_zero_filled
    }

    /// Queue an arriving frame. `real` distinguishes network frames from
    /// internally synthesized zero-fill; only real frames feed the
    /// arrival clock.
    ///
    /// # Errors
    /// - [`SorterError::EmptyStreamData`] for a zero-length frame without FIN
    /// - [`SorterError::DuplicateStreamData`] when nothing new is carried
    /// - [`SorterError::TooManyGaps`] when the gap list exceeds its cap
    pub fn push(&mut self, frame: StreamFrame, real: bool) -> Result<(), SorterError> {
        let timestamp = Instant::now();
        let mut frame = frame;

        if frame.data.is_empty() {
            if frame.fin {
                self.queued_frames.insert(frame.offset, frame);
                return Ok(());
            }
            return Err(SorterError::EmptyStreamData);
        }

        // A queued frame at the same offset swallows our prefix.
        if let Some(old) = self.queued_frames.get(&frame.offset) {
            if frame.data_len() <= old.data_len() {
                return Err(SorterError::DuplicateStreamData);
            }
            let old_len = old.data_len();
            frame.data.drain(..old_len as usize);
            frame.offset += old_len;
        }

        let mut start = frame.offset;
        let mut end = frame.offset + frame.data_len();

        // Find the first gap this frame touches.
        let mut gi = None;
        for (idx, gap) in self.gaps.iter().enumerate() {
            if end <= gap.start {
                // Entirely inside already-covered bytes.
                return Err(SorterError::DuplicateStreamData);
            }
            if end > gap.start && start <= gap.end {
                gi = Some(idx);
                break;
            }
        }
        // The final gap is unbounded, so a non-duplicate frame always
        // lands somewhere.
        let gi = gi.ok_or(SorterError::DuplicateStreamData)?;

        // Left-trim to the gap start.
        if start < self.gaps[gi].start {
            let cut = self.gaps[gi].start - start;
            frame.offset += cut;
            start += cut;
            frame.data.drain(..cut as usize);
        }

        // Walk to the last gap the frame reaches, dropping gaps it
        // completely covers and the queued frames those gaps ended at.
        let mut end_gap = self.gaps[gi];
        let mut end_gap_idx = gi;
        let mut end_gap_in_list = true;
        while end >= end_gap.end {
            let next_idx = if end_gap_in_list {
                end_gap_idx + 1
            } else {
                end_gap_idx
            };
            if next_idx >= self.gaps.len() {
                // Only reachable by a frame running past the unbounded
                // tail gap, which flow control rules out.
                return Err(SorterError::DuplicateStreamData);
            }
            if end_gap_in_list && end_gap_idx != gi {
                self.gaps.remove(end_gap_idx);
                end_gap_in_list = false;
            }
            let next_pos = if end_gap_in_list {
                end_gap_idx + 1
            } else {
                end_gap_idx
            };
            let next = self.gaps[next_pos];
            if end <= next.start {
                break;
            }
            // The data run ending this gap is superseded.
            if let Some(old) = self.queued_frames.remove(&end_gap.end) {
                self.bytes_queued = self.bytes_queued.saturating_sub(old.data_len());
            }
            end_gap = next;
            end_gap_idx = next_pos;
            end_gap_in_list = true;
        }

        // Right-trim to the last overlapping gap.
        if end > end_gap.end {
            let cut = end - end_gap.end;
            let keep = frame.data_len() - cut;
            frame.data.truncate(keep as usize);
            end = end_gap.end;
        }

        // Adjust or split the touched gaps.
        if start == self.gaps[gi].start {
            if end >= self.gaps[gi].end {
                // The frame completely fills the first gap.
                self.gaps.remove(gi);
                if end_gap_in_list && end_gap_idx > gi {
                    end_gap_idx -= 1;
                }
            }
            if end < end_gap.end {
                // The frame covers the beginning of the last gap.
                self.gaps[end_gap_idx].start = end;
            }
        } else if end == end_gap.end {
            // The frame covers the end of the gap.
            self.gaps[gi].end = start;
        } else if gi == end_gap_idx && end_gap_in_list {
            // The frame lies within a single gap, splitting it.
            let tail = ByteInterval {
                start: end,
                end: self.gaps[gi].end,
            };
            self.gaps[gi].end = start;
            self.gaps.insert(gi + 1, tail);
        } else {
            self.gaps[gi].end = start;
            self.gaps[end_gap_idx].start = end;
        }

        if self.gaps.len() > MAX_STREAM_FRAME_SORTER_GAPS {
            return Err(SorterError::TooManyGaps);
        }

        self.bytes_queued += frame.data_len();
        let offset = frame.offset;
        self.queued_frames.insert(offset, frame);

        if real && offset >= self.max_offset {
            self.max_offset = offset;
            self.sorted_offsets.push_back(offset);
            self.queued_time.insert(offset, timestamp);
        }
        Ok(())
    }

    /// The frame at the read position, if one can be produced.
    ///
    /// For unreliable streams, a long-enough wait turns the first gap
    /// into synthesized zeroes so reading can continue.
    pub fn head(&mut self) -> Option<&StreamFrame> {
        if self.queued_frames.contains_key(&self.read_position) {
            return self.queued_frames.get(&self.read_position);
        }
        if !self.unreliable {
            return None;
        }
        // Judge the age of the hole by the spread between the oldest and
        // newest recorded arrivals. One sample says nothing.
        if self.sorted_offsets.len() < 2 {
            return None;
        }
        let oldest = self.queued_time.get(self.sorted_offsets.front()?)?;
        let newest = self.queued_time.get(self.sorted_offsets.back()?)?;
        let age = newest.saturating_duration_since(*oldest);
        if age <= self.gap_age_threshold {
            return None;
        }

        let gap = *self.gaps.first()?;
        if gap.end >= MAX_BYTE_COUNT {
            // Unbounded tail gap: no data beyond it to catch up to.
            return None;
        }
        // Inclusive [start, end] fill; push trims the spare byte when the
        // next data run adjoins the gap.
        let fill_len = gap.end - gap.start + 1;
        self.bytes_zero_filled += fill_len;
        tracing::trace!(
            stream_id = self.stream_id,
            start = gap.start,
            len = fill_len,
            "zero-filling aged gap"
        );
        let fill = StreamFrame {
            stream_id: self.stream_id,
            offset: gap.start,
            data: vec![0u8; fill_len as usize],
            fin: false,
            unreliable: true,
        };
        // A fill can only collide with data that arrived between the age
        // check and here, which still leaves the head readable.
        let _ = self.push(fill, false);

        self.queued_frames.get(&self.read_position)
    }

    /// Remove and return the frame at the read position, advancing it.
    pub fn pop(&mut self) -> Option<StreamFrame> {
        self.head()?;
        let frame = self.queued_frames.remove(&self.read_position)?;
        self.read_position += frame.data_len();
        self.bytes_queued = self.bytes_queued.saturating_sub(frame.data_len());

        if self.sorted_offsets.front() == Some(&frame.offset) {
            self.queued_time.remove(&frame.offset);
            self.sorted_offsets.pop_front();
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(offset: ByteCount, data: &[u8]) -> StreamFrame {
        StreamFrame {
            stream_id: 5,
            offset,
            data: data.to_vec(),
            fin: false,
            unreliable: false,
        }
    }

    fn fin_frame(offset: ByteCount) -> StreamFrame {
        StreamFrame {
            stream_id: 5,
            offset,
            data: Vec::new(),
            fin: true,
            unreliable: false,
        }
    }

    /// The union of gaps and queued frames must partition [read_position, MAX).
    fn check_gap_soundness(s: &StreamFrameSorter) {
        let gaps = s.gaps();
        for w in gaps.windows(2) {
            assert!(w[0].end <= w[1].start, "gaps ordered and disjoint: {gaps:?}");
        }
        for g in gaps {
            assert!(g.start < g.end, "gaps non-empty: {gaps:?}");
        }
        // No queued byte may fall inside a gap.
        for (offset, len) in s.queued_ranges() {
            for g in gaps {
                assert!(
                    offset + len <= g.start || offset >= g.end,
                    "frame ({offset},{len}) overlaps gap {g:?}"
                );
            }
        }
    }

    #[test]
    fn test_in_order_push_pop() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"hello"), true).unwrap();
        s.push(frame(5, b"world"), true).unwrap();
        check_gap_soundness(&s);

        assert_eq!(s.pop().unwrap().data, b"hello");
        assert_eq!(s.pop().unwrap().data, b"world");
        assert!(s.pop().is_none());
        assert_eq!(s.read_position(), 10);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(5, b"world"), true).unwrap();
        check_gap_soundness(&s);
        assert!(s.head().is_none(), "reliable stream waits for the hole");

        s.push(frame(0, b"hello"), true).unwrap();
        check_gap_soundness(&s);
        assert_eq!(s.pop().unwrap().data, b"hello");
        assert_eq!(s.pop().unwrap().data, b"world");
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut s = StreamFrameSorter::new(5, false);
        assert_eq!(
            s.push(frame(0, b""), true),
            Err(SorterError::EmptyStreamData)
        );
    }

    #[test]
    fn test_fin_only_frame_accepted() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"data"), true).unwrap();
        s.push(fin_frame(4), true).unwrap();
        assert_eq!(s.pop().unwrap().data, b"data");
        let fin = s.pop().unwrap();
        assert!(fin.fin);
        assert!(fin.data.is_empty());
    }

    #[test]
    fn test_exact_duplicate_rejected() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"hello"), true).unwrap();
        assert_eq!(
            s.push(frame(0, b"hello"), true),
            Err(SorterError::DuplicateStreamData)
        );
        assert_eq!(
            s.push(frame(0, b"hel"), true),
            Err(SorterError::DuplicateStreamData)
        );
    }

    #[test]
    fn test_same_offset_longer_frame_keeps_tail() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"he"), true).unwrap();
        s.push(frame(0, b"hello"), true).unwrap();
        check_gap_soundness(&s);
        assert_eq!(s.pop().unwrap().data, b"he");
        assert_eq!(s.pop().unwrap().data, b"llo");
    }

    #[test]
    fn test_overlap_with_delivered_prefix_trimmed() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"hello"), true).unwrap();
        // Overlaps [3,5) which is queued, extends past it.
        s.push(frame(3, b"lo world"), true).unwrap();
        check_gap_soundness(&s);
        assert_eq!(s.pop().unwrap().data, b"hello");
        assert_eq!(s.pop().unwrap().data, b" world");
    }

    #[test]
    fn test_fully_covered_duplicate_range() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"hello world"), true).unwrap();
        assert_eq!(
            s.push(frame(2, b"llo"), true),
            Err(SorterError::DuplicateStreamData)
        );
    }

    #[test]
    fn test_gap_split() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(10, b"xx"), true).unwrap();
        check_gap_soundness(&s);
        let gaps = s.gaps();
        assert_eq!(gaps[0], ByteInterval { start: 0, end: 10 });
        assert_eq!(gaps[1].start, 12);
    }

    #[test]
    fn test_frame_bridging_multiple_gaps() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(10, b"aa"), true).unwrap(); // gaps: [0,10) [12,..)
        s.push(frame(20, b"bb"), true).unwrap(); // gaps: [0,10) [12,20) [22,..)
        check_gap_soundness(&s);
        assert_eq!(s.gaps().len(), 3);

        // One frame covering [0, 22) fills both gaps. The first queued
        // run ("aa") is fully covered and superseded; the second sits at
        // the frame's very end, so the frame is right-trimmed to it.
        let big: Vec<u8> = (0..22).collect();
        s.push(frame(0, &big), true).unwrap();
        check_gap_soundness(&s);
        assert_eq!(s.gaps().len(), 1);
        assert_eq!(s.gaps()[0].start, 22);

        let mut read = Vec::new();
        while let Some(f) = s.pop() {
            read.extend_from_slice(&f.data);
        }
        let mut expected = big[..20].to_vec();
        expected.extend_from_slice(b"bb");
        assert_eq!(read, expected);
    }

    #[test]
    fn test_overlapping_frame_supersedes_covered_run() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(5, b"AB"), true).unwrap(); // gaps: [0,5) [7,..)
        // Frame [3, 9) completely covers the queued run, which is
        // dropped in its favor.
        s.push(frame(3, b"abcdef"), true).unwrap();
        check_gap_soundness(&s);

        assert!(s.head().is_none()); // [0,3) still missing
        s.push(frame(0, b"xyz"), true).unwrap();
        let mut read = Vec::new();
        while let Some(f) = s.pop() {
            read.extend_from_slice(&f.data);
        }
        assert_eq!(read, b"xyzabcdef");
    }

    #[test]
    fn test_too_many_gaps() {
        let mut s = StreamFrameSorter::new(5, false);
        let mut result = Ok(());
        for i in 0..=MAX_STREAM_FRAME_SORTER_GAPS as u64 {
            result = s.push(frame(i * 10, b"x"), true);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(SorterError::TooManyGaps));
    }

    #[test]
    fn test_reliable_never_zero_fills() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(100, b"late"), true).unwrap();
        s.push(frame(200, b"later"), true).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.head().is_none());
        assert_eq!(s.bytes_zero_filled(), 0);
    }

    #[test]
    fn test_unreliable_zero_fill_after_age() {
        let mut s = StreamFrameSorter::new(7, true);
        s.gap_age_threshold = Duration::from_millis(10);

        // Bytes [0,100) and [200,300) present, [100,200) missing.
        s.push(frame(0, &[1u8; 100]), true).unwrap();
        for f in s_pop_all(&mut s) {
            assert_eq!(f.data.len(), 100);
        }
        s.push(frame(200, &[2u8; 100]), true).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        // Second arrival stamps the newest time after the sleep.
        s.push(frame(300, &[3u8; 50]), true).unwrap();

        let head = s.head().expect("zero-fill materializes the hole");
        assert_eq!(head.offset, 100);
        assert!(head.data.iter().all(|&b| b == 0));
        assert_eq!(head.data.len(), 100);

        let fill = s.pop().unwrap();
        assert_eq!(fill.data.len(), 100);
        assert_eq!(s.pop().unwrap().data, vec![2u8; 100]);
        assert_eq!(s.pop().unwrap().data, vec![3u8; 50]);
    }

    fn s_pop_all(s: &mut StreamFrameSorter) -> Vec<StreamFrame> {
        let mut out = Vec::new();
        while let Some(f) = s.pop() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_unreliable_waits_below_threshold() {
        let mut s = StreamFrameSorter::new(7, true);
        // Default 70ms threshold; two immediate arrivals are too fresh.
        s.push(frame(100, b"aa"), true).unwrap();
        s.push(frame(200, b"bb"), true).unwrap();
        assert!(s.head().is_none());
        assert_eq!(s.bytes_zero_filled(), 0);
    }

    #[test]
    fn test_unreliable_needs_two_samples() {
        let mut s = StreamFrameSorter::new(7, true);
        s.gap_age_threshold = Duration::from_millis(1);
        s.push(frame(100, b"aa"), true).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(s.head().is_none(), "one arrival is not enough evidence");
    }

    #[test]
    fn test_zero_fill_not_overwritten_by_retransmission() {
        let mut s = StreamFrameSorter::new(7, true);
        s.gap_age_threshold = Duration::from_millis(1);

        s.push(frame(10, b"AB"), true).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        s.push(frame(20, b"CD"), true).unwrap();

        // Zero-fill [0,10).
        let fill = s.pop().unwrap();
        assert_eq!(fill.offset, 0);
        assert_eq!(fill.data, vec![0u8; 10]);

        // The "lost" original shows up late: nothing new to deliver.
        assert_eq!(
            s.push(frame(0, &[9u8; 10]), true),
            Err(SorterError::DuplicateStreamData)
        );
        assert_eq!(s.pop().unwrap().data, b"AB");
    }

    #[test]
    fn test_read_position_monotonic() {
        let mut s = StreamFrameSorter::new(5, false);
        s.push(frame(0, b"aaaa"), true).unwrap();
        let before = s.read_position();
        s.pop().unwrap();
        assert!(s.read_position() > before);
    }
}
