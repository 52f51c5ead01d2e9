//! CUBIC congestion control for single-path sending.

use super::{
    retransmission_delay_from, SendAlgorithm, SharedRtt, MAX_SEGMENT_SIZE, MIN_CONGESTION_WINDOW,
};
use crate::protocol::{ByteCount, PacketNumber};
use std::time::{Duration, Instant};

/// Cubic scaling constant C, in segments per second cubed.
const CUBIC_C: f64 = 0.4;

/// Multiplicative decrease factor applied on loss.
const CUBIC_BETA: f64 = 0.7;

/// Delay increase over the path minimum that ends slow start.
const SLOW_START_DELAY_FACTOR: f64 = 1.25;

/// CUBIC sender state for one path.
pub struct CubicSender {
    rtt: SharedRtt,
    congestion_window: ByteCount,
    slow_start_threshold: ByteCount,
    max_congestion_window: ByteCount,
    /// Window at the time of the last loss event, in bytes.
    w_max: f64,
    /// Start of the current cubic epoch (last loss), if any.
    epoch_start: Option<Instant>,
    /// Largest packet sent so far; used to end a loss round.
    largest_sent: PacketNumber,
    /// Packets lost at or below this number belong to the current loss
    /// event and must not shrink the window again.
    largest_sent_at_last_cutback: PacketNumber,
    /// Accumulated acked bytes not yet converted into window growth.
    acked_bytes_count: ByteCount,
}

impl CubicSender {
    /// Create a CUBIC sender. Windows are given in packets.
    #[must_use]
    pub fn new(rtt: SharedRtt, initial_window: ByteCount, max_window: ByteCount) -> Self {
        Self {
            rtt,
            congestion_window: initial_window * MAX_SEGMENT_SIZE,
            slow_start_threshold: max_window * MAX_SEGMENT_SIZE,
            max_congestion_window: max_window * MAX_SEGMENT_SIZE,
            w_max: 0.0,
            epoch_start: None,
            largest_sent: 0,
            largest_sent_at_last_cutback: 0,
            acked_bytes_count: 0,
        }
    }

    /// Whether the sender is still in slow start.
    #[must_use]
    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    fn cubic_target(&mut self, now: Instant) -> ByteCount {
        let epoch = *self.epoch_start.get_or_insert(now);
        let t = now.duration_since(epoch).as_secs_f64();
        let w_max_seg = self.w_max / MAX_SEGMENT_SIZE as f64;
        // K: time for the cubic to return to w_max
        let k = (w_max_seg * (1.0 - CUBIC_BETA) / CUBIC_C).cbrt();
        let target_seg = CUBIC_C * (t - k).powi(3) + w_max_seg;
        let target = (target_seg * MAX_SEGMENT_SIZE as f64).max(0.0) as ByteCount;
        target.clamp(MIN_CONGESTION_WINDOW * MAX_SEGMENT_SIZE, self.max_congestion_window)
    }
}

impl SendAlgorithm for CubicSender {
    fn on_packet_sent(
        &mut self,
        _bytes_in_flight: ByteCount,
        pn: PacketNumber,
        _bytes: ByteCount,
        is_retransmittable: bool,
    ) {
        if is_retransmittable {
            self.largest_sent = self.largest_sent.max(pn);
        }
    }

    fn on_packet_acked(&mut self, _pn: PacketNumber, bytes: ByteCount, _bytes_in_flight: ByteCount) {
        if self.in_slow_start() {
            self.congestion_window =
                (self.congestion_window + bytes).min(self.max_congestion_window);
            return;
        }
        // Congestion avoidance: grow toward the cubic target, at most one
        // segment per window of acked data.
        let target = self.cubic_target(Instant::now());
        self.acked_bytes_count += bytes;
        if self.congestion_window < target {
            let step = MAX_SEGMENT_SIZE.min(target - self.congestion_window);
            if self.acked_bytes_count * step >= self.congestion_window {
                self.congestion_window =
                    (self.congestion_window + step).min(self.max_congestion_window);
                self.acked_bytes_count = 0;
            }
        } else if self.acked_bytes_count >= self.congestion_window {
            // Reno-friendly fallback above the target.
            self.congestion_window =
                (self.congestion_window + MAX_SEGMENT_SIZE).min(self.max_congestion_window);
            self.acked_bytes_count = 0;
        }
    }

    fn on_packet_lost(&mut self, pn: PacketNumber, _bytes: ByteCount, _bytes_in_flight: ByteCount) {
        // Only one cutback per loss round.
        if pn <= self.largest_sent_at_last_cutback {
            return;
        }
        self.largest_sent_at_last_cutback = self.largest_sent;
        self.w_max = self.congestion_window as f64;
        self.epoch_start = None;
        self.acked_bytes_count = 0;
        let reduced = (self.congestion_window as f64 * CUBIC_BETA) as ByteCount;
        self.congestion_window = reduced.max(MIN_CONGESTION_WINDOW * MAX_SEGMENT_SIZE);
        self.slow_start_threshold = self.congestion_window;
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if !packets_retransmitted {
            return;
        }
        self.w_max = 0.0;
        self.epoch_start = None;
        self.acked_bytes_count = 0;
        self.slow_start_threshold = self.congestion_window / 2;
        self.congestion_window = MIN_CONGESTION_WINDOW * MAX_SEGMENT_SIZE;
        self.largest_sent_at_last_cutback = self.largest_sent;
    }

    fn maybe_exit_slow_start(&mut self) {
        if !self.in_slow_start() {
            return;
        }
        let rtt = self.rtt.read().expect("rtt lock poisoned");
        let min = rtt.min();
        let latest = rtt.latest();
        if min.is_zero() || latest.is_zero() {
            return;
        }
        // Delay-based exit: queue building up means the pipe is full.
        if latest.as_secs_f64() > min.as_secs_f64() * SLOW_START_DELAY_FACTOR {
            self.slow_start_threshold = self.congestion_window;
        }
    }

    fn congestion_window(&self) -> ByteCount {
        self.congestion_window
    }

    fn retransmission_delay(&self) -> Duration {
        retransmission_delay_from(&self.rtt.read().expect("rtt lock poisoned"))
    }

    fn smoothed_rtt(&self) -> Duration {
        self.rtt.read().expect("rtt lock poisoned").smoothed()
    }
}
