//! Round-trip time estimation.
//!
//! RFC 6298 exponential smoothing (α = 1/8, β = 1/4) with the peer's
//! reported ACK delay subtracted from samples that can afford it.

use std::time::Duration;

const RTT_ALPHA: f64 = 0.125;
const RTT_BETA: f64 = 0.25;

/// Smoothed, latest and minimum RTT for one path.
#[derive(Debug, Default, Clone)]
pub struct RttStats {
    latest: Duration,
    smoothed: Duration,
    min: Duration,
    mean_deviation: Duration,
    max_ack_delay: Duration,
}

impl RttStats {
    /// Create a fresh estimator with no samples.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent RTT sample, after ACK-delay adjustment.
    #[must_use]
    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Exponentially smoothed RTT. Zero until the first sample.
    #[must_use]
    pub fn smoothed(&self) -> Duration {
        self.smoothed
    }

    /// Smallest RTT ever observed on the path.
    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Smoothed mean deviation of samples.
    #[must_use]
    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    /// Externally supplied bound on how long the peer may delay ACKs.
    #[must_use]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    /// Set the peer's maximum ACK delay (a transport parameter).
    pub fn set_max_ack_delay(&mut self, d: Duration) {
        self.max_ack_delay = d;
    }

    /// Feed one sample: the wall time between sending a packet and
    /// receiving the ACK that covered it, plus the peer-reported delay
    /// it sat on that ACK.
    pub fn update(&mut self, send_delta: Duration, ack_delay: Duration) {
        if send_delta.is_zero() {
            return;
        }
        let mut sample = send_delta;

        if self.min.is_zero() || sample < self.min {
            self.min = sample;
        }
        // Correct for the peer's ACK delay, but never below zero.
        if sample > ack_delay {
            sample -= ack_delay;
        }
        self.latest = sample;

        if self.smoothed.is_zero() {
            self.smoothed = sample;
            self.mean_deviation = sample / 2;
        } else {
            let sample_s = sample.as_secs_f64();
            let smoothed_s = self.smoothed.as_secs_f64();
            let dev_s = self.mean_deviation.as_secs_f64();
            self.mean_deviation = Duration::from_secs_f64(
                (1.0 - RTT_BETA) * dev_s + RTT_BETA * (smoothed_s - sample_s).abs(),
            );
            self.smoothed =
                Duration::from_secs_f64((1.0 - RTT_ALPHA) * smoothed_s + RTT_ALPHA * sample_s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_initial_state() {
        let rtt = RttStats::new();
        assert_eq!(rtt.smoothed(), Duration::ZERO);
        assert_eq!(rtt.latest(), Duration::ZERO);
        assert_eq!(rtt.min(), Duration::ZERO);
    }

    #[test]
    fn test_rtt_first_sample_seeds_smoothed() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);

        assert_eq!(rtt.smoothed(), Duration::from_millis(100));
        assert_eq!(rtt.mean_deviation(), Duration::from_millis(50));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(200), Duration::ZERO);

        // smoothed = 7/8 * 100ms + 1/8 * 200ms = 112.5ms
        assert_eq!(rtt.smoothed(), Duration::from_micros(112_500));
        assert_eq!(rtt.latest(), Duration::from_millis(200));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn test_rtt_ack_delay_subtracted() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::from_millis(30));
        assert_eq!(rtt.latest(), Duration::from_millis(70));
        // min is tracked before the adjustment
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn test_rtt_ack_delay_larger_than_sample() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(10), Duration::from_millis(30));
        // sample not adjusted when the delay exceeds it
        assert_eq!(rtt.latest(), Duration::from_millis(10));
    }

    #[test]
    fn test_rtt_min_tracks_floor() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::from_millis(100), Duration::ZERO);
        rtt.update(Duration::from_millis(40), Duration::ZERO);
        rtt.update(Duration::from_millis(300), Duration::ZERO);
        assert_eq!(rtt.min(), Duration::from_millis(40));
    }

    #[test]
    fn test_rtt_zero_sample_ignored() {
        let mut rtt = RttStats::new();
        rtt.update(Duration::ZERO, Duration::ZERO);
        assert_eq!(rtt.smoothed(), Duration::ZERO);
    }
}
