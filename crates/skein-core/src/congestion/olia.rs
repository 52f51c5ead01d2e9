//! OLIA coupled congestion control for multipath sending.
//!
//! OLIA (Opportunistic Linked-Increases Algorithm) grows each path's
//! window as a function of every path's window and RTT, so the session as
//! a whole stays TCP-friendly while shifting load toward the better
//! paths. All OLIA senders of a session register themselves in one
//! [`OliaRegistry`]; each sender publishes its `(cwnd, rtt, inter-loss
//! bytes)` snapshot there and reads its peers' when computing the
//! per-ACK increase term.

use super::{
    retransmission_delay_from, SendAlgorithm, SharedRtt, MAX_SEGMENT_SIZE, MIN_CONGESTION_WINDOW,
};
use crate::protocol::{ByteCount, PacketNumber, PathId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Published per-path state other OLIA senders read.
#[derive(Debug, Clone, Copy, Default)]
struct PathSnapshot {
    cwnd: ByteCount,
    rtt_secs: f64,
    /// Smoothed bytes between loss events; OLIA's `l_p` term.
    inter_loss_bytes: ByteCount,
}

/// Registry shared by all OLIA senders of one session.
#[derive(Debug, Default, Clone)]
pub struct OliaRegistry {
    inner: Arc<Mutex<HashMap<PathId, PathSnapshot>>>,
}

impl OliaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a path that was closed.
    pub fn remove(&self, path_id: PathId) {
        self.inner.lock().expect("olia registry poisoned").remove(&path_id);
    }

    fn publish(&self, path_id: PathId, snap: PathSnapshot) {
        self.inner
            .lock()
            .expect("olia registry poisoned")
            .insert(path_id, snap);
    }

    fn snapshot(&self) -> Vec<(PathId, PathSnapshot)> {
        self.inner
            .lock()
            .expect("olia registry poisoned")
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}

/// OLIA sender state for one non-initial path.
pub struct OliaSender {
    path_id: PathId,
    registry: OliaRegistry,
    rtt: SharedRtt,
    congestion_window: ByteCount,
    slow_start_threshold: ByteCount,
    max_congestion_window: ByteCount,
    largest_sent: PacketNumber,
    largest_sent_at_last_cutback: PacketNumber,
    /// Bytes acked since the most recent loss (OLIA's l1).
    bytes_since_last_loss: ByteCount,
    /// Bytes acked between the previous two losses (OLIA's l2).
    bytes_between_prior_losses: ByteCount,
    /// Fractional window growth below one byte, carried between ACKs.
    growth_remainder: f64,
}

impl OliaSender {
    /// Create an OLIA sender and register it. Windows are in packets.
    #[must_use]
    pub fn new(
        path_id: PathId,
        registry: OliaRegistry,
        rtt: SharedRtt,
        initial_window: ByteCount,
        max_window: ByteCount,
    ) -> Self {
        let sender = Self {
            path_id,
            registry,
            rtt,
            congestion_window: initial_window * MAX_SEGMENT_SIZE,
            slow_start_threshold: max_window * MAX_SEGMENT_SIZE,
            max_congestion_window: max_window * MAX_SEGMENT_SIZE,
            largest_sent: 0,
            largest_sent_at_last_cutback: 0,
            bytes_since_last_loss: 0,
            bytes_between_prior_losses: 0,
            growth_remainder: 0.0,
        };
        sender.publish();
        sender
    }

    /// Whether the sender is still in slow start.
    #[must_use]
    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slow_start_threshold
    }

    fn inter_loss_bytes(&self) -> ByteCount {
        self.bytes_since_last_loss.max(self.bytes_between_prior_losses)
    }

    fn publish(&self) {
        let rtt_secs = self
            .rtt
            .read()
            .expect("rtt lock poisoned")
            .smoothed()
            .as_secs_f64();
        self.registry.publish(
            self.path_id,
            PathSnapshot {
                cwnd: self.congestion_window,
                rtt_secs,
                inter_loss_bytes: self.inter_loss_bytes(),
            },
        );
    }

    /// OLIA's epsilon: positive on "collected" paths (best loss-adjusted
    /// rate but not the biggest window), negative on max-window paths
    /// when some better path is being held back, zero otherwise.
    fn epsilon(&self, paths: &[(PathId, PathSnapshot)]) -> f64 {
        let usable: Vec<_> = paths
            .iter()
            .filter(|(_, s)| s.rtt_secs > 0.0 && s.cwnd > 0)
            .collect();
        let n = usable.len();
        if n < 2 {
            return 0.0;
        }

        let rate = |s: &PathSnapshot| {
            let l = s.inter_loss_bytes.max(1) as f64;
            (l * l) / (s.rtt_secs * s.rtt_secs)
        };
        let best_rate = usable.iter().map(|(_, s)| rate(s)).fold(0.0, f64::max);
        let max_cwnd = usable.iter().map(|(_, s)| s.cwnd).max().unwrap_or(0);

        let in_best: Vec<_> = usable
            .iter()
            .filter(|(_, s)| rate(s) >= best_rate * 0.999)
            .collect();
        let in_max: Vec<_> = usable.iter().filter(|(_, s)| s.cwnd == max_cwnd).collect();
        // Collected: best paths whose window is not already the biggest.
        let collected: Vec<_> = in_best.iter().filter(|(_, s)| s.cwnd < max_cwnd).collect();

        if collected.is_empty() {
            return 0.0;
        }
        if collected.iter().any(|(id, _)| *id == self.path_id) {
            return 1.0 / (collected.len() as f64 * n as f64);
        }
        if in_max.iter().any(|(id, _)| *id == self.path_id) {
            return -1.0 / (in_max.len() as f64 * n as f64);
        }
        0.0
    }
}

impl SendAlgorithm for OliaSender {
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
        self.bytes_since_last_loss += bytes;

        if self.in_slow_start() {
            self.congestion_window =
                (self.congestion_window + bytes).min(self.max_congestion_window);
            self.publish();
            return;
        }

        let own_rtt = self
            .rtt
            .read()
            .expect("rtt lock poisoned")
            .smoothed()
            .as_secs_f64();
        if own_rtt <= 0.0 {
            return;
        }

        let paths = self.registry.snapshot();
        let denom: f64 = paths
            .iter()
            .filter(|(_, s)| s.rtt_secs > 0.0)
            .map(|(_, s)| s.cwnd as f64 / s.rtt_secs)
            .sum();
        if denom <= 0.0 {
            return;
        }

        let w = self.congestion_window as f64;
        let coupled = (w / (own_rtt * own_rtt)) / (denom * denom);
        let eps = self.epsilon(&paths);
        let delta =
            (coupled + eps / w) * MAX_SEGMENT_SIZE as f64 * bytes as f64 + self.growth_remainder;

        let whole = delta.floor();
        self.growth_remainder = delta - whole;
        let next = if whole >= 0.0 {
            self.congestion_window.saturating_add(whole as ByteCount)
        } else {
            self.congestion_window.saturating_sub((-whole) as ByteCount)
        };
        self.congestion_window = next.clamp(
            MIN_CONGESTION_WINDOW * MAX_SEGMENT_SIZE,
            self.max_congestion_window,
        );
        self.publish();
    }

    fn on_packet_lost(&mut self, pn: PacketNumber, _bytes: ByteCount, _bytes_in_flight: ByteCount) {
        if pn <= self.largest_sent_at_last_cutback {
            return;
        }
        self.largest_sent_at_last_cutback = self.largest_sent;
        self.bytes_between_prior_losses = self.bytes_since_last_loss;
        self.bytes_since_last_loss = 0;
        self.congestion_window =
            (self.congestion_window / 2).max(MIN_CONGESTION_WINDOW * MAX_SEGMENT_SIZE);
        self.slow_start_threshold = self.congestion_window;
        self.publish();
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if !packets_retransmitted {
            return;
        }
        self.slow_start_threshold = self.congestion_window / 2;
        self.congestion_window = MIN_CONGESTION_WINDOW * MAX_SEGMENT_SIZE;
        self.largest_sent_at_last_cutback = self.largest_sent;
        self.publish();
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
        if latest.as_secs_f64() > min.as_secs_f64() * 1.25 {
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

impl Drop for OliaSender {
    fn drop(&mut self) {
        self.registry.remove(self.path_id);
    }
}
