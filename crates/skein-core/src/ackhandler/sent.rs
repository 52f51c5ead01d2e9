//! Sent-packet archive, ACK ingestion and loss detection for one path.

use super::Packet;
use crate::congestion::SendAlgorithm;
use crate::error::AckError;
use crate::frame::{strip_non_retransmittable, AckFrame, ClosePathFrame, Frame};
use crate::protocol::{
    ByteCount, PacketNumber, MAX_NON_RETRANSMITTABLE_PACKETS, MAX_TRACKED_SENT_PACKETS,
    MAX_TRACKED_SKIPPED_PACKETS,
};
use crate::rtt::RttStats;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Reordering tolerance for time-based loss detection, as a fraction of
/// the RTT.
const TIME_REORDERING_FRACTION: f64 = 1.0 / 8.0;

/// RTO used before any RTT sample exists.
const DEFAULT_RTO_TIMEOUT: Duration = Duration::from_millis(500);

/// Minimum time in the future an RTO alarm may be set for.
const MIN_RTO_TIMEOUT: Duration = Duration::from_millis(200);

/// Maximum RTO backoff.
const MAX_RTO_TIMEOUT: Duration = Duration::from_secs(60);

/// Tail loss probes sent before falling back to RTO.
const MAX_TAIL_LOSS_PROBES: u32 = 2;

/// Floor shared by RTO and the multi-packet TLP computation.
const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);

/// Minimum tail loss probe timeout.
const MIN_TLP_TIMEOUT: Duration = Duration::from_millis(10);

/// Tracks which STOP_WAITING frame should accompany outgoing packets.
///
/// The frame advances when an ACK raises the in-order horizon or when a
/// packet is queued for retransmission (the peer must not wait for the
/// original any longer).
#[derive(Debug, Default)]
pub struct StopWaitingManager {
    largest_least_unacked_sent: PacketNumber,
    next_least_unacked: Option<PacketNumber>,
}

impl StopWaitingManager {
    /// The STOP_WAITING frame to attach, if it would tell the peer
    /// anything new. `force` emits it even when unchanged.
    #[must_use]
    pub fn get_stop_waiting_frame(&mut self, force: bool) -> Option<Frame> {
        let least_unacked = self.next_least_unacked?;
        if !force && least_unacked <= self.largest_least_unacked_sent {
            return None;
        }
        self.largest_least_unacked_sent = least_unacked;
        Some(Frame::StopWaiting { least_unacked })
    }

    /// An ACK for `largest_acked` means the peer no longer needs anything
    /// at or below it.
    pub fn received_ack(&mut self, largest_acked: PacketNumber) {
        if self.next_least_unacked.map_or(true, |n| n <= largest_acked) {
            self.next_least_unacked = Some(largest_acked + 1);
        }
    }

    /// `pn` was queued for retransmission; the replacement supersedes it.
    pub fn queued_retransmission(&mut self, pn: PacketNumber) {
        if self.next_least_unacked.map_or(true, |n| n <= pn) {
            self.next_least_unacked = Some(pn + 1);
        }
    }
}

/// Per-path archive of in-flight packets with loss detection and the
/// TLP/RTO alarm ladder.
pub struct SentPacketHandler {
    last_sent_pn: PacketNumber,
    skipped_packets: VecDeque<PacketNumber>,
    num_non_retransmittable: usize,

    largest_acked: PacketNumber,
    largest_received_packet_with_ack: PacketNumber,

    /// In-flight packets ordered by ascending packet number.
    packet_history: VecDeque<Packet>,
    stop_waiting: StopWaitingManager,
    retransmission_queue: VecDeque<Packet>,

    bytes_in_flight: ByteCount,

    congestion: Box<dyn SendAlgorithm>,
    rtt: Arc<RwLock<RttStats>>,

    rto_count: u32,
    tlp_count: u32,

    /// When the next packet crosses the reordering threshold.
    loss_time: Option<Instant>,
    last_sent_time: Option<Instant>,
    alarm: Option<Instant>,

    packets: u64,
    retransmissions: u64,
    losses: u64,
}

impl SentPacketHandler {
    /// Create a handler around a congestion sender and the path's shared
    /// RTT estimator.
    #[must_use]
    pub fn new(rtt: Arc<RwLock<RttStats>>, congestion: Box<dyn SendAlgorithm>) -> Self {
        Self {
            last_sent_pn: 0,
            skipped_packets: VecDeque::new(),
            num_non_retransmittable: 0,
            largest_acked: 0,
            largest_received_packet_with_ack: 0,
            packet_history: VecDeque::new(),
            stop_waiting: StopWaitingManager::default(),
            retransmission_queue: VecDeque::new(),
            bytes_in_flight: 0,
            congestion,
            rtt,
            rto_count: 0,
            tlp_count: 0,
            loss_time: None,
            last_sent_time: None,
            alarm: None,
            packets: 0,
            retransmissions: 0,
            losses: 0,
        }
    }

    /// `(sent, retransmissions, losses)` counters for this path.
    #[must_use]
    pub fn statistics(&self) -> (u64, u64, u64) {
        (self.packets, self.retransmissions, self.losses)
    }

    /// Bytes currently considered in flight.
    #[must_use]
    pub fn bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    /// Largest packet number handed to [`SentPacketHandler::sent_packet`].
    #[must_use]
    pub fn last_sent_packet_number(&self) -> PacketNumber {
        self.last_sent_pn
    }

    fn largest_in_order_acked(&self) -> PacketNumber {
        match self.packet_history.front() {
            Some(front) => front.pn - 1,
            None => self.largest_acked,
        }
    }

    /// Smallest packet number the peer should still wait for.
    #[must_use]
    pub fn least_unacked(&self) -> PacketNumber {
        self.largest_in_order_acked() + 1
    }

    /// True after a long run of non-retransmittable packets; the caller
    /// should attach a PING so the peer keeps acking.
    #[must_use]
    pub fn should_send_retransmittable_packet(&self) -> bool {
        self.num_non_retransmittable >= MAX_NON_RETRANSMITTABLE_PACKETS
    }

    /// Archive a freshly sent packet.
    ///
    /// # Errors
    /// - [`AckError::PacketNumberNotIncreasing`] unless `pn` exceeds every
    ///   previously sent packet number
    /// - [`AckError::TooManyTrackedSentPackets`] when archive plus
    ///   retransmission queue would exceed the cap
    pub fn sent_packet(&mut self, mut packet: Packet) -> Result<(), AckError> {
        if packet.pn <= self.last_sent_pn {
            return Err(AckError::PacketNumberNotIncreasing);
        }
        if self.retransmission_queue.len() + self.packet_history.len() + 1
            > MAX_TRACKED_SENT_PACKETS
        {
            return Err(AckError::TooManyTrackedSentPackets);
        }

        for skipped in self.last_sent_pn + 1..packet.pn {
            self.skipped_packets.push_back(skipped);
            if self.skipped_packets.len() > MAX_TRACKED_SKIPPED_PACKETS {
                self.skipped_packets.pop_front();
            }
        }

        self.last_sent_pn = packet.pn;
        let now = Instant::now();
        self.packets += 1;
        self.last_sent_time = Some(now);

        packet.frames = strip_non_retransmittable(std::mem::take(&mut packet.frames));
        let is_retransmittable = !packet.frames.is_empty();

        let pn = packet.pn;
        let length = packet.length;
        if is_retransmittable {
            packet.send_time = now;
            self.bytes_in_flight += length;
            self.packet_history.push_back(packet);
            self.num_non_retransmittable = 0;
        } else {
            self.num_non_retransmittable += 1;
        }

        self.congestion
            .on_packet_sent(self.bytes_in_flight, pn, length, is_retransmittable);

        self.update_loss_detection_alarm();
        Ok(())
    }

    /// Ingest an ACK frame received inside packet `with_pn`.
    ///
    /// # Errors
    /// - [`AckError::AckForUnsentPacket`] when the ACK covers a packet
    ///   number never sent here
    /// - [`AckError::DuplicateOrOutOfOrderAck`] when `with_pn` does not
    ///   advance past the last ACK-bearing packet
    /// - [`AckError::AckForSkippedPacket`] when a deliberately skipped
    ///   packet number is acknowledged
    pub fn received_ack(
        &mut self,
        ack: &AckFrame,
        with_pn: PacketNumber,
        rcv_time: Instant,
    ) -> Result<(), AckError> {
        if ack.largest_acked > self.last_sent_pn {
            return Err(AckError::AckForUnsentPacket);
        }
        if with_pn <= self.largest_received_packet_with_ack {
            return Err(AckError::DuplicateOrOutOfOrderAck);
        }
        self.largest_received_packet_with_ack = with_pn;

        // Repeated ACK that advances nothing: drop silently.
        if ack.largest_acked <= self.largest_in_order_acked() {
            return Ok(());
        }
        self.largest_acked = ack.largest_acked;

        if self.skipped_packets.iter().any(|&pn| ack.acks_packet(pn)) {
            return Err(AckError::AckForSkippedPacket);
        }

        if self.maybe_update_rtt(ack.largest_acked, ack.delay_time, rcv_time) {
            self.congestion.maybe_exit_slow_start();
        }

        let acked = self.take_newly_acked(|pn| ack.acks_packet(pn), ack.largest_acked);
        for packet in acked {
            self.on_packet_acked(&packet);
        }

        self.detect_lost_packets();
        self.update_loss_detection_alarm();
        self.garbage_collect_skipped_packets();
        self.stop_waiting.received_ack(ack.largest_acked);
        Ok(())
    }

    /// Ingest a CLOSE_PATH frame: acknowledge what it lists, then treat
    /// everything still in flight as lost so it can be replayed on
    /// another path.
    ///
    /// # Errors
    /// Same validation as [`SentPacketHandler::received_ack`], except that
    /// a repeated largest-acked is not ignored (a CLOSE_PATH is final).
    pub fn received_close_path(
        &mut self,
        frame: &ClosePathFrame,
        with_pn: PacketNumber,
    ) -> Result<(), AckError> {
        if frame.largest_acked > self.last_sent_pn {
            return Err(AckError::AckForUnsentPacket);
        }
        if with_pn <= self.largest_received_packet_with_ack {
            return Err(AckError::DuplicateOrOutOfOrderAck);
        }
        self.largest_received_packet_with_ack = with_pn;

        if self.skipped_packets.iter().any(|&pn| frame.acks_packet(pn)) {
            return Err(AckError::AckForSkippedPacket);
        }
        self.largest_acked = self.largest_acked.max(frame.largest_acked);

        let acked = self.take_newly_acked(|pn| frame.acks_packet(pn), frame.largest_acked);
        for packet in acked {
            self.on_packet_acked(&packet);
        }

        self.set_inflight_as_lost();
        self.garbage_collect_skipped_packets();
        Ok(())
    }

    /// Remove and return every archived packet up to `largest` that
    /// `acked` matches.
    fn take_newly_acked(
        &mut self,
        acked: impl Fn(PacketNumber) -> bool,
        largest: PacketNumber,
    ) -> Vec<Packet> {
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < self.packet_history.len() {
            let pn = self.packet_history[idx].pn;
            if pn > largest {
                break;
            }
            if acked(pn) {
                // remove() preserves order.
                out.push(self.packet_history.remove(idx).expect("index in bounds"));
            } else {
                idx += 1;
            }
        }
        out
    }

    fn on_packet_acked(&mut self, packet: &Packet) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.length);
        self.rto_count = 0;
        self.tlp_count = 0;
        self.congestion
            .on_packet_acked(packet.pn, packet.length, self.bytes_in_flight);
    }

    fn maybe_update_rtt(
        &mut self,
        largest_acked: PacketNumber,
        ack_delay: Duration,
        rcv_time: Instant,
    ) -> bool {
        for packet in &self.packet_history {
            if packet.pn == largest_acked {
                let sample = rcv_time.saturating_duration_since(packet.send_time);
                self.rtt
                    .write()
                    .expect("rtt lock poisoned")
                    .update(sample, ack_delay);
                return true;
            }
            if packet.pn > largest_acked {
                break;
            }
        }
        false
    }

    fn detect_lost_packets(&mut self) {
        self.loss_time = None;
        let now = Instant::now();

        let (latest, smoothed) = {
            let rtt = self.rtt.read().expect("rtt lock poisoned");
            (rtt.latest(), rtt.smoothed())
        };
        let max_rtt = latest.max(smoothed);
        let delay_until_lost =
            Duration::from_secs_f64((1.0 + TIME_REORDERING_FRACTION) * max_rtt.as_secs_f64());

        let mut lost = Vec::new();
        let mut idx = 0;
        while idx < self.packet_history.len() {
            let packet = &self.packet_history[idx];
            if packet.pn > self.largest_acked {
                break;
            }
            let time_since_sent = now.saturating_duration_since(packet.send_time);
            if time_since_sent > delay_until_lost {
                self.losses += 1;
                lost.push(self.packet_history.remove(idx).expect("index in bounds"));
            } else {
                if self.loss_time.is_none() {
                    self.loss_time = Some(now + (delay_until_lost - time_since_sent));
                }
                idx += 1;
            }
        }

        for packet in lost {
            tracing::debug!(pn = packet.pn, "packet lost, queueing for retransmission");
            let (pn, length) = (packet.pn, packet.length);
            self.queue_for_retransmission(packet);
            self.congestion
                .on_packet_lost(pn, length, self.bytes_in_flight);
        }
    }

    /// Declare everything still archived as lost. Used when the path is
    /// closed or declared failed so the frames can move to another path.
    pub fn set_inflight_as_lost(&mut self) {
        while let Some(packet) = self.packet_history.pop_front() {
            self.losses += 1;
            let (pn, length) = (packet.pn, packet.length);
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(length);
            self.stop_waiting.queued_retransmission(pn);
            self.retransmission_queue.push_back(packet);
            self.congestion
                .on_packet_lost(pn, length, self.bytes_in_flight);
        }
    }

    fn queue_for_retransmission(&mut self, packet: Packet) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.length);
        self.stop_waiting.queued_retransmission(packet.pn);
        self.retransmission_queue.push_back(packet);
    }

    fn has_outstanding_retransmittable_packet(&self) -> bool {
        self.packet_history.iter().any(Packet::is_retransmittable)
    }

    fn update_loss_detection_alarm(&mut self) {
        if self.packet_history.is_empty() {
            self.alarm = None;
            return;
        }

        let srtt = self.congestion.smoothed_rtt();
        let last_sent = self.last_sent_time.unwrap_or_else(Instant::now);
        self.alarm = if let Some(loss_time) = self.loss_time {
            // Early retransmit or time loss detection.
            Some(loss_time)
        } else if !srtt.is_zero() && self.tlp_count < MAX_TAIL_LOSS_PROBES {
            Some(last_sent + self.tlp_timeout())
        } else {
            Some(last_sent + self.rto_timeout().max(MIN_RETRANSMISSION_TIME))
        };
    }

    fn tlp_timeout(&self) -> Duration {
        let srtt = self.congestion.smoothed_rtt();
        if self.packet_history.len() > 1 {
            (2 * srtt).max(srtt * 3 / 2 + MIN_RETRANSMISSION_TIME / 2)
        } else {
            (2 * srtt).max(MIN_TLP_TIMEOUT)
        }
    }

    fn rto_timeout(&self) -> Duration {
        let mut rto = self.congestion.retransmission_delay();
        if rto.is_zero() {
            rto = DEFAULT_RTO_TIMEOUT;
        }
        rto = rto.max(MIN_RTO_TIMEOUT);
        // Exponential backoff.
        rto = rto.saturating_mul(1 << self.rto_count.min(16));
        rto.min(MAX_RTO_TIMEOUT)
    }

    /// Deadline of the loss-detection alarm, if armed.
    #[must_use]
    pub fn alarm_timeout(&self) -> Option<Instant> {
        self.alarm
    }

    /// The alarm fired. `on_rto` is consulted only when the RTO stage is
    /// reached; returning true means the path is considered failed and
    /// everything in flight is queued for retransmission, otherwise only
    /// the oldest two packets are.
    pub fn on_alarm(&mut self, on_rto: impl FnOnce(Instant) -> bool) {
        if !self.has_outstanding_retransmittable_packet() {
            self.alarm = None;
            return;
        }

        if self.loss_time.is_some() {
            // Early retransmit or time loss detection.
            self.detect_lost_packets();
        } else if self.tlp_count < MAX_TAIL_LOSS_PROBES {
            self.retransmit_tlp();
            self.tlp_count += 1;
        } else {
            let last_sent = self.last_sent_time.unwrap_or_else(Instant::now);
            let potentially_failed = on_rto(last_sent);
            if potentially_failed {
                self.retransmit_all_packets();
            } else {
                self.retransmit_oldest_two_packets();
            }
            self.rto_count += 1;
        }

        self.update_loss_detection_alarm();
    }

    fn retransmit_tlp(&mut self) {
        if let Some(packet) = self.packet_history.pop_back() {
            tracing::debug!(pn = packet.pn, "tail loss probe");
            self.queue_for_retransmission(packet);
        }
    }

    fn retransmit_all_packets(&mut self) {
        while let Some(packet) = self.packet_history.pop_front() {
            self.queue_rto(packet);
        }
        self.congestion.on_retransmission_timeout(true);
    }

    fn retransmit_oldest_two_packets(&mut self) {
        for _ in 0..2 {
            if let Some(packet) = self.packet_history.pop_front() {
                self.queue_rto(packet);
            }
        }
        self.congestion.on_retransmission_timeout(true);
    }

    fn queue_rto(&mut self, packet: Packet) {
        tracing::debug!(
            pn = packet.pn,
            outstanding = self.packet_history.len(),
            "queueing packet for retransmission (RTO)"
        );
        let (pn, length) = (packet.pn, packet.length);
        self.queue_for_retransmission(packet);
        self.losses += 1;
        self.congestion
            .on_packet_lost(pn, length, self.bytes_in_flight);
    }

    /// Take the oldest packet awaiting retransmission.
    #[must_use]
    pub fn dequeue_packet_for_retransmission(&mut self) -> Option<Packet> {
        let packet = self.retransmission_queue.pop_front()?;
        self.retransmissions += 1;
        Some(packet)
    }

    /// Enqueue a copy of a packet sent on another path (probe
    /// duplication); it bypasses the archive.
    pub fn duplicate_packet(&mut self, packet: Packet) {
        self.retransmission_queue.push_back(packet);
    }

    /// Pending STOP_WAITING frame, if it would inform the peer.
    #[must_use]
    pub fn get_stop_waiting_frame(&mut self, force: bool) -> Option<Frame> {
        self.stop_waiting.get_stop_waiting_frame(force)
    }

    /// Whether this path may send another packet right now.
    ///
    /// Retransmissions are always allowed; fresh data is blocked by the
    /// congestion window and by the tracked-packet cap.
    #[must_use]
    pub fn sending_allowed(&self) -> bool {
        let congestion_limited = self.bytes_in_flight > self.congestion.congestion_window();
        let tracked_limited = self.retransmission_queue.len() + self.packet_history.len()
            >= MAX_TRACKED_SENT_PACKETS;
        if congestion_limited {
            tracing::trace!(
                bytes_in_flight = self.bytes_in_flight,
                window = self.congestion.congestion_window(),
                "congestion limited"
            );
        }
        let have_retransmissions = !self.retransmission_queue.is_empty();
        !tracked_limited && (!congestion_limited || have_retransmissions)
    }

    /// The path's smoothed RTT, as seen by congestion control.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Duration {
        self.congestion.smoothed_rtt()
    }

    fn garbage_collect_skipped_packets(&mut self) {
        let horizon = self.largest_in_order_acked();
        while let Some(&front) = self.skipped_packets.front() {
            if front <= horizon {
                self.skipped_packets.pop_front();
            } else {
                break;
            }
        }
    }
}
