//! A single network path: RTT state, both ack handlers, the packet
//! number generator and a timer task.

use crate::ackhandler::{Packet, ReceivedPacketHandler, SentPacketHandler};
use crate::congestion::{
    CubicSender, OliaRegistry, OliaSender, SendAlgorithm, DEFAULT_MAX_CONGESTION_WINDOW,
    INITIAL_CONGESTION_WINDOW,
};
use crate::error::Error;
use crate::frame::{self, Frame};
use crate::pn::PacketNumberGenerator;
use crate::protocol::{
    EncryptionLevel, PacketNumber, PathId, MAX_PATH_TIMER, MIN_PATH_TIMER,
    SKIP_PACKET_AVERAGE_PERIOD,
};
use crate::rtt::RttStats;
use crate::session::config::SessionConfig;
use crate::session::packer::{infer_packet_number, PacketHeader, UnpackedPacket, Unpacker};
use skein_transport::{Connection, Datagram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

pub(crate) struct PathHandlers {
    pub(crate) sent: SentPacketHandler,
    pub(crate) recv: ReceivedPacketHandler,
    pub(crate) pn_gen: PacketNumberGenerator,
    pub(crate) largest_rcvd_pn: PacketNumber,
    pub(crate) last_rcvd_pn: PacketNumber,
}

/// One independently congestion-controlled route to the peer.
pub struct Path {
    path_id: PathId,
    conn: Arc<dyn Connection>,
    rtt: Arc<RwLock<RttStats>>,
    handlers: Mutex<PathHandlers>,

    open: AtomicBool,
    potentially_failed: AtomicBool,
    last_network_activity: Mutex<Instant>,
    idle_timeout: Duration,

    sent_packet_notify: Notify,
    close_notify: Notify,
    closed: AtomicBool,
}

impl Path {
    /// Create a path. The session passes its OLIA registry only when
    /// multipath coupling is enabled; non-initial paths then couple
    /// their congestion control through it, everything else runs CUBIC.
    #[must_use]
    pub fn new(
        path_id: PathId,
        conn: Arc<dyn Connection>,
        config: &SessionConfig,
        olia: Option<&OliaRegistry>,
    ) -> Self {
        let rtt = Arc::new(RwLock::new(RttStats::new()));
        let congestion: Box<dyn SendAlgorithm> = match olia {
            Some(registry) if path_id != 0 => Box::new(OliaSender::new(
                path_id,
                registry.clone(),
                Arc::clone(&rtt),
                INITIAL_CONGESTION_WINDOW,
                DEFAULT_MAX_CONGESTION_WINDOW,
            )),
            _ => Box::new(CubicSender::new(
                Arc::clone(&rtt),
                INITIAL_CONGESTION_WINDOW,
                DEFAULT_MAX_CONGESTION_WINDOW,
            )),
        };

        Self {
            path_id,
            conn,
            rtt: Arc::clone(&rtt),
            handlers: Mutex::new(PathHandlers {
                sent: SentPacketHandler::new(rtt, congestion),
                recv: ReceivedPacketHandler::new(path_id, config.version, config.ack_send_delay),
                pn_gen: PacketNumberGenerator::new(SKIP_PACKET_AVERAGE_PERIOD),
                largest_rcvd_pn: 0,
                last_rcvd_pn: 0,
            }),
            open: AtomicBool::new(true),
            potentially_failed: AtomicBool::new(false),
            last_network_activity: Mutex::new(Instant::now()),
            idle_timeout: config.idle_timeout,
            sent_packet_notify: Notify::new(),
            close_notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Path id.
    #[must_use]
    pub fn path_id(&self) -> PathId {
        self.path_id
    }

    /// The datagram connection backing this path.
    #[must_use]
    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Whether the path is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Whether an RTO without network activity marked the path suspect.
    #[must_use]
    pub fn is_potentially_failed(&self) -> bool {
        self.potentially_failed.load(Ordering::Relaxed)
    }

    /// The path's smoothed RTT; zero while unprobed.
    #[must_use]
    pub fn smoothed_rtt(&self) -> Duration {
        self.rtt.read().expect("rtt lock poisoned").smoothed()
    }

    /// Whether congestion control lets this path send right now.
    #[must_use]
    pub fn sending_allowed(&self) -> bool {
        self.is_open() && self.handlers().sent.sending_allowed()
    }

    pub(crate) fn handlers(&self) -> std::sync::MutexGuard<'_, PathHandlers> {
        self.handlers.lock().expect("path handlers lock poisoned")
    }

    /// Close the path and stop its timer task.
    pub fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.closed.store(true, Ordering::Relaxed);
        self.close_notify.notify_one();
    }

    /// Pending ACK frame for this path, if due.
    #[must_use]
    pub fn get_ack_frame(&self) -> Option<Frame> {
        self.handlers().recv.get_ack_frame()
    }

    /// Final ACK snapshot for closing this path.
    #[must_use]
    pub fn get_close_path_frame(&self) -> Frame {
        self.handlers().recv.get_close_path_frame()
    }

    /// Pending STOP_WAITING frame.
    #[must_use]
    pub fn get_stop_waiting_frame(&self, force: bool) -> Option<Frame> {
        self.handlers().sent.get_stop_waiting_frame(force)
    }

    /// Record a freshly packed packet with the sent handler and kick the
    /// timer task.
    ///
    /// # Errors
    /// Propagates archive errors (non-increasing PN, archive full).
    pub fn record_sent(&self, packet: Packet) -> Result<(), Error> {
        self.handlers().sent.sent_packet(packet)?;
        self.sent_packet_notify.notify_one();
        Ok(())
    }

    /// Process one received datagram: resolve the packet number, unpack,
    /// track reception, and hand back the frames for dispatch.
    ///
    /// A decryption failure discards the packet without touching the
    /// remote address; any other unpack error still rebinds it on the
    /// server side (the peer's NAT may have shifted).
    ///
    /// # Errors
    /// Unpack failures and fatal reception errors.
    pub fn handle_packet(
        &self,
        datagram: &Datagram,
        unpacker: &dyn Unpacker,
        is_server: bool,
    ) -> Result<Vec<Frame>, Error> {
        if !self.is_open() {
            return Ok(Vec::new());
        }

        *self
            .last_network_activity
            .lock()
            .expect("activity lock poisoned") = datagram.rcv_time;
        self.potentially_failed.store(false, Ordering::Relaxed);

        let mut input = datagram.data.as_slice();
        let header = PacketHeader::decode(&mut input).map_err(|e| {
            Error::protocol(crate::error::ErrorCode::InternalError, e.to_string())
        })?;
        let header_len = datagram.data.len() - input.len();
        let header_raw = &datagram.data[..header_len];

        let mut handlers = self.handlers();
        let full_pn = infer_packet_number(header.pn_len, handlers.largest_rcvd_pn, header.pn);
        let full_header = PacketHeader {
            pn: full_pn,
            ..header
        };

        let unpacked: UnpackedPacket = match unpacker.unpack(header_raw, &full_header, input) {
            Err(crate::error::UnpackError::DecryptionFailure) => {
                // Possibly attacker-injected: drop without trusting the
                // source address.
                tracing::trace!(path = self.path_id, "discarding undecryptable packet");
                return Ok(Vec::new());
            }
            Err(err) => {
                if is_server {
                    self.conn.set_current_remote_addr(datagram.remote_addr);
                }
                return Err(Error::protocol(
                    crate::error::ErrorCode::InternalError,
                    err.to_string(),
                ));
            }
            Ok(p) => p,
        };
        if is_server {
            self.conn.set_current_remote_addr(datagram.remote_addr);
        }

        handlers.last_rcvd_pn = full_pn;
        handlers.largest_rcvd_pn = handlers.largest_rcvd_pn.max(full_pn);

        let should_instigate_ack = frame::instigates_ack(&unpacked.frames);
        handlers.recv.received_packet(full_pn, should_instigate_ack)?;

        tracing::trace!(
            path = self.path_id,
            pn = full_pn,
            frames = unpacked.frames.len(),
            "received packet"
        );
        Ok(unpacked.frames)
    }

    /// Packet number of the last packet received on this path.
    #[must_use]
    pub fn last_received_packet_number(&self) -> PacketNumber {
        self.handlers().last_rcvd_pn
    }

    /// RTO callback: an RTO with no reception since the probing send
    /// means the path may be dead.
    fn on_rto(&self, last_sent: Instant) -> bool {
        let last_activity = *self
            .last_network_activity
            .lock()
            .expect("activity lock poisoned");
        if last_activity < last_sent {
            self.potentially_failed.store(true, Ordering::Relaxed);
            tracing::info!(path = self.path_id, "RTO without activity, path potentially failed");
            return true;
        }
        false
    }

    /// Drive expired alarms. Returns `(idle_closed, wants_paths_frame)`:
    /// the first when the idle timeout closed the path, the second when
    /// an RTO declared it potentially failed and a PATHS frame should be
    /// advertised.
    pub(crate) fn on_timer_event(&self) -> (bool, bool) {
        let now = Instant::now();
        let last_activity = *self
            .last_network_activity
            .lock()
            .expect("activity lock poisoned");
        if last_activity + self.idle_timeout <= now {
            tracing::info!(path = self.path_id, "idle timeout, closing path");
            self.close();
            return (true, false);
        }

        let mut wants_paths_frame = false;
        let mut handlers = self.handlers();
        if handlers.sent.alarm_timeout().is_some_and(|alarm| alarm <= now) {
            handlers.sent.on_alarm(|last_sent| {
                let failed = self.on_rto(last_sent);
                wants_paths_frame |= failed;
                failed
            });
        }
        (false, wants_paths_frame)
    }

    /// Earliest of the idle deadline, the delayed-ACK alarm and the loss
    /// alarm, clamped so the timer neither spins nor idles.
    fn next_timer_deadline(&self) -> tokio::time::Instant {
        let now = Instant::now();
        let last_activity = *self
            .last_network_activity
            .lock()
            .expect("activity lock poisoned");
        let mut deadline = last_activity + self.idle_timeout;

        let handlers = self.handlers();
        if let Some(ack_alarm) = handlers.recv.alarm_timeout() {
            deadline = ack_alarm;
        }
        if let Some(loss_alarm) = handlers.sent.alarm_timeout() {
            deadline = deadline.min(loss_alarm);
        }
        drop(handlers);

        let deadline = deadline.clamp(now + MIN_PATH_TIMER, now + MAX_PATH_TIMER);
        tokio::time::Instant::from_std(deadline)
    }

    #[cfg(test)]
    pub(crate) fn mark_potentially_failed(&self) {
        self.potentially_failed.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn prime_rtt(&self, rtt: Duration) {
        self.rtt
            .write()
            .expect("rtt lock poisoned")
            .update(rtt, Duration::ZERO);
    }

    /// Timer task: waits for the earliest deadline and reports fires to
    /// the session, re-arming whenever a packet is sent on the path.
    pub(crate) async fn run(self: Arc<Self>, timers: mpsc::Sender<PathId>) {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                break;
            }
            let deadline = self.next_timer_deadline();
            tokio::select! {
                _ = self.close_notify.notified() => break,
                () = tokio::time::sleep_until(deadline) => {
                    if timers.send(self.path_id).await.is_err() {
                        break;
                    }
                }
                _ = self.sent_packet_notify.notified() => {
                    // New send: recompute the deadline.
                }
            }
        }
        self.open.store(false, Ordering::Relaxed);
        tracing::debug!(path = self.path_id, "path timer task stopped");
    }
}

/// Everything needed to turn a packed payload into an archived packet.
#[must_use]
pub fn archived_packet(
    pn: PacketNumber,
    frames: Vec<Frame>,
    length: usize,
    encryption_level: EncryptionLevel,
) -> Packet {
    Packet {
        pn,
        frames,
        length: length as u64,
        encryption_level,
        send_time: Instant::now(),
    }
}
