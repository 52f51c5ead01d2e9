//! Session glue: owns the paths, the stream registry, the scheduler and
//! the packer, and runs the tasks that move packets between them.
//!
//! Task layout: every path runs a timer task reporting fires into the
//! session's `path_timers` channel; every path's connection is drained
//! by a receive task that dispatches packets by the path id in their
//! header; one multiplexer task drives the scheduler on timer fires and
//! send signals.

pub mod config;
pub mod flow;
pub mod framer;
pub mod packer;
pub mod path;
pub mod scheduler;
pub mod stream;
pub mod streams_map;

pub use config::{SchedulerStrategy, SessionConfig};
pub use packer::{NullSealer, PackedPacket, Packer, Sealer, UnpackedPacket, Unpacker};
pub use path::Path;
pub use stream::Stream;
pub use streams_map::StreamsMap;

use crate::ackhandler::Packet;
use crate::error::{Error, ErrorCode, StreamError, StreamMapError};
use crate::frame::Frame;
use crate::protocol::{
    EncryptionLevel, PathId, Perspective, INITIAL_PATH_ID, MAX_PACKET_PAYLOAD,
};
use crate::congestion::OliaRegistry;
use flow::FlowController;
use framer::StreamFramer;
use scheduler::Scheduler;
use skein_transport::{Connection, Datagram};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

/// A multipath session: one logical connection striped over several
/// independently congestion-controlled paths.
pub struct Session {
    config: SessionConfig,
    paths: RwLock<HashMap<PathId, Arc<Path>>>,
    streams: Arc<StreamsMap>,
    flow: Arc<Mutex<FlowController>>,
    framer: Arc<Mutex<StreamFramer>>,
    packer: Mutex<Packer>,
    unpacker: Arc<dyn Unpacker>,
    scheduler: Mutex<Scheduler>,
    olia: OliaRegistry,

    send_notify: Arc<Notify>,
    path_timers_tx: mpsc::Sender<PathId>,
    path_timers_rx: tokio::sync::Mutex<mpsc::Receiver<PathId>>,

    peer_blocked: AtomicBool,
    handshake_complete: AtomicBool,
    remote_path_ids: Mutex<Vec<PathId>>,
    remote_addresses: Mutex<Vec<SocketAddr>>,

    started: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    close_reason: Mutex<Option<String>>,
}

impl Session {
    /// Create a session around a sealer/unpacker pair. Paths are added
    /// with [`Session::add_path`]; call [`Session::start`] afterwards.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        sealer: Arc<dyn Sealer>,
        unpacker: Arc<dyn Unpacker>,
    ) -> Arc<Self> {
        let flow: Arc<Mutex<FlowController>> = Arc::new(Mutex::new(FlowController::new()));
        let framer = Arc::new(Mutex::new(StreamFramer::new(Arc::clone(&flow))));
        let send_notify = Arc::new(Notify::new());

        let streams = {
            let flow = Arc::clone(&flow);
            let framer = Arc::clone(&framer);
            let send_notify = Arc::clone(&send_notify);
            Arc::new(StreamsMap::new(
                config.perspective,
                config.max_outgoing_streams,
                config.max_incoming_streams,
                Box::new(move |id, unreliable| {
                    flow.lock().expect("flow lock poisoned").open_stream(id);
                    let data_notify = Arc::clone(&send_notify);
                    let reset_framer = Arc::clone(&framer);
                    let reset_notify = Arc::clone(&send_notify);
                    Arc::new(Stream::new(
                        id,
                        unreliable,
                        Arc::clone(&flow),
                        Box::new(move || data_notify.notify_one()),
                        Box::new(move |stream_id, byte_offset| {
                            reset_framer
                                .lock()
                                .expect("framer lock poisoned")
                                .queue_control_frame(Frame::RstStream {
                                    stream_id,
                                    byte_offset,
                                    error_code: 0,
                                });
                            reset_notify.notify_one();
                        }),
                    ))
                }),
            ))
        };

        let (path_timers_tx, path_timers_rx) = mpsc::channel(32);

        Arc::new(Self {
            scheduler: Mutex::new(Scheduler::new(config.scheduler)),
            config,
            paths: RwLock::new(HashMap::new()),
            streams,
            flow,
            framer,
            packer: Mutex::new(Packer::new(sealer)),
            unpacker,
            olia: OliaRegistry::new(),
            send_notify,
            path_timers_tx,
            path_timers_rx: tokio::sync::Mutex::new(path_timers_rx),
            peer_blocked: AtomicBool::new(false),
            handshake_complete: AtomicBool::new(true),
            remote_path_ids: Mutex::new(Vec::new()),
            remote_addresses: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            close_reason: Mutex::new(None),
        })
    }

    /// Create a session with passthrough packet protection (tests,
    /// loopback).
    #[must_use]
    pub fn with_null_crypto(config: SessionConfig) -> Arc<Self> {
        let sealer = Arc::new(NullSealer);
        Self::new(config, Arc::clone(&sealer) as Arc<dyn Sealer>, sealer)
    }

    /// This side's perspective.
    #[must_use]
    pub fn perspective(&self) -> Perspective {
        self.config.perspective
    }

    /// Whether the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// The close reason, if the session is closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason
            .lock()
            .expect("close reason lock poisoned")
            .clone()
    }

    /// Add a path over `conn` and spawn its timer and receive tasks.
    /// The first added path becomes the initial path (id 0).
    pub fn add_path(self: &Arc<Self>, conn: Arc<dyn Connection>) -> PathId {
        let mut paths = self.paths.write().expect("paths lock poisoned");
        let path_id = paths.keys().max().map_or(INITIAL_PATH_ID, |m| m + 1);
        let olia = self.config.multipath.then_some(&self.olia);
        let path = Arc::new(Path::new(path_id, conn, &self.config, olia));
        paths.insert(path_id, Arc::clone(&path));
        drop(paths);

        tokio::spawn(Arc::clone(&path).run(self.path_timers_tx.clone()));
        tokio::spawn(Arc::clone(self).receive_loop(path));
        tracing::info!(path = path_id, "path added");
        path_id
    }

    /// Spawn the send/timer multiplexer. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(self).run_loop());
    }

    /// Open the next locally-initiated reliable stream.
    ///
    /// # Errors
    /// Transient [`StreamMapError::TooManyOpenStreams`] at the cap.
    pub fn open_stream(&self) -> Result<Arc<Stream>, StreamMapError> {
        self.streams.open_stream()
    }

    /// Open the next locally-initiated unreliable stream.
    ///
    /// # Errors
    /// Transient [`StreamMapError::TooManyOpenStreams`] at the cap.
    pub fn open_unreliable_stream(&self) -> Result<Arc<Stream>, StreamMapError> {
        self.streams.open_unreliable_stream()
    }

    /// Wait for the next stream the peer opens.
    ///
    /// # Errors
    /// The registry's close error after teardown.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, StreamMapError> {
        self.streams.accept_stream().await
    }

    /// The stream registry.
    #[must_use]
    pub fn streams(&self) -> &Arc<StreamsMap> {
        &self.streams
    }

    /// Ask the scheduler to run a sending cycle soon.
    pub fn schedule_send(&self) {
        self.send_notify.notify_one();
    }

    /// Snapshot of the session's paths, ordered by id.
    #[must_use]
    pub fn paths(&self) -> Vec<Arc<Path>> {
        self.ordered_paths()
    }

    /// Addresses the peer advertised via ADD_ADDRESS.
    #[must_use]
    pub fn remote_addresses(&self) -> Vec<SocketAddr> {
        self.remote_addresses
            .lock()
            .expect("remote addresses lock poisoned")
            .clone()
    }

    /// Path ids the peer advertised via PATHS.
    #[must_use]
    pub fn remote_path_ids(&self) -> Vec<PathId> {
        self.remote_path_ids
            .lock()
            .expect("remote path ids lock poisoned")
            .clone()
    }

    /// Mark the handshake as (in)complete. Until complete, handshake
    /// packets are eligible for direct retransmission.
    pub fn set_handshake_complete(&self, complete: bool) {
        self.handshake_complete.store(complete, Ordering::Relaxed);
    }

    /// Close the session, cancelling every stream.
    pub fn close(&self) {
        self.close_with_reason("session closed locally");
    }

    fn close_with_reason(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(reason, "closing session");
        *self.close_reason.lock().expect("close reason lock poisoned") = Some(reason.to_string());
        self.streams
            .close_with_error(&StreamMapError::Closed(reason.to_string()));
        let paths: Vec<Arc<Path>> = {
            let paths = self.paths.read().expect("paths lock poisoned");
            paths.values().cloned().collect()
        };
        for path in paths {
            path.close();
        }
        self.close_notify.notify_waiters();
        self.close_notify.notify_one();
        self.send_notify.notify_one();
    }

    fn path_ids(&self) -> Vec<PathId> {
        let mut ids: Vec<PathId> = self
            .paths
            .read()
            .expect("paths lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    fn ordered_paths(&self) -> Vec<Arc<Path>> {
        let paths = self.paths.read().expect("paths lock poisoned");
        let mut v: Vec<Arc<Path>> = paths.values().cloned().collect();
        v.sort_by_key(|p| p.path_id());
        v
    }

    fn remove_path(&self, path_id: PathId) {
        self.paths
            .write()
            .expect("paths lock poisoned")
            .remove(&path_id);
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .remove_path(path_id);
        self.olia.remove(path_id);
        tracing::info!(path = path_id, "path removed");
    }

    /// Drain one path's connection, dispatching packets by the path id
    /// in their header.
    async fn receive_loop(self: Arc<Self>, path: Arc<Path>) {
        loop {
            if self.is_closed() || !path.is_open() {
                break;
            }
            // The periodic branch re-checks the close flags so the task
            // winds down even when the socket stays silent.
            let datagram = tokio::select! {
                received = path.conn().receive() => match received {
                    Ok(d) => d,
                    Err(_) => break,
                },
                () = tokio::time::sleep(std::time::Duration::from_millis(250)) => continue,
            };
            let target_id = datagram.data.first().copied().unwrap_or(path.path_id());
            let target = self
                .paths
                .read()
                .expect("paths lock poisoned")
                .get(&target_id)
                .cloned();
            let Some(target) = target else {
                tracing::warn!(path = target_id, "packet for unknown path dropped");
                continue;
            };
            self.handle_datagram(&target, &datagram);
        }
        tracing::debug!(path = path.path_id(), "receive task stopped");
    }

    fn handle_datagram(&self, path: &Arc<Path>, datagram: &Datagram) {
        let is_server = self.config.perspective == Perspective::Server;
        match path.handle_packet(datagram, &*self.unpacker, is_server) {
            Ok(frames) => {
                if let Err(err) = self.handle_frames(frames, path) {
                    if err.is_fatal() {
                        self.close_with_reason(&err.to_string());
                    } else {
                        tracing::debug!(error = %err, "non-fatal frame handling error");
                    }
                }
                self.schedule_send();
            }
            Err(err) if err.is_fatal() => self.close_with_reason(&err.to_string()),
            Err(err) => tracing::debug!(error = %err, "packet dropped"),
        }
    }

    /// Fan received frames out to the ack handlers, streams and session
    /// state.
    fn handle_frames(&self, frames: Vec<Frame>, path: &Arc<Path>) -> Result<(), Error> {
        for frame in frames {
            match frame {
                Frame::Ack(ack) => {
                    let target = self
                        .paths
                        .read()
                        .expect("paths lock poisoned")
                        .get(&ack.path_id)
                        .cloned();
                    let Some(target) = target else { continue };
                    let with_pn = path.last_received_packet_number();
                    match target.handlers().sent.received_ack(&ack, with_pn, Instant::now()) {
                        Ok(()) => {}
                        Err(err) if err.is_fatal() => {
                            return Err(Error::protocol(err.code(), err.to_string()));
                        }
                        Err(err) => {
                            tracing::trace!(error = %err, "dropping ACK");
                        }
                    };
                }
                Frame::ClosePath(cp) => {
                    let target = self
                        .paths
                        .read()
                        .expect("paths lock poisoned")
                        .get(&cp.path_id)
                        .cloned();
                    let Some(target) = target else { continue };
                    let with_pn = path.last_received_packet_number();
                    match target.handlers().sent.received_close_path(&cp, with_pn) {
                        Ok(()) => {}
                        Err(err) if err.is_fatal() => {
                            return Err(Error::protocol(err.code(), err.to_string()));
                        }
                        Err(err) => {
                            tracing::trace!(error = %err, "dropping CLOSE_PATH");
                        }
                    }
                    target.close();
                    self.remove_path(cp.path_id);
                }
                Frame::Stream(sf) => {
                    let stream = if sf.unreliable {
                        self.streams.get_or_open_stream_typed(sf.stream_id, true)
                    } else {
                        self.streams.get_or_open_stream(sf.stream_id)
                    };
                    match stream {
                        Ok(Some(stream)) => {
                            stream.add_stream_frame(sf)?;
                            self.maybe_reap_stream(&stream);
                        }
                        Ok(None) => {
                            // Data for a stream that came and went.
                        }
                        Err(err @ StreamMapError::InvalidStreamId(..)) => {
                            return Err(Error::protocol(
                                ErrorCode::InvalidStreamId,
                                err.to_string(),
                            ));
                        }
                        Err(err @ StreamMapError::TooManyOpenStreams) => {
                            return Err(Error::protocol(
                                ErrorCode::TooManyOpenStreams,
                                err.to_string(),
                            ));
                        }
                        Err(err) => return Err(Error::StreamMap(err)),
                    }
                }
                Frame::StopWaiting { least_unacked } => {
                    path.handlers()
                        .recv
                        .set_lower_limit(least_unacked.saturating_sub(1));
                }
                Frame::WindowUpdate {
                    stream_id,
                    byte_offset,
                } => {
                    self.flow
                        .lock()
                        .expect("flow lock poisoned")
                        .update_send_window(stream_id, byte_offset);
                    self.framer
                        .lock()
                        .expect("framer lock poisoned")
                        .window_updated(stream_id);
                }
                Frame::Blocked { .. } => {
                    self.peer_blocked.store(true, Ordering::Relaxed);
                }
                Frame::Ping => {}
                Frame::Paths { path_ids } => {
                    *self
                        .remote_path_ids
                        .lock()
                        .expect("remote path ids lock poisoned") = path_ids;
                }
                Frame::AddAddress { addr } => {
                    self.remote_addresses
                        .lock()
                        .expect("remote addresses lock poisoned")
                        .push(addr);
                }
                Frame::RstStream {
                    stream_id,
                    byte_offset,
                    ..
                } => {
                    if let Some(stream) = self.streams.get(stream_id) {
                        self.flow
                            .lock()
                            .expect("flow lock poisoned")
                            .update_highest_received(stream_id, byte_offset)?;
                        stream.register_remote_error(StreamError::ResetRemote(stream_id));
                        self.maybe_reap_stream(&stream);
                    }
                }
            }
        }
        Ok(())
    }

    fn maybe_reap_stream(&self, stream: &Arc<Stream>) {
        if stream.finished() {
            let id = stream.id();
            if self.streams.remove_stream(id).is_ok() {
                self.flow
                    .lock()
                    .expect("flow lock poisoned")
                    .remove_stream(id);
            }
        }
    }

    /// Multiplexer: path timers and send signals drive the scheduler.
    async fn run_loop(self: Arc<Self>) {
        let mut timers = self.path_timers_rx.lock().await;
        loop {
            if self.is_closed() {
                break;
            }
            tokio::select! {
                _ = self.close_notify.notified() => break,
                fired = timers.recv() => {
                    let Some(path_id) = fired else { break };
                    self.on_path_timer(path_id);
                    if let Err(err) = self.send_packets().await {
                        self.on_send_error(err);
                    }
                }
                _ = self.send_notify.notified() => {
                    if let Err(err) = self.send_packets().await {
                        self.on_send_error(err);
                    }
                }
            }
        }
        tracing::debug!("session run loop stopped");
    }

    fn on_path_timer(&self, path_id: PathId) {
        let path = self
            .paths
            .read()
            .expect("paths lock poisoned")
            .get(&path_id)
            .cloned();
        let Some(path) = path else { return };
        let (idle_closed, wants_paths_frame) = path.on_timer_event();
        if idle_closed {
            self.remove_path(path_id);
        }
        if wants_paths_frame {
            let ids = self.path_ids();
            self.framer
                .lock()
                .expect("framer lock poisoned")
                .schedule_paths_frame(ids);
        }
    }

    fn on_send_error(&self, err: Error) {
        if err.is_fatal() {
            self.close_with_reason(&err.to_string());
        } else {
            tracing::debug!(error = %err, "send cycle error");
        }
    }

    /// Pull queued retransmissions off every path and sort their frames:
    /// reliable stream frames to the framer, surviving WINDOW_UPDATEs
    /// and other control frames back to the packer, unreliable stream
    /// frames to the floor.
    fn get_retransmission(&self) -> (bool, Option<Packet>, Option<Arc<Path>>) {
        let mut has_retransmission = false;
        let mut last_from: Option<Arc<Path>> = None;

        loop {
            let mut item: Option<(Packet, Arc<Path>)> = None;
            for path in self.ordered_paths() {
                let dequeued = path.handlers().sent.dequeue_packet_for_retransmission();
                if let Some(packet) = dequeued {
                    item = Some((packet, path));
                    break;
                }
            }
            let Some((packet, from)) = item else { break };
            has_retransmission = true;
            last_from = Some(Arc::clone(&from));

            if packet.encryption_level != EncryptionLevel::ForwardSecure {
                if self.handshake_complete.load(Ordering::Relaxed) {
                    // Handshake packets are meaningless once the
                    // handshake completed.
                    continue;
                }
                return (true, Some(packet), last_from);
            }

            tracing::debug!(
                pn = packet.pn,
                path = from.path_id(),
                "redistributing frames of lost packet"
            );
            for frame in packet.frames {
                match frame {
                    Frame::Stream(sf) => {
                        if self.streams.is_unreliable(sf.stream_id) == Some(true) {
                            tracing::trace!(
                                stream = sf.stream_id,
                                "dropping lost unreliable stream frame"
                            );
                        } else {
                            self.framer
                                .lock()
                                .expect("framer lock poisoned")
                                .add_frame_for_retransmission(sf);
                        }
                    }
                    Frame::WindowUpdate {
                        stream_id,
                        byte_offset,
                    } => {
                        let current = self
                            .flow
                            .lock()
                            .expect("flow lock poisoned")
                            .receive_window_offset(stream_id);
                        if current.is_some_and(|cur| byte_offset >= cur) {
                            self.packer
                                .lock()
                                .expect("packer lock poisoned")
                                .queue_control_frame(
                                    Frame::WindowUpdate {
                                        stream_id,
                                        byte_offset,
                                    },
                                    from.path_id(),
                                );
                        }
                    }
                    Frame::Paths { .. } => {
                        let ids = self.path_ids();
                        self.framer
                            .lock()
                            .expect("framer lock poisoned")
                            .schedule_paths_frame(ids);
                    }
                    other => {
                        self.packer
                            .lock()
                            .expect("packer lock poisoned")
                            .queue_control_frame(other, from.path_id());
                    }
                }
            }
        }
        (has_retransmission, None, last_from)
    }

    /// One full sending cycle: keep packing and sending until there is
    /// nothing left or no path can take more.
    async fn send_packets(&self) -> Result<(), Error> {
        let mut window_updates: Vec<Frame> = self
            .flow
            .lock()
            .expect("flow lock poisoned")
            .window_updates()
            .into_iter()
            .map(|(stream_id, byte_offset)| Frame::WindowUpdate {
                stream_id,
                byte_offset,
            })
            .collect();

        loop {
            if self.is_closed() {
                return Ok(());
            }

            let (has_retransmission, handshake_packet, from_path) = self.get_retransmission();
            let has_stream_retransmission = self
                .framer
                .lock()
                .expect("framer lock poisoned")
                .has_frames_for_retransmission();

            let selected = {
                let paths = self.paths.read().expect("paths lock poisoned");
                self.scheduler
                    .lock()
                    .expect("scheduler lock poisoned")
                    .select_path(
                        &paths,
                        has_retransmission,
                        has_stream_retransmission,
                        from_path.as_ref(),
                    )
            };
            let Some(path) = selected else {
                return self.ack_remaining_paths(&window_updates).await;
            };
            let path_id = path.path_id();

            // A handshake retransmission goes out as-is, preceded by a
            // forced STOP_WAITING.
            if let Some(hs) = handshake_packet {
                {
                    let mut packer = self.packer.lock().expect("packer lock poisoned");
                    if let Some(swf) = path.get_stop_waiting_frame(true) {
                        packer.queue_control_frame(swf, path_id);
                    }
                    for frame in hs.frames {
                        packer.queue_control_frame(frame, path_id);
                    }
                }
                self.pack_and_send(&path, Vec::new()).await?;
                continue;
            }

            // ACK and STOP_WAITING.
            let ack = path.get_ack_frame();
            let ack_queued = ack.is_some();
            {
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                if let Some(ack) = ack {
                    packer.queue_control_frame(ack, path_id);
                }
                if ack_queued || has_stream_retransmission {
                    if let Some(swf) = path.get_stop_waiting_frame(has_stream_retransmission) {
                        packer.queue_control_frame(swf, path_id);
                    }
                }
            }

            // CLOSE_PATH, ADD_ADDRESS and PATHS frames, then loose
            // control frames.
            {
                let mut framer = self.framer.lock().expect("framer lock poisoned");
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                while let Some(f) = framer.pop_close_path_frame() {
                    packer.queue_control_frame(f, path_id);
                }
                while let Some(f) = framer.pop_add_address_frame() {
                    packer.queue_control_frame(f, path_id);
                }
                while let Some(f) = framer.pop_paths_frame() {
                    packer.queue_control_frame(f, path_id);
                }
                while let Some(f) = framer.pop_control_frame() {
                    packer.queue_control_frame(f, path_id);
                }
            }

            // Keep the peer acking through long ACK-only stretches.
            if path.handlers().sent.should_send_retransmittable_packet() {
                self.packer
                    .lock()
                    .expect("packer lock poisoned")
                    .queue_control_frame(Frame::Ping, path_id);
            }

            // Window updates ride the first packet of the cycle and are
            // repeated once.
            let wufs = std::mem::take(&mut window_updates);
            {
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                for f in &wufs {
                    packer.queue_control_frame(f.clone(), path_id);
                }
            }

            // Stream data under the packet budget.
            let sending_allowed = path.sending_allowed();
            let (stream_frames, blocked) = self
                .framer
                .lock()
                .expect("framer lock poisoned")
                .pop_frames(&self.streams, MAX_PACKET_PAYLOAD, sending_allowed);
            {
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                for f in blocked {
                    packer.queue_control_frame(f, path_id);
                }
            }
            let frames: Vec<Frame> = stream_frames.into_iter().map(Frame::Stream).collect();

            let Some(sent) = self.pack_and_send(&path, frames).await? else {
                // Nothing left to pack: flush ACKs pending elsewhere.
                return self.ack_remaining_paths(&window_updates).await;
            };

            // Window updates go out twice.
            {
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                for f in wufs {
                    packer.queue_control_frame(f, path_id);
                }
            }

            // Probe duplication: data sent on an unprobed path is also
            // offered to a less-used path whose window has room.
            if path.smoothed_rtt().is_zero() {
                let current_quota = self
                    .scheduler
                    .lock()
                    .expect("scheduler lock poisoned")
                    .quota(path_id);
                for other in self.ordered_paths() {
                    let other_id = other.path_id();
                    if other_id == INITIAL_PATH_ID || other_id == path_id {
                        continue;
                    }
                    let other_quota = self
                        .scheduler
                        .lock()
                        .expect("scheduler lock poisoned")
                        .quota(other_id);
                    if other_quota < current_quota && other.sending_allowed() {
                        other.handlers().sent.duplicate_packet(sent.clone());
                        tracing::trace!(
                            from = path_id,
                            to = other_id,
                            pn = sent.pn,
                            "duplicating probe packet"
                        );
                        break;
                    }
                }
            }

            // Probe a potentially failed retransmission source.
            if let Some(from) = &from_path {
                if from.is_potentially_failed() {
                    self.send_ping(from).await?;
                }
            }
        }
    }

    /// Pack one packet for `path` and put it on the wire. Returns the
    /// archived copy, or `None` when there was nothing to pack.
    async fn pack_and_send(
        &self,
        path: &Arc<Path>,
        stream_frames: Vec<Frame>,
    ) -> Result<Option<Packet>, Error> {
        let path_id = path.path_id();
        let (packet, pn) = {
            let mut handlers = path.handlers();
            let pn = handlers.pn_gen.peek();
            let packet = self
                .packer
                .lock()
                .expect("packer lock poisoned")
                .pack_packet(path_id, pn, stream_frames);
            if packet.is_some() {
                handlers.pn_gen.pop();
            }
            (packet, pn)
        };
        let Some(packet) = packet else {
            return Ok(None);
        };

        let archived = Packet {
            pn,
            frames: packet.frames.clone(),
            length: packet.raw.len() as u64,
            encryption_level: packet.encryption_level,
            send_time: Instant::now(),
        };
        if let Err(err) = path.record_sent(archived.clone()) {
            // Transient archive pressure: drop this cycle, the data is
            // still queued.
            tracing::warn!(error = %err, path = path_id, "could not archive packet");
            return Err(err.into());
        }
        path.conn().send(&packet.raw).await?;
        self.scheduler
            .lock()
            .expect("scheduler lock poisoned")
            .add_quota(path_id);
        tracing::trace!(path = path_id, pn, bytes = packet.raw.len(), "sent packet");
        Ok(Some(archived))
    }

    /// No path can take data: still flush pure ACKs and window updates
    /// on every probed path.
    async fn ack_remaining_paths(&self, window_updates: &[Frame]) -> Result<(), Error> {
        for path in self.ordered_paths() {
            if !path.is_open() {
                continue;
            }
            let path_id = path.path_id();
            let ack = path.get_ack_frame();
            {
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                for f in window_updates {
                    packer.queue_control_frame(f.clone(), path_id);
                }
            }
            if ack.is_none() && window_updates.is_empty() {
                continue;
            }
            if path_id == INITIAL_PATH_ID && ack.is_none() {
                continue;
            }
            {
                let mut packer = self.packer.lock().expect("packer lock poisoned");
                if let Some(swf) = path.get_stop_waiting_frame(false) {
                    packer.queue_control_frame(swf, path_id);
                }
                if let Some(ack) = ack {
                    packer.queue_control_frame(ack, path_id);
                }
            }
            self.pack_and_send(&path, Vec::new()).await?;
        }
        self.peer_blocked.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn send_ping(&self, path: &Arc<Path>) -> Result<(), Error> {
        self.packer
            .lock()
            .expect("packer lock poisoned")
            .queue_control_frame(Frame::Ping, path.path_id());
        self.pack_and_send(path, Vec::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_transport::MemoryConnection;
    use std::time::Duration;

    fn session_pair() -> (Arc<Session>, Arc<Session>) {
        let client = Session::with_null_crypto(SessionConfig::new(Perspective::Client));
        let server = Session::with_null_crypto(SessionConfig::new(Perspective::Server));
        let (a, b) = MemoryConnection::pair(
            "10.0.0.1:4433".parse().unwrap(),
            "10.0.0.2:4433".parse().unwrap(),
        );
        client.add_path(a);
        server.add_path(b);
        client.start();
        server.start();
        (client, server)
    }

    #[tokio::test]
    async fn test_single_path_reliable_echo() {
        let (client, server) = session_pair();

        let stream = client.open_stream().unwrap();
        let writer = Arc::clone(&stream);
        let write_task = tokio::spawn(async move {
            for chunk in 0..8u8 {
                writer.write(&[chunk; 128]).await.unwrap();
            }
            writer.close();
        });

        let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .expect("accept timed out")
            .unwrap();
        assert_eq!(accepted.id(), 1);

        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), accepted.read(&mut buf))
                .await
                .expect("read timed out")
                .unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        write_task.await.unwrap();

        assert_eq!(received.len(), 1024);
        for chunk in 0..8usize {
            assert!(received[chunk * 128..(chunk + 1) * 128]
                .iter()
                .all(|&b| b == chunk as u8));
        }
    }

    #[tokio::test]
    async fn test_bidirectional_streams() {
        let (client, server) = session_pair();

        let c2s = client.open_stream().unwrap();
        c2s.write(b"ping from client").await.unwrap();

        let on_server = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), on_server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping from client");

        let s2c = server.open_stream().unwrap();
        s2c.write(b"pong from server").await.unwrap();
        let on_client = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(on_client.id(), 2);
        let n = tokio::time::timeout(Duration::from_secs(5), on_client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong from server");
    }

    #[tokio::test]
    async fn test_session_close_cancels_streams() {
        let (client, _server) = session_pair();
        let stream = client.open_stream().unwrap();
        client.close();
        assert!(client.is_closed());

        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(client.open_stream().is_err());
    }
}
