//! Stream frame production for outgoing packets.
//!
//! The framer owns the retransmission queue of reliable stream frames and
//! the queues of CLOSE_PATH, PATHS and ADD_ADDRESS control frames the
//! scheduler drains, and pops fresh stream data round-robin under a
//! per-packet byte budget.

use crate::frame::{Frame, StreamFrame};
use crate::protocol::{ByteCount, PathId, StreamId};
use crate::session::flow::FlowController;
use crate::session::streams_map::StreamsMap;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Produces the stream-data part of outgoing packets.
pub struct StreamFramer {
    retransmission_queue: VecDeque<StreamFrame>,
    close_path_frames: VecDeque<Frame>,
    add_address_frames: VecDeque<Frame>,
    paths_frames: VecDeque<Frame>,
    control_frames: VecDeque<Frame>,
    /// Streams we already emitted a BLOCKED frame for; cleared when the
    /// peer raises their window.
    blocked_streams: HashSet<StreamId>,
    flow: Arc<Mutex<FlowController>>,
}

impl StreamFramer {
    /// Create a framer sharing the session's flow controller.
    #[must_use]
    pub fn new(flow: Arc<Mutex<FlowController>>) -> Self {
        Self {
            retransmission_queue: VecDeque::new(),
            close_path_frames: VecDeque::new(),
            add_address_frames: VecDeque::new(),
            paths_frames: VecDeque::new(),
            control_frames: VecDeque::new(),
            blocked_streams: HashSet::new(),
            flow,
        }
    }

    /// Queue a reliable stream frame pulled from a lost packet.
    pub fn add_frame_for_retransmission(&mut self, frame: StreamFrame) {
        self.retransmission_queue.push_back(frame);
    }

    /// Whether lost stream data is waiting to be resent.
    #[must_use]
    pub fn has_frames_for_retransmission(&self) -> bool {
        !self.retransmission_queue.is_empty()
    }

    /// Queue a CLOSE_PATH frame for the scheduler.
    pub fn queue_close_path_frame(&mut self, frame: Frame) {
        self.close_path_frames.push_back(frame);
    }

    /// Take the next queued CLOSE_PATH frame.
    pub fn pop_close_path_frame(&mut self) -> Option<Frame> {
        self.close_path_frames.pop_front()
    }

    /// Queue an ADD_ADDRESS frame for the scheduler.
    pub fn queue_add_address_frame(&mut self, frame: Frame) {
        self.add_address_frames.push_back(frame);
    }

    /// Take the next queued ADD_ADDRESS frame.
    pub fn pop_add_address_frame(&mut self) -> Option<Frame> {
        self.add_address_frames.pop_front()
    }

    /// Queue a loose control frame (e.g. RST_STREAM) for whichever path
    /// the scheduler picks next.
    pub fn queue_control_frame(&mut self, frame: Frame) {
        self.control_frames.push_back(frame);
    }

    /// Take the next loose control frame.
    pub fn pop_control_frame(&mut self) -> Option<Frame> {
        self.control_frames.pop_front()
    }

    /// Schedule a PATHS frame advertising `path_ids`.
    pub fn schedule_paths_frame(&mut self, path_ids: Vec<PathId>) {
        self.paths_frames.push_back(Frame::Paths { path_ids });
    }

    /// Take the next queued PATHS frame.
    pub fn pop_paths_frame(&mut self) -> Option<Frame> {
        self.paths_frames.pop_front()
    }

    /// The peer raised a window: allow BLOCKED to be reported again.
    pub fn window_updated(&mut self, id: StreamId) {
        self.blocked_streams.remove(&id);
    }

    /// Pop at most `max_bytes` of stream frames: retransmissions first,
    /// then fresh data round-robin. `sending_allowed` gates fresh
    /// unreliable data. Returns the stream frames and any BLOCKED
    /// control frames that became due.
    pub fn pop_frames(
        &mut self,
        streams: &StreamsMap,
        max_bytes: ByteCount,
        sending_allowed: bool,
    ) -> (Vec<StreamFrame>, Vec<Frame>) {
        let mut frames = Vec::new();
        let mut control = Vec::new();
        let mut budget = max_bytes;

        while budget > 0 {
            let Some(mut frame) = self.retransmission_queue.pop_front() else {
                break;
            };
            if frame.data_len() > budget {
                // Split: the tail goes back to the front of the queue.
                let tail_data = frame.data.split_off(budget as usize);
                let tail = StreamFrame {
                    stream_id: frame.stream_id,
                    offset: frame.offset + budget,
                    data: tail_data,
                    fin: frame.fin,
                    unreliable: frame.unreliable,
                };
                frame.fin = false;
                self.retransmission_queue.push_front(tail);
                budget = 0;
                frames.push(frame);
                break;
            }
            budget -= frame.data_len();
            frames.push(frame);
        }

        if budget == 0 {
            return (frames, control);
        }

        let flow = Arc::clone(&self.flow);
        let blocked = &mut self.blocked_streams;
        let _ = streams.round_robin_iterate_send_blocked(
            |stream| {
                if budget == 0 {
                    return Ok(false);
                }
                if !stream.wants_to_send() {
                    return Ok(true);
                }
                let window = flow
                    .lock()
                    .expect("flow lock poisoned")
                    .send_window_available(stream.id());
                let max = budget.min(window);
                if max == 0 && stream.len_of_data_for_writing() > 0 {
                    if blocked.insert(stream.id()) {
                        control.push(Frame::Blocked {
                            stream_id: stream.id(),
                        });
                    }
                    return Ok(true);
                }
                if let Some(frame) = stream.pop_stream_frame(max) {
                    flow.lock()
                        .expect("flow lock poisoned")
                        .add_bytes_sent(stream.id(), frame.data_len());
                    budget -= frame.data_len();
                    frames.push(frame);
                }
                Ok(true)
            },
            sending_allowed,
        );

        (frames, control)
    }
}
