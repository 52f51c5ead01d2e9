//! Stream and connection level flow control.
//!
//! Tracks the receive offsets we have advertised to the peer and the
//! send windows the peer has advertised to us. Window updates are
//! generated once the reader has consumed half of a receive window.
//! Stream id 0 stands for the connection-level window in WINDOW_UPDATE
//! and BLOCKED frames.

use crate::error::{Error, ErrorCode};
use crate::protocol::{
    ByteCount, StreamId, RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW,
    RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
};
use std::collections::HashMap;

#[derive(Debug)]
struct StreamFlow {
    highest_received: ByteCount,
    bytes_read: ByteCount,
    receive_window: ByteCount,
    receive_window_size: ByteCount,
    bytes_sent: ByteCount,
    send_window: ByteCount,
}

/// Per-session flow control state.
#[derive(Debug)]
pub struct FlowController {
    streams: HashMap<StreamId, StreamFlow>,
    conn_highest_received: ByteCount,
    conn_bytes_read: ByteCount,
    conn_receive_window: ByteCount,
    conn_receive_window_size: ByteCount,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowController {
    /// Create a controller with the default window sizes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
            conn_highest_received: 0,
            conn_bytes_read: 0,
            conn_receive_window: RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW,
            conn_receive_window_size: RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW,
        }
    }

    /// Start tracking a stream. The peer's initial send allowance equals
    /// our initial stream window until a WINDOW_UPDATE says otherwise.
    pub fn open_stream(&mut self, id: StreamId) {
        self.streams.entry(id).or_insert(StreamFlow {
            highest_received: 0,
            bytes_read: 0,
            receive_window: RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
            receive_window_size: RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
            bytes_sent: 0,
            send_window: RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
        });
    }

    /// Stop tracking a closed stream.
    pub fn remove_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// Record the highest byte offset seen on a stream.
    ///
    /// # Errors
    /// A fatal protocol violation when the peer writes past the advertised
    /// receive window.
    pub fn update_highest_received(&mut self, id: StreamId, offset: ByteCount) -> Result<(), Error> {
        let flow = self
            .streams
            .get_mut(&id)
            .ok_or_else(|| Error::protocol(ErrorCode::InternalError, "flow for unknown stream"))?;
        if offset <= flow.highest_received {
            return Ok(());
        }
        let increase = offset - flow.highest_received;
        if offset > flow.receive_window {
            return Err(Error::protocol(
                ErrorCode::FlowControlReceivedTooMuchData,
                format!("stream {id} exceeded receive window"),
            ));
        }
        flow.highest_received = offset;

        self.conn_highest_received += increase;
        if self.conn_highest_received > self.conn_receive_window {
            return Err(Error::protocol(
                ErrorCode::FlowControlReceivedTooMuchData,
                "connection receive window exceeded",
            ));
        }
        Ok(())
    }

    /// The reader consumed `n` more bytes of the stream.
    pub fn add_bytes_read(&mut self, id: StreamId, n: ByteCount) {
        if let Some(flow) = self.streams.get_mut(&id) {
            flow.bytes_read += n;
        }
        self.conn_bytes_read += n;
    }

    /// Our current advertised receive offset for the stream, or `None`
    /// once the stream is gone.
    #[must_use]
    pub fn receive_window_offset(&self, id: StreamId) -> Option<ByteCount> {
        self.streams.get(&id).map(|f| f.receive_window)
    }

    /// WINDOW_UPDATE offsets that should go out now: any stream (or the
    /// connection, id 0) whose reader crossed half of its window.
    #[must_use]
    pub fn window_updates(&mut self) -> Vec<(StreamId, ByteCount)> {
        let mut updates = Vec::new();
        for (&id, flow) in &mut self.streams {
            let remaining = flow.receive_window - flow.bytes_read;
            if remaining <= flow.receive_window_size / 2 {
                flow.receive_window = flow.bytes_read + flow.receive_window_size;
                updates.push((id, flow.receive_window));
            }
        }
        let conn_remaining = self.conn_receive_window - self.conn_bytes_read;
        if conn_remaining <= self.conn_receive_window_size / 2 {
            self.conn_receive_window = self.conn_bytes_read + self.conn_receive_window_size;
            updates.push((0, self.conn_receive_window));
        }
        updates
    }

    /// The peer raised a send window via WINDOW_UPDATE.
    pub fn update_send_window(&mut self, id: StreamId, offset: ByteCount) {
        if let Some(flow) = self.streams.get_mut(&id) {
            if offset > flow.send_window {
                flow.send_window = offset;
            }
        }
    }

    /// Bytes the peer still allows us to send on the stream.
    #[must_use]
    pub fn send_window_available(&self, id: StreamId) -> ByteCount {
        self.streams
            .get(&id)
            .map_or(0, |f| f.send_window.saturating_sub(f.bytes_sent))
    }

    /// Record stream bytes handed to the packer.
    pub fn add_bytes_sent(&mut self, id: StreamId, n: ByteCount) {
        if let Some(flow) = self.streams.get_mut(&id) {
            flow.bytes_sent += n;
        }
    }
}
