//! Stream state machine: ordered reads out of the frame sorter, buffered
//! writes drained by the framer, deadlines and the FIN/RST lifecycle.
//!
//! Lock discipline: the per-stream mutex guards the sorter, the write
//! buffer, deadlines and the sticky error slot. The flow controller has
//! its own lock and is never acquired while the stream mutex is held.

use crate::error::{Error, SorterError, StreamError};
use crate::frame::StreamFrame;
use crate::protocol::{ByteCount, StreamId};
use crate::session::flow::FlowController;
use crate::sorter::StreamFrameSorter;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

/// Callback invoked when the stream has data or state to send.
pub type OnData = Box<dyn Fn() + Send + Sync>;
/// Callback that queues a RST_STREAM for this stream.
pub type OnReset = Box<dyn Fn(StreamId, ByteCount) + Send + Sync>;

struct StreamInner {
    sorter: StreamFrameSorter,
    read_offset: ByteCount,
    read_pos_in_frame: usize,
    write_offset: ByteCount,
    data_for_writing: Option<Vec<u8>>,

    err: Option<StreamError>,
    cancelled: bool,
    finished_reading: bool,
    finished_writing: bool,
    reset_local: bool,
    reset_remote: bool,
    fin_sent: bool,
    rst_sent: bool,

    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

/// An ordered byte stream multiplexed over the session's paths.
///
/// `read` and `write` may run concurrently with each other, but multiple
/// concurrent readers (or writers) must synchronize externally.
pub struct Stream {
    id: StreamId,
    unreliable: bool,
    inner: Mutex<StreamInner>,
    read_notify: Notify,
    write_notify: Notify,
    on_data: OnData,
    on_reset: OnReset,
    flow: Arc<Mutex<FlowController>>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("unreliable", &self.unreliable)
            .finish_non_exhaustive()
    }
}

enum ReadStep {
    Copied { n: usize, fin: bool },
    Wait(Option<Instant>),
    Fail(StreamError),
    Eof,
}

impl Stream {
    /// Create a stream. `unreliable` marks its frames as
    /// non-retransmittable and enables receive-side zero-fill.
    #[must_use]
    pub fn new(
        id: StreamId,
        unreliable: bool,
        flow: Arc<Mutex<FlowController>>,
        on_data: OnData,
        on_reset: OnReset,
    ) -> Self {
        Self {
            id,
            unreliable,
            inner: Mutex::new(StreamInner {
                sorter: StreamFrameSorter::new(id, unreliable),
                read_offset: 0,
                read_pos_in_frame: 0,
                write_offset: 0,
                data_for_writing: None,
                err: None,
                cancelled: false,
                finished_reading: false,
                finished_writing: false,
                reset_local: false,
                reset_remote: false,
                fin_sent: false,
                rst_sent: false,
                read_deadline: None,
                write_deadline: None,
            }),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
            on_data,
            on_reset,
            flow,
        }
    }

    /// Stream id.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether this stream's frames carry the unreliable marker.
    #[must_use]
    pub fn is_unreliable(&self) -> bool {
        self.unreliable
    }

    /// Read into `buf`, blocking until at least one byte (or EOF, or an
    /// error) is available. Returns `Ok(0)` at end of stream.
    ///
    /// # Errors
    /// [`StreamError::DeadlineExceeded`] (transient) when the read
    /// deadline passes, the sticky stream error otherwise.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut bytes_read = 0usize;

        loop {
            let step = self.read_step(&mut buf[bytes_read..]);
            match step {
                ReadStep::Copied { n, fin } => {
                    self.flow_bytes_read(n as ByteCount);
                    (self.on_data)(); // a WINDOW_UPDATE may be due
                    bytes_read += n;
                    if fin || bytes_read == buf.len() {
                        return Ok(bytes_read);
                    }
                }
                ReadStep::Eof => return Ok(bytes_read),
                ReadStep::Fail(err) => {
                    if bytes_read > 0 && err.is_temporary() {
                        return Ok(bytes_read);
                    }
                    return Err(err);
                }
                ReadStep::Wait(deadline) => {
                    if bytes_read > 0 {
                        // Partial data beats blocking for more.
                        return Ok(bytes_read);
                    }
                    self.wait_read(deadline).await;
                }
            }
        }
    }

    fn read_step(&self, buf: &mut [u8]) -> ReadStep {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        if inner.cancelled || inner.reset_local || inner.reset_remote {
            return ReadStep::Fail(
                inner
                    .err
                    .clone()
                    .unwrap_or(StreamError::ResetLocal(self.id)),
            );
        }
        if inner.finished_reading {
            return ReadStep::Eof;
        }
        if let Some(deadline) = inner.read_deadline {
            if Instant::now() >= deadline {
                return ReadStep::Fail(StreamError::DeadlineExceeded);
            }
        }

        let deadline = inner.read_deadline;
        let read_offset = inner.read_offset;
        let copied = match inner.sorter.head() {
            None => None,
            Some(frame) => {
                let pos = (read_offset - frame.offset) as usize;
                let m = buf.len().min(frame.data.len() - pos);
                buf[..m].copy_from_slice(&frame.data[pos..pos + m]);
                Some((pos, m, pos + m >= frame.data.len(), frame.fin))
            }
        };
        let Some((pos, m, consumed, fin)) = copied else {
            return ReadStep::Wait(deadline);
        };

        inner.read_pos_in_frame = pos + m;
        inner.read_offset += m as ByteCount;
        if consumed {
            inner.sorter.pop();
            inner.read_pos_in_frame = 0;
            if fin {
                inner.finished_reading = true;
                return ReadStep::Copied { n: m, fin: true };
            }
        }
        ReadStep::Copied { n: m, fin: false }
    }

    fn flow_bytes_read(&self, n: ByteCount) {
        let reset_remote = self
            .inner
            .lock()
            .expect("stream lock poisoned")
            .reset_remote;
        // After a remote reset the peer already accounted the final
        // offset; reporting reads would double-count.
        if !reset_remote && n > 0 {
            self.flow
                .lock()
                .expect("flow lock poisoned")
                .add_bytes_read(self.id, n);
        }
    }

    async fn wait_read(&self, deadline: Option<Instant>) {
        match deadline {
            None => self.read_notify.notified().await,
            Some(d) => {
                let _ = tokio::time::timeout_at(tokio::time::Instant::from_std(d), async {
                    self.read_notify.notified().await;
                })
                .await;
            }
        }
    }

    /// Write all of `data` into the send buffer and block until the
    /// framer drained it, the write deadline passes, or an error is set.
    ///
    /// # Errors
    /// [`StreamError::DeadlineExceeded`] (transient), the sticky error,
    /// or [`StreamError::WriteOnClosedStream`] after `close`.
    pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            if inner.reset_local || inner.err.is_some() {
                return Err(inner
                    .err
                    .clone()
                    .unwrap_or(StreamError::ResetLocal(self.id)));
            }
            if inner.finished_writing {
                return Err(StreamError::WriteOnClosedStream(self.id));
            }
            if data.is_empty() {
                return Ok(0);
            }
            inner.data_for_writing = Some(data.to_vec());
        }
        (self.on_data)();

        loop {
            let deadline = {
                let inner = self.inner.lock().expect("stream lock poisoned");
                if let Some(d) = inner.write_deadline {
                    if Instant::now() >= d {
                        return Err(StreamError::DeadlineExceeded);
                    }
                }
                if let Some(err) = &inner.err {
                    return Err(err.clone());
                }
                if inner.data_for_writing.is_none() {
                    return Ok(data.len());
                }
                inner.write_deadline
            };

            match deadline {
                None => self.write_notify.notified().await,
                Some(d) => {
                    let _ = tokio::time::timeout_at(tokio::time::Instant::from_std(d), async {
                        self.write_notify.notified().await;
                    })
                    .await;
                }
            }
        }
    }

    /// Bytes waiting to be packed.
    #[must_use]
    pub fn len_of_data_for_writing(&self) -> ByteCount {
        let inner = self.inner.lock().expect("stream lock poisoned");
        if inner.err.is_some() {
            return 0;
        }
        inner
            .data_for_writing
            .as_ref()
            .map_or(0, |d| d.len() as ByteCount)
    }

    /// Whether the framer should visit this stream at all.
    #[must_use]
    pub(crate) fn wants_to_send(&self) -> bool {
        let inner = self.inner.lock().expect("stream lock poisoned");
        if inner.err.is_some() {
            return false;
        }
        inner.data_for_writing.is_some() || (inner.finished_writing && !inner.fin_sent)
    }

    /// Produce the next outgoing frame, taking at most `max_bytes` of
    /// buffered data. Returns a pure-FIN frame once the buffer is
    /// drained after `close`.
    pub(crate) fn pop_stream_frame(&self, max_bytes: ByteCount) -> Option<StreamFrame> {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        if inner.err.is_some() {
            return None;
        }

        let avail = inner.data_for_writing.as_ref().map_or(0, |d| d.len() as ByteCount);
        let n = avail.min(max_bytes);

        let data = if n == 0 {
            if avail > 0 {
                return None; // flow blocked; BLOCKED is the framer's call
            }
            Vec::new()
        } else {
            let buffer = inner.data_for_writing.as_mut().expect("avail > 0");
            let taken: Vec<u8> = buffer.drain(..n as usize).collect();
            if buffer.is_empty() {
                inner.data_for_writing = None;
                self.write_notify.notify_one();
            }
            taken
        };

        let offset = inner.write_offset;
        inner.write_offset += data.len() as ByteCount;

        let fin = inner.finished_writing && inner.data_for_writing.is_none() && !inner.fin_sent;
        if data.is_empty() && !fin {
            return None;
        }
        if fin {
            inner.fin_sent = true;
        }
        Some(StreamFrame {
            stream_id: self.id,
            offset,
            data,
            fin,
            unreliable: self.unreliable,
        })
    }

    /// Queue an incoming frame into the sorter.
    ///
    /// # Errors
    /// Flow control violations and a gap-list overflow are fatal;
    /// duplicates and empty frames are silently dropped.
    pub fn add_stream_frame(&self, frame: StreamFrame) -> Result<(), Error> {
        let max_offset = frame.end_offset();
        self.flow
            .lock()
            .expect("flow lock poisoned")
            .update_highest_received(self.id, max_offset)?;

        {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            match inner.sorter.push(frame, true) {
                Ok(()) => {}
                Err(SorterError::DuplicateStreamData | SorterError::EmptyStreamData) => {}
                Err(err @ SorterError::TooManyGaps) => return Err(err.into()),
            }
        }
        self.read_notify.notify_one();
        Ok(())
    }

    /// Deliver a synthetic FIN at `offset` (used when the peer announces
    /// the final offset out of band).
    pub fn close_remote(&self, offset: ByteCount) {
        let _ = self.add_stream_frame(StreamFrame {
            stream_id: self.id,
            offset,
            data: Vec::new(),
            fin: true,
            unreliable: self.unreliable,
        });
    }

    /// Close the write side; a FIN goes out once the buffer drains.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            inner.finished_writing = true;
        }
        (self.on_data)();
    }

    fn should_send_reset(inner: &StreamInner) -> bool {
        if inner.rst_sent {
            return false;
        }
        (inner.reset_local || inner.reset_remote) && !(inner.finished_writing && inner.fin_sent)
    }

    /// Reset the stream locally. The error is sticky; a RST_STREAM is
    /// queued unless the write side already finished cleanly.
    pub fn reset(&self, err: StreamError) {
        let send_reset = {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            if inner.reset_local {
                return;
            }
            inner.reset_local = true;
            if inner.err.is_none() {
                inner.err = Some(err);
                self.read_notify.notify_one();
                self.write_notify.notify_one();
            }
            let send = Self::should_send_reset(&inner);
            if send {
                inner.rst_sent = true;
            }
            send
        };
        if send_reset {
            let offset = self.inner.lock().expect("stream lock poisoned").write_offset;
            (self.on_reset)(self.id, offset);
            (self.on_data)();
        }
    }

    /// The peer reset the stream.
    pub fn register_remote_error(&self, err: StreamError) {
        let send_reset = {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            if inner.reset_remote {
                return;
            }
            inner.reset_remote = true;
            if inner.err.is_none() {
                inner.err = Some(err);
                self.read_notify.notify_one();
                self.write_notify.notify_one();
            }
            let send = Self::should_send_reset(&inner);
            if send {
                inner.rst_sent = true;
            }
            send
        };
        if send_reset {
            let offset = self.inner.lock().expect("stream lock poisoned").write_offset;
            (self.on_reset)(self.id, offset);
            (self.on_data)();
        }
    }

    /// Session teardown: record the error and wake every waiter.
    pub fn cancel(&self, err: StreamError) {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        inner.cancelled = true;
        if inner.err.is_none() {
            inner.err = Some(err);
        }
        self.read_notify.notify_one();
        self.write_notify.notify_one();
    }

    /// Set the read deadline. An earlier deadline wakes pending readers.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        let wake = {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            let earlier = match (deadline, inner.read_deadline) {
                (Some(new), Some(old)) => new < old,
                (Some(_), None) => true,
                _ => false,
            };
            inner.read_deadline = deadline;
            earlier
        };
        if wake {
            self.read_notify.notify_one();
        }
    }

    /// Set the write deadline. An earlier deadline wakes pending writers.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        let wake = {
            let mut inner = self.inner.lock().expect("stream lock poisoned");
            let earlier = match (deadline, inner.write_deadline) {
                (Some(new), Some(old)) => new < old,
                (Some(_), None) => true,
                _ => false,
            };
            inner.write_deadline = deadline;
            earlier
        };
        if wake {
            self.write_notify.notify_one();
        }
    }

    /// Set both deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Whether the stream is completely done and can be reaped.
    #[must_use]
    pub fn finished(&self) -> bool {
        let inner = self.inner.lock().expect("stream lock poisoned");
        let wrote_fin = inner.finished_writing && inner.fin_sent;
        inner.cancelled
            || (inner.finished_reading && wrote_fin)
            || (inner.reset_remote && inner.rst_sent)
            || (inner.finished_reading && inner.rst_sent)
            || (wrote_fin && inner.reset_remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn make_stream(id: StreamId, unreliable: bool) -> (Arc<Stream>, Arc<AtomicUsize>) {
        let flow = Arc::new(Mutex::new(FlowController::new()));
        flow.lock().unwrap().open_stream(id);
        let data_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&data_calls);
        let stream = Arc::new(Stream::new(
            id,
            unreliable,
            flow,
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
            Box::new(|_, _| {}),
        ));
        (stream, data_calls)
    }

    fn frame(id: StreamId, offset: ByteCount, data: &[u8], fin: bool) -> StreamFrame {
        StreamFrame {
            stream_id: id,
            offset,
            data: data.to_vec(),
            fin,
            unreliable: false,
        }
    }

    #[tokio::test]
    async fn test_read_in_order() {
        let (s, _) = make_stream(5, false);
        s.add_stream_frame(frame(5, 0, b"hello ", false)).unwrap();
        s.add_stream_frame(frame(5, 6, b"world", false)).unwrap();

        let mut buf = [0u8; 11];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[tokio::test]
    async fn test_read_blocks_until_frame() {
        let (s, _) = make_stream(5, false);
        let reader = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let n = reader.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        s.add_stream_frame(frame(5, 0, b"data", false)).unwrap();
        assert_eq!(handle.await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_read_eof_after_fin() {
        let (s, _) = make_stream(5, false);
        s.add_stream_frame(frame(5, 0, b"bye", true)).unwrap();

        let mut buf = [0u8; 16];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"bye");
        assert_eq!(s.read(&mut buf).await.unwrap(), 0, "EOF");
    }

    #[tokio::test]
    async fn test_read_partial_return() {
        let (s, _) = make_stream(5, false);
        s.add_stream_frame(frame(5, 0, b"abc", false)).unwrap();
        // A bigger buffer returns the available bytes instead of waiting.
        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (s, _) = make_stream(5, false);
        s.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
        let mut buf = [0u8; 4];
        let err = s.read(&mut buf).await.unwrap_err();
        assert_eq!(err, StreamError::DeadlineExceeded);
        assert!(err.is_temporary());

        // Deadline cleared: data flows again.
        s.set_read_deadline(None);
        s.add_stream_frame(frame(5, 0, b"late", false)).unwrap();
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_write_blocks_until_drained() {
        let (s, data_calls) = make_stream(5, false);
        let writer = Arc::clone(&s);
        let handle = tokio::spawn(async move { writer.write(b"payload").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(data_calls.load(Ordering::Relaxed) > 0, "write signalled data");
        assert_eq!(s.len_of_data_for_writing(), 7);

        let popped = s.pop_stream_frame(1000).unwrap();
        assert_eq!(popped.data, b"payload");
        assert_eq!(popped.offset, 0);
        assert!(!popped.fin);

        assert_eq!(handle.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_write_deadline() {
        let (s, _) = make_stream(5, false);
        s.set_write_deadline(Some(Instant::now() + Duration::from_millis(20)));
        // Nothing drains the buffer: the writer must time out.
        let err = s.write(b"stuck").await.unwrap_err();
        assert_eq!(err, StreamError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_pop_respects_budget_and_offsets() {
        let (s, _) = make_stream(5, false);
        let writer = Arc::clone(&s);
        let handle = tokio::spawn(async move { writer.write(b"abcdef").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let first = s.pop_stream_frame(4).unwrap();
        assert_eq!(first.data, b"abcd");
        assert_eq!(first.offset, 0);
        let second = s.pop_stream_frame(4).unwrap();
        assert_eq!(second.data, b"ef");
        assert_eq!(second.offset, 4);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fin_after_close_and_drain() {
        let (s, _) = make_stream(5, false);
        let writer = Arc::clone(&s);
        let handle = tokio::spawn(async move { writer.write(b"tail").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.close();

        let data_frame = s.pop_stream_frame(1000).unwrap();
        assert_eq!(data_frame.data, b"tail");
        assert!(data_frame.fin, "drained buffer and closed: FIN rides along");
        handle.await.unwrap().unwrap();

        assert!(!s.wants_to_send(), "FIN already sent");
    }

    #[tokio::test]
    async fn test_pure_fin_frame() {
        let (s, _) = make_stream(5, false);
        s.close();
        let fin = s.pop_stream_frame(1000).unwrap();
        assert!(fin.fin);
        assert!(fin.data.is_empty());
        assert!(s.pop_stream_frame(1000).is_none());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (s, _) = make_stream(5, false);
        s.close();
        assert_eq!(
            s.write(b"x").await.unwrap_err(),
            StreamError::WriteOnClosedStream(5)
        );
    }

    #[tokio::test]
    async fn test_reset_is_sticky_and_wakes() {
        let (s, _) = make_stream(5, false);
        let reader = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.reset(StreamError::ResetLocal(5));

        assert_eq!(handle.await.unwrap().unwrap_err(), StreamError::ResetLocal(5));
        // Sticky: later calls see the same error.
        let mut buf = [0u8; 4];
        assert_eq!(
            s.read(&mut buf).await.unwrap_err(),
            StreamError::ResetLocal(5)
        );
        assert_eq!(
            s.write(b"x").await.unwrap_err(),
            StreamError::ResetLocal(5)
        );
    }

    #[tokio::test]
    async fn test_reset_queues_rst() {
        let flow = Arc::new(Mutex::new(FlowController::new()));
        flow.lock().unwrap().open_stream(5);
        let resets: Arc<Mutex<Vec<(StreamId, ByteCount)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&resets);
        let s = Stream::new(
            5,
            false,
            flow,
            Box::new(|| {}),
            Box::new(move |id, offset| sink.lock().unwrap().push((id, offset))),
        );
        s.reset(StreamError::ResetLocal(5));
        assert_eq!(resets.lock().unwrap().as_slice(), &[(5, 0)]);

        // Repeated resets do not requeue.
        s.reset(StreamError::ResetLocal(5));
        assert_eq!(resets.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_wakes_writer() {
        let (s, _) = make_stream(5, false);
        let writer = Arc::clone(&s);
        let handle = tokio::spawn(async move { writer.write(b"never sent").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        s.cancel(StreamError::Cancelled(5, "session closed".into()));
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Cancelled(5, _)));
    }

    #[tokio::test]
    async fn test_close_remote_delivers_eof() {
        let (s, _) = make_stream(5, false);
        s.add_stream_frame(frame(5, 0, b"all", false)).unwrap();
        s.close_remote(3);

        let mut buf = [0u8; 8];
        let n = s.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"all");
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finished_lifecycle() {
        let (s, _) = make_stream(5, false);
        assert!(!s.finished());
        s.add_stream_frame(frame(5, 0, b"x", true)).unwrap();
        let mut buf = [0u8; 2];
        let _ = s.read(&mut buf).await.unwrap();
        let _ = s.read(&mut buf).await.unwrap(); // EOF
        s.close();
        let _ = s.pop_stream_frame(100); // emits FIN
        assert!(s.finished());
    }

    #[tokio::test]
    async fn test_flow_violation_is_fatal() {
        let (s, _) = make_stream(5, false);
        let huge = crate::protocol::RECEIVE_STREAM_FLOW_CONTROL_WINDOW + 1;
        let result = s.add_stream_frame(frame(5, huge - 1, b"x", false));
        assert!(result.is_err());
        assert!(result.unwrap_err().is_fatal());
    }
}
