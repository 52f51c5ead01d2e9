//! Stream registry: id allocation, reliable/unreliable marking, accept
//! queue and round-robin iteration.

use crate::error::{Error, StreamMapError};
use crate::protocol::{Perspective, StreamId, MAX_NEW_STREAM_ID_DELTA};
use crate::session::stream::Stream;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

/// Builds a stream for the session when the registry materializes one.
pub type NewStreamFn = Box<dyn Fn(StreamId, bool) -> Arc<Stream> + Send + Sync>;

struct MapInner {
    streams: HashMap<StreamId, Arc<Stream>>,
    /// Ids in open order, backing round-robin iteration.
    open_streams: Vec<StreamId>,
    unreliable_mark: HashMap<StreamId, bool>,
    round_robin_index: usize,
    unreliable_robin_index: usize,

    next_stream: StreamId,
    highest_opened_by_peer: StreamId,
    next_to_accept: StreamId,

    num_outgoing: usize,
    num_incoming: usize,
    close_err: Option<StreamMapError>,
}

/// The session's stream registry.
pub struct StreamsMap {
    inner: RwLock<MapInner>,
    accept_notify: Notify,
    perspective: Perspective,
    max_outgoing: usize,
    max_incoming: usize,
    new_stream: NewStreamFn,
}

impl StreamsMap {
    /// Create a registry. Locally initiated ids start at 1 (client) or 2
    /// (server); the accept counter starts at the peer's first id.
    #[must_use]
    pub fn new(
        perspective: Perspective,
        max_outgoing: usize,
        max_incoming: usize,
        new_stream: NewStreamFn,
    ) -> Self {
        let (next_stream, next_to_accept) = match perspective {
            Perspective::Client => (1, 2),
            Perspective::Server => (2, 1),
        };
        Self {
            inner: RwLock::new(MapInner {
                streams: HashMap::new(),
                open_streams: Vec::new(),
                unreliable_mark: HashMap::new(),
                round_robin_index: 0,
                unreliable_robin_index: 0,
                next_stream,
                highest_opened_by_peer: 0,
                next_to_accept,
                num_outgoing: 0,
                num_incoming: 0,
                close_err: None,
            }),
            accept_notify: Notify::new(),
            perspective,
            max_outgoing,
            max_incoming,
            new_stream,
        }
    }

    fn local_parity(&self) -> u64 {
        match self.perspective {
            Perspective::Client => 1,
            Perspective::Server => 0,
        }
    }

    /// Look up an open stream.
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.inner
            .read()
            .expect("streams map lock poisoned")
            .streams
            .get(&id)
            .cloned()
    }

    /// Whether the stream carries the unreliable marker. `None` for
    /// unknown streams.
    #[must_use]
    pub fn is_unreliable(&self, id: StreamId) -> Option<bool> {
        let inner = self.inner.read().expect("streams map lock poisoned");
        if !inner.streams.contains_key(&id) {
            return None;
        }
        Some(*inner.unreliable_mark.get(&id).unwrap_or(&false))
    }

    /// Number of currently open streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("streams map lock poisoned")
            .streams
            .len()
    }

    /// Whether no stream is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open the next locally-initiated reliable stream.
    ///
    /// # Errors
    /// [`StreamMapError::TooManyOpenStreams`] (transient) at the cap.
    pub fn open_stream(&self) -> Result<Arc<Stream>, StreamMapError> {
        self.open_stream_impl(false)
    }

    /// Open the next locally-initiated unreliable stream.
    ///
    /// # Errors
    /// [`StreamMapError::TooManyOpenStreams`] (transient) at the cap.
    pub fn open_unreliable_stream(&self) -> Result<Arc<Stream>, StreamMapError> {
        self.open_stream_impl(true)
    }

    fn open_stream_impl(&self, unreliable: bool) -> Result<Arc<Stream>, StreamMapError> {
        let mut inner = self.inner.write().expect("streams map lock poisoned");
        if let Some(err) = &inner.close_err {
            return Err(err.clone());
        }
        if inner.num_outgoing >= self.max_outgoing {
            return Err(StreamMapError::TooManyOpenStreams);
        }
        let id = inner.next_stream;
        inner.next_stream += 2;
        inner.num_outgoing += 1;
        let stream = (self.new_stream)(id, unreliable);
        Self::put_stream(&mut inner, id, Arc::clone(&stream), unreliable);
        Ok(stream)
    }

    /// Return an existing stream, or materialize the peer-initiated
    /// stream `id` together with every skipped id below it. `Ok(None)`
    /// means the id belongs to a stream that already came and went.
    ///
    /// # Errors
    /// [`StreamMapError::InvalidStreamId`] when the id has our parity but
    /// was never opened locally, or jumps implausibly far ahead;
    /// [`StreamMapError::TooManyOpenStreams`] at the incoming cap.
    pub fn get_or_open_stream(&self, id: StreamId) -> Result<Option<Arc<Stream>>, StreamMapError> {
        self.get_or_open_inner(id, false, false)
    }

    /// Like [`StreamsMap::get_or_open_stream`] but opens only `id`
    /// itself, marked `unreliable`. Used when the frame carries the
    /// stream-type marker.
    ///
    /// # Errors
    /// See [`StreamsMap::get_or_open_stream`].
    pub fn get_or_open_stream_typed(
        &self,
        id: StreamId,
        unreliable: bool,
    ) -> Result<Option<Arc<Stream>>, StreamMapError> {
        self.get_or_open_inner(id, true, unreliable)
    }

    fn get_or_open_inner(
        &self,
        id: StreamId,
        typed: bool,
        unreliable: bool,
    ) -> Result<Option<Arc<Stream>>, StreamMapError> {
        {
            let inner = self.inner.read().expect("streams map lock poisoned");
            if let Some(s) = inner.streams.get(&id) {
                return Ok(Some(Arc::clone(s)));
            }
        }

        let mut inner = self.inner.write().expect("streams map lock poisoned");
        if let Some(err) = &inner.close_err {
            return Err(err.clone());
        }
        // Re-check: another task may have opened it between the locks.
        if let Some(s) = inner.streams.get(&id) {
            return Ok(Some(Arc::clone(s)));
        }

        if id % 2 == self.local_parity() {
            if id <= inner.next_stream {
                // A local stream we already opened and closed.
                return Ok(None);
            }
            return Err(StreamMapError::InvalidStreamId(
                id,
                "peer used a locally-initiated id".into(),
            ));
        }
        if id <= inner.highest_opened_by_peer {
            // A peer stream that was closed already.
            return Ok(None);
        }

        // First id the peer may open: 1 toward a server, 2 toward a client.
        let first_peer_id = match self.perspective {
            Perspective::Server => 1,
            Perspective::Client => 2,
        };

        if typed {
            self.open_remote_stream(&mut inner, id, unreliable)?;
        } else {
            let mut sid = if inner.highest_opened_by_peer == 0 {
                first_peer_id
            } else {
                inner.highest_opened_by_peer + 2
            };
            while sid <= id {
                self.open_remote_stream(&mut inner, sid, false)?;
                sid += 2;
            }
        }

        self.accept_notify.notify_waiters();
        Ok(inner.streams.get(&id).cloned())
    }

    fn open_remote_stream(
        &self,
        inner: &mut MapInner,
        id: StreamId,
        unreliable: bool,
    ) -> Result<(), StreamMapError> {
        if inner.num_incoming >= self.max_incoming {
            return Err(StreamMapError::TooManyOpenStreams);
        }
        if id + MAX_NEW_STREAM_ID_DELTA < inner.highest_opened_by_peer {
            return Err(StreamMapError::InvalidStreamId(
                id,
                "far below the highest opened stream".into(),
            ));
        }
        inner.num_incoming += 1;
        if id > inner.highest_opened_by_peer {
            inner.highest_opened_by_peer = id;
        }
        let stream = (self.new_stream)(id, unreliable);
        Self::put_stream(inner, id, stream, unreliable);
        Ok(())
    }

    fn put_stream(inner: &mut MapInner, id: StreamId, stream: Arc<Stream>, unreliable: bool) {
        inner.streams.insert(id, stream);
        inner.open_streams.push(id);
        inner.unreliable_mark.insert(id, unreliable);
    }

    /// Wait for the next peer-initiated stream, in id order.
    ///
    /// # Errors
    /// The registry's close error once the session shuts down.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, StreamMapError> {
        loop {
            let mut notified = pin!(self.accept_notify.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.inner.write().expect("streams map lock poisoned");
                if let Some(err) = &inner.close_err {
                    return Err(err.clone());
                }
                let next = inner.next_to_accept;
                if let Some(stream) = inner.streams.get(&next).cloned() {
                    inner.next_to_accept += 2;
                    return Ok(stream);
                }
            }
            notified.await;
        }
    }

    /// Visit open streams round-robin: the control streams (ids 1 and 3)
    /// first, then reliable streams, then unreliable streams. The
    /// visitor returns `false` to stop early.
    ///
    /// # Errors
    /// Propagates the visitor's error.
    pub fn round_robin_iterate<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        self.iterate_inner(&mut f, true)
    }

    /// The send-blocked flavor: reliable streams are always visited, but
    /// unreliable streams only while the path can actually send. Fresh
    /// unreliable data is worthless once it would just sit in a queue
    /// going stale.
    ///
    /// # Errors
    /// Propagates the visitor's error.
    pub fn round_robin_iterate_send_blocked<F>(
        &self,
        mut f: F,
        sending_allowed: bool,
    ) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        self.iterate_inner(&mut f, sending_allowed)
    }

    fn iterate_inner<F>(&self, f: &mut F, visit_unreliable: bool) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        let mut inner = self.inner.write().expect("streams map lock poisoned");

        for id in [1u64, 3] {
            if let Some(stream) = inner.streams.get(&id).cloned() {
                if !f(&stream)? {
                    return Ok(());
                }
            }
        }

        let open: Vec<StreamId> = inner.open_streams.clone();
        let n = open.len();
        if n == 0 {
            return Ok(());
        }

        let start = inner.round_robin_index;
        for i in 0..n {
            let id = open[(i + start) % n];
            if id == 1 || id == 3 {
                continue;
            }
            if *inner.unreliable_mark.get(&id).unwrap_or(&false) {
                continue;
            }
            let Some(stream) = inner.streams.get(&id).cloned() else {
                continue;
            };
            inner.round_robin_index = (inner.round_robin_index + 1) % n;
            if !f(&stream)? {
                return Ok(());
            }
        }

        if !visit_unreliable {
            return Ok(());
        }
        let start = inner.unreliable_robin_index;
        for i in 0..n {
            let id = open[(i + start) % n];
            if id == 1 || id == 3 {
                continue;
            }
            if !*inner.unreliable_mark.get(&id).unwrap_or(&false) {
                continue;
            }
            let Some(stream) = inner.streams.get(&id).cloned() else {
                continue;
            };
            inner.unreliable_robin_index = (inner.unreliable_robin_index + 1) % n;
            if !f(&stream)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Remove a finished stream.
    ///
    /// # Errors
    /// [`StreamMapError::InvalidStreamId`] if the stream is not open.
    pub fn remove_stream(&self, id: StreamId) -> Result<(), StreamMapError> {
        let mut inner = self.inner.write().expect("streams map lock poisoned");
        if inner.streams.remove(&id).is_none() {
            return Err(StreamMapError::InvalidStreamId(
                id,
                "removing a stream that is not open".into(),
            ));
        }
        if id % 2 == self.local_parity() {
            inner.num_outgoing = inner.num_outgoing.saturating_sub(1);
        } else {
            inner.num_incoming = inner.num_incoming.saturating_sub(1);
        }
        if let Some(pos) = inner.open_streams.iter().position(|&s| s == id) {
            inner.open_streams.remove(pos);
            if pos < inner.round_robin_index {
                inner.round_robin_index -= 1;
            }
            if pos < inner.unreliable_robin_index {
                inner.unreliable_robin_index -= 1;
            }
        }
        inner.unreliable_mark.remove(&id);
        Ok(())
    }

    /// Shut the registry down: every open stream is cancelled with the
    /// error, and pending/future `accept_stream` calls fail.
    pub fn close_with_error(&self, err: &StreamMapError) {
        let streams: Vec<Arc<Stream>> = {
            let mut inner = self.inner.write().expect("streams map lock poisoned");
            inner.close_err = Some(err.clone());
            inner.streams.values().cloned().collect()
        };
        self.accept_notify.notify_waiters();
        for stream in streams {
            stream.cancel(crate::error::StreamError::Cancelled(
                stream.id(),
                err.to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::flow::FlowController;
    use std::sync::Mutex;

    fn make_map(perspective: Perspective) -> StreamsMap {
        let flow = Arc::new(Mutex::new(FlowController::new()));
        StreamsMap::new(
            perspective,
            4,
            4,
            Box::new(move |id, unreliable| {
                flow.lock().unwrap().open_stream(id);
                Arc::new(Stream::new(
                    id,
                    unreliable,
                    Arc::clone(&flow),
                    Box::new(|| {}),
                    Box::new(|_, _| {}),
                ))
            }),
        )
    }

    #[test]
    fn test_client_allocates_odd_ids() {
        let map = make_map(Perspective::Client);
        assert_eq!(map.open_stream().unwrap().id(), 1);
        assert_eq!(map.open_unreliable_stream().unwrap().id(), 3);
        assert_eq!(map.open_stream().unwrap().id(), 5);
        assert_eq!(map.is_unreliable(3), Some(true));
        assert_eq!(map.is_unreliable(1), Some(false));
        assert_eq!(map.is_unreliable(99), None);
    }

    #[test]
    fn test_server_allocates_even_ids() {
        let map = make_map(Perspective::Server);
        assert_eq!(map.open_stream().unwrap().id(), 2);
        assert_eq!(map.open_stream().unwrap().id(), 4);
    }

    #[test]
    fn test_too_many_streams_is_transient() {
        let map = make_map(Perspective::Client);
        for _ in 0..4 {
            map.open_stream().unwrap();
        }
        assert_eq!(
            map.open_stream().unwrap_err(),
            StreamMapError::TooManyOpenStreams
        );
        // Closing one frees a slot.
        map.remove_stream(1).unwrap();
        assert!(map.open_stream().is_ok());
    }

    #[test]
    fn test_get_or_open_fills_skipped_ids() {
        let map = make_map(Perspective::Server);
        // Peer (client) opens stream 5: 1 and 3 materialize too.
        let s = map.get_or_open_stream(5).unwrap().unwrap();
        assert_eq!(s.id(), 5);
        assert!(map.get(1).is_some());
        assert!(map.get(3).is_some());
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_get_or_open_typed_opens_single() {
        let map = make_map(Perspective::Server);
        let s = map.get_or_open_stream_typed(1, true).unwrap().unwrap();
        assert_eq!(s.id(), 1);
        assert_eq!(map.is_unreliable(1), Some(true));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_wrong_parity_rejected() {
        let map = make_map(Perspective::Server);
        // Peer claims stream 4, a server-side id never opened here.
        let err = map.get_or_open_stream(4).unwrap_err();
        assert!(matches!(err, StreamMapError::InvalidStreamId(4, _)));
    }

    #[test]
    fn test_closed_ids_return_none() {
        let map = make_map(Perspective::Server);
        map.get_or_open_stream(3).unwrap();
        map.remove_stream(1).unwrap();
        // Stream 1 is below the peer's high-water mark and gone: closed.
        assert!(map.get_or_open_stream(1).unwrap().is_none());

        // A locally-opened-and-closed id likewise.
        map.open_stream().unwrap(); // id 2
        map.remove_stream(2).unwrap();
        assert!(map.get_or_open_stream(2).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accept_stream_blocks_until_open() {
        let map = Arc::new(make_map(Perspective::Server));
        let acceptor = Arc::clone(&map);
        let handle = tokio::spawn(async move { acceptor.accept_stream().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        map.get_or_open_stream(1).unwrap();
        let accepted = handle.await.unwrap().unwrap();
        assert_eq!(accepted.id(), 1);

        // Next accept targets stream 3.
        map.get_or_open_stream(3).unwrap();
        assert_eq!(map.accept_stream().await.unwrap().id(), 3);
    }

    #[tokio::test]
    async fn test_accept_fails_after_close() {
        let map = Arc::new(make_map(Perspective::Server));
        let acceptor = Arc::clone(&map);
        let handle = tokio::spawn(async move { acceptor.accept_stream().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        map.close_with_error(&StreamMapError::Closed("bye".into()));
        assert!(handle.await.unwrap().is_err());
    }

    #[test]
    fn test_round_robin_reliable_before_unreliable() {
        let map = make_map(Perspective::Client);
        let reliable = map.open_stream().unwrap(); // 1 (control id, visited first anyway)
        let unreliable = map.open_unreliable_stream().unwrap(); // 3... also control id
        let reliable2 = map.open_stream().unwrap(); // 5
        let unreliable2 = map.open_unreliable_stream().unwrap(); // 7
        let _ = (reliable, unreliable);

        let mut visited = Vec::new();
        map.round_robin_iterate(|s| {
            visited.push(s.id());
            Ok(true)
        })
        .unwrap();
        // Control 1 and 3 first, then reliable 5, then unreliable 7.
        assert_eq!(visited, vec![1, 3, reliable2.id(), unreliable2.id()]);
    }

    #[test]
    fn test_round_robin_send_blocked_skips_unreliable() {
        let map = make_map(Perspective::Client);
        let _c1 = map.open_stream().unwrap(); // 1
        let _c3 = map.open_stream().unwrap(); // 3
        let r = map.open_stream().unwrap(); // 5
        let _u = map.open_unreliable_stream().unwrap(); // 7

        let mut visited = Vec::new();
        map.round_robin_iterate_send_blocked(
            |s| {
                visited.push(s.id());
                Ok(true)
            },
            false,
        )
        .unwrap();
        assert_eq!(visited, vec![1, 3, r.id()]);
    }

    #[test]
    fn test_round_robin_rotates() {
        // Server ids avoid the special control ids 1 and 3.
        let map = make_map(Perspective::Server);
        for _ in 0..4 {
            map.open_stream().unwrap(); // 2,4,6,8
        }
        let one_pass = || {
            let mut v = Vec::new();
            map.round_robin_iterate(|s| {
                v.push(s.id());
                Ok(false) // stop after the first data stream
            })
            .unwrap();
            v
        };
        assert_eq!(one_pass(), vec![2]);
        assert_eq!(one_pass(), vec![4]);
        assert_eq!(one_pass(), vec![6]);
        assert_eq!(one_pass(), vec![8]);
        assert_eq!(one_pass(), vec![2], "wraps around");
    }

    #[test]
    fn test_close_with_error_cancels_streams() {
        let map = make_map(Perspective::Client);
        let s = map.open_stream().unwrap();
        map.close_with_error(&StreamMapError::Closed("fatal".into()));
        assert!(s.finished());
        assert!(map.open_stream().is_err());
    }
}
