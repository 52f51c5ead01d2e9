//! In-process connection pair for tests.
//!
//! A [`MemoryConnection`] pair moves datagrams through unbounded channels
//! with an optional drop predicate, so integration tests can exercise loss
//! and path failure without touching real sockets.

use crate::connection::{ConnError, ConnResult, Connection, Datagram};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

type DropPredicate = dyn Fn(&[u8]) -> bool + Send + Sync;

/// One endpoint of an in-memory datagram pair.
pub struct MemoryConnection {
    local: SocketAddr,
    remote_addr: Mutex<SocketAddr>,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: Arc<AtomicBool>,
    drop_fn: Mutex<Option<Arc<DropPredicate>>>,
}

impl MemoryConnection {
    /// Create a connected pair of endpoints.
    ///
    /// The synthetic addresses only serve to label the two sides.
    #[must_use]
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (Arc<Self>, Arc<Self>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            local: addr_a,
            remote_addr: Mutex::new(addr_b),
            tx: tx_ab,
            rx: tokio::sync::Mutex::new(rx_ba),
            closed: Arc::new(AtomicBool::new(false)),
            drop_fn: Mutex::new(None),
        });
        let b = Arc::new(Self {
            local: addr_b,
            remote_addr: Mutex::new(addr_a),
            tx: tx_ba,
            rx: tokio::sync::Mutex::new(rx_ab),
            closed: Arc::new(AtomicBool::new(false)),
            drop_fn: Mutex::new(None),
        });
        (a, b)
    }

    /// Install a predicate that decides whether an outgoing datagram is
    /// silently dropped. Passing `None` restores lossless delivery.
    pub fn set_drop_predicate(&self, f: Option<Arc<DropPredicate>>) {
        *self.drop_fn.lock().expect("drop predicate lock poisoned") = f;
    }

    /// Drop every outgoing datagram from now on.
    pub fn blackhole(&self) {
        self.set_drop_predicate(Some(Arc::new(|_| true)));
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, buf: &[u8]) -> ConnResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ConnError::Closed);
        }
        let dropped = self
            .drop_fn
            .lock()
            .expect("drop predicate lock poisoned")
            .as_ref()
            .map(|f| f(buf))
            .unwrap_or(false);
        if dropped {
            return Ok(buf.len());
        }
        let datagram = Datagram {
            data: buf.to_vec(),
            remote_addr: self.local,
            rcv_time: Instant::now(),
        };
        // A send after the peer closed behaves like a datagram into the void.
        let _ = self.tx.send(datagram);
        Ok(buf.len())
    }

    async fn receive(&self) -> ConnResult<Datagram> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ConnError::Closed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(ConnError::Closed)
    }

    fn set_current_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock().expect("remote addr lock poisoned") = addr;
    }

    fn local_addr(&self) -> ConnResult<SocketAddr> {
        Ok(self.local)
    }

    async fn close(&self) -> ConnResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}
