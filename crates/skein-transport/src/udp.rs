//! Async UDP connection implementation.

use crate::connection::{ConnError, ConnResult, Connection, Datagram};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;

/// UDP datagram connection using Tokio.
///
/// # Examples
///
/// ```no_run
/// use skein_transport::{Connection, UdpConnection};
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let local: SocketAddr = "127.0.0.1:0".parse()?;
/// let remote: SocketAddr = "127.0.0.1:50000".parse()?;
/// let conn = UdpConnection::bind(local, remote).await?;
/// conn.send(b"hello").await?;
/// let datagram = conn.receive().await?;
/// println!("{} bytes from {}", datagram.data.len(), datagram.remote_addr);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    remote_addr: Arc<Mutex<SocketAddr>>,
    closed: Arc<AtomicBool>,
}

/// Maximum datagram size accepted from the wire.
const MAX_DATAGRAM_SIZE: usize = 1452;

impl UdpConnection {
    /// Bind a UDP connection and point it at `remote`.
    ///
    /// # Errors
    /// Returns [`ConnError::BindFailed`] if the local bind fails.
    pub async fn bind(local: SocketAddr, remote: SocketAddr) -> ConnResult<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ConnError::BindFailed(e.to_string()))?;
        Ok(Self {
            socket: Arc::new(socket),
            remote_addr: Arc::new(Mutex::new(remote)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wrap an already-bound socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket, remote: SocketAddr) -> Self {
        Self {
            socket: Arc::new(socket),
            remote_addr: Arc::new(Mutex::new(remote)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn current_remote(&self) -> SocketAddr {
        *self.remote_addr.lock().expect("remote addr lock poisoned")
    }
}

#[async_trait]
impl Connection for UdpConnection {
    async fn send(&self, buf: &[u8]) -> ConnResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ConnError::Closed);
        }
        let remote = self.current_remote();
        Ok(self.socket.send_to(buf, remote).await?)
    }

    async fn receive(&self) -> ConnResult<Datagram> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(ConnError::Closed);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(Datagram {
            data: buf,
            remote_addr: from,
            rcv_time: Instant::now(),
        })
    }

    fn set_current_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock().expect("remote addr lock poisoned") = addr;
    }

    fn local_addr(&self) -> ConnResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn close(&self) -> ConnResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let placeholder: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();
        let b = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();

        a.set_current_remote_addr(b.local_addr().unwrap());
        b.set_current_remote_addr(a.local_addr().unwrap());

        a.send(b"ping").await.unwrap();
        let datagram = b.receive().await.unwrap();
        assert_eq!(datagram.data, b"ping");
        assert_eq!(datagram.remote_addr, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_rebind_remote() {
        let placeholder: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();
        let b = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();
        let c = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();

        a.set_current_remote_addr(b.local_addr().unwrap());
        a.send(b"to-b").await.unwrap();
        assert_eq!(b.receive().await.unwrap().data, b"to-b");

        a.set_current_remote_addr(c.local_addr().unwrap());
        a.send(b"to-c").await.unwrap();
        assert_eq!(c.receive().await.unwrap().data, b"to-c");
    }

    #[tokio::test]
    async fn test_udp_closed() {
        let placeholder: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), placeholder)
            .await
            .unwrap();
        a.close().await.unwrap();
        assert!(a.is_closed());
        assert!(matches!(a.send(b"x").await, Err(ConnError::Closed)));
    }
}
