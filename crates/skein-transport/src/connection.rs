//! Connection trait abstraction over datagram endpoints.
//!
//! A [`Connection`] is a bound datagram socket plus the peer's current
//! remote address. The protocol core only ever talks to this trait, so
//! sessions can run over real UDP or over an in-memory pair in tests.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

/// Connection-level errors
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection is closed
    #[error("connection is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// No remote address has been set yet
    #[error("no remote address set")]
    NoRemoteAddr,
}

/// Result type for connection operations
pub type ConnResult<T> = Result<T, ConnError>;

/// A received datagram together with its arrival metadata.
#[derive(Debug)]
pub struct Datagram {
    /// The raw payload
    pub data: Vec<u8>,
    /// Address the datagram arrived from
    pub remote_addr: SocketAddr,
    /// Local receive timestamp
    pub rcv_time: Instant,
}

/// Async datagram connection bound to one peer.
///
/// `send` always targets the *current* remote address, which the session
/// may rebind mid-connection (e.g. after the peer's NAT rebinds) via
/// [`Connection::set_current_remote_addr`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a datagram to the current remote address.
    ///
    /// # Errors
    /// Returns [`ConnError`] if the connection is closed, no remote
    /// address is set, or the socket write fails.
    async fn send(&self, buf: &[u8]) -> ConnResult<usize>;

    /// Receive the next datagram.
    ///
    /// # Errors
    /// Returns [`ConnError::Closed`] once the connection is closed.
    async fn receive(&self) -> ConnResult<Datagram>;

    /// Rebind the peer's current remote address.
    fn set_current_remote_addr(&self, addr: SocketAddr);

    /// The local address this connection is bound to.
    ///
    /// # Errors
    /// Returns [`ConnError`] if the address cannot be determined.
    fn local_addr(&self) -> ConnResult<SocketAddr>;

    /// Close the connection. Subsequent operations return [`ConnError::Closed`].
    async fn close(&self) -> ConnResult<()>;

    /// Check whether the connection is closed.
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_error_display() {
        let err = ConnError::Closed;
        assert_eq!(err.to_string(), "connection is closed");

        let err = ConnError::BindFailed("test".to_string());
        assert!(err.to_string().contains("failed to bind"));

        let err = ConnError::NoRemoteAddr;
        assert!(err.to_string().contains("no remote address"));
    }

    #[test]
    fn test_conn_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        let err = ConnError::from(io_err);
        assert!(matches!(err, ConnError::Io(_)));
    }
}
