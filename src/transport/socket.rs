//! Async UDP socket wrapper.
//!
//! Both engines share one socket between the caller-facing API and their
//! background tasks, so the handle is a cheap clone over an `Arc`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::core::{DEFAULT_RECV_BUFFER_SIZE, SocketError};

/// Async UDP socket shared between an engine and its tasks.
///
/// The OS socket is closed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DatagramSocket {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,
    /// Size of receive buffers handed out by [`recv_buffer`](Self::recv_buffer).
    recv_buffer_size: usize,
}

impl DatagramSocket {
    /// Bind a socket to the given address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SocketError::Bind { addr, source })?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an existing UDP socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }

    /// Set the receive buffer size.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Allocate a receive buffer of the configured size.
    pub fn recv_buffer(&self) -> Vec<u8> {
        vec![0u8; self.recv_buffer_size]
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send a datagram to `addr`.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Receive a datagram into `buf`, returning its length and source.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_bind() {
        let socket = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_address() {
        let first = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = first.local_addr().unwrap();

        let err = DatagramSocket::bind(addr).await.unwrap_err();
        assert!(matches!(err, SocketError::Bind { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn test_socket_send_recv() {
        let server = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        client.send_to(b"hello", server_addr).await.unwrap();

        let mut buf = server.recv_buffer();
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_socket() {
        let socket = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
            .with_recv_buffer_size(2048);
        let clone = socket.clone();

        assert_eq!(socket.local_addr().unwrap(), clone.local_addr().unwrap());
        assert_eq!(clone.recv_buffer().len(), 2048);
    }
}
