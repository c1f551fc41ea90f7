//! Transport module - connectionless broadcast link
//!
//! The protocol only needs two things from a link: push a datagram at an
//! address without waiting for anything, and hand every received datagram to
//! a callback. Delivery, ordering and uniqueness are not promised.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::errors::{EverlineError, Result};

/// Invoked once per received datagram with the sender's address.
///
/// Runs outside the owner's main loop, so whatever it touches must tolerate
/// concurrent access.
pub type ReceiveCallback<A> = Box<dyn Fn(A, &[u8]) + Send + Sync + 'static>;

/// Datagram link used by both roles
pub trait Transport {
    /// Addressing scheme of the link (MAC on radio, socket address on UDP)
    type Address: Clone + fmt::Display + Send + Sync + 'static;

    /// Hand a datagram to the link. Returns once queued, never waits for
    /// the peer.
    fn send(&self, destination: &Self::Address, bytes: &[u8]) -> Result<usize>;

    /// Start delivering received datagrams to `callback`. At most one
    /// callback per transport.
    fn register_receive_callback(&mut self, callback: ReceiveCallback<Self::Address>) -> Result<()>;
}

/// UdpTransportBuilder - Fluent interface for socket configuration
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    broadcast: bool,
    recv_buffer_size: usize,
}

impl UdpTransportBuilder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            broadcast: true,
            recv_buffer_size: crate::MAX_DATAGRAM_SIZE,
        }
    }

    /// Enable `SO_BROADCAST` (on by default)
    pub fn with_broadcast(mut self, enable: bool) -> Self {
        self.broadcast = enable;
        self
    }

    /// Receive buffer size; longer datagrams are truncated by the socket and
    /// then fail the length check.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn get_bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn get_recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    pub fn is_broadcast_enabled(&self) -> bool {
        self.broadcast
    }

    /// Bind the socket. Any failure here is fatal for the node.
    pub async fn bind(self) -> Result<UdpBroadcastTransport> {
        let socket = UdpSocket::bind(self.bind_addr).await.map_err(|e| {
            EverlineError::TransportInitFailed(format!("bind {}: {}", self.bind_addr, e))
        })?;
        socket
            .set_broadcast(self.broadcast)
            .map_err(|e| EverlineError::TransportInitFailed(format!("SO_BROADCAST: {}", e)))?;
        // try_send_to only succeeds once the reactor has seen the socket writable
        socket
            .writable()
            .await
            .map_err(|e| EverlineError::TransportInitFailed(e.to_string()))?;

        tracing::debug!(
            local_addr = ?socket.local_addr().ok(),
            broadcast = self.broadcast,
            "udp transport bound"
        );

        Ok(UdpBroadcastTransport {
            socket: Arc::new(socket),
            recv_buffer_size: self.recv_buffer_size,
            recv_task: None,
        })
    }
}

/// UDP stand-in for the radio link. Sends are non-blocking; receives run on
/// a spawned tokio task.
pub struct UdpBroadcastTransport {
    socket: Arc<UdpSocket>,
    recv_buffer_size: usize,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpBroadcastTransport {
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        UdpTransportBuilder::new(bind_addr).bind().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpBroadcastTransport {
    type Address = SocketAddr;

    fn send(&self, destination: &SocketAddr, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > crate::MAX_DATAGRAM_SIZE {
            return Err(EverlineError::TransportSendFailed(format!(
                "datagram of {} bytes exceeds {}",
                bytes.len(),
                crate::MAX_DATAGRAM_SIZE
            )));
        }

        self.socket
            .try_send_to(bytes, *destination)
            .map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock => {
                    EverlineError::TransportSendFailed("socket send buffer full".to_string())
                }
                _ => EverlineError::TransportSendFailed(e.to_string()),
            })
    }

    fn register_receive_callback(&mut self, callback: ReceiveCallback<SocketAddr>) -> Result<()> {
        if self.recv_task.is_some() {
            return Err(EverlineError::TransportInitFailed(
                "receive callback already registered".to_string(),
            ));
        }
        let runtime = Handle::try_current()
            .map_err(|e| EverlineError::TransportInitFailed(e.to_string()))?;

        let socket = Arc::clone(&self.socket);
        let mut buffer = vec![0u8; self.recv_buffer_size];

        self.recv_task = Some(runtime.spawn(async move {
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, sender)) => callback(sender, &buffer[..len]),
                    Err(e) => {
                        tracing::warn!(error = %e, "udp receive failed");
                        tokio::time::sleep(Duration::from_millis(crate::LOOP_DELAY_MS)).await;
                    }
                }
            }
        }));

        Ok(())
    }
}

impl Drop for UdpBroadcastTransport {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = UdpTransportBuilder::new("127.0.0.1:0".parse().unwrap())
            .with_recv_buffer_size(64)
            .with_broadcast(false);

        assert_eq!(builder.get_recv_buffer_size(), 64);
        assert!(!builder.is_broadcast_enabled());
        assert_eq!(builder.get_bind_addr().port(), 0);
    }

    #[test]
    fn test_register_outside_runtime_fails() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut transport = rt
            .block_on(UdpBroadcastTransport::bind("127.0.0.1:0".parse().unwrap()))
            .unwrap();

        let result = transport.register_receive_callback(Box::new(|_, _| {}));
        assert!(matches!(result, Err(EverlineError::TransportInitFailed(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_init_failure() {
        let first = UdpBroadcastTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();
        let second = UdpBroadcastTransport::bind(taken).await;
        assert!(matches!(second, Err(EverlineError::TransportInitFailed(_))));
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let transport = UdpBroadcastTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let dest = transport.local_addr().unwrap();
        let big = vec![0u8; crate::MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            transport.send(&dest, &big),
            Err(EverlineError::TransportSendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_delivery() {
        let mut receiver = UdpBroadcastTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let sender = UdpBroadcastTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        receiver
            .register_receive_callback(Box::new(move |from, bytes| {
                let _ = tx.send((from, bytes.to_vec()));
            }))
            .unwrap();

        let dest = receiver.local_addr().unwrap();
        assert_eq!(sender.send(&dest, b"hello").unwrap(), 5);

        let (from, bytes) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(from, sender.local_addr().unwrap());
    }
}
