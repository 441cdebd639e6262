//! Datagram transport for announcements
//!
//! The [`Transport`] trait lets the announcer run over any async datagram
//! transport. [`UdpTransport`] is the default, backed by
//! `tokio::net::UdpSocket`; the socket is closed when the last handle to the
//! transport is dropped.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec::PacketCodec;
use crate::contracts::Acknowledgment;
use crate::errors::{RecsyncError, Result};

/// Boxed future returned by [`Transport::send_to`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

/// Boxed future returned by [`Transport::recv_from`].
pub type RecvFuture<'a> = Pin<Box<dyn Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a>>;

/// Receive buffer size; acknowledgments are far smaller
const RECV_BUFFER_SIZE: usize = 2048;

/// Pause after a receive error so a persistently failing socket cannot spin
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Async datagram transport used by the announcer.
///
/// Object-safe so it can be shared as `Arc<dyn Transport>`.
pub trait Transport: Send + Sync + 'static {
    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a>;

    /// Receive a datagram into `buf`, returning `(bytes_read, source_address)`.
    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a>;

    /// Return the local address this transport is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Default [`Transport`] implementation wrapping a `tokio::net::UdpSocket`.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a new UDP socket to `addr`.
    ///
    /// # Errors
    /// Returns `RecsyncError::Transport` if the socket cannot be opened; this
    /// is the only fatal transport failure.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Wrap an existing `UdpSocket`.
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl Transport for UdpTransport {
    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> SendFuture<'a> {
        Box::pin(self.socket.send_to(buf, target))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> RecvFuture<'a> {
        Box::pin(self.socket.recv_from(buf))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Strip the IPv4-mapped IPv6 form, so `[::ffff:a.b.c.d]:p` compares equal
/// to `a.b.c.d:p`.
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// Destination to pass to a socket bound at `local` for reaching `target`.
///
/// An IPv6 socket reaches IPv4 targets through their mapped form.
pub fn route_for(local: SocketAddr, target: SocketAddr) -> SocketAddr {
    match (local, target.ip()) {
        (SocketAddr::V6(_), IpAddr::V4(ip)) => SocketAddr::new(IpAddr::V6(ip.to_ipv6_mapped()), target.port()),
        _ => target,
    }
}

/// Send one datagram, mapping I/O failures to `RecsyncError::Transport`.
pub async fn send_packet<T: Transport + ?Sized>(transport: &T, bytes: &[u8], target: SocketAddr) -> Result<usize> {
    let sent = transport
        .send_to(bytes, target)
        .await
        .map_err(|e| RecsyncError::Transport(format!("send to {} failed: {}", target, e)))?;
    trace!(%target, bytes = sent, "Datagram sent");
    Ok(sent)
}

/// A decoded acknowledgment and where it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundAck {
    pub from: SocketAddr,
    pub ack: Acknowledgment,
}

/// Receive datagrams until `queue` is closed.
///
/// Each datagram is decoded as an acknowledgment and queued for the run
/// loop. Malformed datagrams and receive errors are logged and skipped.
pub async fn receive_loop<T: Transport + ?Sized>(transport: Arc<T>, queue: mpsc::Sender<InboundAck>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let received = tokio::select! {
            result = transport.recv_from(&mut buf) => result,
            _ = queue.closed() => break,
        };

        match received {
            Ok((len, from)) => match PacketCodec::decode_ack(&buf[..len]) {
                Ok(ack) => {
                    if queue.send(InboundAck { from, ack }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%from, bytes = len, error = %e, "Dropping malformed datagram");
                }
            },
            Err(e) => {
                warn!(error = %e, "Receive failed");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
            }
        }
    }
    debug!("Receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_loop_decodes_and_drops_malformed() {
        let transport = Arc::new(UdpTransport::bind("127.0.0.1:0").await.unwrap());
        let local = transport.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(receive_loop(Arc::clone(&transport), tx));

        peer.send_to(b"garbage", local).await.unwrap();
        peer.send_to(&PacketCodec::encode_ack(&Acknowledgment::ok(42)), local)
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.ack, Acknowledgment::ok(42));
        assert_eq!(inbound.from, peer.local_addr().unwrap());

        drop(rx);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[test]
    fn test_address_normalization() {
        let v4: SocketAddr = "127.0.0.1:5049".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:5049".parse().unwrap();
        let v6: SocketAddr = "[::1]:5049".parse().unwrap();

        assert_eq!(canonical_addr(mapped), v4);
        assert_eq!(canonical_addr(v4), v4);
        assert_eq!(canonical_addr(v6), v6);

        let any_v6: SocketAddr = "[::]:0".parse().unwrap();
        let any_v4: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert_eq!(route_for(any_v6, v4), mapped);
        assert_eq!(route_for(any_v6, v6), v6);
        assert_eq!(route_for(any_v4, v4), v4);
    }

    #[tokio::test]
    async fn test_send_packet() {
        let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let sent = send_packet(&transport, b"hello", peer.local_addr().unwrap()).await.unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, transport.local_addr().unwrap());
    }
}
