//! Receiver side of the announcement protocol.
//!
//! Enough of a receiver to index announcements and acknowledge them; used by
//! simulated receivers in tests and benchmarks.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::codec::PacketCodec;
use crate::contracts::{Acknowledgment, Announcement};
use crate::errors::Result;

pub struct Receiver;

impl Receiver {
    /// Wait for one announcement datagram and decode it.
    ///
    /// Returns the announcement, its encoded size and the sender.
    pub async fn receive(socket: &UdpSocket, buffer: &mut [u8]) -> Result<(Announcement, usize, SocketAddr)> {
        let (bytes_received, sender_addr) = socket.recv_from(buffer).await?;
        let announcement = PacketCodec::decode_packet(&buffer[..bytes_received])?;
        Ok((announcement, bytes_received, sender_addr))
    }

    /// Acknowledge `sequence` to `destination`.
    pub async fn send_ack(socket: &UdpSocket, sequence: u32, destination: SocketAddr) -> Result<usize> {
        Self::reply(socket, &Acknowledgment::ok(sequence), destination).await
    }

    /// Refuse `sequence`; the announcer will not retry the packet.
    pub async fn send_reject(socket: &UdpSocket, sequence: u32, destination: SocketAddr) -> Result<usize> {
        Self::reply(socket, &Acknowledgment::rejected(sequence), destination).await
    }

    async fn reply(socket: &UdpSocket, ack: &Acknowledgment, destination: SocketAddr) -> Result<usize> {
        let bytes = PacketCodec::encode_ack(ack);
        Ok(socket.send_to(&bytes, destination).await?)
    }
}
