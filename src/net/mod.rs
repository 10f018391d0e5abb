//! Datagram transport for the media session.
//!
//! The transport is an externally supplied capability; the pipeline only
//! relies on the [`Transport`] contract. [`UdpTransport`] is the default
//! implementation, binding the well-known media port and registering the
//! remote participant.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

pub mod rtp;

/// Datagram send/receive capability shared by the receive and keepalive
/// stages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Receive one datagram into `buf`, returning its length. Blocks until
    /// data arrives and fails once the transport has been closed.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one datagram to the registered remote peer.
    async fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Close the transport. Idempotent; a receive blocked in [`recv`]
    /// fails promptly afterwards.
    ///
    /// [`recv`]: Transport::recv
    fn close(&self);
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// UDP transport bound to the local media port and connected to the
/// remote host.
pub struct UdpTransport {
    socket: UdpSocket,
    closed: CancellationToken,
}

impl UdpTransport {
    /// Bind `local_port` and register `remote` as the session peer.
    pub async fn bind(local_port: u16, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))
            .await
            .with_context(|| format!("failed to bind media port {local_port}"))?;
        socket
            .connect(remote)
            .await
            .with_context(|| format!("failed to register remote peer {remote}"))?;

        info!("UdpTransport: bound port {local_port}, peer {remote}");

        Ok(Self {
            socket,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            res = self.socket.recv(buf) => res,
        }
    }

    async fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.socket.send(data).await.map(|_| ())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
