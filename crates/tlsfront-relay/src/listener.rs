//! Inbound listener abstraction
//!
//! The accept loop only needs something that hands out connections. TLS
//! termination (or any other per-connection setup) is expressed as the
//! `Handshake` future, which the relay task awaits so that a slow peer can
//! never hold up the accept loop.

use async_trait::async_trait;
use std::future::{self, Future, Ready};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

/// A connection taken off an [`InboundListener`] whose setup has not run yet
pub struct Accepted<H> {
    /// Resolves to the usable byte stream once per-connection setup completes
    pub handshake: H,
    pub peer_addr: SocketAddr,
}

impl<H> std::fmt::Debug for Accepted<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Source of inbound connections for the accept loop
#[async_trait]
pub trait InboundListener: Send + Sync + 'static {
    /// Byte stream produced once the handshake completes
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Per-connection setup future
    type Handshake: Future<Output = io::Result<Self::Stream>> + Send + 'static;

    /// Wait for the next inbound connection
    async fn accept(&self) -> io::Result<Accepted<Self::Handshake>>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Plain TCP listener with no per-connection setup
#[derive(Debug)]
pub struct TcpInboundListener {
    listener: TcpListener,
}

impl TcpInboundListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl InboundListener for TcpInboundListener {
    type Stream = TcpStream;
    type Handshake = Ready<io::Result<TcpStream>>;

    async fn accept(&self) -> io::Result<Accepted<Self::Handshake>> {
        let (stream, peer_addr) = self.listener.accept().await?;
        Ok(Accepted {
            handshake: future::ready(Ok(stream)),
            peer_addr,
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_listener_accepts_with_ready_handshake() {
        let listener = TcpInboundListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let accepted = listener.accept().await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(accepted.peer_addr, client.local_addr().unwrap());

        let stream = accepted.handshake.await.unwrap();
        assert_eq!(stream.local_addr().unwrap(), addr);
    }
}
