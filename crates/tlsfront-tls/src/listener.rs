//! TLS-terminating inbound listener
use async_trait::async_trait;
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use tlsfront_relay::{Accepted, InboundListener};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};
use tracing::{debug, info, warn};

use crate::cert::Certificate;
use crate::error::TlsError;

const BIND_ATTEMPTS: u32 = 3;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

/// Build a TLS acceptor serving `certificate`
pub fn build_acceptor(certificate: Certificate) -> Result<TlsAcceptor, TlsError> {
    ensure_crypto_provider();

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificate.cert_chain, certificate.private_key)
        .map_err(|e| TlsError::ConfigError(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// TCP listener that terminates TLS on each accepted connection
///
/// `accept` only takes the TCP connection off the socket; the handshake is
/// returned as the connection's [`Accepted::handshake`] and completes on the
/// relay task.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Bind `bind_addr`, retrying briefly while the port is in TIME_WAIT
    pub async fn bind(bind_addr: SocketAddr, acceptor: TlsAcceptor) -> Result<Self, TlsError> {
        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind(bind_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/{}",
                            bind_addr, attempt, BIND_ATTEMPTS
                        );
                    }
                    return Ok(Self { listener, acceptor });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    warn!(
                        "Port {} is in use (attempt {}/{}), retrying in 1 second...",
                        bind_addr.port(),
                        attempt,
                        BIND_ATTEMPTS
                    );
                    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(TlsError::BindError {
                        address: bind_addr.ip().to_string(),
                        port: bind_addr.port(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(TlsError::BindError {
            address: bind_addr.ip().to_string(),
            port: bind_addr.port(),
            reason: format!("Address in use after {} attempts", BIND_ATTEMPTS),
        })
    }
}

#[async_trait]
impl InboundListener for TlsListener {
    type Stream = TlsStream<TcpStream>;
    type Handshake = Accept<TcpStream>;

    async fn accept(&self) -> io::Result<Accepted<Self::Handshake>> {
        let (stream, peer_addr) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        Ok(Accepted {
            handshake: self.acceptor.accept(stream),
            peer_addr,
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}
