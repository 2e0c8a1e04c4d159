//! Per-connection relay between an inbound stream and the loopback backend
//!
//! Each relay dials its own backend connection and runs two independent copy
//! directions. One runs on the relay task, the other on a spawned task. A
//! direction that reaches EOF half-closes its destination so the opposite
//! peer sees the end of the stream. A direction that fails also stops the
//! other one. The pair is released once both directions are done.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::listener::Accepted;

/// Host every relay dials; the backend is always reached over loopback
pub const BACKEND_HOST: &str = "localhost";

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// One direction of a relayed connection pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InboundToBackend,
    BackendToInbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::InboundToBackend => write!(f, "inbound->backend"),
            Direction::BackendToInbound => write!(f, "backend->inbound"),
        }
    }
}

/// Bytes moved in each direction over the lifetime of a pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_to_inbound: u64,
}

/// Terminal state of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Inbound setup (e.g. TLS) failed before a backend was dialed
    HandshakeFailed,
    /// The backend could not be reached; the inbound connection was closed
    DialFailed,
    /// Both directions finished and both connections were released
    Closed(RelayStats),
}

#[derive(Debug, Clone)]
pub struct ConnectionRelay {
    backend_port: u16,
}

impl ConnectionRelay {
    pub fn new(backend_port: u16) -> Self {
        Self { backend_port }
    }

    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }

    /// Complete the inbound handshake, then relay the connection
    pub async fn run<H, S>(&self, conn_id: u64, accepted: Accepted<H>) -> RelayOutcome
    where
        H: Future<Output = io::Result<S>>,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let peer_addr = accepted.peer_addr;
        let inbound = match accepted.handshake.await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    conn_id,
                    peer = %peer_addr,
                    "{}",
                    RelayError::HandshakeFailed(e)
                );
                return RelayOutcome::HandshakeFailed;
            }
        };

        self.relay(conn_id, peer_addr, inbound).await
    }

    /// Dial the backend and copy bytes both ways until both directions end
    pub async fn relay<S>(&self, conn_id: u64, peer_addr: SocketAddr, mut inbound: S) -> RelayOutcome
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let backend = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(conn_id, peer = %peer_addr, "{}", e);
                if let Err(e) = inbound.shutdown().await {
                    debug!(conn_id, error = %e, "Inbound shutdown after dial failure");
                }
                return RelayOutcome::DialFailed;
            }
        };

        debug!(
            conn_id,
            peer = %peer_addr,
            backend_port = self.backend_port,
            "Relaying connection to backend"
        );

        let stats = copy_bidirectional(conn_id, inbound, backend).await;

        info!(
            conn_id,
            peer = %peer_addr,
            bytes_to_backend = stats.bytes_to_backend,
            bytes_to_inbound = stats.bytes_to_inbound,
            "Connection closed"
        );

        RelayOutcome::Closed(stats)
    }

    async fn dial(&self) -> Result<TcpStream, RelayError> {
        let stream = TcpStream::connect((BACKEND_HOST, self.backend_port))
            .await
            .map_err(|source| RelayError::DialFailed {
                address: format!("{}:{}", BACKEND_HOST, self.backend_port),
                source,
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on backend connection");
        }

        Ok(stream)
    }
}

/// How a single copy direction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeEnd {
    Eof,
    Failed,
}

/// Run both directions to completion; the streams drop (and close) on return
///
/// A direction that ends on EOF leaves the other one running. A direction that
/// fails stops the other one as well, so a reset on either side closes the
/// whole pair.
async fn copy_bidirectional<S>(conn_id: u64, inbound: S, backend: TcpStream) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (backend_read, backend_write) = backend.into_split();

    let bytes_to_backend = Arc::new(AtomicU64::new(0));
    let bytes_to_inbound = Arc::new(AtomicU64::new(0));

    let mut to_inbound = tokio::spawn(pipe(
        conn_id,
        Direction::BackendToInbound,
        backend_read,
        inbound_write,
        bytes_to_inbound.clone(),
    ));

    let to_backend = pipe(
        conn_id,
        Direction::InboundToBackend,
        inbound_read,
        backend_write,
        bytes_to_backend.clone(),
    );
    tokio::pin!(to_backend);

    tokio::select! {
        end = &mut to_backend => {
            if end == PipeEnd::Failed {
                to_inbound.abort();
            }
            join_direction(conn_id, to_inbound).await;
        }
        joined = &mut to_inbound => {
            let end = match joined {
                Ok(end) => end,
                Err(e) => {
                    error!(conn_id, direction = %Direction::BackendToInbound, "Relay task failed: {}", e);
                    PipeEnd::Failed
                }
            };
            if end == PipeEnd::Eof {
                to_backend.await;
            } else {
                debug!(conn_id, direction = %Direction::InboundToBackend, "Stopped after opposite direction failed");
            }
        }
    }

    RelayStats {
        bytes_to_backend: bytes_to_backend.load(Ordering::Relaxed),
        bytes_to_inbound: bytes_to_inbound.load(Ordering::Relaxed),
    }
}

async fn join_direction(conn_id: u64, task: JoinHandle<PipeEnd>) {
    match task.await {
        Ok(_) => {}
        Err(e) if e.is_cancelled() => {
            debug!(conn_id, direction = %Direction::BackendToInbound, "Stopped after opposite direction failed");
        }
        Err(e) => {
            error!(conn_id, direction = %Direction::BackendToInbound, "Relay task failed: {}", e);
        }
    }
}

/// Copy one direction until EOF or error, counting the bytes written
///
/// The destination is shut down either way so the opposite peer sees the end
/// of the stream.
async fn pipe<R, W>(
    conn_id: u64,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    total_bytes: Arc<AtomicU64>,
) -> PipeEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    let end = loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break PipeEnd::Eof,
            Ok(n) => n,
            Err(e) => {
                warn!(conn_id, %direction, error = %e, "Read failed");
                break PipeEnd::Failed;
            }
        };

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            warn!(conn_id, %direction, error = %e, "Write failed");
            break PipeEnd::Failed;
        }
        total_bytes.fetch_add(n as u64, Ordering::Relaxed);
    };

    debug!(
        conn_id,
        %direction,
        total_bytes = total_bytes.load(Ordering::Relaxed),
        ?end,
        "Direction finished"
    );

    if let Err(e) = writer.shutdown().await {
        debug!(conn_id, %direction, error = %e, "Destination shutdown failed");
    }

    end
}
