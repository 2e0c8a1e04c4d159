//! Accept loop
//!
//! Pulls connections off an [`InboundListener`] and hands each one to its own
//! relay task. The loop never waits on a relay. Shutdown is observed by racing
//! every accept against the cancellation token, so a pending accept is
//! abandoned as soon as the token fires and the listener is dropped on return.
//! Accept errors are logged and followed by a short pause, so a persistent
//! failure such as running out of file descriptors does not spin the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::listener::InboundListener;
use crate::relay::ConnectionRelay;

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct AcceptLoopConfig {
    /// Port the backend listens on, always dialed on `localhost`
    pub backend_port: u16,
    /// Upper bound on concurrently relayed connections; `None` is unbounded
    pub max_connections: Option<usize>,
}

/// Connection ID generator for log correlation
#[derive(Clone, Debug)]
pub struct ConnectionIdGenerator {
    next_id: Arc<AtomicU64>,
}

impl ConnectionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters reported when the loop returns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptLoopSummary {
    pub accepted: u64,
    pub accept_errors: u64,
}

pub struct AcceptLoop<L> {
    listener: L,
    relay: ConnectionRelay,
    shutdown: CancellationToken,
    limiter: Option<Arc<Semaphore>>,
    ids: ConnectionIdGenerator,
}

impl<L: InboundListener> AcceptLoop<L> {
    pub fn new(listener: L, config: AcceptLoopConfig, shutdown: CancellationToken) -> Self {
        Self {
            listener,
            relay: ConnectionRelay::new(config.backend_port),
            shutdown,
            limiter: config
                .max_connections
                .map(|limit| Arc::new(Semaphore::new(limit))),
            ids: ConnectionIdGenerator::new(),
        }
    }

    /// Accept until the shutdown token is cancelled, then close the listener
    pub async fn run(self) -> AcceptLoopSummary {
        let mut summary = AcceptLoopSummary::default();

        match self.listener.local_addr() {
            Ok(addr) => info!(
                "Accepting connections on {} for localhost:{}",
                addr,
                self.relay.backend_port()
            ),
            Err(e) => debug!("Listener address unavailable: {}", e),
        }

        loop {
            let permit = match &self.limiter {
                Some(limiter) => {
                    let acquire = limiter.clone().acquire_owned();
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        permit = acquire => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    }
                }
                None => None,
            };

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => result,
            };

            match result {
                Ok(accepted) => {
                    summary.accepted += 1;
                    let conn_id = self.ids.generate();
                    debug!(conn_id, peer = %accepted.peer_addr, "Accepted inbound connection");

                    let relay = self.relay.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        relay.run(conn_id, accepted).await;
                    });
                }
                Err(e) => {
                    summary.accept_errors += 1;
                    error!("Failed to accept inbound connection: {}", e);

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(
            accepted = summary.accepted,
            accept_errors = summary.accept_errors,
            "Accept loop stopped, closing listener"
        );

        summary
    }
}
