//! Connection forwarding core
//!
//! Accepts inbound connections from an [`InboundListener`] and relays each one,
//! byte for byte, to a freshly dialed loopback connection to the backend.
//! The accept loop stops when its [`CancellationToken`] is cancelled; relays
//! that are already running are left to drain on their own.

mod accept;
mod error;
mod listener;
mod relay;

pub use accept::{AcceptLoop, AcceptLoopConfig, AcceptLoopSummary, ConnectionIdGenerator};
pub use error::RelayError;
pub use listener::{Accepted, InboundListener, TcpInboundListener};
pub use relay::{ConnectionRelay, Direction, RelayOutcome, RelayStats, BACKEND_HOST};
pub use tokio_util::sync::CancellationToken;
