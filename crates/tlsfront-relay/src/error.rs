use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to backend at {address}: {source}")]
    DialFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Inbound handshake failed: {0}")]
    HandshakeFailed(std::io::Error),
}
