use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 may require elevated privileges\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}
