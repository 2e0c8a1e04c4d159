//! TLS termination for the inbound listener
//!
//! Supplies the certificate (operator-provided PEM files, or a self-signed
//! certificate kept in the state directory) and a [`TlsListener`] whose
//! handshakes run inside each relay task.

pub mod cert;
pub mod error;
pub mod listener;

pub use cert::{
    generate_self_signed_cert, is_safe_file_stem, load_certs, load_private_key, Certificate,
    CertificateSource, SelfSignedCertificate,
};
pub use error::TlsError;
pub use listener::{build_acceptor, TlsListener};
