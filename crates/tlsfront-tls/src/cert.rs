//! Certificate loading and self-signed generation
//!
//! Operators can point at PEM files directly. Otherwise a self-signed
//! certificate for the advertised hostname is generated on first run and kept
//! in the state directory, then reused until it gets close to expiry.

use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::error::TlsError;

/// Lifetime of generated certificates
const SELF_SIGNED_VALIDITY_DAYS: i64 = 90;

/// Stored certificates older than this are regenerated
const SELF_SIGNED_RENEW_AFTER: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Certificate chain with its private key
#[derive(Debug)]
pub struct Certificate {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl Certificate {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}

/// Where the listener's certificate comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    /// Operator-provided PEM files
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// Self-signed certificate for `hostname`, persisted under `state_dir`
    StateDir { state_dir: PathBuf, hostname: String },
}

impl CertificateSource {
    pub fn load(&self) -> Result<Certificate, TlsError> {
        match self {
            CertificateSource::Files {
                cert_path,
                key_path,
            } => {
                info!("Loading TLS certificate from: {}", cert_path.display());
                let cert_chain = load_certs(cert_path)?;
                info!("Loading TLS private key from: {}", key_path.display());
                let private_key = load_private_key(key_path)?;
                Ok(Certificate::new(cert_chain, private_key))
            }
            CertificateSource::StateDir {
                state_dir,
                hostname,
            } => load_or_generate(state_dir, hostname),
        }
    }
}

/// Load TLS certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| {
        TlsError::CertificateError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load a private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| {
        TlsError::CertificateError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TlsError::CertificateError("No private key found".to_string()))
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub pem_cert: String,
    pub pem_key: String,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    ///
    /// On unix the key file is created owner-only, so it is never readable by
    /// others, not even briefly.
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        fs::write(cert_path, &self.pem_cert)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut key_file = options.open(key_path)?;

        // The mode only applies on creation; tighten a key file left by an
        // earlier run before writing into it
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            key_file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        key_file.write_all(self.pem_key.as_bytes())?;
        key_file.sync_all()
    }

    pub fn into_certificate(self) -> Certificate {
        Certificate::new(vec![self.cert_der], self.key_der)
    }
}

/// Generate a self-signed certificate for `hostname`
///
/// The certificate also covers `localhost`, `127.0.0.1` and `::1` so the
/// listener can be reached locally during development.
pub fn generate_self_signed_cert(hostname: &str) -> Result<SelfSignedCertificate, TlsError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationName, "tlsfront");
    params.distinguished_name = dn;

    let mut names = vec![hostname.to_string()];
    if hostname != "localhost" {
        names.push("localhost".to_string());
    }
    let mut subject_alt_names = names
        .into_iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| TlsError::CertificateError(format!("Invalid hostname {}: {}", name, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    subject_alt_names.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    subject_alt_names.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    params.subject_alt_names = subject_alt_names;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(SELF_SIGNED_VALIDITY_DAYS);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| TlsError::CertificateError(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertificateError(e.to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// Whether `hostname` can name files inside the state directory
pub fn is_safe_file_stem(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname != "."
        && hostname != ".."
        && !hostname.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

fn state_paths(state_dir: &Path, hostname: &str) -> Result<(PathBuf, PathBuf), TlsError> {
    if !is_safe_file_stem(hostname) {
        return Err(TlsError::CertificateError(format!(
            "Hostname {:?} cannot be used as a certificate file name",
            hostname
        )));
    }

    Ok((
        state_dir.join(format!("{}.crt", hostname)),
        state_dir.join(format!("{}.key", hostname)),
    ))
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > SELF_SIGNED_RENEW_AFTER)
        .unwrap_or(true)
}

fn load_or_generate(state_dir: &Path, hostname: &str) -> Result<Certificate, TlsError> {
    let (cert_path, key_path) = state_paths(state_dir, hostname)?;

    if cert_path.exists() && key_path.exists() && !is_stale(&cert_path) {
        debug!("Reusing stored certificate {}", cert_path.display());
        return Ok(Certificate::new(
            load_certs(&cert_path)?,
            load_private_key(&key_path)?,
        ));
    }

    fs::create_dir_all(state_dir).map_err(|e| {
        TlsError::CertificateError(format!(
            "Failed to create state directory {}: {}",
            state_dir.display(),
            e
        ))
    })?;

    info!(
        "Generating self-signed certificate for {} in {}",
        hostname,
        state_dir.display()
    );
    let generated = generate_self_signed_cert(hostname)?;
    generated.save_to_files(&cert_path, &key_path)?;

    Ok(generated.into_certificate())
}
