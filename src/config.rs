//! Command line and config file handling
//!
//! Settings may come from an optional YAML file. Command line flags and their
//! `TLSFRONT_*` environment variables take precedence over the file.

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tlsfront_tls::{is_safe_file_stem, CertificateSource};

pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_RUNTIME: &str = "node";
pub const DEFAULT_ENTRYPOINT: &str = "index.js";
pub const DEFAULT_BACKEND_PORT: u16 = 3000;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:443";
pub const DEFAULT_STATE_DIR: &str = "./tlsfront-state/";

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TLSFRONT_GIT_HASH"),
    ", built ",
    env!("TLSFRONT_BUILD_TIME"),
    ")"
);

/// tlsfront - serve a local backend process over TLS
#[derive(Parser, Debug, Default)]
#[command(name = "tlsfront")]
#[command(about = "Serve a local backend process over TLS")]
#[command(version = VERSION)]
#[command(long_about = r#"
tlsfront starts a backend process, terminates TLS on a public listener and
relays every inbound connection to the backend on localhost. When the backend
exits, tlsfront stops accepting connections and exits too.

EXAMPLES:
  # Run `node index.js` (listening on 3000) behind https://app.example.com
  tlsfront --hostname app.example.com

  # Custom runtime, entrypoint and backend port
  tlsfront --runtime deno --entrypoint server.ts --port 8000

  # Use an existing certificate instead of a generated one
  tlsfront --cert cert.pem --key key.pem --listen 0.0.0.0:8443

ENVIRONMENT VARIABLES:
  TLSFRONT_HOSTNAME    Advertised hostname
  TLSFRONT_ENTRYPOINT  Script passed to the runtime
  TLSFRONT_RUNTIME     Backend runtime executable
  TLSFRONT_PORT        Port the backend listens on
  TLSFRONT_LISTEN      TLS listen address
  TLSFRONT_STATE_DIR   Directory for generated certificates
"#)]
pub struct Args {
    /// Hostname the service is published under
    #[arg(long, env = "TLSFRONT_HOSTNAME")]
    pub hostname: Option<String>,

    /// Path to the script the runtime executes
    #[arg(long, env = "TLSFRONT_ENTRYPOINT")]
    pub entrypoint: Option<PathBuf>,

    /// Executable used to run the entrypoint
    #[arg(long, env = "TLSFRONT_RUNTIME")]
    pub runtime: Option<String>,

    /// Port the backend listens on (dialed on localhost)
    #[arg(long, env = "TLSFRONT_PORT")]
    pub port: Option<u16>,

    /// Address the TLS listener binds to
    #[arg(long, env = "TLSFRONT_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Directory holding generated certificates
    #[arg(long, env = "TLSFRONT_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// PEM certificate chain (requires --key)
    #[arg(long, env = "TLSFRONT_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM private key (requires --cert)
    #[arg(long, env = "TLSFRONT_KEY")]
    pub key: Option<PathBuf>,

    /// Maximum number of connections relayed at once (unbounded if unset)
    #[arg(long, env = "TLSFRONT_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub hostname: Option<String>,
    pub entrypoint: Option<PathBuf>,
    pub runtime: Option<String>,
    pub port: Option<u16>,
    pub listen: Option<SocketAddr>,
    pub state_dir: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub max_connections: Option<usize>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub hostname: String,
    pub runtime: String,
    pub entrypoint: PathBuf,
    pub backend_port: u16,
    pub listen: SocketAddr,
    pub certificate: CertificateSource,
    pub max_connections: Option<usize>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

impl Settings {
    /// Merge CLI args over the config file, then apply defaults
    pub fn resolve(args: Args, file: ConfigFile) -> Result<Self> {
        let hostname = args
            .hostname
            .or(file.hostname)
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());
        let runtime = args
            .runtime
            .or(file.runtime)
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
        let entrypoint = args
            .entrypoint
            .or(file.entrypoint)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ENTRYPOINT));
        let backend_port = args.port.or(file.port).unwrap_or(DEFAULT_BACKEND_PORT);
        let listen = match args.listen.or(file.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN.parse().context("Invalid default listen address")?,
        };
        let state_dir = args
            .state_dir
            .or(file.state_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let max_connections = args.max_connections.or(file.max_connections);

        if hostname.trim().is_empty() {
            anyhow::bail!("Hostname cannot be empty");
        }
        if !is_safe_file_stem(&hostname) {
            anyhow::bail!("Hostname cannot contain path separators: {}", hostname);
        }
        if runtime.trim().is_empty() {
            anyhow::bail!("Runtime cannot be empty (use --runtime or config file)");
        }
        if entrypoint.as_os_str().is_empty() {
            anyhow::bail!("Entrypoint cannot be empty (use --entrypoint or config file)");
        }
        if backend_port == 0 {
            anyhow::bail!("Backend port must be between 1 and 65535");
        }
        if max_connections == Some(0) {
            anyhow::bail!("max_connections must be at least 1 when set");
        }

        let certificate = match (args.cert.or(file.cert), args.key.or(file.key)) {
            (Some(cert_path), Some(key_path)) => CertificateSource::Files {
                cert_path,
                key_path,
            },
            (None, None) => CertificateSource::StateDir {
                state_dir,
                hostname: hostname.clone(),
            },
            (Some(_), None) => anyhow::bail!("--cert requires --key"),
            (None, Some(_)) => anyhow::bail!("--key requires --cert"),
        };

        Ok(Self {
            hostname,
            runtime,
            entrypoint,
            backend_port,
            listen,
            certificate,
            max_connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            log_level: "info".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(args(), ConfigFile::default()).unwrap();

        assert_eq!(settings.hostname, DEFAULT_HOSTNAME);
        assert_eq!(settings.runtime, "node");
        assert_eq!(settings.entrypoint, PathBuf::from("index.js"));
        assert_eq!(settings.backend_port, 3000);
        assert_eq!(settings.listen, "0.0.0.0:443".parse().unwrap());
        assert_eq!(settings.max_connections, None);
        assert_eq!(
            settings.certificate,
            CertificateSource::StateDir {
                state_dir: PathBuf::from(DEFAULT_STATE_DIR),
                hostname: DEFAULT_HOSTNAME.to_string(),
            }
        );
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let file = ConfigFile {
            hostname: Some("from-file".to_string()),
            port: Some(4000),
            runtime: Some("deno".to_string()),
            ..Default::default()
        };
        let cli = Args {
            port: Some(5000),
            ..args()
        };

        let settings = Settings::resolve(cli, file).unwrap();
        assert_eq!(settings.hostname, "from-file");
        assert_eq!(settings.runtime, "deno");
        assert_eq!(settings.backend_port, 5000);
    }

    #[test]
    fn test_cert_and_key_must_be_paired() {
        let cli = Args {
            cert: Some(PathBuf::from("cert.pem")),
            ..args()
        };
        assert!(Settings::resolve(cli, ConfigFile::default()).is_err());

        let file = ConfigFile {
            key: Some(PathBuf::from("key.pem")),
            ..Default::default()
        };
        assert!(Settings::resolve(args(), file).is_err());
    }

    #[test]
    fn test_cert_files_are_used_when_given() {
        let cli = Args {
            cert: Some(PathBuf::from("cert.pem")),
            key: Some(PathBuf::from("key.pem")),
            ..args()
        };
        let settings = Settings::resolve(cli, ConfigFile::default()).unwrap();
        assert_eq!(
            settings.certificate,
            CertificateSource::Files {
                cert_path: PathBuf::from("cert.pem"),
                key_path: PathBuf::from("key.pem"),
            }
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let zero_port = Args {
            port: Some(0),
            ..args()
        };
        assert!(Settings::resolve(zero_port, ConfigFile::default()).is_err());

        let empty_host = Args {
            hostname: Some("  ".to_string()),
            ..args()
        };
        assert!(Settings::resolve(empty_host, ConfigFile::default()).is_err());

        let zero_limit = Args {
            max_connections: Some(0),
            ..args()
        };
        assert!(Settings::resolve(zero_limit, ConfigFile::default()).is_err());
    }

    #[test]
    fn test_hostname_with_path_separators_is_rejected() {
        for hostname in ["../etc/passwd", "a/b", "..", "a\\b"] {
            let bad_host = Args {
                hostname: Some(hostname.to_string()),
                ..args()
            };
            let err = Settings::resolve(bad_host, ConfigFile::default()).unwrap_err();
            assert!(err.to_string().contains("path separators"), "{}", hostname);
        }

        let from_file = ConfigFile {
            hostname: Some("../outside".to_string()),
            ..Default::default()
        };
        assert!(Settings::resolve(args(), from_file).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlsfront.yaml");
        fs::write(
            &path,
            "hostname: glorified-spreadsheet\nentrypoint: app/index.js\nport: 3001\nlisten: 127.0.0.1:8443\nmax_connections: 64\n",
        )
        .unwrap();

        let file = load_config_file(&path).unwrap();
        assert_eq!(file.hostname.as_deref(), Some("glorified-spreadsheet"));
        assert_eq!(file.entrypoint, Some(PathBuf::from("app/index.js")));
        assert_eq!(file.port, Some(3001));
        assert_eq!(file.listen, Some("127.0.0.1:8443".parse().unwrap()));
        assert_eq!(file.max_connections, Some(64));
    }

    #[test]
    fn test_unknown_config_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlsfront.yaml");
        fs::write(&path, "hostnme: typo\n").unwrap();

        assert!(load_config_file(&path).is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let args = Args::try_parse_from([
            "tlsfront",
            "--hostname",
            "app.example.com",
            "--port",
            "8080",
            "--listen",
            "127.0.0.1:8443",
        ])
        .unwrap();

        assert_eq!(args.hostname.as_deref(), Some("app.example.com"));
        assert_eq!(args.port, Some(8080));
        assert_eq!(args.log_level, "info");
    }
}
