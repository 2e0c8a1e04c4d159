//! Process lifecycle
//!
//! Binds the TLS listener, starts the backend, runs the accept loop until the
//! backend exits, then stops accepting. Relays still in flight are left to
//! finish on their own or to die with the process.

use anyhow::{Context, Result};
use std::io;
use std::process::ExitStatus;
use tlsfront_relay::{AcceptLoop, AcceptLoopConfig, CancellationToken, InboundListener};
use tlsfront_tls::{build_acceptor, TlsListener};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::Settings;

pub async fn run(settings: Settings) -> Result<ExitStatus> {
    let certificate = settings
        .certificate
        .load()
        .context("Failed to load TLS certificate")?;
    let acceptor = build_acceptor(certificate).context("Failed to configure TLS")?;
    let listener = TlsListener::bind(settings.listen, acceptor).await?;

    serve(&settings, listener).await
}

/// Run the backend and relay `listener` to it until the backend exits
pub async fn serve<L: InboundListener>(settings: &Settings, listener: L) -> Result<ExitStatus> {
    let mut backend = Backend::spawn(&settings.runtime, &settings.entrypoint)?;

    info!(
        "Forwarding from https://{} to localhost:{}",
        settings.hostname, settings.backend_port
    );

    let shutdown = CancellationToken::new();
    let accept_loop = AcceptLoop::new(
        listener,
        AcceptLoopConfig {
            backend_port: settings.backend_port,
            max_connections: settings.max_connections,
        },
        shutdown.clone(),
    );
    let accept_task = tokio::spawn(accept_loop.run());

    let status = wait_for_backend(&mut backend).await;
    match &status {
        Ok(status) => info!("Backend `{}` exited with {}", backend.description(), status),
        Err(e) => error!("Failed to wait for backend `{}`: {}", backend.description(), e),
    }

    shutdown.cancel();
    match accept_task.await {
        Ok(summary) => debug!(
            accepted = summary.accepted,
            accept_errors = summary.accept_errors,
            "Accept loop finished"
        ),
        Err(e) => error!("Accept loop task failed: {}", e),
    }

    status.context("Failed to wait for backend")
}

async fn wait_for_backend(backend: &mut Backend) -> io::Result<ExitStatus> {
    let signal = tokio::select! {
        status = backend.wait() => return status,
        signal = shutdown_signal() => signal,
    };

    info!("Received {}, stopping backend", signal);
    backend.terminate().await
}

/// Resolves on SIGINT/SIGTERM (Ctrl+C elsewhere); never resolves if the
/// handlers cannot be installed
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "Ctrl+C",
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending().await
            }
        }
    }
}

/// Process exit code mirroring the backend's
pub fn exit_code(status: &ExitStatus) -> u8 {
    if status.success() {
        return 0;
    }
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .filter(|code| *code != 0)
        .unwrap_or(1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use tlsfront_relay::TcpInboundListener;
    use tlsfront_tls::CertificateSource;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_exit_code_mirrors_backend() {
        assert_eq!(exit_code(&ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(&ExitStatus::from_raw(3 << 8)), 3);
        // Killed by SIGKILL, no exit code
        assert_eq!(exit_code(&ExitStatus::from_raw(9)), 1);
    }

    #[tokio::test]
    async fn test_serve_relays_until_backend_exits() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = backend_listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let entrypoint = dir.path().join("backend.sh");
        std::fs::write(&entrypoint, "sleep 1\nexit 0\n").unwrap();

        let settings = Settings {
            hostname: "localhost".to_string(),
            runtime: "sh".to_string(),
            entrypoint,
            backend_port,
            listen: "127.0.0.1:0".parse().unwrap(),
            certificate: CertificateSource::StateDir {
                state_dir: PathBuf::from(dir.path()),
                hostname: "localhost".to_string(),
            },
            max_connections: None,
        };

        let listener = TcpInboundListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(async move { serve(&settings, listener).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let status = timeout(Duration::from_secs(10), serving)
            .await
            .expect("serve did not return after backend exit")
            .unwrap()
            .unwrap();
        assert!(status.success());

        // No new connections once the backend is gone
        assert!(TcpStream::connect(addr).await.is_err());

        // The established relay is unaffected
        client.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
