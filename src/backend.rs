//! Backend process management
//!
//! The backend runs as `<runtime> <entrypoint>` with this process's stdout and
//! stderr. Its exit is what ends the service.

use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub struct Backend {
    child: Child,
    description: String,
}

impl Backend {
    pub fn spawn(runtime: &str, entrypoint: &Path) -> Result<Self> {
        let description = format!("{} {}", runtime, entrypoint.display());

        let child = Command::new(runtime)
            .arg(entrypoint)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start backend: {}", description))?;

        info!(pid = child.id(), "Started backend: {}", description);

        Ok(Self { child, description })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Wait for the backend to exit on its own
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the backend and reap it
    pub async fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Err(e) = self.child.start_kill() {
            // Already exited; wait() still reports its status
            debug!("Backend kill failed: {}", e);
        }
        let status = self.child.wait().await?;
        warn!("Backend terminated: {}", self.description);
        Ok(status)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("backend.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let entrypoint = script(dir.path(), "exit 3\n");

        let mut backend = Backend::spawn("sh", &entrypoint).unwrap();
        let status = backend.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_backend() {
        let dir = tempfile::tempdir().unwrap();
        let entrypoint = script(dir.path(), "sleep 30\n");

        let mut backend = Backend::spawn("sh", &entrypoint).unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), backend.terminate())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_missing_runtime_fails_to_spawn() {
        let result = Backend::spawn("tlsfront-no-such-runtime", Path::new("index.js"));
        let err = result.err().expect("spawn should fail");
        assert!(err.to_string().contains("Failed to start backend"));
    }
}
