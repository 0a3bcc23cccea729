use crate::InferenceError;
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff for startup races.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 20,
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Runs `op` until it succeeds or the attempts run out; the last error wins.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.attempts.max(1) => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    debug!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// A file whose existence means the session listener accepts connections.
/// Holds the bound address so clients of an ephemeral port can find it.
/// Removed when dropped.
#[derive(Debug)]
pub struct ReadyMarker {
    path: PathBuf,
}

impl ReadyMarker {
    /// Call only once the listener is bound.
    pub fn create(path: &Path, addr: SocketAddr) -> Result<Self, InferenceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, addr.to_string())?;
        fs::rename(&tmp, path)?;
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReadyMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove ready marker");
            }
        }
    }
}

/// Polls for the marker and returns the address recorded in it, if any.
pub async fn wait_for_marker(path: &Path, backoff: Backoff) -> Result<Option<SocketAddr>, InferenceError> {
    backoff
        .retry("ready marker", move || async move {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => Ok(contents.trim().parse::<SocketAddr>().ok()),
                Err(e) => Err(InferenceError::Other(format!(
                    "server not ready, no marker at {}: {}",
                    path.display(),
                    e
                ))),
            }
        })
        .await
}
