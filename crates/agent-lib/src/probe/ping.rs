//! ICMP echo probing via the system `ping` binary

use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::Prober;
use crate::error::ProbeError;
use crate::models::Liveness;

/// Settings for [`PingProber`]
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Path or name of the ping executable
    pub program: String,
    /// Echo requests sent per probe
    pub count: u32,
    /// Spacing between echo requests
    pub spacing: Duration,
    /// Hard limit on one probe, after which the device counts as down
    pub timeout: Duration,
    /// Maximum ping processes alive at once
    pub max_concurrent: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
            count: 3,
            spacing: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            max_concurrent: 256,
        }
    }
}

/// Probes devices by running `ping -c <count> -i <spacing> <address>`
///
/// A zero exit status means at least one reply came back.
pub struct PingProber {
    config: PingConfig,
    permits: Arc<Semaphore>,
}

impl PingProber {
    pub fn new(config: PingConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { config, permits }
    }

    fn command(&self, address: &str) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-c")
            .arg(self.config.count.max(1).to_string())
            .arg("-i")
            .arg(format_spacing(self.config.spacing))
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Render the spacing the way ping expects it (`1`, `0.2`)
fn format_spacing(spacing: Duration) -> String {
    let secs = spacing.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{secs}")
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str) -> Result<Liveness, ProbeError> {
        let address = address.trim();
        if address.is_empty() {
            return Ok(Liveness::Down);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProbeError::Failed("probe limiter closed".into()))?;

        let mut child = match self.command(address).spawn() {
            Ok(child) => child,
            Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                return Err(ProbeError::Unavailable(format!(
                    "cannot run {}: {err}",
                    self.config.program
                )));
            }
            Err(err) => return Err(ProbeError::Failed(err.to_string())),
        };

        match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(address = %address, code = ?status.code(), "Ping finished");
                Ok(if status.success() {
                    Liveness::Up
                } else {
                    Liveness::Down
                })
            }
            Ok(Err(err)) => Err(ProbeError::Failed(err.to_string())),
            Err(_) => {
                warn!(address = %address, timeout_secs = self.config.timeout.as_secs(), "Ping timed out");
                // kill_on_drop reaps the process when `child` goes out of scope
                Ok(Liveness::Down)
            }
        }
    }
}
