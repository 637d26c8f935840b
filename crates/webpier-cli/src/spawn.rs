//! Starting a session daemon on demand.
//!
//! When no daemon answers on the endpoint of a home directory, the CLI can
//! start one in session mode. Such a daemon stops by itself once its last
//! client disconnects.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

use crate::connection::{ConnectionConfig, ControlClient, RetryPolicy};

/// Connect to the daemon serving `home`, starting `daemon_bin` if nothing
/// answers yet.
pub async fn ensure_daemon(
    config: ConnectionConfig,
    daemon_bin: &Path,
    home: &Path,
) -> Result<ControlClient> {
    let probe = ConnectionConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            ..config.retry.clone()
        },
        ..config.clone()
    };
    if let Ok(client) = ControlClient::connect(probe).await {
        return Ok(client.with_config(config));
    }

    info!(daemon = %daemon_bin.display(), home = %home.display(), "Starting session daemon");
    let child = Command::new(daemon_bin)
        .arg("--home")
        .arg(home)
        .arg("--mode")
        .arg("session")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", daemon_bin.display()))?;
    info!(pid = ?child.id(), "Session daemon started");

    ControlClient::connect(config)
        .await
        .context("Session daemon did not come up")
}

/// Default daemon binary: `webpier-daemon` next to the running executable.
pub fn default_daemon_bin() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot locate the CLI executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("CLI executable has no parent directory"))?;
    Ok(dir.join(format!("webpier-daemon{}", std::env::consts::EXE_SUFFIX)))
}
