//! Tunnel child process launching and supervision.
//!
//! A tunnel is a separate binary forwarding one TCP stream over the punched
//! UDP path. It takes positional arguments
//! `purpose address gateway faraway obscure journal logging`.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Direction of the forwarded service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Export,
    Import,
}

impl Purpose {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}

/// Arguments of one tunnel process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelArgs {
    pub purpose: Purpose,
    /// Local TCP address of the service.
    pub address: String,
    /// Local UDP endpoint obtained from the rendezvous.
    pub gateway: String,
    /// Remote UDP endpoint.
    pub faraway: String,
    /// Obscuring value, 0 when disabled.
    pub obscure: u64,
    /// Journal directory.
    pub journal: PathBuf,
    /// Log level.
    pub logging: String,
}

impl TunnelArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        vec![
            self.purpose.as_str().into(),
            self.address.clone().into(),
            self.gateway.clone().into(),
            self.faraway.clone().into(),
            self.obscure.to_string().into(),
            self.journal.clone().into_os_string(),
            self.logging.clone().into(),
        ]
    }
}

/// A launched tunnel.
///
/// Cancelling `cancel` requests termination; `exited` resolves with the exit
/// code once the process is gone (`None` when killed by a signal).
#[derive(Debug)]
pub struct TunnelProcess {
    pub pid: u32,
    pub cancel: CancellationToken,
    pub exited: oneshot::Receiver<Option<i32>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to launch tunnel: {reason}")]
    LaunchFailed { reason: String },
}

/// Starts tunnel processes.
pub trait Launcher: Send + Sync {
    /// Start a tunnel; must be called within a tokio runtime.
    fn launch(&self, args: &TunnelArgs) -> Result<TunnelProcess, TunnelError>;
}

/// Launches the tunnel binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    /// Time allowed between SIGTERM and SIGKILL.
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            grace: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, args: &TunnelArgs) -> Result<TunnelProcess, TunnelError> {
        let mut child = Command::new(&self.program)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::LaunchFailed {
                reason: format!("{}: {e}", self.program.display()),
            })?;

        let pid = child.id().ok_or_else(|| TunnelError::LaunchFailed {
            reason: "process exited immediately".to_string(),
        })?;

        info!(
            pid,
            purpose = args.purpose.as_str(),
            address = %args.address,
            faraway = %args.faraway,
            "Tunnel launched"
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid, "tunnel stderr: {}", line);
                }
                debug!(pid, "tunnel stderr reader finished");
            });
        }

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(child, pid, cancel.clone(), self.grace, exit_tx));

        Ok(TunnelProcess {
            pid,
            cancel,
            exited: exit_rx,
        })
    }
}

async fn supervise(
    mut child: Child,
    pid: u32,
    cancel: CancellationToken,
    grace: Duration,
    exit_tx: oneshot::Sender<Option<i32>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = cancel.cancelled() => terminate(&mut child, pid, grace).await,
    };
    let code = match status {
        Ok(status) => {
            info!(pid, ?status, "Tunnel exited");
            status.code()
        }
        Err(e) => {
            warn!(pid, error = %e, "Error waiting for tunnel");
            None
        }
    };
    let _ = exit_tx.send(code);
}

async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    debug!(pid, "Terminating tunnel");

    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        // SAFETY: pid is a valid process ID obtained from our own Child handle,
        // which has not been reaped yet.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, error = %err, "Failed to send SIGTERM");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid, "Timeout waiting for tunnel shutdown, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}
