//! `WebPier` Daemon
//!
//! Keeps the declared services of a pier connected and answers control
//! requests from the CLI over the local endpoint.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info, warn};

use webpier_core::config::INSTANCE_FILE;
use webpier_core::lock::FileLock;
use webpier_core::{Repository, ipc};

use webpier_daemon::rendezvous::CommandRendezvous;
use webpier_daemon::tunnel::ProcessLauncher;
use webpier_daemon::{Engine, RunMode, Server, Settings};

#[derive(Parser, Debug)]
#[command(name = "webpier-daemon")]
#[command(version, about = "WebPier daemon - NAT traversal control plane")]
struct Args {
    /// Configuration home directory (default: ~/.webpier)
    #[arg(long, env = "WEBPIER_HOME")]
    home: Option<PathBuf>,

    /// Serve until signalled (steady) or until the last client leaves (session)
    #[arg(long, value_enum, default_value_t = RunMode::Steady)]
    mode: RunMode,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "WEBPIER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "WEBPIER_LOG_JSON")]
    log_json: bool,

    /// Tunnel binary (default: `webpier-carrier` next to this executable)
    #[arg(long, env = "WEBPIER_TUNNEL_BIN")]
    tunnel_bin: Option<PathBuf>,

    /// Rendezvous helper binary (default: `webpier-rendezvous` next to this executable)
    #[arg(long, env = "WEBPIER_RENDEZVOUS_BIN")]
    rendezvous_bin: Option<PathBuf>,
}

/// Startup failures, each with its own exit code.
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error("Tunnel binary not found: {}", .0.display())]
    WrongBinary(PathBuf),

    #[error("Invalid home directory: {0}")]
    InvalidHome(String),

    #[error("Another daemon already serves {}", .0.display())]
    Locked(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Failure {
    const fn exit_code(&self) -> u8 {
        match self {
            Self::WrongBinary(_) => 1,
            Self::InvalidHome(_) => 2,
            Self::Locked(_) => 3,
            Self::Other(_) => 4,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_filter = format!(
        "webpier_daemon={level},webpier_core={level}",
        level = args.log_level
    );
    webpier_core::tracing_init::init_tracing(&log_filter, args.log_json);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            error!(error = %failure, "Daemon failed");
            ExitCode::from(failure.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), Failure> {
    let home = resolve_home(args.home)?;
    let tunnel_bin = match args.tunnel_bin {
        Some(path) => path,
        None => sibling("webpier-carrier")?,
    };
    if !tunnel_bin.is_file() {
        return Err(Failure::WrongBinary(tunnel_bin));
    }
    let rendezvous_bin = match args.rendezvous_bin {
        Some(path) => path,
        None => sibling("webpier-rendezvous")?,
    };

    let instance_path = home.join(INSTANCE_FILE);
    let instance = FileLock::try_acquire(&instance_path)
        .context("Failed to open instance lock")?
        .ok_or_else(|| Failure::Locked(home.clone()))?;
    instance
        .record_pid()
        .context("Failed to record daemon pid")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        home = %home.display(),
        mode = ?args.mode,
        tunnel = %tunnel_bin.display(),
        rendezvous = %rendezvous_bin.display(),
        "Starting webpier-daemon"
    );

    let journal = home.join("journal");
    std::fs::create_dir_all(&journal)
        .with_context(|| format!("Failed to create {}", journal.display()))?;

    let (mut engine, events) = Engine::new(
        Repository::open(&home),
        Arc::new(CommandRendezvous::new(rendezvous_bin)),
        Arc::new(ProcessLauncher::new(tunnel_bin)),
        Settings::new(journal),
    );

    let server = Server::bind(&ipc::endpoint_path(&home), args.mode)
        .context("Failed to bind control endpoint")?;

    if let Err(e) = engine.engage_all() {
        warn!(error = %e, "Failed to engage services at startup");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
            _ = sigterm_future => info!("Received SIGTERM shutdown signal"),
        }
        let _ = shutdown_tx.send(true);
    });

    // Unset $NOTIFY_SOCKET so tunnel children do not notify systemd.
    #[cfg(unix)]
    if args.mode == RunMode::Steady
        && let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready])
    {
        warn!(error = %e, "Failed to notify systemd");
    }

    server.run(engine, events, shutdown_rx).await;

    info!("Daemon stopped");
    Ok(())
}

/// Pick the home directory; the default one is created on first use.
fn resolve_home(home: Option<PathBuf>) -> Result<PathBuf, Failure> {
    let home = match home {
        Some(home) => home,
        None => {
            let home = dirs::home_dir()
                .ok_or_else(|| Failure::InvalidHome("cannot determine user home".into()))?
                .join(".webpier");
            std::fs::create_dir_all(&home)
                .map_err(|e| Failure::InvalidHome(format!("{}: {e}", home.display())))?;
            home
        }
    };
    if !home.is_dir() {
        return Err(Failure::InvalidHome(format!(
            "{} is not a directory",
            home.display()
        )));
    }
    absolute(&home)
}

fn absolute(path: &Path) -> Result<PathBuf, Failure> {
    std::path::absolute(path).map_err(|e| Failure::InvalidHome(format!("{}: {e}", path.display())))
}

/// Path of a companion binary installed next to this executable.
fn sibling(name: &str) -> Result<PathBuf, Failure> {
    let exe = std::env::current_exe().context("Cannot locate the daemon executable")?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Daemon executable has no parent directory"))?;
    Ok(dir.join(format!("{name}{}", std::env::consts::EXE_SUFFIX)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::ffi::OsStr;

    use super::*;

    fn args(home: &Path, tunnel_bin: &Path) -> Args {
        Args::parse_from([
            OsStr::new("webpier-daemon"),
            OsStr::new("--home"),
            home.as_os_str(),
            OsStr::new("--tunnel-bin"),
            tunnel_bin.as_os_str(),
            OsStr::new("--rendezvous-bin"),
            tunnel_bin.as_os_str(),
        ])
    }

    fn exit_code(result: Result<(), Failure>) -> u8 {
        match result {
            Ok(()) => panic!("startup unexpectedly succeeded"),
            Err(failure) => failure.exit_code(),
        }
    }

    #[tokio::test]
    async fn missing_tunnel_binary_exits_with_1() {
        let home = tempfile::tempdir().unwrap();
        let missing = home.path().join("no-such-carrier");
        assert_eq!(exit_code(run(args(home.path(), &missing)).await), 1);
    }

    #[tokio::test]
    async fn invalid_home_exits_with_2() {
        let dir = tempfile::tempdir().unwrap();
        let carrier = dir.path().join("carrier");
        std::fs::write(&carrier, "").unwrap();

        let missing = dir.path().join("absent");
        assert_eq!(exit_code(run(args(&missing, &carrier)).await), 2);
        assert_eq!(exit_code(run(args(&carrier, &carrier)).await), 2);
    }

    #[tokio::test]
    async fn held_instance_lock_exits_with_3() {
        let home = tempfile::tempdir().unwrap();
        let carrier = home.path().join("carrier");
        std::fs::write(&carrier, "").unwrap();
        let _running = FileLock::try_acquire(&home.path().join(INSTANCE_FILE))
            .unwrap()
            .unwrap();

        assert_eq!(exit_code(run(args(home.path(), &carrier)).await), 3);
    }

    #[test]
    fn other_failures_exit_with_4() {
        let failure = Failure::from(anyhow::anyhow!("bind failed"));
        assert_eq!(failure.exit_code(), 4);
    }

    #[test]
    fn resolved_home_is_absolute() {
        let home = tempfile::tempdir().unwrap();
        let resolved = resolve_home(Some(home.path().join("."))).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.is_dir());
    }
}
