//! `WebPier` CLI
//!
//! Queries and controls the daemon of a pier home directory.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use webpier_cli::connection::{ConnectionConfig, ControlClient};
use webpier_cli::spawn;
use webpier_core::{Handle, Health, Report};

#[derive(Parser, Debug)]
#[command(name = "webpier")]
#[command(version, about = "WebPier control CLI", long_about = None)]
struct Cli {
    /// Configuration home directory (default: ~/.webpier)
    #[arg(long, global = true, env = "WEBPIER_HOME")]
    home: Option<PathBuf>,

    /// Start a session daemon when none is running
    #[arg(long, global = true)]
    spawn: bool,

    /// Daemon binary used with --spawn (default: `webpier-daemon` next to this executable)
    #[arg(long, global = true, env = "WEBPIER_DAEMON_BIN")]
    daemon_bin: Option<PathBuf>,

    /// Log level filter (e.g. "warn", "debug").
    #[arg(long, global = true, default_value = "warn", env = "WEBPIER_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Optional single-service scope.
#[derive(clap::Args, Debug)]
struct Target {
    /// Pier declaring the service
    #[arg(long, requires = "service")]
    pier: Option<String>,

    /// Service name
    #[arg(long, requires = "pier")]
    service: Option<String>,
}

impl Target {
    fn handle(self) -> Option<Handle> {
        self.pier.zip(self.service).map(|(pier, service)| Handle::new(pier, service))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show service health
    Status(Target),
    /// Show service health with running tunnels
    Review(Target),
    /// Start services (autostart ones when no service is given)
    Engage(Target),
    /// Apply configuration changes
    Adjust(Target),
    /// Stop services
    Unplug(Target),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = format!(
        "webpier_cli={level},webpier_core={level}",
        level = cli.log_level
    );
    webpier_core::tracing_init::init_tracing(&log_filter, false);

    let home = resolve_home(cli.home)?;
    info!(version = env!("CARGO_PKG_VERSION"), home = %home.display(), "Starting webpier CLI");

    let config = ConnectionConfig::for_home(&home);
    let mut client = if cli.spawn {
        let daemon_bin = match cli.daemon_bin {
            Some(path) => path,
            None => spawn::default_daemon_bin()?,
        };
        spawn::ensure_daemon(config, &daemon_bin, &home).await?
    } else {
        ControlClient::connect(config).await?
    };

    match cli.command {
        Command::Status(target) => {
            let health = client.status(target.handle().as_ref()).await?;
            print_health(&health);
        }
        Command::Review(target) => {
            let reports = client.review(target.handle().as_ref()).await?;
            print_reports(&reports);
        }
        Command::Engage(target) => client.engage(target.handle().as_ref()).await?,
        Command::Adjust(target) => client.adjust(target.handle().as_ref()).await?,
        Command::Unplug(target) => client.unplug(target.handle().as_ref()).await?,
    }
    Ok(())
}

fn resolve_home(home: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let home = match home {
        Some(home) => home,
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?
            .join(".webpier"),
    };
    std::path::absolute(&home).with_context(|| format!("Invalid home {}", home.display()))
}

fn health_row(health: &Health) -> String {
    format!(
        "{:<24} {:<20} {:<8} {}",
        health.handle.pier,
        health.handle.service,
        health.state.to_string(),
        health.message
    )
}

#[allow(clippy::print_stdout)]
fn print_health(list: &[Health]) {
    println!("{:<24} {:<20} {:<8} MESSAGE", "PIER", "SERVICE", "STATE");
    for health in list {
        println!("{}", health_row(health));
    }
}

#[allow(clippy::print_stdout)]
fn print_reports(reports: &[Report]) {
    println!("{:<24} {:<20} {:<8} MESSAGE", "PIER", "SERVICE", "STATE");
    for report in reports {
        println!("{}", health_row(&report.health));
        for tunnel in &report.tunnels {
            println!("    tunnel {:>7} -> {}", tunnel.pid, tunnel.pier);
        }
    }
}
