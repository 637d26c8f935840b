//! Logging setup shared by the daemon and the CLI.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter: `RUST_LOG` when set and valid, `default_filter` otherwise.
fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber writing to stderr.
///
/// `default_filter` applies when `RUST_LOG` is unset, e.g.
/// `"webpier_daemon=info,webpier_core=info"`. With `log_json` every event is
/// one JSON object per line, suited to journald or log shippers.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let registry = tracing_subscriber::registry().with(filter(default_filter));
    let installed = if log_json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_span_events(FmtSpan::NONE)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    installed.is_ok()
}
