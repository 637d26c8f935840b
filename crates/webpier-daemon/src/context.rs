//! Collaborators and settings shared by every connector.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::event::EventSender;
use crate::rendezvous::Rendezvous;
use crate::tunnel::Launcher;

/// Environment variable overriding the retry timeout (seconds).
pub const RETRY_TIMEOUT_ENV: &str = "WEBPIER_RETRY_TIMEOUT";

/// Default delay before retrying a failed rendezvous.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(15);

/// Daemon-wide settings that do not come from the configuration files.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Delay between a rendezvous failure and the next attempt.
    pub retry_timeout: Duration,
    /// Directory tunnel processes write their journals to.
    pub journal: PathBuf,
}

impl Settings {
    pub fn new(journal: PathBuf) -> Self {
        Self {
            retry_timeout: retry_timeout_from_env(),
            journal,
        }
    }

    #[must_use]
    pub const fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }
}

/// Read [`RETRY_TIMEOUT_ENV`], falling back to [`DEFAULT_RETRY_TIMEOUT`].
pub fn retry_timeout_from_env() -> Duration {
    parse_retry_timeout(std::env::var(RETRY_TIMEOUT_ENV).ok().as_deref())
}

fn parse_retry_timeout(value: Option<&str>) -> Duration {
    match value.map(str::trim) {
        None | Some("") => DEFAULT_RETRY_TIMEOUT,
        Some(raw) => raw.parse::<u64>().map_or_else(
            |_| {
                warn!(value = raw, "Ignoring invalid {RETRY_TIMEOUT_ENV}");
                DEFAULT_RETRY_TIMEOUT
            },
            Duration::from_secs,
        ),
    }
}

/// Handles every connector needs, cheap to clone.
#[derive(Clone)]
pub struct Context {
    pub events: EventSender,
    pub rendezvous: Arc<dyn Rendezvous>,
    pub launcher: Arc<dyn Launcher>,
    pub settings: Arc<Settings>,
}
