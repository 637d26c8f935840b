//! Daemon connection client.
//!
//! Talks to the webpier-daemon over its local control endpoint, one request
//! line and one response line at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use webpier_core::ipc::{self, ClientStream};
use webpier_core::{Action, Handle, Health, Message, Payload, Report};

/// Reconnection policy for reaching the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, doubled after each one.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Whether another attempt should be made after `attempt` failures.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Control endpoint of the daemon.
    pub endpoint: PathBuf,
    pub retry: RetryPolicy,
    /// Time allowed for one request and its response.
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    /// Configuration for the daemon serving `home`.
    pub fn for_home(home: &Path) -> Self {
        Self {
            endpoint: ipc::endpoint_path(home),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Cannot reach daemon at {}: {source}", endpoint.display())]
    Connect {
        endpoint: PathBuf,
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] webpier_core::Error),

    #[error("Daemon did not answer within {0:?}")]
    Timeout(Duration),

    #[error("{action} rejected: {message}")]
    Rejected { action: Action, message: String },

    #[error("Unexpected response to {action}: {payload}")]
    Unexpected { action: Action, payload: String },
}

/// Client connection to the daemon.
///
/// The connection is opened on the first request and dropped after a
/// transport error or a timeout; the next request reconnects.
pub struct ControlClient {
    config: ConnectionConfig,
    stream: Option<ClientStream>,
}

impl ControlClient {
    /// Create a client (not yet connected).
    pub const fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    /// Connect now, retrying per the configured policy.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let mut client = Self::new(config);
        client.stream = Some(client.open().await?);
        Ok(client)
    }

    /// Replace the configuration used from now on.
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn open(&self) -> Result<ClientStream, ClientError> {
        let endpoint = &self.config.endpoint;
        let mut attempt = 0;
        loop {
            match ipc::connect(endpoint).await {
                Ok(stream) => {
                    debug!(endpoint = %endpoint.display(), attempt, "Connected to daemon");
                    return Ok(stream);
                }
                Err(e) => {
                    attempt += 1;
                    if !self.config.retry.should_retry(attempt) {
                        return Err(ClientError::Connect {
                            endpoint: endpoint.clone(),
                            source: e,
                        });
                    }
                    let delay = self.config.retry.delay_for_attempt(attempt - 1);
                    debug!(error = %e, attempt, delay_ms = delay.as_millis(), "Daemon not reachable, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A response carrying an error is returned as [`ClientError::Rejected`].
    pub async fn request(&mut self, request: &Message) -> Result<Message, ClientError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.open().await?,
        };

        let timeout = self.config.request_timeout;
        let response = tokio::time::timeout(timeout, stream.exchange(request))
            .await
            .map_err(|_| {
                warn!(action = %request.action, "Request timed out, dropping connection");
                ClientError::Timeout(timeout)
            })??;
        self.stream = Some(stream);

        if !response.ok() {
            return Err(ClientError::Rejected {
                action: response.action,
                message: response.error().unwrap_or_default().to_string(),
            });
        }
        Ok(response)
    }

    async fn command(
        &mut self,
        action: Action,
        handle: Option<&Handle>,
    ) -> Result<Message, ClientError> {
        let request = match handle {
            Some(handle) => Message::with_handle(action, handle.clone()),
            None => Message::request(action),
        };
        self.request(&request).await
    }

    /// Health of one service, or of every service known to the daemon.
    pub async fn status(&mut self, handle: Option<&Handle>) -> Result<Vec<Health>, ClientError> {
        let response = self.command(Action::Status, handle).await?;
        match response.payload {
            Payload::Health(health) => Ok(vec![health]),
            Payload::HealthList(list) => Ok(list),
            other => Err(unexpected(Action::Status, &other)),
        }
    }

    /// Health and tunnels of one service, or of every service.
    pub async fn review(&mut self, handle: Option<&Handle>) -> Result<Vec<Report>, ClientError> {
        let response = self.command(Action::Review, handle).await?;
        match response.payload {
            Payload::Report(report) => Ok(vec![report]),
            Payload::ReportList(list) => Ok(list),
            other => Err(unexpected(Action::Review, &other)),
        }
    }

    pub async fn engage(&mut self, handle: Option<&Handle>) -> Result<(), ClientError> {
        self.command(Action::Engage, handle).await.map(drop)
    }

    pub async fn adjust(&mut self, handle: Option<&Handle>) -> Result<(), ClientError> {
        self.command(Action::Adjust, handle).await.map(drop)
    }

    pub async fn unplug(&mut self, handle: Option<&Handle>) -> Result<(), ClientError> {
        self.command(Action::Unplug, handle).await.map(drop)
    }
}

fn unexpected(action: Action, payload: &Payload) -> ClientError {
    ClientError::Unexpected {
        action,
        payload: format!("{payload:?}"),
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use webpier_core::ipc::IpcListener;
    use webpier_core::State;

    use super::*;

    fn config(dir: &TempDir) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: dir.path().join("control.sock"),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
            },
            request_timeout: Duration::from_millis(200),
        }
    }

    /// Answer every request with `reply`.
    async fn serve(mut listener: IpcListener, reply: Message) {
        let mut stream = listener.accept().await.unwrap();
        while let Ok(Some(_)) = stream.recv().await {
            stream.send(&reply).await.unwrap();
        }
    }

    #[test]
    fn retry_policy_doubles_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn config_for_home_uses_shared_endpoint() {
        let config = ConnectionConfig::for_home(Path::new("/home/alice/.webpier"));
        assert_eq!(
            config.endpoint,
            ipc::endpoint_path(Path::new("/home/alice/.webpier"))
        );
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[tokio::test]
    async fn connect_gives_up_after_retries() {
        let dir = TempDir::new().unwrap();
        let err = ControlClient::connect(config(&dir)).await.err().unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[tokio::test]
    async fn status_returns_health_list() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let listener = IpcListener::bind(&config.endpoint).unwrap();
        let health = Health {
            handle: Handle::new("alice/home", "web"),
            state: State::Burden,
            message: String::new(),
        };
        tokio::spawn(serve(
            listener,
            Message::new(Action::Status, Payload::HealthList(vec![health.clone()])),
        ));

        let mut client = ControlClient::connect(config).await.unwrap();
        assert_eq!(client.status(None).await.unwrap(), vec![health]);
    }

    #[tokio::test]
    async fn error_payload_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let listener = IpcListener::bind(&config.endpoint).unwrap();
        tokio::spawn(serve(
            listener,
            Message::failure(Action::Engage, "wrong service"),
        ));

        let mut client = ControlClient::connect(config).await.unwrap();
        let handle = Handle::new("alice/home", "gone");
        match client.engage(Some(&handle)).await {
            Err(ClientError::Rejected { action, message }) => {
                assert_eq!(action, Action::Engage);
                assert_eq!(message, "wrong service");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_daemon_times_out() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut listener = IpcListener::bind(&config.endpoint).unwrap();
        tokio::spawn(async move {
            let _stream = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let mut client = ControlClient::connect(config).await.unwrap();
        let err = client.unplug(None).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(client.stream.is_none());
    }
}
