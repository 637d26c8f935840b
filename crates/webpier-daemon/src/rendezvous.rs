//! Seam to the external NAT-traversal engine.
//!
//! An attempt is driven through [`Rendezvous::meet`]. Each time the engine
//! has punched a path to the peer it hands a [`Meeting`] to the sink; an
//! `invite` yields at most one meeting, an `accept` may yield several before
//! it ends. Returning an error reports the attempt as failed.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use webpier_core::config::RendezvousOptions;

use crate::event::{ConnectorKey, Event, EventSender};

/// Side of the rendezvous taken by the local pier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Wait for importers of an exported service.
    Accept,
    /// Reach out to the exporter of an imported service.
    Invite,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Invite => "invite",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public endpoint of one side together with its puzzle value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub endpoint: String,
    #[serde(default)]
    pub puzzle: u64,
}

/// Outcome of a successful rendezvous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    /// Local UDP endpoint the tunnel must bind.
    pub bind: String,
    /// Local side as seen from outside.
    pub host: Endpoint,
    /// Remote side.
    pub peer: Endpoint,
}

impl Meeting {
    /// Shared obscuring value derived from both puzzles.
    pub const fn obscure(&self) -> u64 {
        self.host.puzzle ^ self.peer.puzzle
    }
}

/// Parameters of one attempt.
#[derive(Debug, Clone)]
pub struct RendezvousRequest {
    pub role: Role,
    /// Local pier identity.
    pub local: String,
    /// Remote pier identity.
    pub peer: String,
    pub options: RendezvousOptions,
}

/// Receiver for meetings produced by an attempt.
pub struct MeetingSink {
    key: ConnectorKey,
    attempt: u64,
    events: EventSender,
}

impl MeetingSink {
    pub(crate) const fn new(key: ConnectorKey, attempt: u64, events: EventSender) -> Self {
        Self {
            key,
            attempt,
            events,
        }
    }

    /// Hand a meeting over to the control task.
    pub fn deliver(&self, meeting: Meeting) {
        let event = Event::Connected {
            key: self.key.clone(),
            attempt: self.attempt,
            meeting,
        };
        if self.events.send(event).is_err() {
            debug!(peer = %self.key.peer, "Control task gone, dropping meeting");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("{0}")]
    Failed(String),

    #[error("Rendezvous protocol error: {0}")]
    Protocol(String),

    #[error("Rendezvous I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External NAT-traversal engine.
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Run one attempt until it fails, ends, or the future is dropped.
    async fn meet(
        &self,
        request: &RendezvousRequest,
        sink: &MeetingSink,
    ) -> Result<(), RendezvousError>;
}

/// Engine running as a helper program.
///
/// Invoked as `<program> accept|invite <local> <peer>` with the option set as
/// JSON on stdin. Every stdout line is one [`Meeting`]. The helper is killed
/// when the attempt is stopped.
#[derive(Debug, Clone)]
pub struct CommandRendezvous {
    program: PathBuf,
}

impl CommandRendezvous {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Rendezvous for CommandRendezvous {
    async fn meet(
        &self,
        request: &RendezvousRequest,
        sink: &MeetingSink,
    ) -> Result<(), RendezvousError> {
        let mut child = Command::new(&self.program)
            .arg(request.role.as_str())
            .arg(&request.local)
            .arg(&request.peer)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RendezvousError::Failed(format!(
                    "Failed to start {}: {e}",
                    self.program.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let options = serde_json::to_vec(&request.options)
                .map_err(|e| RendezvousError::Protocol(e.to_string()))?;
            // A helper that ignores its options may exit before reading them.
            match stdin.write_all(&options).await {
                Ok(()) => stdin.shutdown().await?,
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(peer = %request.peer, "Rendezvous helper closed stdin");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let stderr = child.stderr.take().map(|stderr| {
            let peer = request.peer.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%peer, "rendezvous: {}", line);
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
                last
            })
        });

        let mut met = 0_usize;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let meeting: Meeting = serde_json::from_str(&line)
                    .map_err(|e| RendezvousError::Protocol(format!("Bad meeting line: {e}")))?;
                sink.deliver(meeting);
                met += 1;
                if request.role == Role::Invite {
                    break;
                }
            }
        }

        if request.role == Role::Invite && met > 0 {
            return Ok(());
        }

        let status = child.wait().await?;
        let last_error = match stderr {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };
        warn!(
            peer = %request.peer,
            role = %request.role,
            ?status,
            "Rendezvous helper exited"
        );
        Err(RendezvousError::Failed(last_error.unwrap_or_else(|| {
            format!("rendezvous ended with {status}")
        })))
    }
}
