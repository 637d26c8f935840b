//! In-memory collaborators for unit tests.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use webpier_core::config::{GlobalConfig, RendezvousOptions};

use crate::context::{Context, Settings};
use crate::event::EventReceiver;
use crate::rendezvous::{
    Endpoint, Meeting, MeetingSink, Rendezvous, RendezvousError, RendezvousRequest, Role,
};
use crate::tunnel::{Launcher, TunnelArgs, TunnelError, TunnelProcess};

/// Scripted result of a rendezvous attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Meet the peer; `accept` then keeps waiting, `invite` returns.
    Meet,
    Fail(String),
    Hang,
    Panic,
}

pub struct ScriptedRendezvous {
    default: Outcome,
    per_peer: Mutex<HashMap<String, Outcome>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedRendezvous {
    pub fn new(default: Outcome) -> Self {
        Self {
            default,
            per_peer: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, peer: &str, outcome: Outcome) {
        self.per_peer
            .lock()
            .unwrap()
            .insert(peer.to_string(), outcome);
    }

    pub fn attempts(&self, peer: &str) -> usize {
        self.attempts.lock().unwrap().get(peer).copied().unwrap_or(0)
    }
}

pub fn meeting() -> Meeting {
    Meeting {
        bind: "0.0.0.0:40000".into(),
        host: Endpoint {
            endpoint: "198.51.100.1:40000".into(),
            puzzle: 0b1010,
        },
        peer: Endpoint {
            endpoint: "203.0.113.7:51000".into(),
            puzzle: 0b0110,
        },
    }
}

#[async_trait]
impl Rendezvous for ScriptedRendezvous {
    async fn meet(
        &self,
        request: &RendezvousRequest,
        sink: &MeetingSink,
    ) -> Result<(), RendezvousError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(request.peer.clone())
            .or_default() += 1;
        let outcome = self
            .per_peer
            .lock()
            .unwrap()
            .get(&request.peer)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        match outcome {
            Outcome::Meet => {
                sink.deliver(meeting());
                if request.role == Role::Invite {
                    return Ok(());
                }
                std::future::pending::<()>().await;
                Ok(())
            }
            Outcome::Fail(error) => Err(RendezvousError::Failed(error)),
            Outcome::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Outcome::Panic => panic!("engine exploded"),
        }
    }
}

pub fn request(peer: &str) -> RendezvousRequest {
    let global = GlobalConfig::default();
    RendezvousRequest {
        role: Role::Accept,
        local: "alice/home".into(),
        peer: peer.into(),
        options: RendezvousOptions {
            kind: global.rendezvous,
            stun: global.nat.stun,
            hops: global.nat.hops,
            dht: Some(global.dht),
            email: None,
            certificate: None,
        },
    }
}

/// Launcher handing out fake pids; a tunnel "exits" when cancelled or when
/// the test calls [`FakeLauncher::exit`].
#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    launched: Mutex<Vec<TunnelArgs>>,
    exits: Mutex<HashMap<u32, oneshot::Sender<i32>>>,
    fail: Mutex<Option<String>>,
}

impl FakeLauncher {
    pub fn launched(&self) -> Vec<TunnelArgs> {
        self.launched.lock().unwrap().clone()
    }

    pub fn fail_with(&self, reason: &str) {
        *self.fail.lock().unwrap() = Some(reason.to_string());
    }

    /// Make tunnel `pid` exit on its own with `code`.
    pub fn exit(&self, pid: u32, code: i32) {
        if let Some(tx) = self.exits.lock().unwrap().remove(&pid) {
            let _ = tx.send(code);
        }
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, args: &TunnelArgs) -> Result<TunnelProcess, TunnelError> {
        if let Some(reason) = self.fail.lock().unwrap().clone() {
            return Err(TunnelError::LaunchFailed { reason });
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.launched.lock().unwrap().push(args.clone());

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (manual_tx, manual_rx) = oneshot::channel::<i32>();
        self.exits.lock().unwrap().insert(pid, manual_tx);

        let token = cancel.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                () = token.cancelled() => None,
                code = manual_rx => code.ok(),
            };
            let _ = exit_tx.send(code);
        });

        Ok(TunnelProcess {
            pid,
            cancel,
            exited: exit_rx,
        })
    }
}

pub struct Harness {
    pub context: Context,
    pub events: EventReceiver,
    pub rendezvous: Arc<ScriptedRendezvous>,
    pub launcher: Arc<FakeLauncher>,
}

pub fn harness(outcome: Outcome, retry: Duration) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let rendezvous = Arc::new(ScriptedRendezvous::new(outcome));
    let launcher = Arc::new(FakeLauncher::default());
    let settings = Settings::new(PathBuf::from("/tmp/webpier-journal")).with_retry_timeout(retry);
    let context = Context {
        events: tx,
        rendezvous: Arc::clone(&rendezvous) as Arc<dyn Rendezvous>,
        launcher: Arc::clone(&launcher) as Arc<dyn Launcher>,
        settings: Arc::new(settings),
    };
    Harness {
        context,
        events: rx,
        rendezvous,
        launcher,
    }
}
