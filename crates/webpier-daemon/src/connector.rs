//! One local service paired with one remote pier.
//!
//! A connector keeps a rendezvous attempt going, launches a tunnel for every
//! meeting it yields and retries after failures. Its health is derived from
//! what it holds: a stored error means broken, tracked tunnels mean burden,
//! anything else is lonely.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use webpier_core::{GlobalConfig, Handle, ServiceSpec};

use crate::context::Context;
use crate::event::{ConnectorKey, Event};
use crate::rendezvous::{Meeting, RendezvousRequest, Role};
use crate::spawner::Spawner;
use crate::tunnel::{Purpose, TunnelArgs};

struct RetryTimer {
    id: u64,
    task: JoinHandle<()>,
}

pub struct Connector {
    key: ConnectorKey,
    context: Context,
    config: Arc<GlobalConfig>,
    service: ServiceSpec,
    spawner: Option<Spawner>,
    error: String,
    tunnels: BTreeMap<u32, CancellationToken>,
    retry: Option<RetryTimer>,
    timers: u64,
}

impl Connector {
    /// Create an idle connector; nothing runs until [`Connector::restart`].
    pub fn new(
        handle: Handle,
        context: Context,
        config: Arc<GlobalConfig>,
        service: ServiceSpec,
    ) -> Self {
        let key = ConnectorKey::new(handle, service.pier.clone());
        Self {
            key,
            context,
            config,
            service,
            spawner: None,
            error: String::new(),
            tunnels: BTreeMap::new(),
            retry: None,
            timers: 0,
        }
    }

    pub const fn key(&self) -> &ConnectorKey {
        &self.key
    }

    pub const fn serial(&self) -> u64 {
        self.key.serial
    }

    pub fn peer(&self) -> &str {
        &self.key.peer
    }

    /// Last failure, empty while healthy.
    pub fn error(&self) -> &str {
        &self.error
    }

    /// Pids of the tunnels currently tracked.
    pub fn tunnels(&self) -> impl Iterator<Item = u32> + '_ {
        self.tunnels.keys().copied()
    }

    pub fn is_broken(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn is_burden(&self) -> bool {
        !self.tunnels.is_empty()
    }

    const fn is_importer(&self) -> bool {
        !self.service.local
    }

    /// Apply new settings and start a fresh attempt.
    ///
    /// An importer whose tunnel is still running keeps it and starts nothing;
    /// the next attempt begins when that tunnel exits.
    pub fn restart(&mut self, config: Arc<GlobalConfig>, service: ServiceSpec) {
        self.cancel_retry();
        self.spawner = None;
        self.config = config;
        self.service = service;
        self.error.clear();

        let request = match self.request() {
            Ok(request) => request,
            Err(e) => {
                warn!(service = %self.key.handle, peer = %self.key.peer, error = %e, "Invalid rendezvous settings");
                self.error = e.to_string();
                return;
            }
        };

        let mut spawner = Spawner::new(
            self.key.clone(),
            request,
            Arc::clone(&self.context.rendezvous),
            self.context.events.clone(),
        );

        if self.is_importer() && self.is_burden() {
            debug!(service = %self.key.handle, peer = %self.key.peer, "Tunnel running, rendezvous deferred");
        } else {
            spawner.startup();
        }
        self.spawner = Some(spawner);
    }

    fn request(&self) -> webpier_core::Result<RendezvousRequest> {
        let options = self.config.options_for(&self.service)?;
        Ok(RendezvousRequest {
            role: if self.service.local {
                Role::Accept
            } else {
                Role::Invite
            },
            local: self.config.pier.clone(),
            peer: self.key.peer.clone(),
            options,
        })
    }

    /// Apply an event addressed to this connector.
    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                attempt, meeting, ..
            } => self.on_connect(attempt, &meeting),
            Event::Fallback { attempt, error, .. } => self.on_fallback(attempt, error),
            Event::Retry { timer, .. } => self.on_retry(timer),
            Event::Exited { pid, code, .. } => self.on_exit(pid, code),
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.spawner
            .as_ref()
            .is_some_and(|spawner| spawner.is_current(attempt))
    }

    fn on_connect(&mut self, attempt: u64, meeting: &Meeting) {
        if !self.is_current(attempt) {
            debug!(peer = %self.key.peer, attempt, "Dropping meeting of a stale attempt");
            return;
        }

        let args = TunnelArgs {
            purpose: if self.service.local {
                Purpose::Export
            } else {
                Purpose::Import
            },
            address: self.service.address.clone(),
            gateway: if meeting.bind.is_empty() {
                self.service.gateway.clone()
            } else {
                meeting.bind.clone()
            },
            faraway: meeting.peer.endpoint.clone(),
            obscure: if self.service.obscure {
                meeting.obscure()
            } else {
                0
            },
            journal: self.context.settings.journal.clone(),
            logging: self.config.log.clone(),
        };

        let process = match self.context.launcher.launch(&args) {
            Ok(process) => process,
            Err(e) => {
                self.on_fallback(attempt, e.to_string());
                return;
            }
        };

        info!(
            service = %self.key.handle,
            peer = %self.key.peer,
            pid = process.pid,
            "Tunnel started"
        );

        let pid = process.pid;
        self.tunnels.insert(pid, process.cancel);

        let key = self.key.clone();
        let events = self.context.events.clone();
        let exited = process.exited;
        tokio::spawn(async move {
            let code = exited.await.ok().flatten();
            let _ = events.send(Event::Exited { key, pid, code });
        });
    }

    fn on_fallback(&mut self, attempt: u64, error: String) {
        if !self.is_current(attempt) {
            debug!(peer = %self.key.peer, attempt, "Dropping failure of a stale attempt");
            return;
        }
        if let Some(spawner) = self.spawner.as_mut() {
            spawner.stop();
        }

        let delay = self.context.settings.retry_timeout;
        warn!(
            service = %self.key.handle,
            peer = %self.key.peer,
            error = %error,
            retry_in_secs = delay.as_secs_f64(),
            "Rendezvous failed, retry scheduled"
        );
        self.error = error;

        self.cancel_retry();
        self.timers += 1;
        let id = self.timers;
        let key = self.key.clone();
        let events = self.context.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Retry { key, timer: id });
        });
        self.retry = Some(RetryTimer { id, task });
    }

    fn on_retry(&mut self, timer: u64) {
        if self.retry.as_ref().is_none_or(|retry| retry.id != timer) {
            return;
        }
        self.retry = None;
        self.error.clear();
        debug!(service = %self.key.handle, peer = %self.key.peer, "Retrying rendezvous");
        if let Some(spawner) = self.spawner.as_mut() {
            spawner.startup();
        }
    }

    fn on_exit(&mut self, pid: u32, code: Option<i32>) {
        if self.tunnels.remove(&pid).is_none() {
            return;
        }
        info!(service = %self.key.handle, peer = %self.key.peer, pid, ?code, "Tunnel finished");

        // Each import tunnel serves one negotiated path.
        if self.is_importer()
            && self.retry.is_none()
            && let Some(spawner) = self.spawner.as_mut()
        {
            spawner.startup();
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.task.abort();
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.cancel_retry();
        self.spawner = None;
        for (pid, cancel) in std::mem::take(&mut self.tunnels) {
            debug!(peer = %self.key.peer, pid, "Cancelling tunnel");
            cancel.cancel();
        }
    }
}
