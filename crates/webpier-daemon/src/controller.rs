//! Connectors of one declared service, one per target pier.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use webpier_core::{GlobalConfig, Handle, Health, Report, ServiceSpec, State, Tunnel};

use crate::connector::Connector;
use crate::context::Context;
use crate::event::ConnectorKey;

pub struct Controller {
    handle: Handle,
    context: Context,
    connectors: BTreeMap<String, Connector>,
}

impl Controller {
    /// Create an asleep controller.
    pub const fn new(handle: Handle, context: Context) -> Self {
        Self {
            handle,
            context,
            connectors: BTreeMap::new(),
        }
    }

    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Reconcile connectors with the piers listed by `service` and restart
    /// every one of them.
    pub fn restart(&mut self, config: &Arc<GlobalConfig>, service: &ServiceSpec) {
        let peers = service.peers();
        self.connectors.retain(|peer, _| {
            let keep = peers.contains(peer.as_str());
            if !keep {
                debug!(service = %self.handle, peer = %peer, "Dropping connector");
            }
            keep
        });

        for peer in peers {
            let single = service.for_peer(peer);
            match self.connectors.get_mut(peer) {
                Some(connector) => connector.restart(Arc::clone(config), single),
                None => {
                    let mut connector = Connector::new(
                        self.handle.clone(),
                        self.context.clone(),
                        Arc::clone(config),
                        single.clone(),
                    );
                    connector.restart(Arc::clone(config), single);
                    self.connectors.insert(peer.to_string(), connector);
                }
            }
        }
    }

    /// Drop every connector.
    pub fn suspend(&mut self) {
        if !self.connectors.is_empty() {
            debug!(service = %self.handle, "Suspending");
        }
        self.connectors.clear();
    }

    pub fn is_asleep(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn state(&self) -> State {
        if self.connectors.values().any(Connector::is_broken) {
            State::Broken
        } else if self.connectors.values().any(Connector::is_burden) {
            State::Burden
        } else if self.connectors.is_empty() {
            State::Asleep
        } else {
            State::Lonely
        }
    }

    /// First connector error, empty when none failed.
    pub fn message(&self) -> String {
        self.connectors
            .values()
            .map(Connector::error)
            .find(|error| !error.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.connectors
            .values()
            .flat_map(|connector| {
                connector.tunnels().map(|pid| Tunnel {
                    pid,
                    pier: connector.peer().to_string(),
                })
            })
            .collect()
    }

    pub fn health(&self) -> Health {
        Health {
            handle: self.handle.clone(),
            state: self.state(),
            message: self.message(),
        }
    }

    pub fn report(&self) -> Report {
        Report {
            health: self.health(),
            tunnels: self.tunnels(),
        }
    }

    /// Connector addressed by `key`, if it is still the same instance.
    pub fn connector_mut(&mut self, key: &ConnectorKey) -> Option<&mut Connector> {
        self.connectors
            .get_mut(&key.peer)
            .filter(|connector| connector.serial() == key.serial)
    }
}
