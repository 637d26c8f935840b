//! Events posted to the control task.
//!
//! Spawner threads, retry timers and tunnel exit watchers never touch
//! connector state directly: they post an [`Event`] and the engine applies it
//! on the control task.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use webpier_core::Handle;

use crate::rendezvous::Meeting;

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Address of one connector instance.
///
/// `serial` differs between a connector and its replacement for the same
/// peer, so events aimed at a torn-down connector are recognised as stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectorKey {
    pub handle: Handle,
    pub peer: String,
    pub serial: u64,
}

impl ConnectorKey {
    pub fn new(handle: Handle, peer: impl Into<String>) -> Self {
        Self {
            handle,
            peer: peer.into(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub enum Event {
    /// A rendezvous attempt met the peer.
    Connected {
        key: ConnectorKey,
        attempt: u64,
        meeting: Meeting,
    },
    /// A rendezvous attempt failed.
    Fallback {
        key: ConnectorKey,
        attempt: u64,
        error: String,
    },
    /// The retry timer armed after a failure fired.
    Retry { key: ConnectorKey, timer: u64 },
    /// A tunnel child exited.
    Exited {
        key: ConnectorKey,
        pid: u32,
        code: Option<i32>,
    },
}

impl Event {
    pub const fn key(&self) -> &ConnectorKey {
        match self {
            Self::Connected { key, .. }
            | Self::Fallback { key, .. }
            | Self::Retry { key, .. }
            | Self::Exited { key, .. } => key,
        }
    }
}
