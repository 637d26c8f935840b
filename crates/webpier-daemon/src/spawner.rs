//! Runs rendezvous attempts on dedicated threads.
//!
//! The traversal engine may block or loop for a long time, so every attempt
//! gets its own OS thread with a private single-threaded runtime. Results are
//! posted to the control task as events and never applied from the thread.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event::{ConnectorKey, Event, EventSender};
use crate::rendezvous::{MeetingSink, Rendezvous, RendezvousRequest};

// Attempt ids are unique per process so a replaced spawner never mistakes
// an old result for its own.
static NEXT_ATTEMPT: AtomicU64 = AtomicU64::new(1);

struct Attempt {
    id: u64,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

/// Drives rendezvous attempts for one connector.
pub struct Spawner {
    key: ConnectorKey,
    request: Arc<RendezvousRequest>,
    rendezvous: Arc<dyn Rendezvous>,
    events: EventSender,
    current: Option<Attempt>,
}

impl Spawner {
    pub fn new(
        key: ConnectorKey,
        request: RendezvousRequest,
        rendezvous: Arc<dyn Rendezvous>,
        events: EventSender,
    ) -> Self {
        Self {
            key,
            request: Arc::new(request),
            rendezvous,
            events,
            current: None,
        }
    }

    /// Start a new attempt, stopping the one in flight first.
    pub fn startup(&mut self) {
        self.stop();
        let id = NEXT_ATTEMPT.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let key = self.key.clone();
        let request = Arc::clone(&self.request);
        let rendezvous = Arc::clone(&self.rendezvous);
        let events = self.events.clone();
        let token = cancel.clone();

        info!(
            service = %key.handle,
            peer = %key.peer,
            role = %request.role,
            attempt = id,
            "Starting rendezvous"
        );

        let spawned = std::thread::Builder::new()
            .name(format!("rendezvous-{}", key.peer))
            .spawn({
                let key = key.clone();
                let events = events.clone();
                move || run_attempt(&key, id, &request, rendezvous, &events, &token)
            });

        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(e) => {
                warn!(peer = %key.peer, error = %e, "Failed to spawn rendezvous thread");
                let _ = events.send(Event::Fallback {
                    key,
                    attempt: id,
                    error: format!("Failed to spawn rendezvous thread: {e}"),
                });
                None
            }
        };

        self.current = Some(Attempt { id, cancel, thread });
    }

    /// Stop the attempt in flight and wait for its thread.
    pub fn stop(&mut self) {
        let Some(mut attempt) = self.current.take() else {
            return;
        };
        attempt.cancel.cancel();
        if let Some(thread) = attempt.thread.take()
            && thread.join().is_err()
        {
            warn!(peer = %self.key.peer, "Rendezvous thread panicked");
        }
        debug!(peer = %self.key.peer, attempt = attempt.id, "Rendezvous stopped");
    }

    /// Whether `attempt` is the one currently started.
    pub fn is_current(&self, attempt: u64) -> bool {
        self.current.as_ref().is_some_and(|a| a.id == attempt)
    }

    /// Id of the attempt currently started.
    pub fn attempt(&self) -> Option<u64> {
        self.current.as_ref().map(|a| a.id)
    }

    /// Whether an attempt has been started and not stopped.
    pub const fn is_active(&self) -> bool {
        self.current.is_some()
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_attempt(
    key: &ConnectorKey,
    attempt: u64,
    request: &RendezvousRequest,
    rendezvous: Arc<dyn Rendezvous>,
    events: &EventSender,
    cancel: &CancellationToken,
) {
    let fallback = |error: String| {
        let _ = events.send(Event::Fallback {
            key: key.clone(),
            attempt,
            error,
        });
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            fallback(format!("Failed to build rendezvous runtime: {e}"));
            return;
        }
    };

    let sink = MeetingSink::new(key.clone(), attempt, events.clone());
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.block_on(async {
            tokio::select! {
                () = cancel.cancelled() => None,
                result = rendezvous.meet(request, &sink) => Some(result),
            }
        })
    }));

    match outcome {
        Ok(None) => debug!(peer = %key.peer, attempt, "Rendezvous cancelled"),
        Ok(Some(Ok(()))) => debug!(peer = %key.peer, attempt, "Rendezvous finished"),
        Ok(Some(Err(e))) if !cancel.is_cancelled() => {
            warn!(peer = %key.peer, attempt, error = %e, "Rendezvous failed");
            fallback(e.to_string());
        }
        Ok(Some(Err(_))) => {}
        Err(_) => {
            warn!(peer = %key.peer, attempt, "Rendezvous engine panicked");
            fallback("rendezvous engine panicked".to_string());
        }
    }
}
