//! Local control server.
//!
//! One control task owns the [`Engine`]. Connection tasks read request lines
//! and hand them over through a channel together with a reply slot, so the
//! engine is never shared between tasks.

use std::path::Path;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use webpier_core::ipc::{IpcListener, ServerStream};

use crate::engine::Engine;
use crate::event::EventReceiver;

/// How long the server lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RunMode {
    /// Serve until signalled.
    Steady,
    /// Serve until the last client disconnects.
    Session,
}

struct Request {
    line: String,
    reply: oneshot::Sender<String>,
}

pub struct Server {
    listener: IpcListener,
    mode: RunMode,
}

impl Server {
    /// Bind the control endpoint, replacing a stale one.
    pub fn bind(endpoint: &Path, mode: RunMode) -> webpier_core::Result<Self> {
        let listener = IpcListener::bind(endpoint)?;
        info!(path = %endpoint.display(), ?mode, "Control server listening");
        Ok(Self { listener, mode })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Serve until shutdown is signalled or, in session mode, until the last
    /// connection closes. Every service is suspended on the way out and the
    /// endpoint is removed.
    pub async fn run(
        mut self,
        mut engine: Engine,
        mut events: EventReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(64);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<u64>();
        let mut active = 0usize;
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(stream) => {
                        next_id += 1;
                        active += 1;
                        debug!(conn = next_id, active, "Client connected");
                        tokio::spawn(serve_connection(
                            next_id,
                            stream,
                            request_tx.clone(),
                            closed_tx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(request) = request_rx.recv() => {
                    let response = engine.comply(&request.line);
                    let _ = request.reply.send(response);
                }
                Some(event) = events.recv() => engine.handle_event(event),
                Some(conn) = closed_rx.recv() => {
                    active = active.saturating_sub(1);
                    debug!(conn, active, "Client disconnected");
                    if self.mode == RunMode::Session && active == 0 {
                        info!("Last client gone, ending session");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        engine.shutdown();
        drop(self.listener);
        info!("Control server stopped");
    }
}

async fn serve_connection(
    id: u64,
    mut stream: ServerStream,
    requests: mpsc::Sender<Request>,
    closed: mpsc::UnboundedSender<u64>,
) {
    loop {
        let line = match stream.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(conn = id, error = %e, "Read failed");
                break;
            }
        };

        let (reply, response) = oneshot::channel();
        if requests.send(Request { line, reply }).await.is_err() {
            break;
        }
        let Ok(response) = response.await else {
            break;
        };

        if let Err(e) = stream.write_line(&response).await {
            debug!(conn = id, error = %e, "Write failed");
            break;
        }
    }
    let _ = closed.send(id);
}
