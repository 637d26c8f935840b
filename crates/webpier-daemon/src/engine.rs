//! Service pool and the control operations.
//!
//! The engine is owned by the control task. Every configuration-dependent
//! operation reloads the repository under the configuration lock, so edits
//! made by other tools are picked up without restarting the daemon. A failed
//! reload leaves the pool as it was.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webpier_core::lock::FileLock;
use webpier_core::{Action, Handle, Health, Message, Payload, Report, Repository, Snapshot};

use crate::context::{Context, Settings};
use crate::controller::Controller;
use crate::event::{Event, EventReceiver};
use crate::rendezvous::Rendezvous;
use crate::tunnel::Launcher;

/// Sent when a response cannot be encoded.
const INTERNAL_ERROR_LINE: &str = "{\"action\":0,\"error\":\"internal error\"}\n";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("wrong service")]
    WrongService,

    #[error("unknown service")]
    UnknownService,

    #[error("{0}")]
    Config(#[from] webpier_core::Error),

    #[error("bad request: {0}")]
    BadRequest(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub struct Engine {
    repo: Repository,
    context: Context,
    pool: BTreeMap<Handle, Controller>,
}

impl Engine {
    /// Create an engine and the receiver of the events its connectors post.
    pub fn new(
        repo: Repository,
        rendezvous: Arc<dyn Rendezvous>,
        launcher: Arc<dyn Launcher>,
        settings: Settings,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let context = Context {
            events,
            rendezvous,
            launcher,
            settings: Arc::new(settings),
        };
        let engine = Self {
            repo,
            context,
            pool: BTreeMap::new(),
        };
        (engine, receiver)
    }

    fn reload(&self) -> Result<(FileLock, Snapshot)> {
        let lock = self.repo.lock()?;
        let snapshot = self.repo.load()?;
        Ok((lock, snapshot))
    }

    fn controller(&mut self, handle: Handle) -> &mut Controller {
        let context = &self.context;
        self.pool
            .entry(handle.clone())
            .or_insert_with(|| Controller::new(handle, context.clone()))
    }

    fn drop_undeclared(&mut self, snapshot: &Snapshot) {
        self.pool.retain(|handle, _| {
            let declared = snapshot.contains(handle);
            if !declared {
                info!(service = %handle, "Service no longer declared");
            }
            declared
        });
    }

    /// Start autostart services, put the others to sleep.
    pub fn engage_all(&mut self) -> Result<()> {
        let (_lock, snapshot) = self.reload()?;
        let config = Arc::new(snapshot.global.clone());
        self.drop_undeclared(&snapshot);
        for (handle, service) in snapshot.declared() {
            let controller = self.controller(handle);
            if service.autostart {
                controller.restart(&config, service);
            } else if !controller.is_asleep() {
                controller.suspend();
            }
        }
        Ok(())
    }

    /// Apply configuration changes without waking asleep services.
    pub fn adjust_all(&mut self) -> Result<()> {
        let (_lock, snapshot) = self.reload()?;
        let config = Arc::new(snapshot.global.clone());
        self.drop_undeclared(&snapshot);
        for (handle, service) in snapshot.declared() {
            let known = self.pool.contains_key(&handle);
            let controller = self.controller(handle);
            if known {
                if !controller.is_asleep() {
                    controller.restart(&config, service);
                }
            } else if service.autostart {
                controller.restart(&config, service);
            }
        }
        Ok(())
    }

    /// Put every declared service to sleep.
    pub fn unplug_all(&mut self) -> Result<()> {
        let (_lock, snapshot) = self.reload()?;
        self.drop_undeclared(&snapshot);
        for (handle, _) in snapshot.declared() {
            self.controller(handle).suspend();
        }
        Ok(())
    }

    /// Start `handle` regardless of `autostart`.
    pub fn engage(&mut self, handle: &Handle) -> Result<()> {
        let (_lock, snapshot) = self.reload()?;
        let Some(service) = snapshot.find(handle) else {
            self.pool.remove(handle);
            return Err(EngineError::WrongService);
        };
        let config = Arc::new(snapshot.global.clone());
        self.controller(handle.clone()).restart(&config, service);
        Ok(())
    }

    /// Apply configuration changes to `handle`.
    pub fn adjust(&mut self, handle: &Handle) -> Result<()> {
        let (_lock, snapshot) = self.reload()?;
        let Some(service) = snapshot.find(handle) else {
            self.pool.remove(handle);
            return Ok(());
        };
        let config = Arc::new(snapshot.global.clone());
        match self.pool.get_mut(handle) {
            Some(controller) if !controller.is_asleep() => controller.restart(&config, service),
            Some(_) => {}
            None => {
                let controller = self.controller(handle.clone());
                if service.autostart {
                    controller.restart(&config, service);
                }
            }
        }
        Ok(())
    }

    /// Put `handle` to sleep.
    pub fn unplug(&mut self, handle: &Handle) -> Result<()> {
        let (_lock, snapshot) = self.reload()?;
        if !snapshot.contains(handle) {
            self.pool.remove(handle);
            return Ok(());
        }
        if let Some(controller) = self.pool.get_mut(handle) {
            controller.suspend();
        }
        Ok(())
    }

    pub fn status_all(&self) -> Vec<Health> {
        self.pool.values().map(Controller::health).collect()
    }

    pub fn status(&self, handle: &Handle) -> Result<Health> {
        self.pool
            .get(handle)
            .map(Controller::health)
            .ok_or(EngineError::UnknownService)
    }

    pub fn review_all(&self) -> Vec<Report> {
        self.pool.values().map(Controller::report).collect()
    }

    pub fn review(&self, handle: &Handle) -> Result<Report> {
        self.pool
            .get(handle)
            .map(Controller::report)
            .ok_or(EngineError::UnknownService)
    }

    /// Answer one encoded request with one encoded response.
    pub fn comply(&mut self, line: &str) -> String {
        let response = match Message::decode(line) {
            Ok(request) => self.dispatch(&request),
            Err(e) => {
                debug!(error = %e, "Undecodable request");
                Message::failure(Action::Naught, e.to_string())
            }
        };
        response.encode().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode response");
            INTERNAL_ERROR_LINE.to_string()
        })
    }

    /// Execute a decoded request; failures become error payloads.
    pub fn dispatch(&mut self, request: &Message) -> Message {
        let action = request.action;
        match self.execute(action, &request.payload) {
            Ok(payload) => Message::new(action, payload),
            Err(e) => {
                debug!(%action, error = %e, "Request failed");
                Message::failure(action, e.to_string())
            }
        }
    }

    fn execute(&mut self, action: Action, payload: &Payload) -> Result<Payload> {
        let done = |()| Payload::Empty;
        match (action, payload) {
            (Action::Naught, _) => Err(EngineError::BadRequest("no action".into())),
            (Action::Engage, Payload::Empty) => self.engage_all().map(done),
            (Action::Engage, Payload::Handle(handle)) => self.engage(handle).map(done),
            (Action::Adjust, Payload::Empty) => self.adjust_all().map(done),
            (Action::Adjust, Payload::Handle(handle)) => self.adjust(handle).map(done),
            (Action::Unplug, Payload::Empty) => self.unplug_all().map(done),
            (Action::Unplug, Payload::Handle(handle)) => self.unplug(handle).map(done),
            (Action::Status, Payload::Empty) => Ok(Payload::HealthList(self.status_all())),
            (Action::Status, Payload::Handle(handle)) => self.status(handle).map(Payload::Health),
            (Action::Review, Payload::Empty) => Ok(Payload::ReportList(self.review_all())),
            (Action::Review, Payload::Handle(handle)) => self.review(handle).map(Payload::Report),
            (action, _) => Err(EngineError::BadRequest(format!(
                "unexpected payload for {action}"
            ))),
        }
    }

    /// Route an event to the connector it belongs to.
    pub fn handle_event(&mut self, event: Event) {
        let key = event.key();
        let Some(connector) = self
            .pool
            .get_mut(&key.handle)
            .and_then(|controller| controller.connector_mut(key))
        else {
            debug!(service = %key.handle, peer = %key.peer, "Discarding event for a gone connector");
            return;
        };
        connector.on_event(event);
    }

    /// Suspend every service.
    pub fn shutdown(&mut self) {
        info!(services = self.pool.len(), "Suspending all services");
        self.pool.clear();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;
    use webpier_core::config::{CONFIG_FILE, LOCK_FILE};
    use webpier_core::{GlobalConfig, ServiceSpec, State};

    use super::*;
    use crate::testing::{FakeLauncher, Outcome, ScriptedRendezvous};

    const PIER: &str = "alice/home";

    struct Fixture {
        _home: TempDir,
        repo: Repository,
        engine: Engine,
        events: EventReceiver,
        rendezvous: Arc<ScriptedRendezvous>,
    }

    fn service(name: &str, pier: &str, autostart: bool) -> ServiceSpec {
        ServiceSpec {
            local: true,
            name: name.into(),
            pier: pier.into(),
            address: "127.0.0.1:8080".into(),
            gateway: String::new(),
            rendezvous: String::new(),
            autostart,
            obscure: false,
        }
    }

    fn fixture(outcome: Outcome, services: &[ServiceSpec]) -> Fixture {
        let home = TempDir::new().unwrap();
        let repo = Repository::open(home.path());
        repo.save_global(&GlobalConfig {
            pier: PIER.into(),
            ..GlobalConfig::default()
        })
        .unwrap();
        repo.save_services(PIER, services).unwrap();

        let rendezvous = Arc::new(ScriptedRendezvous::new(outcome));
        let settings = Settings::new(home.path().join("journal"))
            .with_retry_timeout(Duration::from_secs(60));
        let (engine, events) = Engine::new(
            repo.clone(),
            Arc::clone(&rendezvous) as Arc<dyn Rendezvous>,
            Arc::new(FakeLauncher::default()),
            settings,
        );
        Fixture {
            _home: home,
            repo,
            engine,
            events,
            rendezvous,
        }
    }

    fn handle(name: &str) -> Handle {
        Handle::new(PIER, name)
    }

    fn state(engine: &Engine, name: &str) -> State {
        engine.status(&handle(name)).unwrap().state
    }

    async fn pump(f: &mut Fixture, count: usize) {
        for _ in 0..count {
            let event = tokio::time::timeout(Duration::from_secs(5), f.events.recv())
                .await
                .unwrap()
                .unwrap();
            f.engine.handle_event(event);
        }
    }

    #[tokio::test]
    async fn engage_all_starts_autostart_services_only() {
        let mut f = fixture(
            Outcome::Hang,
            &[service("web", "bob/work", true), service("db", "bob/work", false)],
        );
        f.engine.engage_all().unwrap();
        assert_eq!(state(&f.engine, "web"), State::Lonely);
        assert_eq!(state(&f.engine, "db"), State::Asleep);
        assert_eq!(f.engine.status_all().len(), 2);
    }

    #[tokio::test]
    async fn unplug_all_puts_everything_to_sleep() {
        let mut f = fixture(
            Outcome::Hang,
            &[service("web", "bob/work", true), service("db", "bob/work", false)],
        );
        f.engine.engage_all().unwrap();
        f.engine.unplug_all().unwrap();
        assert_eq!(state(&f.engine, "web"), State::Asleep);
        assert_eq!(state(&f.engine, "db"), State::Asleep);
    }

    #[tokio::test]
    async fn adjust_leaves_asleep_service_asleep() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        f.engine.unplug_all().unwrap();
        f.engine.adjust(&handle("web")).unwrap();
        assert_eq!(state(&f.engine, "web"), State::Asleep);
        f.engine.adjust_all().unwrap();
        assert_eq!(state(&f.engine, "web"), State::Asleep);
    }

    #[tokio::test]
    async fn adjust_restarts_running_service() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", false)]);
        f.engine.engage(&handle("web")).unwrap();
        f.repo
            .save_services(PIER, &[service("web", "bob/work carol/lab", false)])
            .unwrap();
        f.engine.adjust(&handle("web")).unwrap();
        assert_eq!(state(&f.engine, "web"), State::Lonely);
        assert_eq!(f.rendezvous.attempts("bob/work"), 2);
        assert_eq!(f.rendezvous.attempts("carol/lab"), 1);
    }

    #[tokio::test]
    async fn adjust_of_new_service_honours_autostart() {
        let mut f = fixture(
            Outcome::Hang,
            &[service("web", "bob/work", true), service("db", "bob/work", false)],
        );
        f.engine.adjust(&handle("web")).unwrap();
        f.engine.adjust(&handle("db")).unwrap();
        assert_eq!(state(&f.engine, "web"), State::Lonely);
        assert_eq!(state(&f.engine, "db"), State::Asleep);
    }

    #[tokio::test]
    async fn engage_of_undeclared_service_fails_and_forgets_it() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        f.engine.engage(&handle("web")).unwrap();
        f.repo.save_services(PIER, &[]).unwrap();

        let err = f.engine.engage(&handle("web")).unwrap_err();
        assert_eq!(err.to_string(), "wrong service");
        let err = f.engine.status(&handle("web")).unwrap_err();
        assert_eq!(err.to_string(), "unknown service");
    }

    #[tokio::test]
    async fn unplug_and_adjust_of_undeclared_service_succeed() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        f.engine.engage_all().unwrap();
        f.repo.save_services(PIER, &[]).unwrap();
        f.engine.unplug(&handle("web")).unwrap();
        assert!(f.engine.status(&handle("web")).is_err());
        f.engine.adjust(&handle("web")).unwrap();
        assert!(f.engine.status_all().is_empty());
    }

    #[tokio::test]
    async fn exported_service_reports_tunnel_per_peer() {
        let mut f = fixture(Outcome::Meet, &[service("foo", "peerA peerB", true)]);
        f.engine.engage_all().unwrap();
        pump(&mut f, 2).await;

        let report = f.engine.review(&handle("foo")).unwrap();
        assert_eq!(report.health.state, State::Burden);
        let mut peers: Vec<_> = report.tunnels.iter().map(|t| t.pier.clone()).collect();
        peers.sort();
        assert_eq!(peers, vec!["peerA", "peerB"]);

        f.engine.unplug_all().unwrap();
        assert!(f.engine.review_all().iter().all(|r| r.tunnels.is_empty()));
        // Exit notices of the cancelled tunnels are discarded.
        pump(&mut f, 2).await;
        assert_eq!(state(&f.engine, "foo"), State::Asleep);
    }

    #[tokio::test]
    async fn failing_peer_reports_broken_with_message() {
        let mut f = fixture(Outcome::Meet, &[service("foo", "peerA peerB", true)]);
        f.rendezvous.set("peerB", Outcome::Fail("peer offline".into()));
        f.engine.engage_all().unwrap();
        pump(&mut f, 2).await;

        let health = f.engine.status(&handle("foo")).unwrap();
        assert_eq!(health.state, State::Broken);
        assert_eq!(health.message, "peer offline");
    }

    #[tokio::test]
    async fn failed_reload_keeps_pool() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        f.engine.engage_all().unwrap();
        std::fs::write(f.repo.home().join(PIER).join("webpier.json"), "not json").unwrap();

        assert!(f.engine.engage_all().is_err());
        assert_eq!(state(&f.engine, "web"), State::Lonely);
    }

    #[tokio::test]
    async fn mutating_operations_wait_for_config_lock() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        let repo = f.repo.clone();
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let editor = std::thread::spawn(move || {
            let guard = repo.lock().unwrap();
            held_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
            drop(guard);
        });

        held_rx.recv().unwrap();
        f.engine.engage_all().unwrap();
        assert!(released.load(Ordering::SeqCst));
        editor.join().unwrap();
        assert_eq!(state(&f.engine, "web"), State::Lonely);
    }

    #[tokio::test]
    async fn failed_reload_releases_config_lock() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        std::fs::write(f.repo.home().join(PIER).join(CONFIG_FILE), "not json").unwrap();
        let lock_path = f.repo.home().join(LOCK_FILE);

        assert!(f.engine.engage(&handle("web")).is_err());
        assert!(FileLock::try_acquire(&lock_path).unwrap().is_some());
        assert!(f.engine.adjust_all().is_err());
        assert!(FileLock::try_acquire(&lock_path).unwrap().is_some());
        assert!(f.engine.unplug(&handle("web")).is_err());
        assert!(FileLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[tokio::test]
    async fn comply_answers_every_request() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);

        let reply = Message::decode(&f.engine.comply("{\"action\":2}")).unwrap();
        assert_eq!(reply.action, Action::Engage);
        assert!(reply.ok());

        let line = r#"{"action":4,"handle":{"pier":"alice/home","service":"web"}}"#;
        let reply = Message::decode(&f.engine.comply(line)).unwrap();
        match reply.payload {
            Payload::Health(health) => assert_eq!(health.state, State::Lonely),
            other => panic!("unexpected payload {other:?}"),
        }

        let line = r#"{"action":5,"handle":{"pier":"alice/home","service":"nope"}}"#;
        let reply = Message::decode(&f.engine.comply(line)).unwrap();
        assert_eq!(reply.action, Action::Review);
        assert_eq!(reply.error(), Some("unknown service"));

        let reply = Message::decode(&f.engine.comply("garbage")).unwrap();
        assert_eq!(reply.action, Action::Naught);
        assert!(!reply.ok());

        let reply = Message::decode(&f.engine.comply("{\"action\":0}")).unwrap();
        assert!(!reply.ok());

        let reply = Message::decode(&f.engine.comply(r#"{"action":2,"error":""}"#)).unwrap();
        assert!(reply.error().is_some_and(|e| e.contains("unexpected payload")));
    }

    #[tokio::test]
    async fn shutdown_empties_pool() {
        let mut f = fixture(Outcome::Hang, &[service("web", "bob/work", true)]);
        f.engine.engage_all().unwrap();
        f.engine.shutdown();
        assert!(f.engine.status_all().is_empty());
    }
}
