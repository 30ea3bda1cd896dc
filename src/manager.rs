//! Connection state machine. All engine work runs on one control thread that
//! drains a request queue, so at most one engine operation is ever in flight
//! and state is only mutated in one place.

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    configuration::{ConfigStore, Configuration},
    connection_state::ConnectionState,
    engine::{EngineBridge, Health},
    error::{Error, Result},
    ipc::TrafficStats,
    request_queue::{Action, ControlRequest, RequestQueue, RequestSource, SaveOutcome, Submission},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Failed(Error),
    /// Something went wrong without changing the connection state.
    Warning(Error),
    ConfigSaved(PathBuf),
}

/// Observers are called on the control thread and must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

impl ConnectionObserver for mpsc::Sender<ConnectionEvent> {
    fn on_event(&self, event: &ConnectionEvent) {
        let _ = self.send(event.clone());
    }
}

struct Shared {
    queue: RequestQueue,
    state: RwLock<ConnectionState>,
    last_error: Mutex<Option<Error>>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl Shared {
    fn notify(&self, event: &ConnectionEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, error: Option<Error>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

/// Cheap to clone; every clone talks to the same control thread.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

pub struct ControlThread {
    handle: JoinHandle<()>,
    finished: mpsc::Receiver<()>,
}

impl ControlThread {
    /// Returns the thread back if it is still running after `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> std::result::Result<(), Self> {
        match self.finished.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(self),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    log::error!("[manager] control thread panicked");
                }
                Ok(())
            }
        }
    }
}

pub struct SaveTicket {
    submission: Submission,
    outcome: mpsc::Receiver<SaveOutcome>,
}

impl SaveTicket {
    pub fn submission(&self) -> Submission {
        self.submission
    }

    /// `None` when the save was not performed within `timeout` or was
    /// dropped by shutdown.
    pub fn wait(self, timeout: Duration) -> Option<SaveOutcome> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

impl ConnectionManager {
    pub fn spawn<B>(
        bridge: B,
        store: ConfigStore,
        configuration: Configuration,
        observers: Vec<Arc<dyn ConnectionObserver>>,
    ) -> (Self, ControlThread)
    where
        B: EngineBridge + 'static,
    {
        let shared = Arc::new(Shared {
            queue: RequestQueue::new(),
            state: RwLock::new(ConnectionState::Idle),
            last_error: Mutex::new(None),
            observers,
        });

        let control = ControlLoop {
            shared: shared.clone(),
            bridge,
            store,
            configuration,
            engine: None,
            last_traffic: None,
            unhealthy_streak: 0,
            next_health_check: Instant::now(),
        };

        let (finished_sender, finished) = mpsc::channel();
        let handle = thread::spawn(move || {
            control.run();
            let _ = finished_sender.send(());
        });

        (Self { shared }, ControlThread { handle, finished })
    }

    fn submit(&self, action: Action, source: RequestSource) -> Submission {
        let submission = self.shared.queue.push(ControlRequest::new(action, source));
        log::debug!("[manager] request from {source:?}: {submission:?}");
        submission
    }

    pub fn start_connection(&self, source: RequestSource) -> Submission {
        self.submit(Action::Start, source)
    }

    pub fn stop_connection(&self, source: RequestSource) -> Submission {
        self.submit(Action::Stop, source)
    }

    pub fn restart_connection(&self, source: RequestSource) -> Submission {
        self.submit(Action::Restart, source)
    }

    /// Writes the controller's statistics into the configuration file without
    /// touching the engine.
    pub fn save_connection_config(&self, source: RequestSource) -> SaveTicket {
        let (waiter, outcome) = mpsc::channel();
        let submission = self.submit(
            Action::SaveConfig {
                waiters: vec![waiter],
            },
            source,
        );
        SaveTicket {
            submission,
            outcome,
        }
    }

    /// Validates, persists and adopts `configuration`. A running engine keeps
    /// its old settings until the next start or restart.
    pub fn update_config(&self, configuration: Configuration, source: RequestSource) -> Submission {
        self.submit(Action::UpdateConfig(Box::new(configuration)), source)
    }

    /// Stops the engine, saves the configuration and ends the control thread.
    pub fn shutdown(&self) -> Submission {
        self.submit(Action::Shutdown, RequestSource::Ui)
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn last_error(&self) -> Option<Error> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct ControlLoop<B: EngineBridge> {
    shared: Arc<Shared>,
    bridge: B,
    store: ConfigStore,
    configuration: Configuration,
    engine: Option<B::Handle>,
    last_traffic: Option<TrafficStats>,
    unhealthy_streak: u32,
    next_health_check: Instant,
}

impl<B: EngineBridge> ControlLoop<B> {
    fn run(mut self) {
        log::info!("[manager] control thread started");
        loop {
            let timeout = self
                .engine
                .is_some()
                .then(|| self.next_health_check.saturating_duration_since(Instant::now()));

            if let Some(request) = self.shared.queue.pop(timeout)
                && !self.handle(request)
            {
                break;
            }

            if self.engine.is_some() && Instant::now() >= self.next_health_check {
                self.check_health();
            }
        }
        log::info!("[manager] control thread finished");
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.shared.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            log::info!("[manager] {from} -> {to}");
            self.shared
                .notify(&ConnectionEvent::StateChanged { from, to });
        }
    }

    /// Returns false once the loop should exit.
    fn handle(&mut self, request: ControlRequest) -> bool {
        let ControlRequest { action, source } = request;
        let state = self.state();
        log::debug!(
            "[manager] handling {:?} from {source:?} in {state}",
            action.kind()
        );

        match action {
            Action::Start => match state {
                ConnectionState::Idle | ConnectionState::Failed => self.start(),
                _ => log::info!("[manager] start ignored while {state}"),
            },
            Action::Restart => match state {
                ConnectionState::Connected | ConnectionState::Failed => self.restart(),
                ConnectionState::Idle => self.start(),
                _ => log::info!("[manager] restart ignored while {state}"),
            },
            Action::Stop => match state {
                ConnectionState::Connected => self.stop(),
                ConnectionState::Failed => {
                    self.shared.set_last_error(None);
                    self.set_state(ConnectionState::Idle);
                }
                _ => log::debug!("[manager] stop ignored while {state}"),
            },
            Action::SaveConfig { waiters } => {
                let outcome = self.save();
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
            Action::UpdateConfig(configuration) => self.update_config(*configuration),
            Action::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn start(&mut self) {
        self.set_state(ConnectionState::Starting);
        if let Err(error) = self.reload_configuration() {
            self.fail(error);
            return;
        }
        self.launch();
    }

    fn restart(&mut self) {
        self.set_state(ConnectionState::Restarting);
        if let Some(handle) = self.engine.take()
            && let Err(error) = self.bridge.terminate(handle)
        {
            self.fail(error);
            return;
        }
        if let Err(error) = self.reload_configuration() {
            self.fail(error);
            return;
        }
        self.launch();
    }

    fn stop(&mut self) {
        self.set_state(ConnectionState::Stopping);
        self.release_engine();
        self.set_state(ConnectionState::Idle);
    }

    fn launch(&mut self) {
        match self.bridge.launch(&self.configuration) {
            Ok(handle) => {
                self.engine = Some(handle);
                self.last_traffic = None;
                self.unhealthy_streak = 0;
                self.next_health_check =
                    Instant::now() + self.configuration.engine.health_interval();
                self.configuration.statistics.last_connected = Some(Utc::now());
                self.shared.set_last_error(None);
                self.set_state(ConnectionState::Connected);
            }
            Err(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: Error) {
        log::error!("[manager] {error}");
        if let Some(handle) = self.engine.take()
            && let Err(cleanup) = self.bridge.terminate(handle)
        {
            log::warn!("[manager] cleanup after failure: {cleanup}");
        }
        self.shared.set_last_error(Some(error.clone()));
        self.set_state(ConnectionState::Failed);
        self.shared.notify(&ConnectionEvent::Failed(error));
    }

    /// Terminate problems on the way to Idle are reported but do not fail
    /// the connection: the engine is gone either way.
    fn release_engine(&mut self) {
        if let Some(handle) = self.engine.take()
            && let Err(error) = self.bridge.terminate(handle)
        {
            log::warn!("[manager] {error}");
            self.shared.notify(&ConnectionEvent::Warning(error));
        }
    }

    /// Picks up edits made on disk since the last launch. Runtime statistics
    /// are owned by the controller and carried over.
    fn reload_configuration(&mut self) -> Result<()> {
        let mut configuration = self.store.load()?;
        configuration.statistics = self.configuration.statistics.clone();
        self.configuration = configuration;
        Ok(())
    }

    fn check_health(&mut self) {
        let Some(handle) = self.engine.as_mut() else {
            return;
        };
        let health = self.bridge.health_check(handle);
        self.next_health_check = Instant::now() + self.configuration.engine.health_interval();

        match health {
            Health::Healthy(traffic) => {
                self.unhealthy_streak = 0;
                self.record_traffic(traffic);
            }
            Health::Unresponsive(reason) => {
                self.unhealthy_streak += 1;
                let threshold = self.configuration.engine.health_failure_threshold.max(1);
                log::warn!(
                    "[health] engine unresponsive ({}/{threshold}): {reason}",
                    self.unhealthy_streak
                );
                if self.unhealthy_streak >= threshold {
                    self.fail(Error::EngineCrashed(reason));
                }
            }
            Health::Dead(reason) => self.fail(Error::EngineCrashed(reason)),
        }
    }

    /// Engine counters restart from zero with every launch.
    fn record_traffic(&mut self, traffic: TrafficStats) {
        let previous = self.last_traffic.unwrap_or_default();
        let statistics = &mut self.configuration.statistics;
        statistics.uplink_bytes += traffic.uplink.saturating_sub(previous.uplink);
        statistics.downlink_bytes += traffic.downlink.saturating_sub(previous.downlink);
        self.last_traffic = Some(traffic);
    }

    /// The file stays the source of truth for settings edited outside the
    /// controller; only the statistics are written from memory. Falls back to
    /// the in-memory copy when the file no longer loads.
    fn save(&mut self) -> SaveOutcome {
        let merged = match self.store.load() {
            Ok(mut on_disk) => {
                on_disk.statistics = self.configuration.statistics.clone();
                on_disk
            }
            Err(error) => {
                log::warn!("[config] cannot reload before saving, writing in-memory copy: {error}");
                self.configuration.clone()
            }
        };
        self.write(&merged)
    }

    fn write(&self, configuration: &Configuration) -> SaveOutcome {
        match self.store.save(configuration) {
            Ok(()) => {
                let path = self.store.path().to_path_buf();
                log::info!("[config] saved {}", path.display());
                self.shared
                    .notify(&ConnectionEvent::ConfigSaved(path.clone()));
                Ok(path)
            }
            Err(error) => {
                log::error!("[config] {error}");
                self.shared.notify(&ConnectionEvent::Warning(error.clone()));
                Err(error)
            }
        }
    }

    fn update_config(&mut self, mut configuration: Configuration) {
        if let Err(error) = configuration.validate(self.store.path()) {
            log::warn!("[config] update rejected: {error}");
            self.shared.notify(&ConnectionEvent::Warning(error));
            return;
        }

        configuration.statistics = self.configuration.statistics.clone();
        if self.write(&configuration).is_ok() {
            self.configuration = configuration;
        }
    }

    fn shutdown(&mut self) {
        log::info!("[manager] shutting down");
        if self.engine.is_some() {
            self.set_state(ConnectionState::Stopping);
            self.release_engine();
        }
        self.set_state(ConnectionState::Idle);
        let _ = self.save();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct FakeEngine {
        launches: AtomicUsize,
        terminations: AtomicUsize,
        health_checks: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        live_handles: AtomicUsize,
        launch_delay_ms: AtomicU64,
        reject_launch: AtomicBool,
        health_script: Mutex<VecDeque<Health>>,
        last_health: Mutex<Option<Health>>,
    }

    impl FakeEngine {
        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn script_health(&self, script: Vec<Health>) {
            self.health_script.lock().unwrap().extend(script);
        }
    }

    struct FakeHandle(Arc<FakeEngine>);

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.0.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeBridge(Arc<FakeEngine>);

    impl EngineBridge for FakeBridge {
        type Handle = FakeHandle;

        fn launch(&mut self, _configuration: &Configuration) -> Result<FakeHandle> {
            self.0.enter();
            self.0.launches.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(
                self.0.launch_delay_ms.load(Ordering::SeqCst),
            ));
            let result = if self.0.reject_launch.load(Ordering::SeqCst) {
                Err(Error::EngineRejectedConfig("outbound 'proxy' is missing address".into()))
            } else {
                self.0.live_handles.fetch_add(1, Ordering::SeqCst);
                Ok(FakeHandle(self.0.clone()))
            };
            self.0.exit();
            result
        }

        fn terminate(&mut self, handle: FakeHandle) -> Result<()> {
            self.0.enter();
            self.0.terminations.fetch_add(1, Ordering::SeqCst);
            drop(handle);
            self.0.exit();
            Ok(())
        }

        fn health_check(&mut self, _handle: &mut FakeHandle) -> Health {
            self.0.enter();
            self.0.health_checks.fetch_add(1, Ordering::SeqCst);
            let scripted = self.0.health_script.lock().unwrap().pop_front();
            let mut last = self.0.last_health.lock().unwrap();
            if let Some(health) = scripted {
                *last = Some(health);
            }
            let health = last
                .clone()
                .unwrap_or(Health::Healthy(TrafficStats::default()));
            self.0.exit();
            health
        }
    }

    struct Harness {
        _directory: tempfile::TempDir,
        config_path: PathBuf,
        engine: Arc<FakeEngine>,
        manager: ConnectionManager,
        control: ControlThread,
        events: mpsc::Receiver<ConnectionEvent>,
    }

    fn harness_with(configure: impl FnOnce(&mut Configuration)) -> Harness {
        let directory = tempfile::tempdir().unwrap();
        let store = ConfigStore::locate_or_create(Some(directory.path())).unwrap();
        let mut configuration = store.load().unwrap();
        configure(&mut configuration);
        store.save(&configuration).unwrap();

        let engine = Arc::new(FakeEngine::default());
        let (sender, events) = mpsc::channel();
        let config_path = store.path().to_path_buf();
        let (manager, control) = ConnectionManager::spawn(
            FakeBridge(engine.clone()),
            store,
            configuration,
            vec![Arc::new(sender) as Arc<dyn ConnectionObserver>],
        );
        Harness {
            _directory: directory,
            config_path,
            engine,
            manager,
            control,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn drain(events: &mpsc::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        events.try_iter().collect()
    }

    fn is_allowed_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (from, to),
            (Idle, Starting)
                | (Starting, Connected)
                | (Starting, Failed)
                | (Connected, Stopping)
                | (Connected, Restarting)
                | (Connected, Failed)
                | (Restarting, Connected)
                | (Restarting, Failed)
                | (Stopping, Idle)
                | (Failed, Starting)
                | (Failed, Restarting)
                | (Failed, Idle)
        )
    }

    #[test]
    fn start_and_stop_walk_the_state_machine() {
        let harness = harness();
        assert_eq!(
            harness.manager.start_connection(RequestSource::Ui),
            Submission::Queued
        );
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Connected));

        harness.manager.stop_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Idle));

        let transitions: Vec<_> = drain(&harness.events)
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        use ConnectionState::*;
        assert_eq!(
            transitions,
            vec![
                (Idle, Starting),
                (Starting, Connected),
                (Connected, Stopping),
                (Stopping, Idle),
            ]
        );
        assert_eq!(harness.engine.live_handles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_cancels_queued_start() {
        let harness = harness();
        harness.engine.launch_delay_ms.store(300, Ordering::SeqCst);

        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Starting));
        assert_eq!(
            harness.manager.start_connection(RequestSource::Ui),
            Submission::Queued
        );
        harness.manager.stop_connection(RequestSource::Signal);

        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Idle
            && harness.engine.launches.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(harness.manager.current_state(), ConnectionState::Idle);
        assert_eq!(harness.engine.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restarts_during_start_coalesce_into_one() {
        let harness = harness();
        harness.engine.launch_delay_ms.store(200, Ordering::SeqCst);

        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Starting));
        assert_eq!(
            harness.manager.restart_connection(RequestSource::Ui),
            Submission::Queued
        );
        assert_eq!(
            harness.manager.restart_connection(RequestSource::Signal),
            Submission::Coalesced
        );

        assert!(wait_for(|| harness.engine.launches.load(Ordering::SeqCst) == 2
            && harness.manager.current_state() == ConnectionState::Connected));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(harness.engine.launches.load(Ordering::SeqCst), 2);
        assert_eq!(harness.engine.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(harness.engine.live_handles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_launch_fails_then_recovers() {
        let harness = harness();
        harness.engine.reject_launch.store(true, Ordering::SeqCst);

        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Failed));
        assert!(matches!(
            harness.manager.last_error(),
            Some(Error::EngineRejectedConfig(_))
        ));
        assert_eq!(harness.engine.live_handles.load(Ordering::SeqCst), 0);
        assert!(drain(&harness.events)
            .iter()
            .any(|event| matches!(event, ConnectionEvent::Failed(Error::EngineRejectedConfig(_)))));

        harness.engine.reject_launch.store(false, Ordering::SeqCst);
        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Connected));
        assert_eq!(harness.manager.last_error(), None);
    }

    #[test]
    fn stop_from_failed_clears_error() {
        let harness = harness();
        harness.engine.reject_launch.store(true, Ordering::SeqCst);
        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Failed));

        harness.manager.stop_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Idle));
        assert_eq!(harness.manager.last_error(), None);
    }

    #[test]
    fn dead_engine_fails_connection() {
        let harness = harness_with(|configuration| configuration.engine.health_interval_ms = 20);
        harness
            .engine
            .script_health(vec![Health::Dead("engine exited (exit code: 3)".into())]);

        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Failed));
        assert!(matches!(
            harness.manager.last_error(),
            Some(Error::EngineCrashed(_))
        ));
        assert_eq!(harness.engine.terminations.load(Ordering::SeqCst), 1);
        assert_eq!(harness.engine.live_handles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unresponsive_engine_fails_after_threshold() {
        let harness = harness_with(|configuration| {
            configuration.engine.health_interval_ms = 20;
            configuration.engine.health_failure_threshold = 2;
        });
        harness.engine.script_health(vec![
            Health::Unresponsive("health_check timed out".into()),
            Health::Healthy(TrafficStats::default()),
            Health::Unresponsive("health_check timed out".into()),
            Health::Unresponsive("health_check timed out".into()),
        ]);

        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Failed));
        assert_eq!(harness.engine.health_checks.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn traffic_counters_fold_into_saved_statistics() {
        let harness = harness_with(|configuration| configuration.engine.health_interval_ms = 20);
        harness.engine.script_health(vec![
            Health::Healthy(TrafficStats {
                uplink: 10,
                downlink: 20,
            }),
            Health::Healthy(TrafficStats {
                uplink: 15,
                downlink: 30,
            }),
        ]);

        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.engine.health_checks.load(Ordering::SeqCst) >= 3));

        let saved = harness
            .manager
            .save_connection_config(RequestSource::Ui)
            .wait(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        let configuration = ConfigStore::load_from(&saved).unwrap();
        assert_eq!(configuration.statistics.uplink_bytes, 15);
        assert_eq!(configuration.statistics.downlink_bytes, 30);
        assert!(configuration.statistics.last_connected.is_some());
    }

    #[test]
    fn session_save_never_touches_engine() {
        let harness = harness();
        let outcome = harness
            .manager
            .save_connection_config(RequestSource::Session)
            .wait(Duration::from_secs(5));
        assert_eq!(outcome, Some(Ok(harness.config_path.clone())));
        assert_eq!(harness.engine.launches.load(Ordering::SeqCst), 0);
        assert_eq!(harness.engine.health_checks.load(Ordering::SeqCst), 0);
        assert_eq!(harness.manager.current_state(), ConnectionState::Idle);
    }

    #[test]
    fn invalid_update_is_rejected_without_saving() {
        let harness = harness();
        let before = std::fs::read_to_string(&harness.config_path).unwrap();

        let mut invalid = Configuration::default_template();
        invalid.selected_outbound = Some("missing".into());
        harness.manager.update_config(invalid, RequestSource::Ui);
        let warning = harness.events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            warning,
            ConnectionEvent::Warning(Error::ConfigCorrupt { .. })
        ));

        let future_version = Configuration {
            config_version: 99,
            ..Configuration::default_template()
        };
        harness.manager.update_config(future_version, RequestSource::Ui);
        let warning = harness.events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            warning,
            ConnectionEvent::Warning(Error::ConfigIncompatible { found: 99, .. })
        ));
        assert_eq!(std::fs::read_to_string(&harness.config_path).unwrap(), before);

        let mut valid = Configuration::default_template();
        valid.auto_connect = true;
        harness.manager.update_config(valid, RequestSource::Ui);

        assert!(wait_for(|| {
            std::fs::read_to_string(&harness.config_path).unwrap() != before
        }));
        let saved = ConfigStore::load_from(&harness.config_path).unwrap();
        assert!(saved.auto_connect);
        assert!(matches!(
            harness.events.recv_timeout(Duration::from_secs(5)).unwrap(),
            ConnectionEvent::ConfigSaved(_)
        ));
    }

    #[test]
    fn shutdown_stops_engine_and_closes_queue() {
        let harness = harness();
        harness.manager.start_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Connected));

        assert_eq!(harness.manager.shutdown(), Submission::Queued);
        assert!(harness.control.join_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(harness.engine.live_handles.load(Ordering::SeqCst), 0);
        assert_eq!(harness.manager.current_state(), ConnectionState::Idle);
        assert_eq!(
            harness.manager.start_connection(RequestSource::Ui),
            Submission::Closed
        );
        assert!(drain(&harness.events)
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ConfigSaved(_))));
    }

    #[test]
    fn shutdown_save_keeps_edits_made_on_disk() {
        let harness = harness_with(|configuration| configuration.statistics.uplink_bytes = 42);
        let mut edited = ConfigStore::load_from(&harness.config_path).unwrap();
        edited.auto_connect = true;
        edited.statistics.uplink_bytes = 0;
        std::fs::write(&harness.config_path, toml::to_string_pretty(&edited).unwrap()).unwrap();

        harness.manager.shutdown();
        assert!(harness.control.join_timeout(Duration::from_secs(5)).is_ok());

        let saved = ConfigStore::load_from(&harness.config_path).unwrap();
        assert!(saved.auto_connect);
        assert_eq!(saved.statistics.uplink_bytes, 42);
    }

    #[test]
    fn save_falls_back_to_memory_when_file_is_unreadable() {
        let harness = harness_with(|configuration| configuration.statistics.downlink_bytes = 7);
        std::fs::write(&harness.config_path, "config_version = 2\n[engine\n").unwrap();

        let outcome = harness
            .manager
            .save_connection_config(RequestSource::Session)
            .wait(Duration::from_secs(5));
        assert_eq!(outcome, Some(Ok(harness.config_path.clone())));

        let saved = ConfigStore::load_from(&harness.config_path).unwrap();
        assert_eq!(saved.statistics.downlink_bytes, 7);
    }

    #[test]
    fn concurrent_requests_never_overlap_engine_work() {
        let harness = harness();
        harness.engine.launch_delay_ms.store(2, Ordering::SeqCst);

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let manager = harness.manager.clone();
                thread::spawn(move || {
                    for step in 0..25 {
                        match (producer + step) % 3 {
                            0 => manager.start_connection(RequestSource::Ui),
                            1 => manager.restart_connection(RequestSource::Signal),
                            _ => manager.stop_connection(RequestSource::Ui),
                        };
                        thread::sleep(Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        harness.manager.stop_connection(RequestSource::Ui);
        assert!(wait_for(|| harness.manager.current_state() == ConnectionState::Idle
            && harness.engine.in_flight.load(Ordering::SeqCst) == 0));
        harness.manager.shutdown();
        assert!(harness.control.join_timeout(Duration::from_secs(5)).is_ok());

        assert_eq!(harness.engine.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(harness.engine.live_handles.load(Ordering::SeqCst), 0);
        for event in drain(&harness.events) {
            if let ConnectionEvent::StateChanged { from, to } = event {
                assert!(is_allowed_transition(from, to), "{from} -> {to}");
            }
        }
    }
}
