//! Process bootstrap and teardown: preflight, configuration, single instance,
//! the control thread and signal routing, then a bounded shutdown.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    time::Duration,
};

use thiserror::Error;

use crate::{
    configuration::ConfigStore,
    engine::{EngineBridge, ProcessEngine},
    error::Error,
    manager::{ConnectionManager, ConnectionObserver, ControlThread},
    request_queue::RequestSource,
    signals::{SignalEvent, SignalRouter},
    single_instance::{self, InstanceGuard},
    system,
};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Normal = 0,
    /// Command line could not be parsed.
    PreInit = 1,
    ConfigDirectory = 2,
    ConfigLoad = 3,
    DependencyMissing = 4,
    /// Forced exit: a repeated terminate signal or a missed shutdown deadline.
    Interrupted = 130,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        i32::from(self as u8)
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        Self::from(code as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Quit,
    Signal(SignalEvent),
}

#[derive(Clone)]
pub struct ShutdownTrigger {
    sender: mpsc::Sender<ShutdownReason>,
}

impl ShutdownTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<ShutdownReason>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    pub fn request(&self, reason: ShutdownReason) -> bool {
        self.sender.send(reason).is_ok()
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("another instance is already running")]
    AlreadyRunning,
    #[error("{error}")]
    Failed { stage: ExitCode, error: Error },
}

impl BootstrapError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::AlreadyRunning => ExitCode::Normal,
            Self::Failed { stage, .. } => *stage,
        }
    }

    fn at(stage: ExitCode) -> impl FnOnce(Error) -> Self {
        move |error| Self::Failed { stage, error }
    }
}

#[derive(Clone)]
pub struct Options {
    pub config_directory: Option<PathBuf>,
    pub engine_binary: Option<PathBuf>,
    pub no_auto_connect: bool,
    pub shutdown_timeout: Duration,
    pub install_signal_handlers: bool,
    pub single_instance: bool,
    pub observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_directory: None,
            engine_binary: None,
            no_auto_connect: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            install_signal_handlers: true,
            single_instance: true,
            observers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub code: ExitCode,
    /// False when the control thread missed the shutdown deadline.
    pub clean: bool,
}

pub struct Application {
    manager: ConnectionManager,
    control: Option<ControlThread>,
    shutdown: ShutdownTrigger,
    shutdown_requests: mpsc::Receiver<ShutdownReason>,
    router: Arc<SignalRouter>,
    shutdown_timeout: Duration,
    config_path: PathBuf,
    instance: Option<InstanceGuard>,
}

impl Application {
    /// Full startup against the real engine binary.
    pub fn bootstrap(options: &Options) -> Result<Self, BootstrapError> {
        let binary = preflight(options.engine_binary.as_deref())
            .map_err(BootstrapError::at(ExitCode::DependencyMissing))?;

        Self::bootstrap_with(options, |store| {
            ProcessEngine::new(binary).with_logs_directory(store.logs_directory())
        })
    }

    /// Startup with a caller-supplied bridge; skips the engine preflight.
    pub fn bootstrap_with<B, F>(options: &Options, make_bridge: F) -> Result<Self, BootstrapError>
    where
        B: EngineBridge + 'static,
        F: FnOnce(&ConfigStore) -> B,
    {
        let store = ConfigStore::locate_or_create(options.config_directory.as_deref())
            .map_err(BootstrapError::at(ExitCode::ConfigDirectory))?;
        let configuration = store
            .load()
            .map_err(BootstrapError::at(ExitCode::ConfigLoad))?;

        let instance = if options.single_instance {
            match single_instance::acquire(store.directory()) {
                Some(guard) => Some(guard),
                None => {
                    log::info!(
                        "[lifecycle] instance already running for {}",
                        store.directory().display()
                    );
                    return Err(BootstrapError::AlreadyRunning);
                }
            }
        } else {
            None
        };

        let auto_connect = configuration.auto_connect && !options.no_auto_connect;
        let config_path = store.path().to_path_buf();
        let bridge = make_bridge(&store);
        let (manager, control) =
            ConnectionManager::spawn(bridge, store, configuration, options.observers.clone());
        log::info!("[lifecycle] global state initialized ({})", config_path.display());

        let (shutdown, shutdown_requests) = ShutdownTrigger::channel();
        let router = Arc::new(SignalRouter::new(manager.clone(), shutdown.clone()));
        if options.install_signal_handlers
            && let Err(error) = router.clone().install()
        {
            log::warn!("[lifecycle] signal handlers unavailable: {error}");
        }

        if auto_connect {
            log::info!("[lifecycle] auto-connect enabled");
            manager.start_connection(RequestSource::Ui);
        }

        Ok(Self {
            manager,
            control: Some(control),
            shutdown,
            shutdown_requests,
            router,
            shutdown_timeout: options.shutdown_timeout,
            config_path,
            instance,
        })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Session-manager and UI hooks enter through the same router as OS
    /// signals.
    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Blocks until shutdown is requested, then tears everything down within
    /// the shutdown deadline.
    pub fn run(mut self) -> Termination {
        log::info!("[lifecycle] running");
        let reason = self
            .shutdown_requests
            .recv()
            .unwrap_or(ShutdownReason::Quit);
        log::info!("[lifecycle] shutdown requested: {reason:?}");

        self.manager.shutdown();
        let clean = match self.control.take() {
            Some(control) => match control.join_timeout(self.shutdown_timeout) {
                Ok(()) => true,
                Err(_still_running) => {
                    log::error!(
                        "[lifecycle] shutdown did not finish within {:?}",
                        self.shutdown_timeout
                    );
                    false
                }
            },
            None => true,
        };
        // A graceful shutdown is a normal exit whatever asked for it.
        let code = if clean {
            ExitCode::Normal
        } else {
            ExitCode::Interrupted
        };

        if self.instance.take().is_some() {
            log::debug!("[lifecycle] instance lock released");
        }
        log::info!("[lifecycle] global state released, exiting with {code:?}");
        Termination { code, clean }
    }
}

fn preflight(explicit: Option<&Path>) -> Result<PathBuf, Error> {
    let (binary, found) = system::find_engine_binary(explicit);
    if !found {
        return Err(Error::DependencyMissing(format!(
            "engine binary {} not found; install it or pass --engine",
            binary.display()
        )));
    }
    if let Some(problem) = system::check_engine_binary(&binary) {
        return Err(Error::DependencyMissing(problem));
    }
    Ok(binary)
}
