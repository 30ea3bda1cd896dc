use std::{
    path::{Path, PathBuf},
    sync::PoisonError,
    thread,
    time::{Duration, Instant},
};

use crate::{
    configuration::{Configuration, EngineConfig, EngineSettings},
    engine_log::{SharedEngineLog, create_session_log_file, start_log_reader},
    error::{Error, Result},
    ipc::{Command, IpcClient, IpcError, Reply, TrafficStats},
    system::{self, ChildExit, EngineProcess},
};

const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq)]
pub enum Health {
    Healthy(TrafficStats),
    /// Alive but did not answer in time, or answered with an error.
    Unresponsive(String),
    Dead(String),
}

/// Owns the engine's lifecycle. Implementations are driven exclusively from
/// the connection manager's control thread.
pub trait EngineBridge: Send {
    type Handle: Send;

    fn launch(&mut self, configuration: &Configuration) -> Result<Self::Handle>;

    /// Consumes the handle; the engine is gone when this returns, even on
    /// error.
    fn terminate(&mut self, handle: Self::Handle) -> Result<()>;

    fn health_check(&mut self, handle: &mut Self::Handle) -> Health;
}

/// Runs the engine as a child process and drives it over its stdin/stdout.
pub struct ProcessEngine {
    binary: PathBuf,
    logs_directory: Option<PathBuf>,
}

impl ProcessEngine {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            logs_directory: None,
        }
    }

    pub fn with_logs_directory(mut self, directory: PathBuf) -> Self {
        self.logs_directory = Some(directory);
        self
    }
}

pub struct EngineHandle {
    process: Option<EngineProcess>,
    ipc: IpcClient,
    log: SharedEngineLog,
    settings: EngineSettings,
    session_log: Option<PathBuf>,
}

impl EngineHandle {
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(EngineProcess::id)
    }

    pub fn session_log(&self) -> Option<&Path> {
        self.session_log.as_deref()
    }

    fn log_summary(&self) -> Option<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summary()
            .map(str::to_owned)
    }

    fn with_engine_output(&self, detail: String) -> String {
        match self.log_summary() {
            Some(line) => format!("{detail} (engine: {line})"),
            None => detail,
        }
    }

    fn call_before(&self, command: Command, deadline: Instant) -> Result<Reply> {
        let name = command.name();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::EngineLaunchFailed(
                self.with_engine_output(format!("launch timed out before {name}")),
            ));
        }
        self.ipc
            .call(command, remaining)
            .map_err(|error| Error::EngineLaunchFailed(self.with_engine_output(error.to_string())))
    }

    fn handshake(&self, payload: EngineConfig, deadline: Instant) -> Result<()> {
        let reply = self.call_before(Command::SetConfig { config: payload }, deadline)?;
        if !reply.ok {
            return Err(Error::EngineRejectedConfig(reply.error_message()));
        }

        let reply = self.call_before(Command::Start, deadline)?;
        if !reply.ok {
            return Err(Error::EngineLaunchFailed(self.with_engine_output(format!(
                "engine refused to start: {}",
                reply.error_message()
            ))));
        }
        Ok(())
    }

    fn describe_exit(&self, exit: &ChildExit) -> String {
        self.with_engine_output(format!("engine exited ({exit})"))
    }

    /// Kills and reaps the engine if it is still owned by this handle.
    fn release(&mut self) {
        self.ipc.close();
        if let Some(mut process) = self.process.take() {
            let pid = process.id();
            process.kill();
            let exit = process.wait();
            log::info!("[engine] released pid={pid} ({exit})");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.process.is_some() {
            log::warn!("[engine] handle dropped while engine still running");
        }
        self.release();
    }
}

impl EngineBridge for ProcessEngine {
    type Handle = EngineHandle;

    fn launch(&mut self, configuration: &Configuration) -> Result<EngineHandle> {
        let settings = configuration.engine.clone();
        let deadline = Instant::now() + settings.launch_timeout();

        let mut process = system::spawn_engine(&self.binary, &settings.arguments).map_err(|error| {
            Error::EngineLaunchFailed(format!("cannot spawn {}: {error}", self.binary.display()))
        })?;

        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            process.kill();
            process.wait();
            return Err(Error::EngineLaunchFailed("engine stdio pipes unavailable".into()));
        };

        let log = SharedEngineLog::default();
        let (session_log, log_file) = match self
            .logs_directory
            .as_deref()
            .and_then(create_session_log_file)
        {
            Some((path, file)) => (Some(path), Some(file)),
            None => (None, None),
        };
        match process.take_stderr() {
            Some(stderr) => start_log_reader(stderr, log.clone(), log_file),
            None => log::warn!("[engine] no stderr pipe, engine output will not be captured"),
        }

        let mut handle = EngineHandle {
            process: Some(process),
            ipc: IpcClient::new(stdout, stdin),
            log,
            settings,
            session_log,
        };

        let payload = configuration.engine_payload();
        log::info!(
            "[engine] sending configuration: {}",
            serde_json::to_string(&payload.redacted()).unwrap_or_default()
        );

        if let Err(error) = handle.handshake(payload, deadline) {
            log::warn!("[engine] launch aborted: {error}");
            handle.release();
            return Err(error);
        }

        log::info!(
            "[engine] running (pid={})",
            handle.process_id().unwrap_or_default()
        );
        Ok(handle)
    }

    fn terminate(&mut self, mut handle: EngineHandle) -> Result<()> {
        let Some(mut process) = handle.process.take() else {
            return Ok(());
        };
        let pid = process.id();
        let grace = handle.settings.terminate_grace();
        let started = Instant::now();

        match handle.ipc.call(Command::Stop, handle.settings.call_timeout().min(grace)) {
            Ok(reply) if reply.ok => log::info!("[terminate] engine acknowledged stop (pid={pid})"),
            Ok(reply) => log::warn!(
                "[terminate] engine refused stop (pid={pid}): {}",
                reply.error_message()
            ),
            Err(error) => log::info!("[terminate] stop request to pid={pid} failed: {error}"),
        }
        handle.ipc.close();

        let mut signalled = false;
        loop {
            match process.try_wait() {
                Ok(Some(exit)) => {
                    log::info!("[terminate] engine exited gracefully (pid={pid}, {exit})");
                    return Ok(());
                }
                Ok(None) => {}
                Err(error) => {
                    log::warn!("[terminate] cannot query pid={pid}: {error}");
                    break;
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= grace {
                break;
            }
            if !signalled && elapsed >= grace / 2 {
                signalled = system::request_terminate(pid);
            }
            thread::sleep(TERMINATE_POLL_INTERVAL);
        }

        log::warn!("[terminate] graceful shutdown timed out for pid={pid}, killing");
        process.kill();
        let exit = process.wait();
        log::info!("[terminate] engine killed (pid={pid}, {exit})");
        Err(Error::EngineTerminateTimeout { grace })
    }

    fn health_check(&mut self, handle: &mut EngineHandle) -> Health {
        let Some(process) = handle.process.as_mut() else {
            return Health::Dead("engine already released".into());
        };
        match process.try_wait() {
            Ok(Some(exit)) => return Health::Dead(handle.describe_exit(&exit)),
            Ok(None) => {}
            Err(error) => return Health::Dead(format!("cannot query engine process: {error}")),
        }

        match handle
            .ipc
            .call(Command::HealthCheck, handle.settings.call_timeout())
        {
            Ok(reply) if reply.ok => Health::Healthy(reply.stats.unwrap_or_default()),
            Ok(reply) => Health::Unresponsive(reply.error_message()),
            Err(IpcError::Disconnected) => Health::Dead(
                handle.with_engine_output("engine closed its control channel".into()),
            ),
            Err(error) => Health::Unresponsive(error.to_string()),
        }
    }
}
