use std::{
    io,
    path::{Path, PathBuf},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio},
};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use self::unix as platform;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
use self::windows as platform;

#[cfg(target_os = "windows")]
pub const ENGINE_BINARY_NAME: &str = "proxy-engine.exe";
#[cfg(not(target_os = "windows"))]
pub const ENGINE_BINARY_NAME: &str = "proxy-engine";

pub struct ChildExit {
    pub code: Option<i32>,
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code: {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A spawned engine. On Windows the job guard kills the engine if the
/// controller dies; on Linux the parent-death signal does the same.
pub struct EngineProcess {
    child: Child,
    #[cfg(target_os = "windows")]
    _job_guard: Option<platform::JobGuard>,
}

impl EngineProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ChildExit>> {
        self.child
            .try_wait()
            .map(|status| status.map(|status| ChildExit { code: status.code() }))
    }

    pub fn kill(&mut self) {
        if let Err(error) = self.child.kill() {
            log::debug!("[process] kill pid={} failed: {error}", self.child.id());
        }
    }

    pub fn wait(&mut self) -> ChildExit {
        let status = self.child.wait();
        ChildExit {
            code: status.ok().and_then(|status| status.code()),
        }
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

pub fn spawn_engine(binary: &Path, arguments: &[String]) -> io::Result<EngineProcess> {
    log::info!(
        "[process] spawning: {} {}",
        binary.display(),
        arguments.join(" ")
    );

    let mut command = Command::new(binary);
    command
        .args(arguments)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    platform::configure_command(&mut command);

    let child = command.spawn()?;
    log::info!("[process] engine started (pid={})", child.id());

    #[cfg(target_os = "windows")]
    {
        let _job_guard = platform::create_child_job_guard(&child);
        Ok(EngineProcess { child, _job_guard })
    }
    #[cfg(not(target_os = "windows"))]
    {
        Ok(EngineProcess { child })
    }
}

/// Starts a long-running helper whose stdout is read line by line. The helper
/// dies with the controller.
#[cfg(target_os = "linux")]
pub fn spawn_monitor(program: &str, arguments: &[&str]) -> io::Result<Child> {
    let mut command = Command::new(program);
    command
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    platform::configure_command(&mut command);

    let child = command.spawn()?;
    log::info!("[process] {program} started (pid={})", child.id());
    Ok(child)
}

/// Asks the process to exit. Returns false when the platform has no polite
/// way to do so.
pub fn request_terminate(process_id: u32) -> bool {
    platform::terminate_process(process_id)
}

pub fn find_engine_binary(explicit: Option<&Path>) -> (PathBuf, bool) {
    if let Some(path) = explicit {
        let found = path.is_file();
        log::info!(
            "[binary] using explicit engine path {} (found={found})",
            path.display()
        );
        return (path.to_path_buf(), found);
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for directory in std::env::split_paths(&paths) {
            let candidate = directory.join(ENGINE_BINARY_NAME);
            if candidate.is_file() {
                log::info!("[binary] found in PATH: {}", candidate.display());
                return (candidate, true);
            }
        }
    }

    for candidate in platform::ENGINE_SEARCH_PATHS {
        let candidate = Path::new(candidate);
        if candidate.is_file() {
            log::info!("[binary] found on disk: {}", candidate.display());
            return (candidate.to_path_buf(), true);
        }
    }

    log::warn!("[binary] {ENGINE_BINARY_NAME} not found in search paths");
    (PathBuf::from(ENGINE_BINARY_NAME), false)
}

pub fn check_engine_binary(path: &Path) -> Option<String> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(error) => return Some(format!("cannot access '{}': {error}", path.display())),
    };

    if !metadata.is_file() {
        return Some(format!("'{}' is not a file", path.display()));
    }

    if !platform::is_executable(path, &metadata) {
        return Some(format!("'{}' is not executable", path.display()));
    }

    log::debug!("[preflight] engine binary OK: {}", path.display());
    None
}
