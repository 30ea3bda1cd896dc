use std::{fs::Metadata, os::unix::fs::PermissionsExt, path::Path, process::Command};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};

pub const ENGINE_SEARCH_PATHS: &[&str] = &[
    "/opt/proxy-engine/proxy-engine",
    "/usr/local/bin/proxy-engine",
    "/usr/bin/proxy-engine",
];

pub fn configure_command(command: &mut Command) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::process::CommandExt;

        // Runs in the forked child before exec: only async-signal-safe calls.
        unsafe {
            command.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)?;
                Ok(())
            });
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = command;
}

pub fn terminate_process(process_id: u32) -> bool {
    let Ok(raw) = i32::try_from(process_id) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => {
            log::info!("[terminate] sent SIGTERM to pid={process_id}");
            true
        }
        Err(error) => {
            log::info!("[terminate] SIGTERM failed for pid={process_id}: {error}");
            false
        }
    }
}

pub fn is_executable(_path: &Path, metadata: &Metadata) -> bool {
    metadata.permissions().mode() & 0o111 != 0
}
