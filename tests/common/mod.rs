#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use proxy_pilot::{ConfigStore, Configuration, ConnectionManager, ConnectionState};

pub fn mock_engine() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock-engine"))
}

/// Writes a configuration into `directory` the way a user edit would.
pub fn write_configuration(directory: &Path, configure: impl FnOnce(&mut Configuration)) -> PathBuf {
    let store = ConfigStore::locate_or_create(Some(directory)).unwrap();
    let mut configuration = store.load().unwrap();
    configure(&mut configuration);
    store.save(&configuration).unwrap();
    store.path().to_path_buf()
}

pub fn engine_arguments(pid_file: &Path, extra: &[&str]) -> Vec<String> {
    let mut arguments: Vec<String> = extra.iter().map(|argument| argument.to_string()).collect();
    arguments.push("--pid-file".into());
    arguments.push(pid_file.display().to_string());
    arguments
}

pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn wait_for_state(manager: &ConnectionManager, state: ConnectionState, timeout: Duration) -> bool {
    wait_for(timeout, || manager.current_state() == state)
}

pub fn read_pid(pid_file: &Path) -> u32 {
    assert!(
        wait_for(Duration::from_secs(5), || pid_file.exists()),
        "engine never wrote {}",
        pid_file.display()
    );
    std::fs::read_to_string(pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::{sys::signal::kill, unistd::Pid};

    kill(Pid::from_raw(pid as i32), None).is_ok()
}
