//! One controller per configuration directory. The guard fails open: if the
//! platform primitive itself errors, startup proceeds unguarded.

use std::path::Path;

pub const LOCK_FILE_NAME: &str = ".pilot.lock";

#[cfg(unix)]
pub use self::unix::{InstanceGuard, acquire};
#[cfg(windows)]
pub use self::windows::{InstanceGuard, acquire};

#[cfg(unix)]
mod unix {
    use std::{fs::OpenOptions, io::Write, path::Path};

    use nix::{
        errno::Errno,
        fcntl::{Flock, FlockArg},
    };

    use super::lock_path;

    pub struct InstanceGuard {
        _lock: Option<Flock<std::fs::File>>,
    }

    pub fn acquire(directory: &Path) -> Option<InstanceGuard> {
        let path = lock_path(directory);
        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(error) => {
                log::warn!("[single_instance] cannot open {}: {error}", path.display());
                return Some(InstanceGuard { _lock: None });
            }
        };

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(mut lock) => {
                let recorded = lock
                    .set_len(0)
                    .and_then(|()| write!(lock, "{}", std::process::id()));
                if let Err(error) = recorded {
                    log::debug!("[single_instance] cannot record pid: {error}");
                }
                Some(InstanceGuard { _lock: Some(lock) })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => None,
            Err((_, errno)) => {
                log::warn!("[single_instance] flock failed: {errno}");
                Some(InstanceGuard { _lock: None })
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::path::Path;

    use windows::{
        Win32::{
            Foundation::{CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE},
            System::Threading::CreateMutexW,
        },
        core::PCWSTR,
    };

    pub struct InstanceGuard {
        handle: Option<HANDLE>,
    }

    unsafe impl Send for InstanceGuard {}
    unsafe impl Sync for InstanceGuard {}

    impl Drop for InstanceGuard {
        fn drop(&mut self) {
            if let Some(handle) = self.handle.take() {
                unsafe {
                    let _ = CloseHandle(handle);
                }
            }
        }
    }

    fn mutex_name(directory: &Path) -> Vec<u16> {
        let scope: String = directory
            .to_string_lossy()
            .chars()
            .map(|character| {
                if character.is_ascii_alphanumeric() {
                    character.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("Local\\ProxyPilot_{scope}")
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect()
    }

    pub fn acquire(directory: &Path) -> Option<InstanceGuard> {
        let name = mutex_name(directory);
        let result = unsafe { CreateMutexW(None, true, PCWSTR(name.as_ptr())) };

        match result {
            Ok(handle) => {
                if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
                    unsafe {
                        let _ = CloseHandle(handle);
                    }
                    return None;
                }

                Some(InstanceGuard {
                    handle: Some(handle),
                })
            }
            Err(error) => {
                log::warn!("[single_instance] CreateMutexW failed: {error}");
                Some(InstanceGuard { handle: None })
            }
        }
    }
}

#[cfg_attr(windows, allow(dead_code))]
fn lock_path(directory: &Path) -> std::path::PathBuf {
    directory.join(LOCK_FILE_NAME)
}
