use std::{path::PathBuf, time::Duration};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("no usable configuration directory: {reason}")]
    ConfigMissing { reason: String },

    #[error("configuration {} is corrupt: {reason}", path.display())]
    ConfigCorrupt { path: PathBuf, reason: String },

    #[error(
        "configuration {} has version {found}, this build supports up to {supported}",
        path.display()
    )]
    ConfigIncompatible {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("failed to write configuration {}: {reason}", path.display())]
    ConfigWriteFailed { path: PathBuf, reason: String },

    #[error("engine launch failed: {0}")]
    EngineLaunchFailed(String),

    #[error("engine rejected configuration: {0}")]
    EngineRejectedConfig(String),

    #[error("engine did not exit within {grace:?} and was killed")]
    EngineTerminateTimeout { grace: Duration },

    #[error("engine stopped responding: {0}")]
    EngineCrashed(String),

    #[error("required dependency missing: {0}")]
    DependencyMissing(String),
}
