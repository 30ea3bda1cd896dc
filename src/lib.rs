pub mod cli;
pub mod configuration;
pub mod connection_state;
pub mod engine;
pub mod engine_log;
pub mod error;
pub mod ipc;
pub mod lifecycle;
pub mod manager;
pub mod request_queue;
pub mod signals;
pub mod single_instance;
pub mod system;

pub use crate::{
    configuration::{ConfigStore, Configuration},
    connection_state::ConnectionState,
    error::{Error, Result},
    lifecycle::{Application, ExitCode, Options},
    manager::{ConnectionEvent, ConnectionManager, ConnectionObserver},
};
