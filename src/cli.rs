use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::lifecycle::Options;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "proxy-pilot",
    version,
    about = "Supervises a proxy engine process and keeps its configuration on disk"
)]
pub struct Cli {
    /// Use this configuration directory instead of searching the default locations
    #[arg(long, value_name = "DIR", env = "PROXY_PILOT_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Path to the engine binary
    #[arg(long, value_name = "PATH", env = "PROXY_PILOT_ENGINE")]
    pub engine: Option<PathBuf>,

    /// Stay idle at startup even when `auto_connect` is set
    #[arg(long)]
    pub no_auto_connect: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    pub debug_log: bool,

    /// Seconds to wait for a clean shutdown before exiting anyway
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub shutdown_timeout: u64,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(directory) = &self.config_dir
            && directory.is_file()
        {
            return Err(format!(
                "--config-dir {} is a file, not a directory",
                directory.display()
            ));
        }
        Ok(())
    }

    pub fn options(&self) -> Options {
        Options {
            config_directory: self.config_dir.clone(),
            engine_binary: self.engine.clone(),
            no_auto_connect: self.no_auto_connect,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            ..Options::default()
        }
    }

    pub fn default_log_filter(&self) -> &'static str {
        if self.debug_log {
            "proxy_pilot=debug"
        } else {
            "proxy_pilot=info"
        }
    }
}
