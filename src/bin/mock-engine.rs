//! Stand-in engine speaking the controller's stdin/stdout protocol. Used by
//! the integration tests and handy for trying the controller without a real
//! proxy core.

use std::{
    io, process, thread,
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::Parser;

use proxy_pilot::{
    configuration::EngineConfig,
    ipc::{self, Command, Reply, TrafficStats},
};

#[derive(Debug, Parser)]
#[command(name = "mock-engine", about = "Minimal engine for exercising proxy-pilot")]
struct Arguments {
    /// Sleep this long before answering `start`
    #[arg(long, default_value_t = 0)]
    hang_on_start_ms: u64,

    /// Exit with status 3 this long after a successful `start`
    #[arg(long)]
    exit_after_start_ms: Option<u64>,

    /// Refuse `stop`, keep running after end of input, ignore SIGTERM
    #[arg(long)]
    ignore_stop: bool,

    /// Write the process id here on startup
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

struct MockEngine {
    arguments: Arguments,
    configuration: Option<EngineConfig>,
    started_at: Option<Instant>,
}

impl MockEngine {
    fn handle(&mut self, command: Command) -> Reply {
        log::debug!("command: {}", command.name());
        match command {
            Command::SetConfig { config } => match check_configuration(&config) {
                Ok(()) => {
                    self.configuration = Some(config);
                    Reply::success()
                }
                Err(reason) => {
                    log::error!("rejecting configuration: {reason}");
                    Reply::failure(reason)
                }
            },
            Command::Start => self.start(),
            Command::Stop => {
                if self.arguments.ignore_stop {
                    log::warn!("ignoring stop");
                    return Reply::failure("stop ignored");
                }
                self.started_at = None;
                log::info!("stopped");
                Reply::success()
            }
            Command::HealthCheck => match self.started_at {
                Some(started_at) => {
                    let elapsed = started_at.elapsed().as_millis() as u64;
                    Reply::with_stats(TrafficStats {
                        uplink: elapsed * 10,
                        downlink: elapsed * 40,
                    })
                }
                None => Reply::failure("not started"),
            },
        }
    }

    fn start(&mut self) -> Reply {
        let Some(configuration) = &self.configuration else {
            return Reply::failure("start before set_config");
        };
        if self.arguments.hang_on_start_ms > 0 {
            log::warn!("hanging for {}ms", self.arguments.hang_on_start_ms);
            thread::sleep(Duration::from_millis(self.arguments.hang_on_start_ms));
        }

        log::info!(
            "listening (socks={}, http={}, outbound={})",
            configuration.inbound.socks.as_deref().unwrap_or("-"),
            configuration.inbound.http.as_deref().unwrap_or("-"),
            configuration.selected_outbound.as_deref().unwrap_or("-"),
        );
        self.started_at = Some(Instant::now());

        if let Some(delay) = self.arguments.exit_after_start_ms {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay));
                log::error!("simulated crash");
                process::exit(3);
            });
        }
        Reply::success()
    }
}

fn check_configuration(configuration: &EngineConfig) -> Result<(), String> {
    if configuration.outbounds.is_empty() {
        return Err("no outbounds configured".into());
    }
    if let Some(selected) = &configuration.selected_outbound
        && !configuration
            .outbounds
            .iter()
            .any(|outbound| &outbound.tag == selected)
    {
        return Err(format!("selected outbound '{selected}' is not defined"));
    }
    for outbound in &configuration.outbounds {
        if !outbound.requires_endpoint() {
            continue;
        }
        if outbound.address.trim().is_empty() {
            return Err(format!("outbound '{}' is missing address", outbound.tag));
        }
        if outbound.port == 0 {
            return Err(format!("outbound '{}' is missing port", outbound.tag));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn ignore_terminate_signal() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    if let Err(error) = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) } {
        log::warn!("cannot ignore SIGTERM: {error}");
    }
}

#[cfg(not(unix))]
fn ignore_terminate_signal() {}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let arguments = Arguments::parse();

    if let Some(path) = &arguments.pid_file
        && let Err(error) = std::fs::write(path, process::id().to_string())
    {
        log::error!("cannot write pid file {}: {error}", path.display());
    }
    if arguments.ignore_stop {
        ignore_terminate_signal();
    }

    let ignore_stop = arguments.ignore_stop;
    let mut engine = MockEngine {
        arguments,
        configuration: None,
        started_at: None,
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    if let Err(error) = ipc::serve(stdin.lock(), stdout.lock(), |command| engine.handle(command)) {
        log::error!("control channel failed: {error}");
    }

    if ignore_stop {
        log::warn!("control channel closed, staying up");
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
    log::info!("control channel closed, exiting");
}
