use clap::Parser;

use proxy_pilot::{Application, ExitCode, cli::Cli};

fn main() -> std::process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = if error.use_stderr() {
                ExitCode::PreInit
            } else {
                ExitCode::Normal
            };
            let _ = error.print();
            return code.into();
        }
    };
    if let Err(message) = cli.validate() {
        eprintln!("proxy-pilot: {message}");
        return ExitCode::PreInit.into();
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.default_log_filter()),
    )
    .init();

    log::info!(
        "proxy-pilot v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("<default: {}>", cli.default_log_filter())),
    );
    log::info!(
        "[env] PROXY_PILOT_CONFIG_DIR={}, PROXY_PILOT_ENGINE={}",
        std::env::var("PROXY_PILOT_CONFIG_DIR").unwrap_or_default(),
        std::env::var("PROXY_PILOT_ENGINE").unwrap_or_default(),
    );

    let application = match Application::bootstrap(&cli.options()) {
        Ok(application) => application,
        Err(error) => {
            let code = error.exit_code();
            if code == ExitCode::Normal {
                log::info!("[startup] {error}");
            } else {
                log::error!("[startup] {error}");
            }
            eprintln!("proxy-pilot: {error}");
            return code.into();
        }
    };

    let termination = application.run();
    if !termination.clean {
        // The control thread is stuck; skip destructors and leave now.
        std::process::exit(termination.code.code());
    }
    termination.code.into()
}
