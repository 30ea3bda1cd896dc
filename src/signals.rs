use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    lifecycle::{ExitCode, ShutdownReason, ShutdownTrigger},
    manager::ConnectionManager,
    request_queue::{RequestSource, Submission},
};

const SESSION_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Interrupt,
    Hangup,
    Terminate,
    UserRestart,
    UserStop,
    /// The desktop session is ending and wants state written out now.
    SessionCommitData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    ShutdownRequested,
    /// A second terminate-class signal arrived while shutdown was underway.
    ForceExit,
    Restart(Submission),
    Stop(Submission),
    SessionSaved(bool),
    SessionIgnored,
}

/// Turns OS signals and session-manager callbacks into connection requests.
/// Nothing here blocks on the engine; the only wait is the bounded session
/// save.
pub struct SignalRouter {
    manager: ConnectionManager,
    shutdown: ShutdownTrigger,
    shutdown_requested: AtomicBool,
    session_committed: AtomicBool,
    session_save_timeout: Duration,
}

impl SignalRouter {
    pub fn new(manager: ConnectionManager, shutdown: ShutdownTrigger) -> Self {
        Self {
            manager,
            shutdown,
            shutdown_requested: AtomicBool::new(false),
            session_committed: AtomicBool::new(false),
            session_save_timeout: SESSION_SAVE_TIMEOUT,
        }
    }

    pub fn dispatch(&self, event: SignalEvent) -> Dispatch {
        log::info!("[signal] {event:?}");
        match event {
            SignalEvent::Interrupt | SignalEvent::Hangup | SignalEvent::Terminate => {
                if self.shutdown_requested.swap(true, Ordering::SeqCst) {
                    log::warn!("[signal] repeated {event:?} during shutdown, exiting immediately");
                    return Dispatch::ForceExit;
                }
                self.manager.stop_connection(RequestSource::Signal);
                self.shutdown.request(ShutdownReason::Signal(event));
                Dispatch::ShutdownRequested
            }
            SignalEvent::UserRestart => {
                Dispatch::Restart(self.manager.restart_connection(RequestSource::Signal))
            }
            SignalEvent::UserStop => {
                Dispatch::Stop(self.manager.stop_connection(RequestSource::Signal))
            }
            SignalEvent::SessionCommitData => self.commit_session(),
        }
    }

    fn commit_session(&self) -> Dispatch {
        if self.session_committed.swap(true, Ordering::SeqCst) {
            log::info!("[session] commit already handled");
            return Dispatch::SessionIgnored;
        }

        let ticket = self.manager.save_connection_config(RequestSource::Session);
        match ticket.wait(self.session_save_timeout) {
            Some(Ok(path)) => {
                log::info!("[session] configuration committed to {}", path.display());
                Dispatch::SessionSaved(true)
            }
            Some(Err(error)) => {
                log::error!("[session] commit failed: {error}");
                Dispatch::SessionSaved(false)
            }
            None => {
                log::warn!(
                    "[session] save not confirmed within {:?}",
                    self.session_save_timeout
                );
                Dispatch::SessionSaved(false)
            }
        }
    }

    /// Registers OS signal handlers and routes them from a dedicated thread.
    /// Registration errors are returned; delivery runs until the process
    /// exits.
    pub fn install(self: Arc<Self>) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut listeners = {
            let _context = runtime.enter();
            platform::Listeners::register()?
        };
        #[cfg(target_os = "linux")]
        logind::watch(self.clone());

        thread::spawn(move || {
            runtime.block_on(async move {
                while let Some(event) = listeners.next().await {
                    if self.dispatch(event) == Dispatch::ForceExit {
                        std::process::exit(ExitCode::Interrupted.code());
                    }
                }
            });
        });
        log::info!("[signal] handlers installed");
        Ok(())
    }
}

#[cfg(unix)]
mod platform {
    use std::io;

    use tokio::signal::unix::{Signal, SignalKind, signal};

    use super::SignalEvent;

    pub struct Listeners {
        interrupt: Signal,
        hangup: Signal,
        terminate: Signal,
        user_restart: Signal,
        user_stop: Signal,
    }

    impl Listeners {
        pub fn register() -> io::Result<Self> {
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                hangup: signal(SignalKind::hangup())?,
                terminate: signal(SignalKind::terminate())?,
                user_restart: signal(SignalKind::user_defined1())?,
                user_stop: signal(SignalKind::user_defined2())?,
            })
        }

        pub async fn next(&mut self) -> Option<SignalEvent> {
            tokio::select! {
                Some(()) = self.interrupt.recv() => Some(SignalEvent::Interrupt),
                Some(()) = self.hangup.recv() => Some(SignalEvent::Hangup),
                Some(()) = self.terminate.recv() => Some(SignalEvent::Terminate),
                Some(()) = self.user_restart.recv() => Some(SignalEvent::UserRestart),
                Some(()) = self.user_stop.recv() => Some(SignalEvent::UserStop),
                else => None,
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::io;

    use tokio::signal::windows::{
        CtrlBreak, CtrlC, CtrlClose, CtrlLogoff, CtrlShutdown, ctrl_break, ctrl_c, ctrl_close,
        ctrl_logoff, ctrl_shutdown,
    };

    use super::SignalEvent;

    pub struct Listeners {
        ctrl_c: CtrlC,
        ctrl_break: CtrlBreak,
        close: CtrlClose,
        logoff: CtrlLogoff,
        shutdown: CtrlShutdown,
    }

    impl Listeners {
        pub fn register() -> io::Result<Self> {
            Ok(Self {
                ctrl_c: ctrl_c()?,
                ctrl_break: ctrl_break()?,
                close: ctrl_close()?,
                logoff: ctrl_logoff()?,
                shutdown: ctrl_shutdown()?,
            })
        }

        pub async fn next(&mut self) -> Option<SignalEvent> {
            tokio::select! {
                Some(()) = self.ctrl_c.recv() => Some(SignalEvent::Interrupt),
                Some(()) = self.ctrl_break.recv() => Some(SignalEvent::UserRestart),
                Some(()) = self.close.recv() => Some(SignalEvent::Terminate),
                Some(()) = self.shutdown.recv() => Some(SignalEvent::Terminate),
                Some(()) = self.logoff.recv() => Some(SignalEvent::SessionCommitData),
                else => None,
            }
        }
    }
}

/// logind has no per-client session protocol; `PrepareForShutdown(true)` on
/// the system bus is the last notice before the session goes away.
#[cfg(target_os = "linux")]
mod logind {
    use std::{
        io::{BufRead, BufReader},
        sync::Arc,
        thread,
    };

    use super::{SignalEvent, SignalRouter};
    use crate::system;

    const MONITOR_ARGUMENTS: &[&str] = &[
        "monitor",
        "--system",
        "--dest",
        "org.freedesktop.login1",
        "--object-path",
        "/org/freedesktop/login1",
    ];

    pub fn watch(router: Arc<SignalRouter>) {
        let mut child = match system::spawn_monitor("gdbus", MONITOR_ARGUMENTS) {
            Ok(child) => child,
            Err(error) => {
                log::info!("[session] logind monitor unavailable: {error}");
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            return;
        };

        thread::spawn(move || {
            route_lines(BufReader::new(stdout), &router);
            let _ = child.wait();
            log::debug!("[session] logind monitor exited");
        });
    }

    pub fn route_lines(reader: impl BufRead, router: &SignalRouter) {
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            if is_prepare_for_shutdown(&line) {
                router.dispatch(SignalEvent::SessionCommitData);
            }
        }
    }

    /// Matches `gdbus monitor` output such as
    /// `/org/freedesktop/login1: org.freedesktop.login1.Manager.PrepareForShutdown (true,)`.
    pub fn is_prepare_for_shutdown(line: &str) -> bool {
        line.split_once(".Manager.PrepareForShutdown")
            .is_some_and(|(_, arguments)| arguments.trim_start().starts_with("(true"))
    }
}
