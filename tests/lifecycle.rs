mod common;

use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use proxy_pilot::{
    Application, ConfigStore, ConnectionEvent, ConnectionObserver, ConnectionState, Error,
    ExitCode, Options,
    configuration::{CONFIG_FILE_NAME, Outbound},
    lifecycle::{BootstrapError, ShutdownReason},
    request_queue::RequestSource,
    signals::{Dispatch, SignalEvent},
};

use common::{engine_arguments, mock_engine, wait_for_state, write_configuration};

fn options_for(directory: &std::path::Path) -> (Options, mpsc::Receiver<ConnectionEvent>) {
    let (sender, events) = mpsc::channel();
    let options = Options {
        config_directory: Some(directory.to_path_buf()),
        engine_binary: Some(mock_engine()),
        install_signal_handlers: false,
        shutdown_timeout: Duration::from_secs(10),
        observers: vec![Arc::new(sender) as Arc<dyn ConnectionObserver>],
        ..Options::default()
    };
    (options, events)
}

fn bootstrap(options: &Options) -> Application {
    match Application::bootstrap(options) {
        Ok(application) => application,
        Err(error) => panic!("bootstrap failed: {error}"),
    }
}

#[test]
fn fresh_install_connects_and_quits_cleanly() {
    let root = tempfile::tempdir().unwrap();
    let directory = root.path().join("config");
    let (options, _events) = options_for(&directory);

    let application = bootstrap(&options);
    assert_eq!(application.config_path(), directory.join(CONFIG_FILE_NAME));
    assert!(application.config_path().is_file());

    let manager = application.manager().clone();
    assert_eq!(manager.current_state(), ConnectionState::Idle);
    manager.start_connection(RequestSource::Ui);
    assert!(wait_for_state(&manager, ConnectionState::Connected, Duration::from_secs(5)));
    manager.stop_connection(RequestSource::Ui);
    assert!(wait_for_state(&manager, ConnectionState::Idle, Duration::from_secs(5)));

    assert!(application.shutdown_trigger().request(ShutdownReason::Quit));
    let termination = application.run();
    assert_eq!(termination.code, ExitCode::Normal);
    assert!(termination.clean);

    let saved = ConfigStore::load_from(&directory.join(CONFIG_FILE_NAME)).unwrap();
    assert!(saved.statistics.last_connected.is_some());
}

#[cfg(unix)]
#[test]
fn terminate_signal_stops_engine_and_exits_normally() {
    let directory = tempfile::tempdir().unwrap();
    let pid_file = directory.path().join("engine.pid");
    write_configuration(directory.path(), |configuration| {
        configuration.auto_connect = true;
        configuration.engine.arguments = engine_arguments(&pid_file, &[]);
    });
    let (options, _events) = options_for(directory.path());

    let application = bootstrap(&options);
    let manager = application.manager().clone();
    assert!(wait_for_state(&manager, ConnectionState::Connected, Duration::from_secs(5)));
    let pid = common::read_pid(&pid_file);

    assert_eq!(
        application.router().dispatch(SignalEvent::Terminate),
        Dispatch::ShutdownRequested
    );
    let started = Instant::now();
    let termination = application.run();
    assert_eq!(termination.code, ExitCode::Normal);
    assert!(termination.clean);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!common::process_alive(pid));
}

#[cfg(unix)]
#[test]
fn missed_shutdown_deadline_exits_interrupted() {
    let directory = tempfile::tempdir().unwrap();
    let pid_file = directory.path().join("engine.pid");
    write_configuration(directory.path(), |configuration| {
        configuration.auto_connect = true;
        configuration.engine.terminate_grace_ms = 3_000;
        configuration.engine.arguments = engine_arguments(&pid_file, &["--ignore-stop"]);
    });
    let (mut options, _events) = options_for(directory.path());
    options.shutdown_timeout = Duration::from_millis(300);

    let application = bootstrap(&options);
    let manager = application.manager().clone();
    assert!(wait_for_state(&manager, ConnectionState::Connected, Duration::from_secs(5)));
    let pid = common::read_pid(&pid_file);

    application.router().dispatch(SignalEvent::Terminate);
    let termination = application.run();
    assert_eq!(termination.code, ExitCode::Interrupted);
    assert!(!termination.clean);

    // The control thread keeps going in the background and kills the engine.
    assert!(common::wait_for(Duration::from_secs(10), || !common::process_alive(pid)));
}

#[test]
fn no_auto_connect_overrides_configuration() {
    let directory = tempfile::tempdir().unwrap();
    write_configuration(directory.path(), |configuration| configuration.auto_connect = true);
    let (mut options, _events) = options_for(directory.path());
    options.no_auto_connect = true;

    let application = bootstrap(&options);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(application.manager().current_state(), ConnectionState::Idle);

    application.shutdown_trigger().request(ShutdownReason::Quit);
    assert!(application.run().clean);
}

#[cfg(unix)]
#[test]
fn engine_rejection_leaves_no_process_behind() {
    let directory = tempfile::tempdir().unwrap();
    let pid_file = directory.path().join("engine.pid");
    write_configuration(directory.path(), |configuration| {
        configuration.engine.arguments = engine_arguments(&pid_file, &[]);
        configuration.outbounds.push(Outbound {
            tag: "proxy".into(),
            protocol: "trojan".into(),
            address: "proxy.example.net".into(),
            port: 0,
            username: None,
            password: Some("secret".into()),
            id: None,
        });
        configuration.selected_outbound = Some("proxy".into());
    });
    let (options, events) = options_for(directory.path());

    let application = bootstrap(&options);
    let manager = application.manager().clone();
    manager.start_connection(RequestSource::Ui);
    assert!(wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(5)));
    assert!(matches!(
        manager.last_error(),
        Some(Error::EngineRejectedConfig(reason)) if reason.contains("port")
    ));
    assert!(!common::process_alive(common::read_pid(&pid_file)));
    assert!(events
        .try_iter()
        .any(|event| matches!(event, ConnectionEvent::Failed(_))));

    application.shutdown_trigger().request(ShutdownReason::Quit);
    assert_eq!(application.run().code, ExitCode::Normal);
}

#[cfg(unix)]
#[test]
fn hanging_engine_fails_within_launch_timeout() {
    let directory = tempfile::tempdir().unwrap();
    let pid_file = directory.path().join("engine.pid");
    write_configuration(directory.path(), |configuration| {
        configuration.engine.arguments = engine_arguments(&pid_file, &["--hang-on-start-ms", "10000"]);
        configuration.engine.launch_timeout_ms = 3000;
    });
    let (options, _events) = options_for(directory.path());

    let application = bootstrap(&options);
    let manager = application.manager().clone();
    let started = Instant::now();
    manager.start_connection(RequestSource::Ui);
    assert!(wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(5)));
    assert!(started.elapsed() < Duration::from_millis(4500));
    assert!(matches!(manager.last_error(), Some(Error::EngineLaunchFailed(_))));
    assert!(!common::process_alive(common::read_pid(&pid_file)));

    application.shutdown_trigger().request(ShutdownReason::Quit);
    assert!(application.run().clean);
}

#[test]
fn crashed_engine_moves_connection_to_failed() {
    let directory = tempfile::tempdir().unwrap();
    let pid_file = directory.path().join("engine.pid");
    write_configuration(directory.path(), |configuration| {
        configuration.engine.arguments = engine_arguments(&pid_file, &["--exit-after-start-ms", "200"]);
        configuration.engine.health_interval_ms = 100;
    });
    let (options, _events) = options_for(directory.path());

    let application = bootstrap(&options);
    let manager = application.manager().clone();
    manager.start_connection(RequestSource::Ui);
    assert!(wait_for_state(&manager, ConnectionState::Failed, Duration::from_secs(5)));
    assert!(matches!(manager.last_error(), Some(Error::EngineCrashed(_))));

    application.shutdown_trigger().request(ShutdownReason::Quit);
    assert!(application.run().clean);
}

#[test]
fn session_commit_saves_once_without_engine_work() {
    let directory = tempfile::tempdir().unwrap();
    let (options, events) = options_for(directory.path());
    let application = bootstrap(&options);

    let router = application.router().clone();
    assert_eq!(
        router.dispatch(SignalEvent::SessionCommitData),
        Dispatch::SessionSaved(true)
    );
    assert_eq!(
        router.dispatch(SignalEvent::SessionCommitData),
        Dispatch::SessionIgnored
    );
    let observed: Vec<_> = events.try_iter().collect();
    assert_eq!(
        observed
            .iter()
            .filter(|event| matches!(event, ConnectionEvent::ConfigSaved(_)))
            .count(),
        1
    );
    assert_eq!(application.manager().current_state(), ConnectionState::Idle);

    application.shutdown_trigger().request(ShutdownReason::Quit);
    assert!(application.run().clean);
}

#[test]
fn startup_failures_map_to_exit_codes() {
    let root = tempfile::tempdir().unwrap();

    let not_a_directory = root.path().join("plain-file");
    std::fs::write(&not_a_directory, "").unwrap();
    let (options, _events) = options_for(&not_a_directory.join("config"));
    let error = Application::bootstrap(&options).err().unwrap();
    assert_eq!(error.exit_code(), ExitCode::ConfigDirectory);

    let corrupt = root.path().join("corrupt");
    std::fs::create_dir_all(&corrupt).unwrap();
    std::fs::write(corrupt.join(CONFIG_FILE_NAME), "config_version = [").unwrap();
    let (options, _events) = options_for(&corrupt);
    let error = Application::bootstrap(&options).err().unwrap();
    assert_eq!(error.exit_code(), ExitCode::ConfigLoad);

    let (mut options, _events) = options_for(&root.path().join("healthy"));
    options.engine_binary = Some(root.path().join("missing-engine"));
    let error = Application::bootstrap(&options).err().unwrap();
    assert_eq!(error.exit_code(), ExitCode::DependencyMissing);
}

#[test]
fn second_instance_exits_normally() {
    let directory = tempfile::tempdir().unwrap();
    let (options, _events) = options_for(directory.path());
    let first = bootstrap(&options);

    let error = Application::bootstrap(&options).err().unwrap();
    assert!(matches!(error, BootstrapError::AlreadyRunning));
    assert_eq!(error.exit_code(), ExitCode::Normal);

    first.shutdown_trigger().request(ShutdownReason::Quit);
    assert!(first.run().clean);
}
