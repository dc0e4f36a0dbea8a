//! Lifecycle controller against real child processes.
//!
//! Covers readiness (both signals required), crash detection, startup
//! timeouts, graceful and escalated shutdown, zombie cleanup and the
//! never-failing `cleanup()`.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{TestProject, host, transport};
use mbh_common::errors::TransportError;
use mbh_common::lifecycle::shutdown::ShutdownStep;
use mbh_common::mock::{MockHost, MockTransport};
use mbh_common::process::{Signal, is_process_alive};
use mbh_common::{
    CommandTransport, HarnessError, InterruptHandle, LifecycleState, ProcessLifecycleController,
};

fn controller(project: &TestProject, transport: Arc<dyn CommandTransport>, host: Arc<MockHost>) -> ProcessLifecycleController {
    ProcessLifecycleController::new(&project.config, transport, host, InterruptHandle::new())
        .expect("controller")
}

#[test]
fn test_start_then_stop() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let mock = transport();
    let mut server = controller(&project, mock.clone(), host());

    server.start().unwrap();
    assert_eq!(server.state(), LifecycleState::Ready);
    let readiness = server.readiness().unwrap();
    assert!(readiness.log_marker_seen && readiness.channel_verified);
    let pid = server.pid().unwrap();
    assert!(is_process_alive(pid));

    server.channel().unwrap().say("hello").unwrap();
    assert_eq!(server.state(), LifecycleState::Running);

    let trace = server.stop().unwrap();
    assert!(trace.confirmed());
    assert_eq!(server.state(), LifecycleState::Stopped);
    assert_eq!(server.pid(), None);

    let commands = mock.commands();
    assert_eq!(commands.first().map(String::as_str), Some("list"));
    assert!(commands.iter().any(|c| c == "say hello"));
    assert!(commands.iter().any(|c| c == "save-all"));
    assert!(commands.iter().any(|c| c == "stop"));
}

/// Touches `stop_requested` in the server directory when told to stop.
struct StopFileTransport {
    server_dir: PathBuf,
}

impl CommandTransport for StopFileTransport {
    fn execute(&self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
        if command == "stop" {
            fs::write(self.server_dir.join("stop_requested"), b"")
                .map_err(|e| TransportError::Connection(e.to_string()))?;
        }
        Ok(String::new())
    }
}

#[test]
fn test_graceful_stop_needs_no_signals() {
    let mut project = TestProject::new();
    project.config.timeouts.server_shutdown = Duration::from_secs(3);
    project.write_server_script(&format!(
        "echo '{}'\nwhile [ ! -f stop_requested ]; do sleep 0.05; done\nexit 0\n",
        common::READY_LINE
    ));
    let transport = Arc::new(StopFileTransport {
        server_dir: project.server_dir().to_path_buf(),
    });
    let mut server = controller(&project, transport, host());

    server.start().unwrap();
    let trace = server.stop().unwrap();
    assert_eq!(trace.final_step(), ShutdownStep::ConfirmedDead);
    assert_eq!(trace.escalated_to(), None);
}

#[test]
fn test_unresponsive_server_is_escalated() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let mut server = controller(&project, transport(), host());

    server.start().unwrap();
    let pid = server.pid().unwrap();
    let trace = server.stop().unwrap();
    assert!(trace.confirmed());
    assert_eq!(trace.escalated_to(), Some(Signal::Term));
    assert!(!is_process_alive(pid));
}

#[test]
fn test_crash_before_ready() {
    let project = TestProject::new();
    project.write_server_script("echo 'Loading libraries'\nexit 3\n");
    let mut server = controller(&project, transport(), host());

    let err = server.start().unwrap_err();
    assert!(matches!(err, HarnessError::Crash { exit_code: Some(3) }), "got {err:?}");
    assert!(err.is_startup_failure());
    assert_eq!(server.state(), LifecycleState::Crashed);
    assert!(server.start().is_err(), "crashed controller must not restart");

    server.cleanup();
    server.cleanup();
    assert_eq!(server.state(), LifecycleState::Crashed);
    assert_eq!(server.pid(), None);
}

#[test]
fn test_log_ready_but_channel_unreachable() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let mock = Arc::new(MockTransport::unreachable());
    let mut server = controller(&project, mock.clone(), host());

    let err = server.start().unwrap_err();
    assert!(matches!(err, HarnessError::Startup(_)), "got {err:?}");
    assert_eq!(server.state(), LifecycleState::Error);
    assert_eq!(server.pid(), None);

    let probes = mock.commands();
    assert_eq!(probes.len(), project.config.channel.ready_probe_retries as usize);
    assert!(probes.iter().all(|c| c == "list"));
    // Readiness log line was present, so the failure came from probing.
    assert!(project.server_log().contains("Done ("));

    server.cleanup();
    server.cleanup();
    assert_eq!(server.state(), LifecycleState::Error);
    assert_eq!(server.pid(), None);
    assert_eq!(mock.commands().len(), probes.len(), "cleanup after a failed start sends nothing");
}

#[test]
fn test_startup_timeout_kills_process() {
    let project = TestProject::new();
    project.write_server_script("exec sleep 30\n");
    let mut server = controller(&project, transport(), host());

    let started = Instant::now();
    let err = server.start_with_timeout(Duration::from_millis(300)).unwrap_err();
    assert!(matches!(err, HarnessError::Startup(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(server.pid(), None);
}

#[test]
fn test_cleanup_is_repeatable_and_allows_restart() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let mut server = controller(&project, transport(), host());

    server.cleanup();
    assert_eq!(server.state(), LifecycleState::Idle);

    server.start().unwrap();
    server.cleanup();
    server.cleanup();
    assert_eq!(server.state(), LifecycleState::Stopped);

    server.start().unwrap();
    assert_eq!(server.state(), LifecycleState::Ready);
    server.cleanup();
}

#[test]
fn test_world_is_reset_before_launch() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let world = project.server_dir().join("world");
    fs::create_dir_all(world.join("region")).unwrap();
    fs::write(world.join("level.dat"), b"old").unwrap();

    let mut server = controller(&project, transport(), host());
    server.start().unwrap();
    assert!(!world.exists());
    server.cleanup();
}

#[test]
fn test_zombie_listener_is_reaped_before_launch() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let hosts = host();
    hosts.add_listener(4242, &[project.config.server.port]);
    hosts.add_stubborn_listener(4343, &[project.config.channel.port]);

    let mut server = controller(&project, transport(), hosts.clone());
    server.start().unwrap();

    let signals = hosts.signals();
    assert!(signals.contains(&(4242, Signal::Term)));
    assert!(signals.contains(&(4343, Signal::Term)));
    assert!(signals.contains(&(4343, Signal::Kill)));
    assert!(!signals.iter().any(|(pid, sig)| *pid == 4242 && *sig == Signal::Kill));
    server.cleanup();
}

#[test]
fn test_port_held_without_owner_blocks_start() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let hosts = host();
    hosts.occupy_port(project.config.channel.port);

    let mut server = controller(&project, transport(), hosts);
    let err = server.start().unwrap_err();
    assert!(matches!(err, HarnessError::PortInUse { port, .. } if port == project.config.channel.port));
    assert_eq!(server.state(), LifecycleState::Error);
    assert!(!project.config.paths.server_log().exists(), "nothing may launch");
}

#[test]
fn test_missing_launch_script_is_setup_error() {
    let project = TestProject::new();
    let mut config = project.config.clone();
    config.server.launch_script = "missing.sh".to_string();
    let err = ProcessLifecycleController::new(&config, transport(), host(), InterruptHandle::new())
        .err()
        .unwrap();
    assert!(matches!(err, HarnessError::Setup(_)));
}

#[test]
fn test_copy_file_to_server() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let server = controller(&project, transport(), host());
    let source = project.root().join("chunks.txt");
    fs::write(&source, "1,1\n").unwrap();

    let dest = server.copy_file_to_server(&source, "chunk_list.txt").unwrap();
    assert_eq!(fs::read_to_string(dest).unwrap(), "1,1\n");
    assert!(server.copy_file_to_server(&source, "../escape.txt").is_err());
}

#[test]
fn test_interrupt_kills_active_server() {
    let project = TestProject::new();
    project.write_ready_server(&[]);
    let interrupt = InterruptHandle::new();
    let mut server =
        ProcessLifecycleController::new(&project.config, transport(), host(), interrupt.clone()).unwrap();

    server.start().unwrap();
    let pid = server.pid().unwrap();
    assert_eq!(interrupt.active_pid(), Some(pid));
    assert_eq!(interrupt.kill_active(), Some(pid));
    assert!(interrupt.is_interrupted());

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!server.is_running());
    server.cleanup();
}
