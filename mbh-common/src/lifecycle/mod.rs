//! Server process lifecycle.
//!
//! [`ProcessLifecycleController`] owns one server process at a time:
//! zombie cleanup, world reset, launch, two-phase readiness (log marker,
//! then a command-channel probe), escalating shutdown, and a `cleanup()`
//! that never fails and also runs on drop.

pub mod shutdown;
pub mod zombie;

use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::channel::{CommandChannel, CommandTransport};
use crate::config::{HarnessConfig, TimeoutConfig};
use crate::errors::{HarnessError, HarnessResult};
use crate::poll::{Deadline, PollError, PollSpec, Probe, poll_until};
use crate::process::{HostProcesses, Signal, signal_process_tree};

use shutdown::{ShutdownBudget, ShutdownTarget, ShutdownTrace, run_shutdown};
use zombie::{ReapTiming, cleanup_zombie_processes};

/// Interval for child-exit polling during shutdown waits.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Cleaning,
    Launching,
    AwaitingReady,
    Ready,
    /// A caller has taken the command channel.
    Running,
    Stopping,
    Stopped,
    /// The process exited before readiness. Absorbing.
    Crashed,
    /// Startup failed for any other reason. Absorbing.
    Error,
}

impl LifecycleState {
    pub fn accepts_start(self) -> bool {
        matches!(self, Self::Idle | Self::Stopped)
    }

    pub fn is_absorbing(self) -> bool {
        matches!(self, Self::Crashed | Self::Error)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Cleaning => "CLEANING",
            Self::Launching => "LAUNCHING",
            Self::AwaitingReady => "AWAITING_READY",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Crashed => "CRASHED",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Both readiness signals; a session is ready only when both hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessState {
    pub log_marker_seen: bool,
    pub channel_verified: bool,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        self.log_marker_seen && self.channel_verified
    }
}

/// The live process of one start/stop cycle.
#[derive(Debug)]
pub struct ServerSession {
    child: Child,
    pub pid: u32,
    pub started_at: Instant,
    pub readiness: ReadinessState,
}

// ---------------------------------------------------------------------------
// Interrupt handle
// ---------------------------------------------------------------------------

/// Lets another thread kill the active server, e.g. on Ctrl-C.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    active: Arc<AtomicU32>,
    interrupted: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32) {
        self.active.store(pid, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.active.store(0, Ordering::SeqCst);
    }

    pub fn active_pid(&self) -> Option<u32> {
        match self.active.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Mark the run interrupted and SIGKILL the active server, if any.
    pub fn kill_active(&self) -> Option<u32> {
        self.interrupted.store(true, Ordering::SeqCst);
        let pid = self.active.swap(0, Ordering::SeqCst);
        if pid == 0 {
            return None;
        }
        warn!(pid, "Interrupted, killing server process");
        if let Err(e) = signal_process_tree(pid, Signal::Kill) {
            error!(pid, error = %e, "Failed to kill server on interrupt");
        }
        Some(pid)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything the controller needs, resolved from [`HarnessConfig`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub server_dir: PathBuf,
    pub launch_script: PathBuf,
    pub launch_args: Vec<String>,
    pub world_dir: PathBuf,
    pub log_path: PathBuf,
    pub ports: Vec<u16>,
    pub ready_pattern: Regex,
    pub timeouts: TimeoutConfig,
    pub probe_retries: u32,
    pub probe_delay: Duration,
    /// Upper bound on a single readiness probe.
    pub probe_timeout: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        let ready_pattern = Regex::new(&config.server.ready_pattern)
            .map_err(|e| HarnessError::Config(format!("invalid ready_pattern: {e}")))?;
        Ok(Self {
            server_dir: config.paths.server_dir.clone(),
            launch_script: config.paths.server_dir.join(&config.server.launch_script),
            launch_args: config.server.launch_args.clone(),
            world_dir: config.paths.server_dir.join(&config.server.world_name),
            log_path: config.paths.server_log(),
            ports: config.managed_ports().to_vec(),
            ready_pattern,
            timeouts: config.timeouts.clone(),
            probe_retries: config.channel.ready_probe_retries.max(1),
            probe_delay: config.channel.ready_probe_delay,
            probe_timeout: config.channel.connect_timeout,
        })
    }

    fn reap_timing(&self) -> ReapTiming {
        ReapTiming {
            term_poll_interval: self.timeouts.term_poll_interval,
            term_poll_attempts: self.timeouts.term_poll_attempts,
            port_poll_interval: self.timeouts.port_poll_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Drives one server process through its lifecycle.
pub struct ProcessLifecycleController {
    settings: LifecycleSettings,
    channel: CommandChannel,
    host: Arc<dyn HostProcesses>,
    interrupt: InterruptHandle,
    state: LifecycleState,
    session: Option<ServerSession>,
}

impl ProcessLifecycleController {
    /// Fails with [`HarnessError::Setup`] if the launch script is missing.
    pub fn new(
        config: &HarnessConfig,
        transport: Arc<dyn CommandTransport>,
        host: Arc<dyn HostProcesses>,
        interrupt: InterruptHandle,
    ) -> HarnessResult<Self> {
        let settings = LifecycleSettings::from_config(config)?;
        if !settings.launch_script.is_file() {
            return Err(HarnessError::Setup(format!(
                "Server run script not found: {}",
                settings.launch_script.display()
            )));
        }
        Ok(Self {
            channel: CommandChannel::from_config(config, transport),
            settings,
            host,
            interrupt,
            state: LifecycleState::Idle,
            session: None,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.pid)
    }

    pub fn readiness(&self) -> Option<ReadinessState> {
        self.session.as_ref().map(|s| s.readiness)
    }

    pub fn server_dir(&self) -> &Path {
        &self.settings.server_dir
    }

    /// Server stdout/stderr capture for the current or last session.
    pub fn log_path(&self) -> &Path {
        &self.settings.log_path
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Lifecycle transition");
            self.state = next;
        }
    }

    /// Start with the configured startup timeout.
    pub fn start(&mut self) -> HarnessResult<()> {
        self.start_with_timeout(self.settings.timeouts.server_startup)
    }

    /// Clean up zombies, reset the world, launch, and wait for readiness.
    ///
    /// On any failure the launched process is killed before returning.
    pub fn start_with_timeout(&mut self, timeout: Duration) -> HarnessResult<()> {
        if !self.state.accepts_start() {
            return Err(HarnessError::Setup(format!(
                "cannot start server from state {}",
                self.state
            )));
        }
        let deadline = Deadline::after(timeout);
        info!(timeout_secs = timeout.as_secs_f64(), "Starting server");

        self.transition(LifecycleState::Cleaning);
        if let Err(e) = cleanup_zombie_processes(
            self.host.as_ref(),
            &self.settings.ports,
            self.settings.reap_timing(),
            self.settings.timeouts.zombie_cleanup,
        ) {
            error!(error = %e, "Zombie cleanup failed");
            self.transition(LifecycleState::Error);
            return Err(e);
        }
        self.delete_world();

        self.transition(LifecycleState::Launching);
        let child = match self.launch() {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "Launch failed");
                self.transition(LifecycleState::Error);
                return Err(e);
            }
        };
        let pid = child.id();
        info!(pid, "Server process started");
        self.interrupt.register(pid);
        self.session = Some(ServerSession {
            child,
            pid,
            started_at: Instant::now(),
            readiness: ReadinessState::default(),
        });

        self.transition(LifecycleState::AwaitingReady);
        match self.wait_for_ready(deadline.remaining()) {
            Ok(_) => {
                self.transition(LifecycleState::Ready);
                info!(elapsed_ms = deadline.elapsed().as_millis() as u64, "Server startup complete");
                Ok(())
            }
            Err(e) => {
                let next = match e {
                    HarnessError::Crash { .. } => LifecycleState::Crashed,
                    _ => LifecycleState::Error,
                };
                self.abort_session();
                self.transition(next);
                Err(e)
            }
        }
    }

    fn launch(&self) -> HarnessResult<Child> {
        let log_path = &self.settings.log_path;
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).map_err(|e| HarnessError::file(dir, e))?;
        }
        let stdout = File::create(log_path).map_err(|e| HarnessError::file(log_path, e))?;
        let stderr = stdout.try_clone().map_err(|e| HarnessError::file(log_path, e))?;

        info!(
            script = %self.settings.launch_script.display(),
            args = ?self.settings.launch_args,
            "Launching server"
        );
        let mut cmd = Command::new(&self.settings.launch_script);
        cmd.args(&self.settings.launch_args)
            .current_dir(&self.settings.server_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so signals reach the JVM behind the launch script.
            cmd.process_group(0);
        }
        cmd.spawn()
            .map_err(|e| HarnessError::Startup(format!("Failed to start server process: {e}")))
    }

    /// Two-phase readiness: poll the log for the marker, then probe the
    /// command channel until it answers.
    ///
    /// Process exit during either phase is a [`HarnessError::Crash`].
    pub fn wait_for_ready(&mut self, timeout: Duration) -> HarnessResult<ReadinessState> {
        let deadline = Deadline::after(timeout);
        let settings = &self.settings;
        let channel = &self.channel;
        let session = self.session.as_mut().ok_or_else(|| {
            HarnessError::Setup("wait_for_ready called without a launched server".to_string())
        })?;
        info!(timeout_secs = timeout.as_secs_f64(), "Waiting for server ready");

        let child = &mut session.child;
        let marker = poll_until(
            PollSpec::new(deadline, settings.timeouts.log_poll_interval),
            |_| {
                if let Some(code) = exit_code(child) {
                    return Probe::Abort(code);
                }
                if log_contains(&settings.log_path, &settings.ready_pattern) {
                    Probe::Ready(())
                } else {
                    Probe::Pending
                }
            },
        );
        match marker {
            Ok(()) => {
                info!("Server ready message detected in log");
                session.readiness.log_marker_seen = true;
            }
            Err(PollError::Aborted(exit_code)) => {
                error!(?exit_code, "Server process exited during startup");
                return Err(HarnessError::Crash { exit_code });
            }
            Err(_) => {
                return Err(HarnessError::Startup(format!(
                    "Server did not become ready within {timeout:?}"
                )));
            }
        }

        let retries = settings.probe_retries;
        let window = deadline.remaining().max(settings.timeouts.ready_probe_min_window);
        let per_probe = (window / retries).min(settings.probe_timeout);
        let verified = poll_until(
            PollSpec::new(Deadline::after(window), settings.probe_delay).with_max_attempts(retries),
            |attempt| {
                if let Some(code) = exit_code(child) {
                    return Probe::Abort(code);
                }
                debug!(attempt, retries, "Probing command channel");
                if channel.probe(per_probe) {
                    Probe::Ready(())
                } else {
                    Probe::Pending
                }
            },
        );
        match verified {
            Ok(()) => {
                info!("Command channel verified");
                session.readiness.channel_verified = true;
                Ok(session.readiness)
            }
            Err(PollError::Aborted(exit_code)) => {
                error!(?exit_code, "Server process exited during channel verification");
                Err(HarnessError::Crash { exit_code })
            }
            Err(PollError::AttemptsExhausted { attempts, .. } | PollError::DeadlineExpired { attempts, .. }) => {
                Err(HarnessError::Startup(format!(
                    "Server logged readiness but the command channel never answered ({attempts} probes)"
                )))
            }
        }
    }

    /// Hand out the command channel. Only valid once the server is ready.
    pub fn channel(&mut self) -> HarnessResult<&CommandChannel> {
        match self.state {
            LifecycleState::Ready | LifecycleState::Running => {
                self.transition(LifecycleState::Running);
                Ok(&self.channel)
            }
            state => Err(HarnessError::Setup(format!(
                "command channel unavailable in state {state}"
            ))),
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.session
            .as_mut()
            .is_some_and(|s| matches!(s.child.try_wait(), Ok(None)))
    }

    /// Stop with the configured shutdown timeout.
    pub fn stop(&mut self) -> Option<ShutdownTrace> {
        self.stop_with_timeout(self.settings.timeouts.server_shutdown)
    }

    /// Save, ask the server to stop, then escalate to SIGTERM and SIGKILL.
    ///
    /// Channel failures along the way are logged, never returned. `None`
    /// when no server was running.
    pub fn stop_with_timeout(&mut self, timeout: Duration) -> Option<ShutdownTrace> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                debug!("stop() with no running server");
                return None;
            }
        };
        self.transition(LifecycleState::Stopping);
        info!(pid = session.pid, "Stopping server");

        let budget = ShutdownBudget {
            graceful: timeout,
            term: self.settings.timeouts.graceful_kill,
            kill: self.settings.timeouts.kill_confirm,
        };
        let mut target = SessionShutdown {
            child: &mut session.child,
            pid: session.pid,
            channel: &self.channel,
            save_flush: self.settings.timeouts.save_flush,
        };
        let trace = run_shutdown(&mut target, budget);

        self.interrupt.clear();
        self.transition(LifecycleState::Stopped);
        Some(trace)
    }

    /// Release everything. Never fails and is safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if self.session.is_some() {
            self.stop();
        }
        self.abort_session();
        if !self.state.is_absorbing() && self.state != LifecycleState::Idle {
            self.transition(LifecycleState::Stopped);
        }
    }

    /// Kill and reap the session without the graceful path.
    fn abort_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if matches!(session.child.try_wait(), Ok(None)) {
                warn!(pid = session.pid, "Killing server process");
                if let Err(e) = signal_process_tree(session.pid, Signal::Kill) {
                    debug!(pid = session.pid, error = %e, "Group kill failed");
                }
                let _ = session.child.kill();
            }
            let _ = session.child.wait();
        }
        self.interrupt.clear();
    }

    /// Remove the world directory so the next launch regenerates it.
    ///
    /// Failures and timeouts are logged; the launch proceeds regardless.
    pub fn delete_world(&self) {
        let world = self.settings.world_dir.clone();
        if !world.exists() {
            debug!("No world directory to delete");
            return;
        }
        info!(path = %world.display(), "Deleting world directory");

        let timeout = self.settings.timeouts.world_deletion;
        let (tx, rx) = mpsc::channel();
        let target = world.clone();
        thread::spawn(move || {
            let _ = tx.send(fs::remove_dir_all(&target));
        });
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => info!("World directory deleted"),
            Ok(Err(e)) => warn!(path = %world.display(), error = %e, "Error deleting world directory"),
            Err(_) => warn!(timeout_secs = timeout.as_secs_f64(), "World deletion timed out"),
        }
    }

    /// Copy `source` into the server directory as `dest_name`.
    pub fn copy_file_to_server(&self, source: &Path, dest_name: &str) -> HarnessResult<PathBuf> {
        if dest_name.is_empty() || dest_name.contains(['/', '\\']) || dest_name == ".." {
            return Err(HarnessError::Setup(format!(
                "destination must be a plain file name, got '{dest_name}'"
            )));
        }
        let dest = self.settings.server_dir.join(dest_name);
        fs::copy(source, &dest).map_err(|e| HarnessError::file(source, e))?;
        debug!(from = %source.display(), to = %dest.display(), "Copied file to server");
        Ok(dest)
    }
}

impl Drop for ProcessLifecycleController {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Exit code if the child has exited; `Some(None)` means killed by a signal.
fn exit_code(child: &mut Child) -> Option<Option<i32>> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.code()),
        _ => None,
    }
}

fn log_contains(path: &Path, pattern: &Regex) -> bool {
    fs::read(path)
        .map(|bytes| pattern.is_match(&String::from_utf8_lossy(&bytes)))
        .unwrap_or(false)
}

struct SessionShutdown<'a> {
    child: &'a mut Child,
    pid: u32,
    channel: &'a CommandChannel,
    save_flush: Duration,
}

impl ShutdownTarget for SessionShutdown<'_> {
    fn request_graceful(&mut self) {
        if !self.channel.send_best_effort("save-all").succeeded() {
            warn!("save-all failed");
        }
        thread::sleep(self.save_flush);
        if !self.channel.send_best_effort("stop").succeeded() {
            warn!("stop command failed");
        }
    }

    fn send(&mut self, signal: Signal) {
        if let Err(e) = signal_process_tree(self.pid, signal) {
            warn!(pid = self.pid, signal = signal.as_str(), error = %e, "Signal failed");
        }
        if signal == Signal::Kill {
            let _ = self.child.kill();
        }
    }

    fn wait_exit(&mut self, budget: Duration) -> bool {
        let child = &mut *self.child;
        poll_until(
            PollSpec::new(Deadline::after(budget), EXIT_POLL_INTERVAL),
            |_| match child.try_wait() {
                Ok(None) => Probe::<(), ()>::Pending,
                // An unwaitable child has already been reaped.
                Ok(Some(_)) | Err(_) => Probe::Ready(()),
            },
        )
        .is_ok()
    }
}
