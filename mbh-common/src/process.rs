//! Host process control: timed subprocess execution, port occupancy and
//! signal delivery.
//!
//! Lifecycle code talks to the host only through [`HostProcesses`], so
//! tests can substitute a scripted process table.

use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, warn};

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Bound on host utility calls (`ss`, `kill`, `pgrep`).
const UTILITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Timed execution
// ---------------------------------------------------------------------------

/// Captured result of a finished (or killed) command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `program` with piped output, killing it once `timeout` elapses.
pub fn exec_with_timeout<I, S>(
    program: impl AsRef<OsStr>,
    args: I,
    cwd: Option<&Path>,
    timeout: Duration,
) -> std::io::Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let start = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let stdout_handle = child
        .stdout
        .take()
        .map(|mut stdout| thread::spawn(move || read_to_string(&mut stdout)));
    let stderr_handle = child
        .stderr
        .take()
        .map(|mut stderr| thread::spawn(move || read_to_string(&mut stderr)));

    let mut timed_out = false;
    let exit_status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            let _ = child.kill();
            break child.wait().ok();
        }
        thread::sleep(Duration::from_millis(10));
    };

    let stdout = join_output(stdout_handle);
    let stderr = join_output(stderr_handle);
    let exit_code = exit_status
        .and_then(|status| status.code())
        .unwrap_or(if timed_out { TIMEOUT_EXIT_CODE } else { -1 });

    Ok(CommandResult {
        exit_code,
        stdout,
        stderr,
        duration: start.elapsed(),
        timed_out,
    })
}

fn read_to_string<R: Read>(reader: &mut R) -> String {
    let mut bytes = Vec::new();
    let _ = reader.read_to_end(&mut bytes);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn join_output(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Signals and the process table
// ---------------------------------------------------------------------------

/// Signals the harness sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

/// What the lifecycle controller needs from the host.
pub trait HostProcesses: Send + Sync {
    /// PIDs of processes listening on `port`.
    fn listening_pids(&self, port: u16) -> Vec<u32>;

    /// Whether anything is listening on `port`, identifiable or not.
    fn port_in_use(&self, port: u16) -> bool;

    fn is_alive(&self, pid: u32) -> bool;

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), String>;
}

/// Real host backed by `ss` and `kill`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl SystemHost {
    fn ss_listing(&self, port: u16) -> Option<String> {
        let filter = format!("sport = :{port}");
        match exec_with_timeout("ss", ["-tlnp", filter.as_str()], None, UTILITY_TIMEOUT) {
            Ok(result) if result.success() => Some(result.stdout),
            Ok(result) => {
                debug!(port, exit_code = result.exit_code, "ss returned non-zero");
                None
            }
            Err(e) => {
                warn!(port, error = %e, "Failed to run ss");
                None
            }
        }
    }
}

impl HostProcesses for SystemHost {
    fn listening_pids(&self, port: u16) -> Vec<u32> {
        self.ss_listing(port)
            .map(|out| parse_ss_pids(&out, port))
            .unwrap_or_default()
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.ss_listing(port)
            .is_some_and(|out| ss_shows_listener(&out, port))
    }

    fn is_alive(&self, pid: u32) -> bool {
        is_process_alive(pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), String> {
        send_signal(pid, signal)
    }
}

/// Check whether a process exists.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Deliver `signal` via the `kill` utility.
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), String> {
    let flag = format!("-{}", signal.as_str());
    let pid_arg = pid.to_string();
    match exec_with_timeout("kill", [flag.as_str(), pid_arg.as_str()], None, UTILITY_TIMEOUT) {
        Ok(result) if result.success() => Ok(()),
        Ok(result) => Err(format!(
            "kill {flag} {pid} exited {}: {}",
            result.exit_code,
            result.stderr.trim()
        )),
        Err(e) => Err(format!("failed to execute kill: {e}")),
    }
}

/// Deliver `signal` to every process in group `pgid`, falling back to the
/// single process when the group is gone.
pub fn signal_process_tree(pgid: u32, signal: Signal) -> Result<(), String> {
    let flag = format!("-{}", signal.as_str());
    let group = format!("-{pgid}");
    match exec_with_timeout("kill", [flag.as_str(), "--", group.as_str()], None, UTILITY_TIMEOUT) {
        Ok(result) if result.success() => Ok(()),
        _ => send_signal(pgid, signal),
    }
}

/// First child of `parent` whose command name contains `name`.
pub fn find_child_pid(parent: u32, name: &str) -> Option<u32> {
    let parent_arg = parent.to_string();
    let result = exec_with_timeout("pgrep", ["-P", parent_arg.as_str()], None, UTILITY_TIMEOUT).ok()?;
    if !result.success() {
        return None;
    }
    result
        .stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .find(|pid| {
            let pid_arg = pid.to_string();
            exec_with_timeout("ps", ["-p", pid_arg.as_str(), "-o", "comm="], None, UTILITY_TIMEOUT)
                .is_ok_and(|r| r.stdout.contains(name))
        })
}

static PID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid=(\d+)").expect("pid regex is valid"));

/// Extract PIDs from `ss -tlnp` output, keeping only lines for `port`.
pub fn parse_ss_pids(output: &str, port: u16) -> Vec<u32> {
    let needle = format!(":{port}");
    let mut pids: Vec<u32> = output
        .lines()
        .filter(|line| line.contains(&needle))
        .flat_map(|line| {
            PID_REGEX
                .captures_iter(line)
                .filter_map(|c| c.get(1)?.as_str().parse().ok())
                .collect::<Vec<u32>>()
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// True if `ss` output lists a listener on `port`.
pub fn ss_shows_listener(output: &str, port: u16) -> bool {
    let needle = format!(":{port}");
    output
        .lines()
        .any(|line| line.starts_with("LISTEN") && line.split_whitespace().any(|f| f.ends_with(&needle)))
}
