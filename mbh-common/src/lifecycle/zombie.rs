//! Reaping leftover server processes that still hold the harness ports.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::poll::{Deadline, PollError, PollSpec, Probe, poll_until};
use crate::process::{HostProcesses, Signal};

/// What a cleanup pass found and did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ZombieReport {
    pub found: Vec<u32>,
    /// Exited after SIGTERM.
    pub terminated: Vec<u32>,
    /// Needed SIGKILL.
    pub killed: Vec<u32>,
}

impl ZombieReport {
    pub fn is_clean(&self) -> bool {
        self.found.is_empty()
    }
}

/// Polling cadence for the escalation and the port wait.
#[derive(Debug, Clone, Copy)]
pub struct ReapTiming {
    pub term_poll_interval: Duration,
    /// Checks after SIGTERM, one per interval. SIGKILL follows the last
    /// one, so the grace period is `term_poll_interval * term_poll_attempts`.
    pub term_poll_attempts: u32,
    pub port_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    AlreadyGone,
    Terminated,
    Killed,
}

/// Terminate whatever holds `ports`, then wait for the ports to be released.
///
/// Each owner gets SIGTERM, a short bounded wait, then SIGKILL. With no
/// owners and free ports this returns immediately. Ports still bound at the
/// deadline are a [`HarnessError::PortInUse`].
pub fn cleanup_zombie_processes(
    host: &dyn HostProcesses,
    ports: &[u16],
    timing: ReapTiming,
    timeout: Duration,
) -> HarnessResult<ZombieReport> {
    info!(?ports, "Checking for zombie processes on server ports");
    let deadline = Deadline::after(timeout);
    let mut report = ZombieReport::default();

    for &port in ports {
        for pid in host.listening_pids(port) {
            if !report.found.contains(&pid) {
                warn!(pid, port, "Found process on harness port");
                report.found.push(pid);
            }
        }
    }

    if report.is_clean() {
        if !ports.iter().any(|&p| host.port_in_use(p)) {
            info!("No zombie processes found");
            return Ok(report);
        }
        warn!(?ports, "Port bound by a process with no visible owner");
    }

    for pid in report.found.clone() {
        match terminate(host, pid, timing, deadline) {
            Termination::AlreadyGone => debug!(pid, "Process already gone"),
            Termination::Terminated => report.terminated.push(pid),
            Termination::Killed => report.killed.push(pid),
        }
    }

    let waited = poll_until(PollSpec::new(deadline, timing.port_poll_interval), |_| {
        match ports.iter().copied().find(|&p| host.port_in_use(p)) {
            Some(_) => Probe::<(), ()>::Pending,
            None => Probe::Ready(()),
        }
    });

    match waited {
        Ok(()) => {
            info!(
                terminated = report.terminated.len(),
                killed = report.killed.len(),
                "Zombie process cleanup complete"
            );
            Ok(report)
        }
        Err(PollError::DeadlineExpired { waited, .. } | PollError::AttemptsExhausted { waited, .. }) => {
            let port = ports
                .iter()
                .copied()
                .find(|&p| host.port_in_use(p))
                .or_else(|| ports.first().copied())
                .unwrap_or_default();
            Err(HarnessError::PortInUse { port, waited })
        }
        Err(PollError::Aborted(())) => Err(HarnessError::PortInUse {
            port: ports.first().copied().unwrap_or_default(),
            waited: deadline.elapsed(),
        }),
    }
}

fn terminate(host: &dyn HostProcesses, pid: u32, timing: ReapTiming, deadline: Deadline) -> Termination {
    if !host.is_alive(pid) {
        return Termination::AlreadyGone;
    }

    info!(pid, signal = Signal::Term.as_str(), "Sending signal to zombie process");
    if let Err(e) = host.signal(pid, Signal::Term) {
        debug!(pid, error = %e, "SIGTERM not delivered");
        if !host.is_alive(pid) {
            return Termination::AlreadyGone;
        }
    }

    // One extra check at t=0 so every counted attempt follows a full interval.
    let exited = poll_until(
        PollSpec::new(deadline, timing.term_poll_interval)
            .with_max_attempts(timing.term_poll_attempts.saturating_add(1)),
        |_| {
            if host.is_alive(pid) {
                Probe::<(), ()>::Pending
            } else {
                Probe::Ready(())
            }
        },
    );
    if exited.is_ok() {
        info!(pid, "Process terminated gracefully");
        return Termination::Terminated;
    }

    warn!(pid, "Process didn't terminate, sending SIGKILL");
    if let Err(e) = host.signal(pid, Signal::Kill) {
        warn!(pid, error = %e, "SIGKILL not delivered");
    }
    Termination::Killed
}
