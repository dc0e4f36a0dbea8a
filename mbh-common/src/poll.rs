//! Bounded polling.
//!
//! Log readiness, channel readiness, port release and process exit all wait
//! the same way: check, sleep a fixed interval, stop at a wall-clock
//! deadline or an attempt budget.

use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

/// Wall-clock deadline measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

/// Result of one check.
#[derive(Debug)]
pub enum Probe<T, E> {
    Ready(T),
    Pending,
    /// Stop polling immediately with this error.
    Abort(E),
}

/// How to poll.
#[derive(Debug, Clone, Copy)]
pub struct PollSpec {
    pub deadline: Deadline,
    pub interval: Duration,
    /// Stop after this many checks even if time remains.
    pub max_attempts: Option<u32>,
}

impl PollSpec {
    pub fn new(deadline: Deadline, interval: Duration) -> Self {
        Self {
            deadline,
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

/// Why polling ended without a ready value.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    DeadlineExpired { waited: Duration, attempts: u32 },
    AttemptsExhausted { waited: Duration, attempts: u32 },
    Aborted(E),
}

/// Run `check` until it reports ready, aborts, or the spec's bounds run out.
///
/// `check` always runs at least once and receives the 1-based attempt
/// number. The final sleep is clipped to the remaining time, so the total
/// wait never overshoots the deadline by more than one check.
pub fn poll_until<T, E, F>(spec: PollSpec, mut check: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Probe<T, E>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match check(attempts) {
            Probe::Ready(value) => return Ok(value),
            Probe::Abort(err) => return Err(PollError::Aborted(err)),
            Probe::Pending => {}
        }

        if spec.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(PollError::AttemptsExhausted {
                waited: spec.deadline.elapsed(),
                attempts,
            });
        }
        let remaining = spec.deadline.remaining();
        if remaining.is_zero() {
            return Err(PollError::DeadlineExpired {
                waited: spec.deadline.elapsed(),
                attempts,
            });
        }

        let nap = spec.interval.min(remaining);
        trace!(attempt = attempts, nap_ms = nap.as_millis() as u64, "poll pending");
        thread::sleep(nap);
    }
}
