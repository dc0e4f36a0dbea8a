//! Shutdown escalation as an explicit state machine.
//!
//! ```text
//! GracefulRequested -> WaitExit(Graceful) -> TermSent -> WaitExit(Term)
//!                   -> KillSent -> WaitExit(Kill) -> ConfirmedDead | Unconfirmed
//! ```
//!
//! Any `WaitExit` that observes the process exiting jumps straight to
//! `ConfirmedDead`.

use std::time::Duration;

use tracing::{info, warn};

use crate::process::Signal;

/// The escalation level a wait belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Graceful,
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    GracefulRequested,
    WaitExit(Escalation),
    TermSent,
    KillSent,
    ConfirmedDead,
    /// SIGKILL was sent but the exit was never observed.
    Unconfirmed,
}

impl ShutdownStep {
    /// Next step. `exited` only matters for `WaitExit` steps.
    pub fn next(self, exited: bool) -> Self {
        match self {
            Self::GracefulRequested => Self::WaitExit(Escalation::Graceful),
            Self::WaitExit(_) if exited => Self::ConfirmedDead,
            Self::WaitExit(Escalation::Graceful) => Self::TermSent,
            Self::TermSent => Self::WaitExit(Escalation::Term),
            Self::WaitExit(Escalation::Term) => Self::KillSent,
            Self::KillSent => Self::WaitExit(Escalation::Kill),
            Self::WaitExit(Escalation::Kill) => Self::Unconfirmed,
            Self::ConfirmedDead => Self::ConfirmedDead,
            Self::Unconfirmed => Self::Unconfirmed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ConfirmedDead | Self::Unconfirmed)
    }
}

/// How long each wait lasts.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownBudget {
    pub graceful: Duration,
    pub term: Duration,
    pub kill: Duration,
}

impl ShutdownBudget {
    fn for_level(&self, level: Escalation) -> Duration {
        match level {
            Escalation::Graceful => self.graceful,
            Escalation::Term => self.term,
            Escalation::Kill => self.kill,
        }
    }
}

/// The process being shut down.
pub trait ShutdownTarget {
    /// Ask the process to exit on its own. Failures are the target's to log.
    fn request_graceful(&mut self);

    fn send(&mut self, signal: Signal);

    /// Wait up to `budget`; true if the process has exited.
    fn wait_exit(&mut self, budget: Duration) -> bool;
}

/// Every step visited, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownTrace {
    pub steps: Vec<ShutdownStep>,
}

impl ShutdownTrace {
    pub fn final_step(&self) -> ShutdownStep {
        self.steps.last().copied().unwrap_or(ShutdownStep::Unconfirmed)
    }

    pub fn confirmed(&self) -> bool {
        self.final_step() == ShutdownStep::ConfirmedDead
    }

    /// Highest signal that had to be sent, if any.
    pub fn escalated_to(&self) -> Option<Signal> {
        if self.steps.contains(&ShutdownStep::KillSent) {
            Some(Signal::Kill)
        } else if self.steps.contains(&ShutdownStep::TermSent) {
            Some(Signal::Term)
        } else {
            None
        }
    }
}

/// Drive `target` through the machine until a terminal step.
pub fn run_shutdown(target: &mut dyn ShutdownTarget, budget: ShutdownBudget) -> ShutdownTrace {
    let mut step = ShutdownStep::GracefulRequested;
    let mut steps = vec![step];

    while !step.is_terminal() {
        let exited = match step {
            ShutdownStep::GracefulRequested => {
                target.request_graceful();
                false
            }
            ShutdownStep::TermSent => {
                warn!("Server didn't stop gracefully, sending SIGTERM");
                target.send(Signal::Term);
                false
            }
            ShutdownStep::KillSent => {
                warn!("Server didn't respond to SIGTERM, sending SIGKILL");
                target.send(Signal::Kill);
                false
            }
            ShutdownStep::WaitExit(level) => target.wait_exit(budget.for_level(level)),
            ShutdownStep::ConfirmedDead | ShutdownStep::Unconfirmed => true,
        };
        step = step.next(exited);
        steps.push(step);
    }

    let trace = ShutdownTrace { steps };
    if trace.confirmed() {
        info!(escalation = ?trace.escalated_to(), "Server stopped");
    } else {
        warn!("Server exit could not be confirmed after SIGKILL");
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exits once it has received `exits_after` signals (0 = on graceful request).
    struct FakeTarget {
        exits_after: Option<usize>,
        graceful_requested: bool,
        signals: Vec<Signal>,
        waits: Vec<Duration>,
    }

    impl FakeTarget {
        fn new(exits_after: Option<usize>) -> Self {
            Self {
                exits_after,
                graceful_requested: false,
                signals: Vec::new(),
                waits: Vec::new(),
            }
        }
    }

    impl ShutdownTarget for FakeTarget {
        fn request_graceful(&mut self) {
            self.graceful_requested = true;
        }

        fn send(&mut self, signal: Signal) {
            self.signals.push(signal);
        }

        fn wait_exit(&mut self, budget: Duration) -> bool {
            self.waits.push(budget);
            self.exits_after.is_some_and(|n| self.signals.len() >= n)
        }
    }

    fn budget() -> ShutdownBudget {
        ShutdownBudget {
            graceful: Duration::from_secs(30),
            term: Duration::from_secs(10),
            kill: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_graceful_exit_sends_no_signals() {
        let mut target = FakeTarget::new(Some(0));
        let trace = run_shutdown(&mut target, budget());
        assert!(target.graceful_requested);
        assert!(target.signals.is_empty());
        assert!(trace.confirmed());
        assert_eq!(trace.escalated_to(), None);
        assert_eq!(target.waits, vec![Duration::from_secs(30)]);
    }

    #[test]
    fn test_sigterm_escalation() {
        let mut target = FakeTarget::new(Some(1));
        let trace = run_shutdown(&mut target, budget());
        assert_eq!(target.signals, vec![Signal::Term]);
        assert_eq!(trace.escalated_to(), Some(Signal::Term));
        assert_eq!(
            trace.steps,
            vec![
                ShutdownStep::GracefulRequested,
                ShutdownStep::WaitExit(Escalation::Graceful),
                ShutdownStep::TermSent,
                ShutdownStep::WaitExit(Escalation::Term),
                ShutdownStep::ConfirmedDead,
            ]
        );
    }

    #[test]
    fn test_full_escalation_to_kill() {
        let mut target = FakeTarget::new(Some(2));
        let trace = run_shutdown(&mut target, budget());
        assert_eq!(target.signals, vec![Signal::Term, Signal::Kill]);
        assert!(trace.confirmed());
        assert_eq!(
            target.waits,
            vec![Duration::from_secs(30), Duration::from_secs(10), Duration::from_secs(5)]
        );
    }

    #[test]
    fn test_unkillable_process_ends_unconfirmed() {
        let mut target = FakeTarget::new(None);
        let trace = run_shutdown(&mut target, budget());
        assert_eq!(trace.final_step(), ShutdownStep::Unconfirmed);
        assert_eq!(trace.escalated_to(), Some(Signal::Kill));
    }

    #[test]
    fn test_terminal_steps_are_absorbing() {
        assert_eq!(ShutdownStep::ConfirmedDead.next(false), ShutdownStep::ConfirmedDead);
        assert_eq!(ShutdownStep::Unconfirmed.next(true), ShutdownStep::Unconfirmed);
    }
}
