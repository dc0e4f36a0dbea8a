//! Scripted stand-ins for the command channel and the host process table.
//!
//! Used by unit tests and the `tests/` suites to exercise lifecycle and
//! orchestration logic without a game server.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::channel::CommandTransport;
use crate::errors::TransportError;
use crate::process::{HostProcesses, Signal};

type Response = Result<String, TransportError>;

/// A command observed by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockCall {
    pub command: String,
    pub timeout: Duration,
    pub at: Instant,
}

#[derive(Debug)]
struct TransportScript {
    queued: VecDeque<Response>,
    by_prefix: Vec<(String, Response)>,
    fallback: Response,
    calls: Vec<MockCall>,
}

/// Transport answering from a script.
///
/// Lookup order: queued one-shot responses, then prefix rules, then the
/// fallback response.
#[derive(Debug)]
pub struct MockTransport {
    script: Mutex<TransportScript>,
}

impl MockTransport {
    /// Every command succeeds with an empty payload.
    pub fn new() -> Self {
        Self::with_fallback(Ok(String::new()))
    }

    /// Every command fails with a connection error.
    pub fn unreachable() -> Self {
        Self::with_fallback(Err(TransportError::Connection("connection refused".to_string())))
    }

    pub fn with_fallback(fallback: Response) -> Self {
        Self {
            script: Mutex::new(TransportScript {
                queued: VecDeque::new(),
                by_prefix: Vec::new(),
                fallback,
                calls: Vec::new(),
            }),
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, TransportScript> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a one-shot response for the next command.
    pub fn push_response(&self, response: Response) {
        self.script().queued.push_back(response);
    }

    /// Answer every command starting with `prefix`.
    pub fn respond_to(&self, prefix: &str, response: Response) {
        self.script().by_prefix.push((prefix.to_string(), response));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.script().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.script().calls.iter().map(|c| c.command.clone()).collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTransport for MockTransport {
    fn execute(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        let mut script = self.script();
        script.calls.push(MockCall {
            command: command.to_string(),
            timeout,
            at: Instant::now(),
        });
        if let Some(response) = script.queued.pop_front() {
            return response;
        }
        if let Some((_, response)) = script
            .by_prefix
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return response.clone();
        }
        script.fallback.clone()
    }
}

#[derive(Debug, Default)]
struct HostTable {
    /// pid -> ports it listens on
    listeners: BTreeMap<u32, Vec<u16>>,
    /// Listening sockets with no visible owner.
    anonymous_ports: BTreeSet<u16>,
    /// PIDs that ignore SIGTERM.
    stubborn: BTreeSet<u32>,
    signals: Vec<(u32, Signal)>,
}

/// In-memory process table.
///
/// SIGTERM removes a process unless it was registered as stubborn; SIGKILL
/// always removes it. Removing a process frees its ports.
#[derive(Debug, Default)]
pub struct MockHost {
    table: Mutex<HostTable>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HostTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a live process listening on `ports`.
    pub fn add_listener(&self, pid: u32, ports: &[u16]) {
        self.table().listeners.insert(pid, ports.to_vec());
    }

    /// Register a process that only dies on SIGKILL.
    pub fn add_stubborn_listener(&self, pid: u32, ports: &[u16]) {
        let mut table = self.table();
        table.listeners.insert(pid, ports.to_vec());
        table.stubborn.insert(pid);
    }

    /// Occupy a port without exposing an owning PID.
    pub fn occupy_port(&self, port: u16) {
        self.table().anonymous_ports.insert(port);
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.table().signals.clone()
    }
}

impl HostProcesses for MockHost {
    fn listening_pids(&self, port: u16) -> Vec<u32> {
        self.table()
            .listeners
            .iter()
            .filter(|(_, ports)| ports.contains(&port))
            .map(|(pid, _)| *pid)
            .collect()
    }

    fn port_in_use(&self, port: u16) -> bool {
        let table = self.table();
        table.anonymous_ports.contains(&port)
            || table.listeners.values().any(|ports| ports.contains(&port))
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.table().listeners.contains_key(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), String> {
        let mut table = self.table();
        table.signals.push((pid, signal));
        if !table.listeners.contains_key(&pid) {
            return Err(format!("no such process: {pid}"));
        }
        let dies = signal == Signal::Kill || !table.stubborn.contains(&pid);
        if dies {
            table.listeners.remove(&pid);
            table.stubborn.remove(&pid);
        }
        Ok(())
    }
}
