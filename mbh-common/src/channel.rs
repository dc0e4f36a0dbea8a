//! Remote command channel.
//!
//! [`CommandTransport`] performs one attempt; [`CommandChannel`] layers the
//! retry policy, response logging and the domain command vocabulary on top.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult, TransportError};
use crate::process::exec_with_timeout;

/// Responses longer than this are truncated in the log.
const LOG_RESPONSE_LIMIT: usize = 200;

/// Server replies that mean the command itself was refused.
const REJECTION_MARKERS: &[&str] = &["Unknown or incomplete command", "<--[HERE]"];

/// One attempt at sending a command.
pub trait CommandTransport: Send + Sync {
    fn execute(&self, command: &str, timeout: Duration) -> Result<String, TransportError>;
}

// ---------------------------------------------------------------------------
// mcrcon transport
// ---------------------------------------------------------------------------

/// Transport that shells out to the `mcrcon` client.
#[derive(Debug, Clone)]
pub struct McrconTransport {
    client: PathBuf,
    host: String,
    port: u16,
    password: String,
}

impl McrconTransport {
    pub fn new(client: PathBuf, host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        Self {
            client,
            host: host.into(),
            port,
            password: password.into(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.channel_client(),
            config.channel.host.clone(),
            config.channel.port,
            config.channel.password.clone(),
        )
    }

    pub fn client_path(&self) -> &std::path::Path {
        &self.client
    }
}

impl CommandTransport for McrconTransport {
    fn execute(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        let port = self.port.to_string();
        let args = [
            "-H",
            self.host.as_str(),
            "-P",
            port.as_str(),
            "-p",
            self.password.as_str(),
            command,
        ];
        let result = exec_with_timeout(&self.client, args, None, timeout).map_err(|e| {
            TransportError::Connection(format!("failed to run {}: {e}", self.client.display()))
        })?;

        if result.timed_out {
            return Err(TransportError::Timeout(timeout));
        }
        if result.exit_code != 0 {
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim()
            } else {
                result.stderr.trim()
            };
            return Err(TransportError::Connection(format!(
                "mcrcon exited {}: {detail}",
                result.exit_code
            )));
        }

        let response = result.stdout.trim().to_string();
        if REJECTION_MARKERS.iter().any(|m| response.contains(m)) {
            return Err(TransportError::Rejected(response));
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Retries after the first attempt, and the pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

/// Result of a command, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub command: String,
    pub payload: String,
    pub elapsed: Duration,
    pub attempts: u32,
    pub status: CommandStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Succeeded,
    Failed(String),
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Succeeded
    }
}

/// Command channel with retry policy and domain helpers.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn CommandTransport>,
    policy: RetryPolicy,
    command_timeout: Duration,
    bulk_timeout: Duration,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn CommandTransport>, policy: RetryPolicy, command_timeout: Duration) -> Self {
        Self {
            transport,
            policy,
            command_timeout,
            bulk_timeout: command_timeout,
        }
    }

    /// Timeout applied to forceload and batch inspection.
    pub fn with_bulk_timeout(mut self, timeout: Duration) -> Self {
        self.bulk_timeout = timeout;
        self
    }

    pub fn from_config(config: &HarnessConfig, transport: Arc<dyn CommandTransport>) -> Self {
        Self::new(
            transport,
            RetryPolicy::new(config.channel.max_retries, config.channel.retry_delay),
            config.channel.command_timeout,
        )
        .with_bulk_timeout(config.timeouts.bulk_operation)
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send with the default timeout and retry policy.
    pub fn send(&self, command: &str) -> HarnessResult<CommandOutcome> {
        self.send_with(command, self.command_timeout, self.policy)
    }

    /// Send with an explicit timeout and retry policy.
    ///
    /// Connection failures are retried up to `policy.max_retries` times.
    /// A timeout or a rejected command fails immediately.
    pub fn send_with(&self, command: &str, timeout: Duration, policy: RetryPolicy) -> HarnessResult<CommandOutcome> {
        debug!(command, "channel command");
        let started = Instant::now();
        let total = policy.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.transport.execute(command, timeout) {
                Ok(payload) => {
                    debug!(command, response = %truncate(&payload, LOG_RESPONSE_LIMIT), "channel response");
                    if attempt > 1 {
                        info!(command, attempt, "Command succeeded after retry");
                    }
                    return Ok(CommandOutcome {
                        command: command.to_string(),
                        payload,
                        elapsed: started.elapsed(),
                        attempts: attempt,
                        status: CommandStatus::Succeeded,
                    });
                }
                Err(TransportError::Timeout(waited)) => {
                    warn!(command, timeout_secs = waited.as_secs_f64(), "Command timed out");
                    return Err(HarnessError::Timeout {
                        operation: format!("channel command '{command}'"),
                        waited,
                    });
                }
                Err(TransportError::Rejected(message)) => {
                    warn!(command, %message, "Command rejected by server");
                    return Err(HarnessError::Command {
                        command: command.to_string(),
                        message,
                    });
                }
                Err(err) if attempt < total => {
                    warn!(
                        command,
                        attempt,
                        total,
                        error = %err,
                        delay_ms = policy.delay.as_millis() as u64,
                        "Channel attempt failed, retrying"
                    );
                    thread::sleep(policy.delay);
                }
                Err(err) => {
                    error!(command, attempts = attempt, error = %err, "Channel unreachable");
                    return Err(HarnessError::Connection {
                        command: command.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    /// Send and report failure as an outcome instead of an error.
    pub fn send_best_effort(&self, command: &str) -> CommandOutcome {
        let started = Instant::now();
        match self.send(command) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(command, error = %err, "Best-effort command failed");
                let attempts = match &err {
                    HarnessError::Connection { attempts, .. } => *attempts,
                    _ => 1,
                };
                CommandOutcome {
                    command: command.to_string(),
                    payload: String::new(),
                    elapsed: started.elapsed(),
                    attempts,
                    status: CommandStatus::Failed(err.to_string()),
                }
            }
        }
    }

    /// Single attempt with no retries; true if the channel answered.
    pub fn probe(&self, timeout: Duration) -> bool {
        match self.send_with("list", timeout, RetryPolicy::none()) {
            Ok(_) => {
                info!("Command channel answered probe");
                true
            }
            Err(err) => {
                debug!(error = %err, "Channel probe failed");
                false
            }
        }
    }

    pub fn say(&self, message: &str) -> HarnessResult<CommandOutcome> {
        self.send(&format!("say {message}"))
    }

    pub fn save_all(&self) -> HarnessResult<CommandOutcome> {
        self.send("save-all")
    }

    pub fn stop(&self) -> HarnessResult<CommandOutcome> {
        self.send("stop")
    }

    /// Force-load chunks listed in a file inside the server directory.
    pub fn forceload_chunks(&self, chunk_file: &str) -> HarnessResult<CommandOutcome> {
        self.send_with(
            &format!("microbiome forceload_chunks {chunk_file}"),
            self.bulk_timeout,
            self.policy,
        )
    }

    /// Inspect every coordinate of a baseline file inside the server directory.
    pub fn batch_inspect(&self, baseline_file: &str) -> HarnessResult<CommandOutcome> {
        self.send_with(
            &format!("microbiome batch_inspect {baseline_file}"),
            self.bulk_timeout,
            self.policy,
        )
    }

    pub fn tick_sprint(&self, ticks: u32) -> HarnessResult<CommandOutcome> {
        self.send(&format!("tick sprint {ticks}"))
    }

    pub fn profile_stats(&self) -> HarnessResult<CommandOutcome> {
        self.send("microbiome profile stats")
    }

    pub fn profile_reset(&self) -> HarnessResult<CommandOutcome> {
        self.send("microbiome profile reset")
    }

    pub fn profile_export(&self, file_name: &str) -> HarnessResult<CommandOutcome> {
        self.send(&format!("microbiome profile export {file_name}"))
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
