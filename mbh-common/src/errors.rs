//! Error taxonomy for harness operations.
//!
//! Lifecycle and orchestration code returns [`HarnessError`]. The command
//! transport reports the narrower [`TransportError`], which the channel's
//! retry loop classifies before wrapping it.

use std::path::PathBuf;
use std::time::Duration;

/// Failure reported by a single command-channel attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The client did not answer within its timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The channel could not be reached, or the client exited unsuccessfully.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The server answered with an error response.
    #[error("command rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Only connection failures are worth another attempt. A timeout means
    /// the command may still be executing server-side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Server failed to start: {0}")]
    Startup(String),

    #[error("Server process exited unexpectedly{}", exit_suffix(.exit_code))]
    Crash { exit_code: Option<i32> },

    #[error("Port {port} still in use after {waited:?}")]
    PortInUse { port: u16, waited: Duration },

    #[error("Command channel unreachable for '{command}' after {attempts} attempt(s)")]
    Connection {
        command: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Timed out after {waited:?}: {operation}")]
    Timeout { operation: String, waited: Duration },

    #[error("Command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Baseline error: {0}")]
    Baseline(String),

    #[error("Chunk calculation failed: {0}")]
    ChunkCalculation(String),

    #[error("Log parsing failed: {0}")]
    LogParsing(String),

    #[error("Profiler error: {0}")]
    Profiler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("IO error at {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => " (terminated by signal)".to_string(),
    }
}

impl HarnessError {
    /// Attach a path to an I/O error.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// True for the failure modes that end a session before readiness.
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, Self::Startup(_) | Self::Crash { .. } | Self::PortInUse { .. })
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_only_connection_failures_retry() {
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(!TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TransportError::Rejected("Unknown command".into()).is_retryable());
    }

    #[test]
    fn test_connection_error_chains_transport_cause() {
        let err = HarnessError::Connection {
            command: "list".into(),
            attempts: 4,
            source: TransportError::Connection("refused".into()),
        };
        assert!(err.to_string().contains("4 attempt(s)"));
        let cause = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(cause.contains("refused"));
    }

    #[test]
    fn test_crash_message_includes_exit_code() {
        let err = HarnessError::Crash { exit_code: Some(3) };
        assert_eq!(err.to_string(), "Server process exited unexpectedly with code 3");
        let err = HarnessError::Crash { exit_code: None };
        assert!(err.to_string().ends_with("(terminated by signal)"));
    }

    #[test]
    fn test_startup_failure_classification() {
        assert!(HarnessError::Startup("x".into()).is_startup_failure());
        assert!(HarnessError::Crash { exit_code: None }.is_startup_failure());
        assert!(!HarnessError::Baseline("x".into()).is_startup_failure());
    }
}
