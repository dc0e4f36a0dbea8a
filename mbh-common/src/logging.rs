//! Process-wide tracing setup.
//!
//! The harness log is a plain-text file written through a non-blocking
//! appender; the console only ever sees pass/fail lines (see
//! [`crate::console`]). Setting `stderr` mirrors log events to the terminal
//! for `--debug` runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::EnvParser;
use crate::errors::{HarnessError, HarnessResult};

static INSTALLED: OnceLock<PathBuf> = OnceLock::new();

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    /// Directory holding the log file; created if missing.
    pub log_dir: PathBuf,
    pub file_name: String,
    pub stderr: bool,
    /// Emit JSON lines instead of plain text in the file.
    pub json: bool,
}

impl LogConfig {
    /// Level from `MBH_LOG_LEVEL`, falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).into_inner();
        let json = parser.get_optional_string("LOG_JSON").into_inner().is_some();
        Self {
            level,
            log_dir: PathBuf::from("test_results"),
            file_name: "harness.log".to_string(),
            stderr: false,
            json,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.file_name)
    }
}

/// Keeps the file writer alive; dropping it flushes pending events.
pub struct LogContext {
    log_path: PathBuf,
    _guard: Option<WorkerGuard>,
}

impl LogContext {
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// Install the global subscriber.
///
/// Only the first call installs anything; later calls return a context
/// pointing at the already-active log file.
pub fn init_logging(config: &LogConfig) -> HarnessResult<LogContext> {
    if let Some(existing) = INSTALLED.get() {
        return Ok(LogContext {
            log_path: existing.clone(),
            _guard: None,
        });
    }

    fs::create_dir_all(&config.log_dir).map_err(|e| HarnessError::file(&config.log_dir, e))?;
    let log_path = config.log_path();
    // Each run starts with a fresh file.
    let file = fs::File::create(&log_path).map_err(|e| HarnessError::file(&log_path, e))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.json {
        layers.push(fmt::layer().json().with_writer(writer).boxed());
    } else {
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer)
                .boxed(),
        );
    }
    if config.stderr {
        layers.push(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    }

    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| HarnessError::Config(format!("invalid log level '{}': {e}", config.level)))?;

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| HarnessError::Setup(format!("logging already initialized: {e}")))?;

    let _ = INSTALLED.set(log_path.clone());
    Ok(LogContext {
        log_path,
        _guard: Some(guard),
    })
}
