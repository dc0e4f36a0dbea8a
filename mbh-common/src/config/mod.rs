//! Configuration system for the harness.
//!
//! Values resolve in layers: built-in defaults, then an optional TOML file,
//! then `MBH_*` environment variables. The binary applies command-line
//! flags last.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};

/// Seed used when neither the CLI nor a baseline file name picks one.
pub const DEFAULT_SEED: i64 = -5_704_795_430_421_488_525;

/// Readiness marker the server prints once it accepts commands.
pub const DEFAULT_READY_PATTERN: &str = r"Done \([0-9.]+s\)! For help";

/// Every blocking operation in the harness draws its bound from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "duration_secs")]
    pub zombie_cleanup: Duration,
    #[serde(with = "duration_secs")]
    pub server_startup: Duration,
    #[serde(with = "duration_secs")]
    pub server_shutdown: Duration,
    /// Wait after SIGTERM before escalating to SIGKILL.
    #[serde(with = "duration_secs")]
    pub graceful_kill: Duration,
    /// Wait after SIGKILL for the process to be reaped.
    #[serde(with = "duration_secs")]
    pub kill_confirm: Duration,
    #[serde(with = "duration_secs")]
    pub log_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub port_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub term_poll_interval: Duration,
    pub term_poll_attempts: u32,
    /// Chunk forceload and batch inspection.
    #[serde(with = "duration_secs")]
    pub bulk_operation: Duration,
    #[serde(with = "duration_secs")]
    pub generation_settle: Duration,
    /// Pause between `save-all` and `stop`.
    #[serde(with = "duration_secs")]
    pub save_flush: Duration,
    #[serde(with = "duration_secs")]
    pub world_deletion: Duration,
    /// Lower bound on the window given to post-log channel probing.
    #[serde(with = "duration_secs")]
    pub ready_probe_min_window: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            zombie_cleanup: Duration::from_secs(30),
            server_startup: Duration::from_secs(180),
            server_shutdown: Duration::from_secs(30),
            graceful_kill: Duration::from_secs(10),
            kill_confirm: Duration::from_secs(5),
            log_poll_interval: Duration::from_secs(2),
            port_poll_interval: Duration::from_secs(1),
            term_poll_interval: Duration::from_secs(1),
            term_poll_attempts: 3,
            bulk_operation: Duration::from_secs(400),
            generation_settle: Duration::from_secs(3),
            save_flush: Duration::from_secs(3),
            world_deletion: Duration::from_secs(60),
            ready_probe_min_window: Duration::from_secs(10),
        }
    }
}

/// Remote command channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    /// Client executable; defaults to `<tools_dir>/mcrcon`.
    pub client_path: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    pub ready_probe_retries: u32,
    #[serde(with = "duration_secs")]
    pub ready_probe_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25575,
            password: "test_password_12345".to_string(),
            client_path: None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            ready_probe_retries: 10,
            ready_probe_delay: Duration::from_secs(2),
        }
    }
}

/// Server process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Launch script, relative to the server directory.
    pub launch_script: String,
    pub launch_args: Vec<String>,
    pub ready_pattern: String,
    pub world_name: String,
    /// File-name prefix of the mod artifact under test.
    pub mod_jar_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 25565,
            launch_script: "run.sh".to_string(),
            launch_args: vec!["nogui".to_string()],
            ready_pattern: DEFAULT_READY_PATTERN.to_string(),
            world_name: "world".to_string(),
            mod_jar_prefix: "microbiomereplacer".to_string(),
        }
    }
}

/// Test execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub seed: i64,
    pub buffer_size: u32,
    pub pass_threshold: f64,
    pub tick_sprint_base: u32,
    pub tick_sprint_per_100_chunks: u32,
    pub failure_sample_limit: usize,
    pub diff_sample_limit: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            buffer_size: 0,
            pass_threshold: 0.95,
            tick_sprint_base: 1000,
            tick_sprint_per_100_chunks: 500,
            failure_sample_limit: 20,
            diff_sample_limit: 10,
        }
    }
}

impl TestConfig {
    /// Ticks to sprint so that `chunk_count` freshly force-loaded chunks
    /// finish generating.
    pub fn tick_sprint_count(&self, chunk_count: usize) -> u32 {
        let hundreds = u32::try_from(chunk_count / 100).unwrap_or(u32::MAX);
        self.tick_sprint_base
            .saturating_add(hundreds.saturating_mul(self.tick_sprint_per_100_chunks))
    }
}

/// Directory layout, resolved against the project root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathConfig {
    pub project_root: PathBuf,
    pub server_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub results_dir: PathBuf,
    pub baseline_dir: PathBuf,
    pub build_libs_dir: PathBuf,
}

impl PathConfig {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let project_root = root.into();
        Self {
            server_dir: project_root.join("test_server"),
            tools_dir: project_root.join("test_tools"),
            results_dir: project_root.join("test_results"),
            baseline_dir: project_root.join("baseline_data"),
            build_libs_dir: project_root.join("build").join("libs"),
            project_root,
        }
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.server_dir.join("mods")
    }

    pub fn server_log(&self) -> PathBuf {
        self.results_dir.join("server_stdout.log")
    }

    pub fn harness_log(&self) -> PathBuf {
        self.results_dir.join("harness.log")
    }

    pub fn report_json(&self) -> PathBuf {
        self.results_dir.join("report.json")
    }

    pub fn async_profiler_dir(&self) -> PathBuf {
        self.tools_dir.join("async-profiler")
    }
}

/// Fully resolved harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarnessConfig {
    pub timeouts: TimeoutConfig,
    pub channel: ChannelConfig,
    pub server: ServerConfig,
    pub test: TestConfig,
    pub paths: PathConfig,
    pub log_level: String,
}

/// On-disk shape of the optional TOML file. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    project_root: Option<PathBuf>,
    log_level: Option<String>,
    timeouts: TimeoutConfig,
    channel: ChannelConfig,
    server: ServerConfig,
    test: TestConfig,
}

impl HarnessConfig {
    /// Defaults rooted at `project_root`.
    pub fn for_project(project_root: impl Into<PathBuf>) -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            channel: ChannelConfig::default(),
            server: ServerConfig::default(),
            test: TestConfig::default(),
            paths: PathConfig::from_root(project_root),
            log_level: "debug".to_string(),
        }
    }

    /// Resolve defaults, the optional TOML file and the environment.
    ///
    /// An explicit `project_root` wins over the file's `project_root`, which
    /// wins over `MBH_PROJECT_ROOT` and finally the current directory.
    pub fn load(project_root: Option<&Path>, config_file: Option<&Path>) -> HarnessResult<Self> {
        let file = match config_file {
            Some(path) => Some(Self::read_file(path)?),
            None => None,
        };

        let mut parser = EnvParser::new();
        let env_root = parser.get_optional_string("PROJECT_ROOT").into_inner();
        let root = match (project_root, file.as_ref().and_then(|f| f.project_root.clone()), env_root) {
            (Some(root), _, _) => root.to_path_buf(),
            (None, Some(root), _) => root,
            (None, None, Some(root)) => env::expand_home(&root),
            (None, None, None) => std::env::current_dir()?,
        };

        let mut config = Self::for_project(root);
        if let Some(file) = file {
            config.timeouts = file.timeouts;
            config.channel = file.channel;
            config.server = file.server;
            config.test = file.test;
            if let Some(level) = file.log_level {
                config.log_level = level;
            }
        }

        config.apply_env(&mut parser);
        let errors = parser.take_errors();
        if !errors.is_empty() {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(HarnessError::Config(joined.join("; ")));
        }
        config.validate()?;
        debug!(root = %config.paths.project_root.display(), "Configuration resolved");
        Ok(config)
    }

    fn read_file(path: &Path) -> HarnessResult<FileConfig> {
        let text = fs::read_to_string(path).map_err(|e| HarnessError::file(path, e))?;
        toml::from_str(&text)
            .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display())))
    }

    /// Overlay `MBH_*` variables onto the current values.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        parser
            .get_string("CHANNEL_HOST", &self.channel.host)
            .apply_to(&mut self.channel.host);
        parser
            .get_in_range("CHANNEL_PORT", self.channel.port, 1..=u16::MAX, "port number")
            .apply_to(&mut self.channel.port);
        parser
            .get_string("CHANNEL_PASSWORD", &self.channel.password)
            .apply_to(&mut self.channel.password);
        if let Some(path) = parser.get_optional_string("CHANNEL_CLIENT").into_inner() {
            self.channel.client_path = Some(env::expand_home(&path));
        }
        parser
            .get_duration("COMMAND_TIMEOUT", self.channel.command_timeout)
            .apply_to(&mut self.channel.command_timeout);
        parser
            .get_in_range("CHANNEL_RETRIES", self.channel.max_retries, 0..=20, "retry count")
            .apply_to(&mut self.channel.max_retries);
        parser
            .get_in_range("SERVER_PORT", self.server.port, 1..=u16::MAX, "port number")
            .apply_to(&mut self.server.port);
        parser
            .get_duration("STARTUP_TIMEOUT", self.timeouts.server_startup)
            .apply_to(&mut self.timeouts.server_startup);
        parser
            .get_duration("SHUTDOWN_TIMEOUT", self.timeouts.server_shutdown)
            .apply_to(&mut self.timeouts.server_shutdown);
        parser
            .get_duration("BULK_TIMEOUT", self.timeouts.bulk_operation)
            .apply_to(&mut self.timeouts.bulk_operation);
        parser
            .get_in_range("PASS_THRESHOLD", self.test.pass_threshold, 0.0..=1.0, "number")
            .apply_to(&mut self.test.pass_threshold);
        parser
            .get_log_level("LOG_LEVEL", &self.log_level)
            .apply_to(&mut self.log_level);
    }

    /// Reject values that would make the run meaningless.
    pub fn validate(&self) -> HarnessResult<()> {
        if !(0.0..=1.0).contains(&self.test.pass_threshold) {
            return Err(HarnessError::Config(format!(
                "pass threshold must be within 0.0..=1.0, got {}",
                self.test.pass_threshold
            )));
        }
        if self.test.buffer_size > 2 {
            return Err(HarnessError::Config(format!(
                "buffer size must be 0, 1 or 2, got {}",
                self.test.buffer_size
            )));
        }
        if self.channel.port == self.server.port {
            return Err(HarnessError::Config(format!(
                "command channel and server share port {}",
                self.server.port
            )));
        }
        if self.channel.ready_probe_retries == 0 {
            return Err(HarnessError::Config(
                "ready_probe_retries must be at least 1".to_string(),
            ));
        }
        regex::Regex::new(&self.server.ready_pattern)
            .map_err(|e| HarnessError::Config(format!("invalid ready_pattern: {e}")))?;
        Ok(())
    }

    /// Path to the command-channel client executable.
    pub fn channel_client(&self) -> PathBuf {
        self.channel
            .client_path
            .clone()
            .unwrap_or_else(|| self.paths.tools_dir.join("mcrcon"))
    }

    /// Ports that must be free before a launch.
    pub fn managed_ports(&self) -> [u16; 2] {
        [self.server.port, self.channel.port]
    }
}

/// Serialize durations as (fractional) seconds in TOML and JSON.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
