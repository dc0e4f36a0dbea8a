//! Performance phase support: profiler control and the latency verdict.
//!
//! The profiler is optional. When `asprof` is not installed the phase still
//! runs and reports timing statistics, just without a flamegraph.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};
use crate::parsing::ProfileStats;
use crate::poll::{Deadline, PollSpec, Probe, poll_until};
use crate::process::{exec_with_timeout, find_child_pid};
use crate::reporting::TestStatus;

const PROFILER_EVENTS: &[&str] = &["cpu", "wall", "alloc", "lock"];

/// Thresholds and sampling settings for one performance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub p99_threshold_ms: f64,
    /// Advisory; exceeding it is logged but does not fail the run.
    pub p90_threshold_ms: f64,
    /// Advisory; exceeding it is logged but does not fail the run.
    pub mean_threshold_ms: f64,
    pub chunk_count: usize,
    /// Generated first and discarded from the statistics.
    pub warmup_chunks: usize,
    pub event: String,
    pub interval: String,
    /// JVM frame filter for the flamegraph (`/`-separated package path).
    pub include_pattern: Option<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            p99_threshold_ms: 50.0,
            p90_threshold_ms: 20.0,
            mean_threshold_ms: 5.0,
            chunk_count: 500,
            warmup_chunks: 100,
            event: "cpu".to_string(),
            interval: "1ms".to_string(),
            include_pattern: Some("com/example/alexthundercook/microbiomereplacer/*".to_string()),
        }
    }
}

impl ProfileConfig {
    pub fn validate(&self) -> HarnessResult<()> {
        for (name, value) in [
            ("p99_threshold_ms", self.p99_threshold_ms),
            ("p90_threshold_ms", self.p90_threshold_ms),
            ("mean_threshold_ms", self.mean_threshold_ms),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(HarnessError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if self.chunk_count == 0 {
            return Err(HarnessError::Config("chunk_count must be at least 1".to_string()));
        }
        if !PROFILER_EVENTS.contains(&self.event.as_str()) {
            return Err(HarnessError::Config(format!(
                "unknown profiler event '{}' (expected one of {})",
                self.event,
                PROFILER_EVENTS.join(", ")
            )));
        }
        if self.interval.trim().is_empty() {
            return Err(HarnessError::Config("profiler interval must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Attachable sampling profiler.
pub trait Profiler: Send {
    fn is_available(&self) -> bool;

    /// Bind to the server. `pid` may be the launch shell; implementations
    /// resolve the JVM beneath it.
    fn attach(&mut self, pid: u32) -> HarnessResult<()>;

    fn start_recording(&mut self, output_name: &str, config: &ProfileConfig) -> HarnessResult<()>;

    /// Stop and write the flamegraph. `None` when nothing was recorded.
    fn stop_recording(&mut self) -> Option<PathBuf>;

    /// Stop any recording and forget the target. Never fails.
    fn cleanup(&mut self);
}

/// Drives the async-profiler `asprof` CLI.
#[derive(Debug)]
pub struct AsyncProfiler {
    asprof: PathBuf,
    output_dir: PathBuf,
    child_lookup_attempts: u32,
    child_lookup_delay: Duration,
    pid: Option<u32>,
    recording: Option<Recording>,
}

#[derive(Debug)]
struct Recording {
    output_name: String,
    include_pattern: Option<String>,
}

impl AsyncProfiler {
    pub fn new(profiler_dir: &Path, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            asprof: profiler_dir.join("bin").join("asprof"),
            output_dir: output_dir.into(),
            child_lookup_attempts: 5,
            child_lookup_delay: Duration::from_secs(1),
            pid: None,
            recording: None,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            &config.paths.async_profiler_dir(),
            config.paths.results_dir.join("flamegraphs"),
        )
    }

    pub fn asprof_path(&self) -> &Path {
        &self.asprof
    }

    pub fn attached_pid(&self) -> Option<u32> {
        self.pid
    }

    fn find_java_pid(&self, parent: u32) -> Option<u32> {
        let spec = PollSpec::new(
            Deadline::after(self.child_lookup_delay * self.child_lookup_attempts),
            self.child_lookup_delay,
        )
        .with_max_attempts(self.child_lookup_attempts);
        poll_until(spec, |_| match find_child_pid(parent, "java") {
            Some(pid) => Probe::<u32, ()>::Ready(pid),
            None => Probe::Pending,
        })
        .ok()
    }
}

impl Profiler for AsyncProfiler {
    fn is_available(&self) -> bool {
        self.asprof.is_file()
    }

    fn attach(&mut self, pid: u32) -> HarnessResult<()> {
        if !self.is_available() {
            warn!(path = %self.asprof.display(), "async-profiler not found");
            return Ok(());
        }
        match self.find_java_pid(pid) {
            Some(java_pid) => {
                info!(java_pid, shell_pid = pid, "Attached async-profiler");
                self.pid = Some(java_pid);
            }
            None => {
                warn!(pid, "No Java child process found, attaching to launch process");
                self.pid = Some(pid);
            }
        }
        Ok(())
    }

    fn start_recording(&mut self, output_name: &str, config: &ProfileConfig) -> HarnessResult<()> {
        let Some(pid) = self.pid.filter(|_| self.is_available()) else {
            return Err(HarnessError::Profiler("profiler is not attached".to_string()));
        };
        fs::create_dir_all(&self.output_dir).map_err(|e| HarnessError::file(&self.output_dir, e))?;

        let pid_arg = pid.to_string();
        let args = ["start", "-e", config.event.as_str(), "-i", config.interval.as_str(), pid_arg.as_str()];
        let result = exec_with_timeout(&self.asprof, args, None, Duration::from_secs(30))
            .map_err(|e| HarnessError::Profiler(format!("failed to run asprof: {e}")))?;
        if result.timed_out {
            return Err(HarnessError::Profiler("asprof start timed out".to_string()));
        }
        if result.exit_code != 0 {
            let stderr = result.stderr.trim();
            // asprof exits non-zero on some warnings.
            if stderr.to_ascii_lowercase().contains("error") {
                return Err(HarnessError::Profiler(format!("asprof start failed: {stderr}")));
            }
            warn!(stderr, "asprof start reported a warning");
        }

        self.recording = Some(Recording {
            output_name: output_name.to_string(),
            include_pattern: config.include_pattern.clone(),
        });
        info!(event = %config.event, interval = %config.interval, "Started profiling");
        Ok(())
    }

    fn stop_recording(&mut self) -> Option<PathBuf> {
        let pid = self.pid?;
        let recording = self.recording.take()?;
        let output = self.output_dir.join(format!("{}.html", recording.output_name));

        let mut args = vec![
            "stop".to_string(),
            "-f".to_string(),
            output.to_string_lossy().into_owned(),
            "-o".to_string(),
            "flamegraph".to_string(),
        ];
        if let Some(pattern) = &recording.include_pattern {
            info!(pattern = %pattern, "Stopping profiler with frame filter");
            args.push("-I".to_string());
            args.push(pattern.clone());
        }
        args.push(pid.to_string());

        match exec_with_timeout(&self.asprof, &args, None, Duration::from_secs(60)) {
            Ok(result) if result.timed_out => error!("asprof stop timed out"),
            Ok(result) if result.exit_code != 0 => {
                warn!(stderr = %result.stderr.trim(), stdout = %result.stdout.trim(), "asprof stop failed");
            }
            Ok(_) => {}
            Err(e) => error!("Failed to stop profiler: {}", e),
        }

        if output.is_file() {
            info!(path = %output.display(), "Flamegraph generated");
            Some(output)
        } else {
            warn!(path = %output.display(), "Flamegraph not created");
            None
        }
    }

    fn cleanup(&mut self) {
        if self.recording.is_some() {
            let _ = self.stop_recording();
        }
        self.pid = None;
        self.recording = None;
    }
}

/// Borrow of an attached profiler that always detaches on drop.
pub struct AttachedProfiler<'a> {
    profiler: &'a mut dyn Profiler,
}

impl<'a> AttachedProfiler<'a> {
    pub fn attach(profiler: &'a mut dyn Profiler, pid: u32) -> HarnessResult<Self> {
        let guard = Self { profiler };
        guard.profiler.attach(pid)?;
        Ok(guard)
    }

    pub fn start_recording(&mut self, output_name: &str, config: &ProfileConfig) -> HarnessResult<()> {
        self.profiler.start_recording(output_name, config)
    }

    pub fn stop_recording(&mut self) -> Option<PathBuf> {
        self.profiler.stop_recording()
    }
}

impl Drop for AttachedProfiler<'_> {
    fn drop(&mut self) {
        debug!("Detaching profiler");
        self.profiler.cleanup();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingStats {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkCounters {
    pub replacements: u64,
    pub homogeneous_skips: u64,
    pub positions_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceResult {
    pub status: TestStatus,
    pub chunk_count: u64,
    pub timing: TimingStats,
    pub work: WorkCounters,
    pub threshold_p99_ms: f64,
    pub flamegraph_path: Option<PathBuf>,
    pub duration_ms: u64,
}

/// PASS iff `p99_ms` is strictly below the configured threshold.
pub fn evaluate_performance(
    stats: &ProfileStats,
    config: &ProfileConfig,
    duration: Duration,
    flamegraph_path: Option<PathBuf>,
) -> PerformanceResult {
    let status = if stats.p99_ms < config.p99_threshold_ms {
        TestStatus::Pass
    } else {
        TestStatus::Fail
    };
    if stats.p90_ms >= config.p90_threshold_ms {
        warn!(p90_ms = stats.p90_ms, threshold = config.p90_threshold_ms, "p90 above advisory threshold");
    }
    if stats.mean_ms >= config.mean_threshold_ms {
        warn!(mean_ms = stats.mean_ms, threshold = config.mean_threshold_ms, "Mean above advisory threshold");
    }

    PerformanceResult {
        status,
        chunk_count: stats.count,
        timing: TimingStats {
            mean_ms: stats.mean_ms,
            p50_ms: stats.p50_ms,
            p90_ms: stats.p90_ms,
            p99_ms: stats.p99_ms,
            min_ms: stats.min_ms,
            max_ms: stats.max_ms,
            total_ms: stats.total_ms,
        },
        work: WorkCounters {
            replacements: stats.replacements,
            homogeneous_skips: stats.homogeneous_skips,
            positions_processed: stats.positions_processed,
        },
        threshold_p99_ms: config.p99_threshold_ms,
        flamegraph_path,
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stats_with_p99(p99_ms: f64) -> ProfileStats {
        ProfileStats {
            count: 500,
            p99_ms,
            ..ProfileStats::default()
        }
    }

    #[test]
    fn test_p99_under_threshold_passes() {
        let config = ProfileConfig {
            p99_threshold_ms: 50.0,
            ..ProfileConfig::default()
        };
        let result = evaluate_performance(&stats_with_p99(40.0), &config, Duration::from_secs(1), None);
        assert_eq!(result.status, TestStatus::Pass);
        assert_eq!(result.threshold_p99_ms, 50.0);
        assert_eq!(result.chunk_count, 500);
        assert_eq!(result.duration_ms, 1000);
    }

    #[test]
    fn test_p99_over_threshold_fails() {
        let config = ProfileConfig {
            p99_threshold_ms: 30.0,
            ..ProfileConfig::default()
        };
        let result = evaluate_performance(&stats_with_p99(40.0), &config, Duration::ZERO, None);
        assert_eq!(result.status, TestStatus::Fail);
    }

    #[test]
    fn test_p99_equal_to_threshold_fails() {
        let result = evaluate_performance(&stats_with_p99(50.0), &ProfileConfig::default(), Duration::ZERO, None);
        assert_eq!(result.status, TestStatus::Fail);
    }

    #[test]
    fn test_result_json_shape() {
        let result = evaluate_performance(
            &stats_with_p99(12.5),
            &ProfileConfig::default(),
            Duration::ZERO,
            Some(PathBuf::from("/tmp/fg.html")),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "PASS");
        assert_eq!(value["timing"]["p99_ms"], 12.5);
        assert_eq!(value["work"]["replacements"], 0);
        assert_eq!(value["flamegraph_path"], "/tmp/fg.html");
    }

    #[test]
    fn test_config_validation() {
        assert!(ProfileConfig::default().validate().is_ok());
        let bad_event = ProfileConfig {
            event: "itimer-ish".to_string(),
            ..ProfileConfig::default()
        };
        assert!(matches!(bad_event.validate(), Err(HarnessError::Config(_))));
        let bad_threshold = ProfileConfig {
            p99_threshold_ms: 0.0,
            ..ProfileConfig::default()
        };
        assert!(bad_threshold.validate().is_err());
        let no_chunks = ProfileConfig {
            chunk_count: 0,
            ..ProfileConfig::default()
        };
        assert!(no_chunks.validate().is_err());
    }

    #[test]
    fn test_missing_asprof_is_unavailable_but_attach_succeeds() {
        let dir = TempDir::new().unwrap();
        let mut profiler = AsyncProfiler::new(dir.path(), dir.path().join("flamegraphs"));
        assert!(!profiler.is_available());
        profiler.attach(1).unwrap();
        assert_eq!(profiler.attached_pid(), None);
        assert!(profiler.start_recording("perf", &ProfileConfig::default()).is_err());
        assert_eq!(profiler.stop_recording(), None);
    }

    struct CountingProfiler {
        cleanups: u32,
    }

    impl Profiler for CountingProfiler {
        fn is_available(&self) -> bool {
            true
        }
        fn attach(&mut self, _pid: u32) -> HarnessResult<()> {
            Ok(())
        }
        fn start_recording(&mut self, _name: &str, _config: &ProfileConfig) -> HarnessResult<()> {
            Ok(())
        }
        fn stop_recording(&mut self) -> Option<PathBuf> {
            None
        }
        fn cleanup(&mut self) {
            self.cleanups += 1;
        }
    }

    #[test]
    fn test_attached_profiler_detaches_on_drop() {
        let mut profiler = CountingProfiler { cleanups: 0 };
        {
            let _guard = AttachedProfiler::attach(&mut profiler, 42).unwrap();
        }
        assert_eq!(profiler.cleanups, 1);
    }
}
