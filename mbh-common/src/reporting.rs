//! Run report accumulation and persistence.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{HarnessError, HarnessResult};
use crate::process::exec_with_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skip,
}

impl TestStatus {
    /// Counts against the run's exit code.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Skip => "SKIP",
        };
        f.write_str(s)
    }
}

/// Outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPhaseResult {
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestPhaseResult {
    pub fn new(name: impl Into<String>, status: TestStatus, duration: Duration) -> Self {
        Self {
            name: name.into(),
            status,
            duration_ms: millis(duration),
            details: None,
            error: None,
        }
    }

    pub fn errored(name: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, TestStatus::Error, duration).with_error(error)
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(name, TestStatus::Skip, Duration::ZERO).with_error(reason)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub platform: String,
    pub java: String,
    pub harness_version: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_version: Option<String>,
}

impl EnvironmentInfo {
    /// Probe the host. `mods_dir` is searched for the installed mod jar.
    pub fn collect(mods_dir: &Path, mod_jar_prefix: &str) -> Self {
        Self {
            platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            java: java_version(),
            harness_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            mod_version: mod_version(mods_dir, mod_jar_prefix),
        }
    }
}

/// `java -version` prints to stderr: `openjdk version "21.0.2" 2024-01-16`.
pub fn java_version() -> String {
    match exec_with_timeout("java", ["-version"], None, Duration::from_secs(10)) {
        Ok(result) => {
            let output = if result.stderr.trim().is_empty() {
                result.stdout
            } else {
                result.stderr
            };
            parse_java_version(&output).unwrap_or_else(|| "unknown".to_string())
        }
        Err(e) => {
            debug!("Failed to get Java version: {}", e);
            "unknown".to_string()
        }
    }
}

fn parse_java_version(output: &str) -> Option<String> {
    let line = output
        .lines()
        .find(|l| l.to_ascii_lowercase().contains("version"))?;
    let quoted = line.split('"').nth(1);
    Some(quoted.unwrap_or(line.trim()).to_string())
}

/// Stem of the first mod jar in `mods_dir`.
pub fn mod_version(mods_dir: &Path, prefix: &str) -> Option<String> {
    let prefix = prefix.to_ascii_lowercase();
    let mut stems: Vec<String> = fs::read_dir(mods_dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jar"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|stem| stem.to_ascii_lowercase().starts_with(&prefix))
        .collect();
    stems.sort();
    stems.into_iter().next()
}

/// The persisted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub environment: EnvironmentInfo,
    pub tests: Vec<TestPhaseResult>,
}

/// Accumulates phase results between `start_run` and `end_run`.
#[derive(Debug, Default)]
pub struct ReportGenerator {
    results: Vec<TestPhaseResult>,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl ReportGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_run(&mut self) {
        self.results.clear();
        self.started = Some(Instant::now());
        self.elapsed = None;
    }

    pub fn add(&mut self, result: TestPhaseResult) {
        self.results.push(result);
    }

    pub fn end_run(&mut self) {
        self.elapsed = self.started.map(|s| s.elapsed());
    }

    pub fn results(&self) -> &[TestPhaseResult] {
        &self.results
    }

    /// Zero duration until `end_run`.
    pub fn duration(&self) -> Duration {
        self.elapsed.unwrap_or_default()
    }

    pub fn summary(&self) -> RunSummary {
        let count = |pred: fn(TestStatus) -> bool| self.results.iter().filter(|r| pred(r.status)).count();
        RunSummary {
            total: self.results.len(),
            passed: count(|s| s == TestStatus::Pass),
            failed: count(TestStatus::is_failure),
            skipped: count(|s| s == TestStatus::Skip),
            duration_ms: millis(self.duration()),
        }
    }

    pub fn build(&self, environment: EnvironmentInfo) -> RunReport {
        RunReport {
            summary: self.summary(),
            environment,
            tests: self.results.clone(),
        }
    }
}

/// Persists a finished report.
pub trait ReportWriter: Send + Sync {
    fn write(&self, report: &RunReport) -> HarnessResult<PathBuf>;
}

/// Pretty-printed JSON at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonReportWriter {
    path: PathBuf,
}

impl JsonReportWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportWriter for JsonReportWriter {
    fn write(&self, report: &RunReport) -> HarnessResult<PathBuf> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| HarnessError::file(parent, e))?;
        }
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| HarnessError::Setup(format!("Failed to serialize report: {e}")))?;
        fs::write(&self.path, json).map_err(|e| HarnessError::file(&self.path, e))?;
        info!(path = %self.path.display(), "Wrote report");
        Ok(self.path.clone())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn environment() -> EnvironmentInfo {
        EnvironmentInfo {
            platform: "linux x86_64".to_string(),
            java: "21.0.2".to_string(),
            harness_version: "0.0.0".to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            mod_version: None,
        }
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(TestStatus::Skip).unwrap(), json!("SKIP"));
        assert_eq!(TestStatus::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_summary_counts() {
        let mut generator = ReportGenerator::new();
        generator.start_run();
        generator.add(TestPhaseResult::new("accuracy", TestStatus::Pass, Duration::from_millis(10)));
        generator.add(TestPhaseResult::errored("determinism", "boom", Duration::from_millis(5)));
        generator.add(TestPhaseResult::new("performance", TestStatus::Fail, Duration::ZERO));
        generator.add(TestPhaseResult::skipped("extra", "no baseline"));
        generator.end_run();

        let summary = generator.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_start_run_resets() {
        let mut generator = ReportGenerator::new();
        generator.start_run();
        generator.add(TestPhaseResult::new("accuracy", TestStatus::Pass, Duration::ZERO));
        generator.start_run();
        assert!(generator.results().is_empty());
    }

    #[test]
    fn test_json_writer_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results").join("report.json");
        let mut generator = ReportGenerator::new();
        generator.start_run();
        generator.add(
            TestPhaseResult::new("accuracy", TestStatus::Pass, Duration::from_millis(1200))
                .with_details(json!({"pass_rate": 1.0})),
        );
        generator.end_run();

        let written = JsonReportWriter::new(&path).write(&generator.build(environment())).unwrap();
        assert_eq!(written, path);

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["passed"], 1);
        assert_eq!(value["environment"]["java"], "21.0.2");
        assert_eq!(value["tests"][0]["status"], "PASS");
        assert_eq!(value["tests"][0]["details"]["pass_rate"], 1.0);
        assert!(value["tests"][0].get("error").is_none());
        assert!(value["environment"].get("mod_version").is_none());
    }

    #[test]
    fn test_parse_java_version() {
        let stderr = "openjdk version \"21.0.2\" 2024-01-16\nOpenJDK Runtime Environment";
        assert_eq!(parse_java_version(stderr).as_deref(), Some("21.0.2"));
        assert_eq!(parse_java_version("nothing here"), None);
    }

    #[test]
    fn test_mod_version_from_mods_dir() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("other-mod-1.0.jar"), b"").unwrap();
        fs::write(dir.path().join("microbiomereplacer-0.3.1.jar"), b"").unwrap();
        assert_eq!(
            mod_version(dir.path(), "microbiomereplacer").as_deref(),
            Some("microbiomereplacer-0.3.1")
        );
        assert_eq!(mod_version(&dir.path().join("missing"), "microbiomereplacer"), None);
    }
}
