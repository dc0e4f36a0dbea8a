//! Test orchestration.
//!
//! [`TestOrchestrator`] runs an ordered list of phases. Each phase gets
//! fresh server sessions from a [`SessionFactory`]; every error or panic
//! inside a phase becomes an `ERROR` result and the run moves on.

mod phases;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::artifact::{JarSync, sync_mod_jar};
use crate::channel::{CommandTransport, McrconTransport};
use crate::chunks::MAX_BUFFER_SIZE;
use crate::config::HarnessConfig;
use crate::console::Console;
use crate::errors::{HarnessError, HarnessResult};
use crate::lifecycle::{InterruptHandle, ProcessLifecycleController};
use crate::process::{HostProcesses, SystemHost};
use crate::profiling::{AsyncProfiler, ProfileConfig, Profiler};
use crate::reporting::{
    EnvironmentInfo, JsonReportWriter, ReportGenerator, ReportWriter, RunSummary, TestPhaseResult, TestStatus,
};

pub use phases::find_baseline;

/// File names used inside the server directory.
pub const CHUNK_LIST_FILE: &str = "chunk_list.txt";
pub const BASELINE_FILE: &str = "baseline_coords.csv";
pub const PERF_WARMUP_FILE: &str = "perf_warmup.txt";
pub const PERF_CHUNKS_FILE: &str = "perf_chunks.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Accuracy,
    Determinism,
    Performance,
}

impl PhaseKind {
    /// Phases run by `all`. Performance is opt-in.
    pub const DEFAULT_SUITE: [PhaseKind; 2] = [PhaseKind::Accuracy, PhaseKind::Determinism];

    pub fn name(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Determinism => "determinism",
            Self::Performance => "performance",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhaseKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accuracy" => Ok(Self::Accuracy),
            "determinism" => Ok(Self::Determinism),
            "performance" => Ok(Self::Performance),
            other => Err(HarnessError::Config(format!("unknown test phase '{other}'"))),
        }
    }
}

/// Per-run knobs, usually from the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub seed: i64,
    pub buffer_size: u32,
    pub threshold: f64,
    pub profile: ProfileConfig,
}

impl RunSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            seed: config.test.seed,
            buffer_size: config.test.buffer_size,
            threshold: config.test.pass_threshold,
            profile: ProfileConfig::default(),
        }
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(HarnessError::Config(format!(
                "buffer size must be between 0 and {MAX_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(HarnessError::Config(format!(
                "threshold must be between 0.0 and 1.0, got {}",
                self.threshold
            )));
        }
        self.profile.validate()
    }
}

/// Builds one lifecycle controller per server session.
pub struct SessionFactory {
    config: HarnessConfig,
    transport: Arc<dyn CommandTransport>,
    host: Arc<dyn HostProcesses>,
    interrupt: InterruptHandle,
}

impl SessionFactory {
    pub fn open(&self) -> HarnessResult<ProcessLifecycleController> {
        if self.interrupt.is_interrupted() {
            return Err(HarnessError::Setup("run was interrupted".to_string()));
        }
        ProcessLifecycleController::new(
            &self.config,
            Arc::clone(&self.transport),
            Arc::clone(&self.host),
            self.interrupt.clone(),
        )
    }
}

/// Result of [`TestOrchestrator::run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// No phase failed or errored. Skipped phases do not count.
    pub all_passed: bool,
    pub summary: RunSummary,
    pub report_path: Option<PathBuf>,
    pub results: Vec<TestPhaseResult>,
}

pub struct TestOrchestrator {
    config: HarnessConfig,
    settings: RunSettings,
    sessions: SessionFactory,
    profiler: Box<dyn Profiler>,
    console: Console,
    writer: Box<dyn ReportWriter>,
    sync_artifacts: bool,
}

impl TestOrchestrator {
    pub fn builder(config: HarnessConfig) -> TestOrchestratorBuilder {
        TestOrchestratorBuilder::new(config)
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Handle for killing the active server from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.sessions.interrupt.clone()
    }

    /// Run `phases` in order, write the report and return the outcome.
    pub fn run(&mut self, phases: &[PhaseKind]) -> RunOutcome {
        if self.sync_artifacts {
            self.sync_mod_jar();
        }

        self.console
            .harness(&format!("Starting test run: {} tests queued", phases.len()));
        info!(
            seed = self.settings.seed,
            buffer = self.settings.buffer_size,
            threshold = self.settings.threshold,
            phases = ?phases.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "Starting test run"
        );

        let mut report = ReportGenerator::new();
        report.start_run();
        for &phase in phases {
            if self.sessions.interrupt.is_interrupted() {
                warn!(phase = %phase, "Run interrupted, skipping remaining phases");
                break;
            }
            let result = self.run_phase(phase);
            self.announce(&result);
            report.add(result);
        }
        report.end_run();

        let summary = report.summary();
        self.console
            .summary(summary.passed, summary.total, summary.failed, report.duration());

        let environment = EnvironmentInfo::collect(&self.config.paths.mods_dir(), &self.config.server.mod_jar_prefix);
        let report_path = match self.writer.write(&report.build(environment)) {
            Ok(path) => Some(path),
            Err(e) => {
                error!(error = %e, "Failed to write report");
                None
            }
        };

        RunOutcome {
            all_passed: summary.failed == 0,
            summary,
            report_path,
            results: report.results().to_vec(),
        }
    }

    /// Run one phase, converting errors and panics into `ERROR` results.
    pub fn run_phase(&mut self, phase: PhaseKind) -> TestPhaseResult {
        let started = Instant::now();
        info!(phase = %phase, "Running phase");

        let mut ctx = phases::PhaseContext {
            config: &self.config,
            settings: &self.settings,
            sessions: &self.sessions,
            profiler: self.profiler.as_mut(),
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match phase {
            PhaseKind::Accuracy => phases::accuracy(&mut ctx),
            PhaseKind::Determinism => phases::determinism(&mut ctx),
            PhaseKind::Performance => phases::performance(&mut ctx),
        }));

        match outcome {
            Ok(Ok(result)) => {
                info!(phase = %phase, status = %result.status, duration_ms = result.duration_ms, "Phase finished");
                result
            }
            Ok(Err(e)) => {
                error!(phase = %phase, error = %e, "Phase failed");
                TestPhaseResult::errored(phase.name(), e.to_string(), started.elapsed())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(phase = %phase, panic = %message, "Phase panicked");
                TestPhaseResult::errored(phase.name(), format!("phase panicked: {message}"), started.elapsed())
            }
        }
    }

    fn announce(&self, result: &TestPhaseResult) {
        match result.status {
            TestStatus::Pass => self.console.pass(&result.name, result.duration()),
            TestStatus::Skip => self
                .console
                .skip(&result.name, result.error.as_deref().unwrap_or("skipped")),
            TestStatus::Fail | TestStatus::Error => self.console.fail(&result.name, result.duration()),
        }
    }

    fn sync_mod_jar(&self) {
        let paths = &self.config.paths;
        match sync_mod_jar(&paths.build_libs_dir, &paths.mods_dir(), &self.config.server.mod_jar_prefix) {
            Ok(JarSync::MissingBuild) => {
                if let Some(message) = JarSync::MissingBuild.message() {
                    warn!("{}", message);
                }
            }
            Ok(outcome) => {
                if let Some(message) = outcome.message() {
                    info!("{}", message);
                    self.console.harness(&message);
                }
            }
            Err(e) => warn!(error = %e, "Mod JAR sync failed"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Assembles a [`TestOrchestrator`]. Unset collaborators fall back to the
/// real ones: `mcrcon`, the host process table, async-profiler and a JSON
/// report under the results directory.
pub struct TestOrchestratorBuilder {
    config: HarnessConfig,
    settings: Option<RunSettings>,
    transport: Option<Arc<dyn CommandTransport>>,
    host: Option<Arc<dyn HostProcesses>>,
    profiler: Option<Box<dyn Profiler>>,
    console: Option<Console>,
    writer: Option<Box<dyn ReportWriter>>,
    interrupt: Option<InterruptHandle>,
    sync_artifacts: bool,
}

impl TestOrchestratorBuilder {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            settings: None,
            transport: None,
            host: None,
            profiler: None,
            console: None,
            writer: None,
            interrupt: None,
            sync_artifacts: true,
        }
    }

    pub fn settings(mut self, settings: RunSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn CommandTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn host(mut self, host: Arc<dyn HostProcesses>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn profiler(mut self, profiler: Box<dyn Profiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn console(mut self, console: Console) -> Self {
        self.console = Some(console);
        self
    }

    pub fn report_writer(mut self, writer: Box<dyn ReportWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn interrupt(mut self, interrupt: InterruptHandle) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Copy the built mod jar into the server before running. On by default.
    pub fn sync_artifacts(mut self, enabled: bool) -> Self {
        self.sync_artifacts = enabled;
        self
    }

    /// Fails with [`HarnessError::Config`] when the run settings are invalid.
    pub fn build(self) -> HarnessResult<TestOrchestrator> {
        let settings = self
            .settings
            .unwrap_or_else(|| RunSettings::from_config(&self.config));
        settings.validate()?;

        let config = self.config;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(McrconTransport::from_config(&config)));
        let host = self.host.unwrap_or_else(|| Arc::new(SystemHost));
        let profiler = self
            .profiler
            .unwrap_or_else(|| Box::new(AsyncProfiler::from_config(&config)));
        let writer = self
            .writer
            .unwrap_or_else(|| Box::new(JsonReportWriter::new(config.paths.report_json())));

        Ok(TestOrchestrator {
            sessions: SessionFactory {
                config: config.clone(),
                transport,
                host,
                interrupt: self.interrupt.unwrap_or_default(),
            },
            config,
            settings,
            profiler,
            console: self.console.unwrap_or_else(Console::stdout),
            writer,
            sync_artifacts: self.sync_artifacts,
        })
    }
}

/// Scratch file under the results directory.
fn results_file(config: &HarnessConfig, name: &str) -> PathBuf {
    config.paths.results_dir.join(name)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
