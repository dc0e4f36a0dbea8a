//! Micro Biome harness CLI.
//!
//! Runs the accuracy, determinism and performance phases against a local
//! test server and exits with 0 (all passed), 1 (a phase failed),
//! 2 (setup error) or 130 (interrupted).

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mbh_common::profiling::ProfileConfig;
use mbh_common::{Console, HarnessConfig, LogConfig, PhaseKind, RunSettings, TestOrchestrator, init_logging};
use tracing::{error, info, warn};

const EXIT_FAILED: i32 = 1;
const EXIT_SETUP: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "mbh")]
#[command(author, version, about = "Micro Biome harness - integration tests against a live server")]
struct Cli {
    /// Test suite to run
    #[arg(value_enum, default_value_t = Suite::All)]
    suite: Suite,

    /// World seed (selects the baseline file)
    #[arg(long, allow_hyphen_values = true)]
    seed: Option<i64>,

    /// Chunk buffer around each baseline coordinate
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=2))]
    buffer: Option<u32>,

    /// Minimum replacement rate for accuracy to pass (0.0-1.0)
    #[arg(long)]
    threshold: Option<f64>,

    /// p99 latency threshold in milliseconds
    #[arg(long)]
    p99_threshold: Option<f64>,

    /// Chunks generated for the measured performance batch
    #[arg(long)]
    chunk_count: Option<usize>,

    /// Chunks generated before measuring
    #[arg(long)]
    warmup_chunks: Option<usize>,

    /// TOML configuration file
    #[arg(long, env = "MBH_CONFIG")]
    config: Option<PathBuf>,

    /// Project root containing test_server/, baseline_data/ and build/
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Mirror the harness log to stderr at debug level
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Suite {
    /// Accuracy then determinism
    All,
    Accuracy,
    Determinism,
    Performance,
}

impl Suite {
    fn phases(self) -> Vec<PhaseKind> {
        match self {
            Suite::All => PhaseKind::DEFAULT_SUITE.to_vec(),
            Suite::Accuracy => vec![PhaseKind::Accuracy],
            Suite::Determinism => vec![PhaseKind::Determinism],
            Suite::Performance => vec![PhaseKind::Performance],
        }
    }
}

fn resolve(cli: &Cli) -> Result<(HarnessConfig, RunSettings)> {
    let mut config = HarnessConfig::load(cli.project_root.as_deref(), cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(seed) = cli.seed {
        config.test.seed = seed;
    }
    if let Some(buffer) = cli.buffer {
        config.test.buffer_size = buffer;
    }
    if let Some(threshold) = cli.threshold {
        config.test.pass_threshold = threshold;
    }
    if cli.debug {
        config.log_level = "debug".to_string();
    }

    let defaults = ProfileConfig::default();
    let settings = RunSettings {
        profile: ProfileConfig {
            p99_threshold_ms: cli.p99_threshold.unwrap_or(defaults.p99_threshold_ms),
            chunk_count: cli.chunk_count.unwrap_or(defaults.chunk_count),
            warmup_chunks: cli.warmup_chunks.unwrap_or(defaults.warmup_chunks),
            ..defaults
        },
        ..RunSettings::from_config(&config)
    };
    settings.validate().context("invalid run settings")?;
    Ok((config, settings))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let console = Console::stdout();

    let (config, settings) = match resolve(&cli) {
        Ok(resolved) => resolved,
        Err(e) => {
            console.harness(&format!("Error: {e:#}"));
            std::process::exit(EXIT_SETUP);
        }
    };

    let mut log_config = LogConfig::from_env(&config.log_level)
        .with_level(config.log_level.clone())
        .with_log_dir(&config.paths.results_dir);
    if cli.debug {
        log_config = log_config.with_stderr();
    }
    let logging = match init_logging(&log_config) {
        Ok(ctx) => ctx,
        Err(e) => {
            console.harness(&format!("Error: failed to initialize logging: {e}"));
            std::process::exit(EXIT_SETUP);
        }
    };
    info!(
        seed = settings.seed,
        buffer = settings.buffer_size,
        threshold = settings.threshold,
        root = %config.paths.project_root.display(),
        "Harness starting"
    );

    let mut orchestrator = match TestOrchestrator::builder(config)
        .settings(settings)
        .console(console.clone())
        .build()
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "Harness setup failed");
            console.harness(&format!("Error: {e}"));
            drop(logging);
            std::process::exit(EXIT_SETUP);
        }
    };
    let interrupt = orchestrator.interrupt_handle();
    let phases = cli.suite.phases();

    let worker = tokio::task::spawn_blocking(move || orchestrator.run(&phases));

    let code = tokio::select! {
        joined = worker => match joined {
            Ok(outcome) => {
                if let Some(path) = &outcome.report_path {
                    info!(path = %path.display(), "Report written");
                }
                if outcome.all_passed { 0 } else { EXIT_FAILED }
            }
            Err(e) => {
                error!(error = %e, "Harness worker aborted");
                console.harness(&format!("Error: {e}"));
                EXIT_SETUP
            }
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            if let Some(pid) = interrupt.kill_active() {
                info!(pid, "Killed server after interrupt");
            }
            console.harness("Interrupted by user");
            EXIT_INTERRUPTED
        }
    };

    // process::exit skips destructors; flush the log first.
    drop(logging);
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_suite_is_accuracy_then_determinism() {
        let cli = Cli::try_parse_from(["mbh"]).unwrap();
        assert_eq!(cli.suite, Suite::All);
        assert_eq!(cli.suite.phases(), vec![PhaseKind::Accuracy, PhaseKind::Determinism]);
    }

    #[test]
    fn test_negative_seed_and_flags() {
        let cli = Cli::try_parse_from([
            "mbh",
            "performance",
            "--seed",
            "-5704795430421488525",
            "--p99-threshold",
            "30",
            "--chunk-count",
            "200",
        ])
        .unwrap();
        assert_eq!(cli.suite.phases(), vec![PhaseKind::Performance]);
        assert_eq!(cli.seed, Some(-5_704_795_430_421_488_525));
        assert_eq!(cli.p99_threshold, Some(30.0));
        assert_eq!(cli.chunk_count, Some(200));
    }

    #[test]
    fn test_buffer_out_of_range_rejected() {
        assert!(Cli::try_parse_from(["mbh", "--buffer", "3"]).is_err());
        assert!(Cli::try_parse_from(["mbh", "--buffer", "2"]).is_ok());
    }

    #[test]
    fn test_resolve_applies_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from([
            "mbh",
            "--project-root",
            root.as_str(),
            "--seed",
            "42",
            "--buffer",
            "1",
            "--warmup-chunks",
            "0",
        ])
        .unwrap();
        let (config, settings) = resolve(&cli).unwrap();
        assert_eq!(config.paths.project_root, dir.path());
        assert_eq!(settings.seed, 42);
        assert_eq!(settings.buffer_size, 1);
        assert_eq!(settings.profile.warmup_chunks, 0);
        assert_eq!(settings.profile.chunk_count, 500);
    }

    #[test]
    fn test_resolve_rejects_bad_threshold() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["mbh", "--project-root", root.as_str(), "--threshold", "1.5"]).unwrap();
        assert!(resolve(&cli).is_err());
    }
}
