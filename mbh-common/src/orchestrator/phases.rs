//! Phase bodies: accuracy, determinism and performance.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::{BASELINE_FILE, CHUNK_LIST_FILE, PERF_CHUNKS_FILE, PERF_WARMUP_FILE, RunSettings, SessionFactory};
use super::{display, results_file};
use crate::chunks::{ChunkPlanner, spawn_grid, write_chunk_list};
use crate::config::HarnessConfig;
use crate::determinism::{DeterminismRecord, diff_records, log_differences};
use crate::errors::{HarnessError, HarnessResult};
use crate::lifecycle::ProcessLifecycleController;
use crate::parsing::{BiomeInspection, ResultLog, accuracy_stats, parse_log_file};
use crate::profiling::{AttachedProfiler, Profiler, evaluate_performance};
use crate::reporting::{TestPhaseResult, TestStatus};

pub(super) struct PhaseContext<'a> {
    pub config: &'a HarnessConfig,
    pub settings: &'a RunSettings,
    pub sessions: &'a SessionFactory,
    pub profiler: &'a mut dyn Profiler,
}

/// Baseline CSV for `seed`: a file whose name contains the seed, else the
/// first CSV by name.
pub fn find_baseline(dir: &Path, seed: i64) -> Option<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        warn!(dir = %dir.display(), "Baseline directory not found");
        return None;
    };
    let mut csvs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    csvs.sort();

    let seed = seed.to_string();
    if let Some(exact) = csvs
        .iter()
        .find(|p| p.file_name().is_some_and(|n| n.to_string_lossy().contains(&seed)))
    {
        return Some(exact.clone());
    }
    match csvs.into_iter().next() {
        Some(first) => {
            info!(seed = %seed, file = %first.display(), "No baseline for seed, using first CSV");
            Some(first)
        }
        None => {
            warn!(dir = %dir.display(), "No CSV files in baseline directory");
            None
        }
    }
}

/// Load the baseline, compute chunks and write the chunk list.
fn plan(ctx: &PhaseContext<'_>, baseline: &Path) -> HarnessResult<(ChunkPlanner, PathBuf)> {
    let mut planner = ChunkPlanner::new();
    planner.load_baseline(baseline)?;
    planner.calculate_chunks(ctx.settings.buffer_size)?;
    let chunk_file = planner.write_chunk_file(&results_file(ctx.config, CHUNK_LIST_FILE))?;
    Ok((planner, chunk_file))
}

fn skip_without_baseline(name: &str, ctx: &PhaseContext<'_>) -> TestPhaseResult {
    TestPhaseResult::skipped(
        name,
        format!("no baseline file found in {}", ctx.config.paths.baseline_dir.display()),
    )
}

/// Stop (if `driven` succeeded) and clean up the session, then surface
/// `driven`'s error.
fn finish_session<T>(server: &mut ProcessLifecycleController, driven: HarnessResult<T>) -> HarnessResult<T> {
    if driven.is_ok() {
        server.stop();
    }
    server.cleanup();
    driven
}

/// One full session: launch, stage inputs, forceload, sprint, settle,
/// inspect, stop. Returns the parsed server log.
fn run_generation(
    ctx: &PhaseContext<'_>,
    run: &str,
    planner: &ChunkPlanner,
    chunk_file: &Path,
    baseline: &Path,
) -> HarnessResult<ResultLog> {
    let mut server = ctx.sessions.open()?;
    let driven = drive_generation(ctx, &mut server, run, planner.chunk_count(), chunk_file, baseline);
    finish_session(&mut server, driven)?;

    let log = parse_log_file(server.log_path())?;
    for command in ["forceload_chunks", "batch_inspect"] {
        if let Some(err) = log.failure_for(command) {
            return Err(err);
        }
    }
    Ok(log)
}

fn drive_generation(
    ctx: &PhaseContext<'_>,
    server: &mut ProcessLifecycleController,
    run: &str,
    chunk_count: usize,
    chunk_file: &Path,
    baseline: &Path,
) -> HarnessResult<()> {
    server.start()?;
    server.copy_file_to_server(chunk_file, CHUNK_LIST_FILE)?;
    server.copy_file_to_server(baseline, BASELINE_FILE)?;

    let channel = server.channel()?;
    info!(run, chunks = chunk_count, "Force-loading chunks");
    channel.forceload_chunks(CHUNK_LIST_FILE)?;

    let ticks = ctx.config.test.tick_sprint_count(chunk_count);
    info!(run, ticks, "Running tick sprint");
    channel.tick_sprint(ticks)?;
    thread::sleep(ctx.config.timeouts.generation_settle);

    info!(run, "Querying biomes via batch_inspect");
    channel.batch_inspect(BASELINE_FILE)?;
    Ok(())
}

/// `details` object with `extra` merged in at the top level.
fn details_with<T: Serialize>(mut base: Map<String, Value>, extra: &T) -> HarnessResult<Value> {
    match serde_json::to_value(extra) {
        Ok(Value::Object(fields)) => base.extend(fields),
        Ok(other) => {
            base.insert("value".to_string(), other);
        }
        Err(e) => return Err(HarnessError::Setup(format!("Failed to serialize results: {e}"))),
    }
    Ok(Value::Object(base))
}

fn to_value<T: Serialize>(value: &T) -> HarnessResult<Value> {
    serde_json::to_value(value).map_err(|e| HarnessError::Setup(format!("Failed to serialize results: {e}")))
}

pub(super) fn accuracy(ctx: &mut PhaseContext<'_>) -> HarnessResult<TestPhaseResult> {
    const NAME: &str = "accuracy";
    let started = Instant::now();
    let Some(baseline) = find_baseline(&ctx.config.paths.baseline_dir, ctx.settings.seed) else {
        return Ok(skip_without_baseline(NAME, ctx));
    };
    info!(baseline = %baseline.display(), "Using baseline");

    let (planner, chunk_file) = plan(ctx, &baseline)?;
    let log = run_generation(ctx, NAME, &planner, &chunk_file, &baseline)?;

    let inspections = log.inspections();
    let stats = accuracy_stats(&inspections, ctx.settings.threshold, ctx.config.test.failure_sample_limit);
    info!(
        total = stats.total_coordinates,
        replaced = stats.replaced,
        pass_rate = stats.pass_rate,
        status = %stats.status,
        "Accuracy computed"
    );

    let mut chunks = to_value(&planner.stats())?;
    if let (Value::Object(fields), Some(loaded)) = (&mut chunks, log.forceload()) {
        fields.insert("loaded".to_string(), json!(loaded.chunks_loaded));
        fields.insert("load_duration_ms".to_string(), json!(loaded.duration_ms));
    }
    let mut base = Map::new();
    base.insert("seed".to_string(), json!(ctx.settings.seed));
    base.insert("baseline_file".to_string(), json!(display(&baseline)));
    base.insert("chunks".to_string(), chunks);
    if let Some(summary) = log.inspect_summary() {
        base.insert("inspect_errors".to_string(), json!(summary.errors));
    }

    Ok(TestPhaseResult::new(NAME, stats.status, started.elapsed()).with_details(details_with(base, &stats)?))
}

pub(super) fn determinism(ctx: &mut PhaseContext<'_>) -> HarnessResult<TestPhaseResult> {
    const NAME: &str = "determinism";
    let started = Instant::now();
    let Some(baseline) = find_baseline(&ctx.config.paths.baseline_dir, ctx.settings.seed) else {
        return Ok(skip_without_baseline(NAME, ctx));
    };
    info!(baseline = %baseline.display(), "Determinism test using baseline");

    // Same chunk set for both runs.
    let (planner, chunk_file) = plan(ctx, &baseline)?;

    let mut runs: Vec<Vec<BiomeInspection>> = Vec::with_capacity(2);
    for run in ["run1", "run2"] {
        info!(run, "Starting determinism run");
        let inspections = run_generation(ctx, run, &planner, &chunk_file, &baseline)?.inspections();
        info!(run, results = inspections.len(), "Determinism run complete");
        runs.push(inspections);
    }
    let (run1, run2) = (&runs[0], &runs[1]);

    let record = DeterminismRecord::compare(run1, run2);
    let mut base = Map::new();
    base.insert("seed".to_string(), json!(ctx.settings.seed));
    base.insert("run1_results".to_string(), json!(run1.len()));
    base.insert("run2_results".to_string(), json!(run2.len()));

    let status = if record.matched {
        if run1.is_empty() {
            warn!("Determinism runs matched but produced no inspection results");
        }
        info!(hash = %record.run1_hash, "Determinism check passed: results are identical");
        TestStatus::Pass
    } else {
        let differences = diff_records(run1, run2, ctx.config.test.diff_sample_limit);
        warn!(shown = differences.len(), "Determinism check failed: results differ");
        log_differences(&differences);
        base.insert("differences".to_string(), to_value(&differences)?);
        TestStatus::Fail
    };

    Ok(TestPhaseResult::new(NAME, status, started.elapsed()).with_details(details_with(base, &record)?))
}

pub(super) fn performance(ctx: &mut PhaseContext<'_>) -> HarnessResult<TestPhaseResult> {
    const NAME: &str = "performance";
    let started = Instant::now();

    let mut server = ctx.sessions.open()?;
    let driven = drive_performance(ctx, &mut server);
    let flamegraph = finish_session(&mut server, driven)?;

    let log = parse_log_file(server.log_path())?;
    if let Some(err) = log.failure_for("forceload_chunks") {
        return Err(err);
    }
    let Some(stats) = log.profile_stats() else {
        return Ok(TestPhaseResult::errored(
            NAME,
            "No profile stats found in server output",
            started.elapsed(),
        ));
    };

    let result = evaluate_performance(stats, &ctx.settings.profile, started.elapsed(), flamegraph);
    info!(
        p99_ms = result.timing.p99_ms,
        threshold_ms = result.threshold_p99_ms,
        status = %result.status,
        "Performance evaluated"
    );
    Ok(TestPhaseResult::new(NAME, result.status, started.elapsed()).with_details(to_value(&result)?))
}

/// Launch, profile warmup then measured generation, collect stats.
/// Returns the flamegraph path, if one was produced.
fn drive_performance(ctx: &mut PhaseContext<'_>, server: &mut ProcessLifecycleController) -> HarnessResult<Option<PathBuf>> {
    let settings: &RunSettings = ctx.settings;
    let profile = &settings.profile;
    server.start()?;

    let mut attached = match server.pid() {
        Some(pid) if ctx.profiler.is_available() => match AttachedProfiler::attach(&mut *ctx.profiler, pid) {
            Ok(attached) => Some(attached),
            Err(e) => {
                warn!(error = %e, "Profiler attach failed, continuing without flamegraph");
                None
            }
        },
        _ => {
            info!("Profiler not available, continuing without flamegraph");
            None
        }
    };
    if let Some(profiler) = attached.as_mut()
        && let Err(e) = profiler.start_recording("chunk_processing", profile)
    {
        warn!(error = %e, "Profiler failed to start recording");
    }

    info!("Resetting performance stats");
    server.channel()?.profile_reset()?;

    if profile.warmup_chunks > 0 {
        info!(chunks = profile.warmup_chunks, "Generating warmup chunks");
        generate_grid(ctx.config, server, profile.warmup_chunks, PERF_WARMUP_FILE)?;
        server.channel()?.profile_reset()?;
    }

    info!(chunks = profile.chunk_count, "Generating measured chunks");
    generate_grid(ctx.config, server, profile.chunk_count, PERF_CHUNKS_FILE)?;

    info!("Collecting performance stats");
    server.channel()?.profile_stats()?;

    let flamegraph = attached.as_mut().and_then(|p| p.stop_recording());
    Ok(flamegraph)
}

/// Force-load a spawn-centred grid of `count` chunks and let it generate.
fn generate_grid(
    config: &HarnessConfig,
    server: &mut ProcessLifecycleController,
    count: usize,
    file_name: &str,
) -> HarnessResult<()> {
    let local = results_file(config, file_name);
    write_chunk_list(&local, spawn_grid(count))?;
    server.copy_file_to_server(&local, file_name)?;

    let channel = server.channel()?;
    channel.forceload_chunks(file_name)?;
    let ticks = config.test.tick_sprint_count(count);
    info!(ticks, chunks = count, "Running tick sprint");
    channel.tick_sprint(ticks)?;
    thread::sleep(config.timeouts.generation_settle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_baseline_prefers_seed_match() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a_other.csv"), "").unwrap();
        fs::write(dir.path().join("baseline_-42.csv"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(find_baseline(dir.path(), -42), Some(dir.path().join("baseline_-42.csv")));
        assert_eq!(find_baseline(dir.path(), 7), Some(dir.path().join("a_other.csv")));
    }

    #[test]
    fn test_find_baseline_missing_dir_or_files() {
        let dir = TempDir::new().unwrap();
        assert_eq!(find_baseline(dir.path(), 1), None);
        assert_eq!(find_baseline(&dir.path().join("nope"), 1), None);
    }

    #[test]
    fn test_details_merge_flattens_struct() {
        #[derive(Serialize)]
        struct Extra {
            pass_rate: f64,
        }
        let mut base = Map::new();
        base.insert("seed".to_string(), json!(1));
        let merged = details_with(base, &Extra { pass_rate: 0.5 }).unwrap();
        assert_eq!(merged, json!({"seed": 1, "pass_rate": 0.5}));
    }
}
