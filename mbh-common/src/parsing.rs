//! Extraction of `[TEST_RESULT]` records from the server log.
//!
//! Each record is a JSON object following the marker on a log line. Records
//! are dispatched on their `command` field into [`ResultEvent`]s; unknown
//! commands are ignored and malformed payloads are skipped with a warning.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{HarnessError, HarnessResult};
use crate::reporting::TestStatus;

pub const TEST_RESULT_MARKER: &str = "[TEST_RESULT]";

/// One inspected coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiomeInspection {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    #[serde(alias = "baseline_biome")]
    pub baseline_label: String,
    #[serde(alias = "actual_biome")]
    pub actual_label: String,
}

impl BiomeInspection {
    /// The mod replaced this position's biome.
    pub fn replaced(&self) -> bool {
        self.baseline_label != self.actual_label
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInspectSummary {
    pub total: u64,
    #[serde(default)]
    pub errors: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceloadSummary {
    pub chunks_loaded: u64,
    #[serde(default)]
    pub errors: u64,
    pub duration_ms: u64,
}

/// Timing histogram and work counters reported by `microbiome profile stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileStats {
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
    pub replacements: u64,
    pub homogeneous_skips: u64,
    pub positions_processed: u64,
}

/// A server-side failure reported as a result record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandFailure {
    pub command: String,
    pub error: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultEvent {
    Forceload(ForceloadSummary),
    Inspection(BiomeInspection),
    InspectComplete(BatchInspectSummary),
    ProfileStats(ProfileStats),
    Failure(CommandFailure),
}

/// All events from one log, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultLog {
    pub events: Vec<ResultEvent>,
    /// Marker lines whose payload could not be parsed.
    pub skipped: usize,
}

impl ResultLog {
    pub fn inspections(&self) -> Vec<BiomeInspection> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ResultEvent::Inspection(i) => Some(i.clone()),
                _ => None,
            })
            .collect()
    }

    /// Last batch-inspect summary.
    pub fn inspect_summary(&self) -> Option<&BatchInspectSummary> {
        self.events.iter().rev().find_map(|e| match e {
            ResultEvent::InspectComplete(s) => Some(s),
            _ => None,
        })
    }

    /// First forceload summary.
    pub fn forceload(&self) -> Option<&ForceloadSummary> {
        self.events.iter().find_map(|e| match e {
            ResultEvent::Forceload(s) => Some(s),
            _ => None,
        })
    }

    /// Last profile stats record.
    pub fn profile_stats(&self) -> Option<&ProfileStats> {
        self.events.iter().rev().find_map(|e| match e {
            ResultEvent::ProfileStats(s) => Some(s),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommandFailure> {
        self.events.iter().filter_map(|e| match e {
            ResultEvent::Failure(f) => Some(f),
            _ => None,
        })
    }

    /// First server-reported failure for `command`, as an error.
    pub fn failure_for(&self, command: &str) -> Option<HarnessError> {
        self.failures().find(|f| f.command == command).map(|f| HarnessError::Command {
            command: f.command.clone(),
            message: match &f.detail {
                Some(detail) => format!("{} ({detail})", f.error),
                None => f.error.clone(),
            },
        })
    }
}

/// Read and parse a server log. A missing file is a [`HarnessError::LogParsing`].
pub fn parse_log_file(path: &Path) -> HarnessResult<ResultLog> {
    debug!(path = %path.display(), "Extracting test results");
    if !path.is_file() {
        return Err(HarnessError::LogParsing(format!(
            "Log file not found: {}",
            path.display()
        )));
    }
    let bytes = fs::read(path)
        .map_err(|e| HarnessError::LogParsing(format!("Failed to read {}: {e}", path.display())))?;
    let log = parse_log_text(&String::from_utf8_lossy(&bytes));
    info!(events = log.events.len(), skipped = log.skipped, "Extracted test results from log");
    Ok(log)
}

pub fn parse_log_text(text: &str) -> ResultLog {
    let mut log = ResultLog::default();
    for (index, line) in text.lines().enumerate() {
        if !line.contains(TEST_RESULT_MARKER) {
            continue;
        }
        let parsed = extract_json_payload(line)
            .ok_or_else(|| "no JSON object after marker".to_string())
            .and_then(|payload| serde_json::from_str::<Value>(payload).map_err(|e| e.to_string()))
            .and_then(classify);
        match parsed {
            Ok(Some(event)) => log.events.push(event),
            Ok(None) => {}
            Err(reason) => {
                warn!(line = index + 1, %reason, "Failed to parse result line");
                log.skipped += 1;
            }
        }
    }
    log
}

/// The first balanced `{...}` after the marker. Braces inside JSON strings
/// are ignored. An unbalanced object yields the rest of the line.
pub fn extract_json_payload(line: &str) -> Option<&str> {
    let after = &line[line.find(TEST_RESULT_MARKER)? + TEST_RESULT_MARKER.len()..];
    let start = after.find('{')?;
    let candidate = &after[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in candidate.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&candidate[..=i]);
                }
            }
            _ => {}
        }
    }
    Some(candidate.trim_end())
}

fn classify(value: Value) -> Result<Option<ResultEvent>, String> {
    let command = value
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| "record has no command field".to_string())?
        .to_string();

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let detail = value
            .get("message")
            .or_else(|| value.get("file"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(Some(ResultEvent::Failure(CommandFailure {
            command,
            error: error.to_string(),
            detail,
        })));
    }

    let decode_err = |e: serde_json::Error| format!("{command}: {e}");
    let event = match command.as_str() {
        "batch_inspect" => ResultEvent::Inspection(serde_json::from_value(value).map_err(decode_err)?),
        "batch_inspect_complete" => {
            ResultEvent::InspectComplete(serde_json::from_value(value).map_err(decode_err)?)
        }
        // Progress records omit the summary fields.
        "forceload_chunks" if value.get("chunks_loaded").is_some() => {
            ResultEvent::Forceload(serde_json::from_value(value).map_err(decode_err)?)
        }
        "profile_stats" => ResultEvent::ProfileStats(serde_json::from_value(value).map_err(decode_err)?),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

// ---------------------------------------------------------------------------
// Accuracy
// ---------------------------------------------------------------------------

/// A coordinate the mod left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccuracyFailure {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub expected_change: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyStats {
    pub total_coordinates: usize,
    pub replaced: usize,
    pub not_replaced: usize,
    pub pass_rate: f64,
    pub status: TestStatus,
    pub threshold: f64,
    /// First `failure_limit` unreplaced coordinates.
    pub failures: Vec<AccuracyFailure>,
}

/// Replacement rate over `inspections`. No inspections is a failure.
pub fn accuracy_stats(inspections: &[BiomeInspection], threshold: f64, failure_limit: usize) -> AccuracyStats {
    let total = inspections.len();
    let replaced = inspections.iter().filter(|i| i.replaced()).count();
    let pass_rate = if total == 0 {
        0.0
    } else {
        replaced as f64 / total as f64
    };
    let status = if total > 0 && pass_rate >= threshold {
        TestStatus::Pass
    } else {
        TestStatus::Fail
    };
    let failures = inspections
        .iter()
        .filter(|i| !i.replaced())
        .take(failure_limit)
        .map(|i| AccuracyFailure {
            x: i.x,
            y: i.y,
            z: i.z,
            expected_change: i.baseline_label.clone(),
            actual: i.actual_label.clone(),
        })
        .collect();

    AccuracyStats {
        total_coordinates: total,
        replaced,
        not_replaced: total - replaced,
        pass_rate,
        status,
        threshold,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r#"[12:00:00] [Server thread/INFO]: Done (12.3s)! For help, type "help"
[12:00:05] [Server thread/INFO] [microbiomereplacer/]: [TEST_RESULT] {"command":"forceload_chunks","chunks_loaded":2,"errors":0,"duration_ms":840}
[12:00:09] [Server thread/INFO] [microbiomereplacer/]: [TEST_RESULT] {"command":"batch_inspect","x":16,"y":64,"z":16,"baseline_biome":"minecraft:plains","actual_biome":"minecraft:meadow"}
[12:00:09] [Server thread/INFO] [microbiomereplacer/]: [TEST_RESULT] {"command":"batch_inspect","x":32,"y":70,"z":-16,"baseline_biome":"minecraft:desert","actual_biome":"minecraft:desert"}
[12:00:09] [Server thread/INFO] [microbiomereplacer/]: [TEST_RESULT] {"command":"batch_inspect","x":1,"y":
[12:00:09] [Server thread/INFO] [microbiomereplacer/]: [TEST_RESULT] {"command":"inspect","x":0,"y":0,"z":0,"biome":"minecraft:plains","timestamp":1}
[12:00:10] [Server thread/INFO] [microbiomereplacer/]: [TEST_RESULT] {"command":"batch_inspect_complete","total":2,"errors":0,"duration_ms":33} trailing text
"#;

    #[test]
    fn test_parse_mixed_log() {
        let log = parse_log_text(LOG);
        assert_eq!(log.skipped, 1);
        assert_eq!(log.forceload().map(|f| f.chunks_loaded), Some(2));

        let inspections = log.inspections();
        assert_eq!(inspections.len(), 2);
        assert!(inspections[0].replaced());
        assert!(!inspections[1].replaced());
        assert_eq!(inspections[1].baseline_label, "minecraft:desert");
        assert_eq!(log.inspect_summary().map(|s| s.total), Some(2));
        assert!(log.profile_stats().is_none());
    }

    #[test]
    fn test_extract_payload_ignores_braces_in_strings() {
        let line = r#"x [TEST_RESULT] {"command":"say","text":"a } b {"} tail }"#;
        assert_eq!(
            extract_json_payload(line),
            Some(r#"{"command":"say","text":"a } b {"}"#)
        );
        assert_eq!(extract_json_payload("[TEST_RESULT] no json"), None);
        assert_eq!(extract_json_payload("no marker {}"), None);
    }

    #[test]
    fn test_spec_style_label_fields_accepted() {
        let log = parse_log_text(
            r#"[TEST_RESULT] {"command":"batch_inspect","x":0,"y":0,"z":0,"baseline_label":"a","actual_label":"b"}"#,
        );
        assert_eq!(log.inspections()[0].actual_label, "b");
    }

    #[test]
    fn test_forceload_progress_records_ignored() {
        let log = parse_log_text(r#"[TEST_RESULT] {"command":"forceload_chunks","progress":50}"#);
        assert!(log.events.is_empty());
        assert_eq!(log.skipped, 0);
    }

    #[test]
    fn test_server_error_records_become_failures() {
        let log = parse_log_text(
            r#"[TEST_RESULT] {"command":"batch_inspect","error":"file_not_found","file":"baseline_coords.csv"}"#,
        );
        let err = log.failure_for("batch_inspect").unwrap();
        assert!(err.to_string().contains("file_not_found (baseline_coords.csv)"));
        assert!(log.failure_for("forceload_chunks").is_none());
    }

    #[test]
    fn test_profile_stats_parsed() {
        let log = parse_log_text(
            r#"[TEST_RESULT] {"command":"profile_stats","count":500,"mean_ms":2.10,"min_ms":0.40,"max_ms":61.00,"p50_ms":1.80,"p90_ms":4.00,"p99_ms":40.00,"total_ms":1050.00,"replacements":120,"homogeneous_skips":300,"positions_processed":64000}"#,
        );
        let stats = log.profile_stats().unwrap();
        assert_eq!(stats.count, 500);
        assert_eq!(stats.p99_ms, 40.0);
        assert_eq!(stats.positions_processed, 64000);
    }

    #[test]
    fn test_missing_log_file() {
        let err = parse_log_file(Path::new("/nonexistent/server_stdout.log")).unwrap_err();
        assert!(matches!(err, HarnessError::LogParsing(_)));
    }

    fn inspection(baseline: &str, actual: &str) -> BiomeInspection {
        BiomeInspection {
            x: 0,
            y: 64,
            z: 0,
            baseline_label: baseline.to_string(),
            actual_label: actual.to_string(),
        }
    }

    #[test]
    fn test_accuracy_empty_is_fail() {
        let stats = accuracy_stats(&[], 0.0, 20);
        assert_eq!(stats.status, TestStatus::Fail);
        assert_eq!(stats.total_coordinates, 0);
        assert_eq!(stats.pass_rate, 0.0);
    }

    #[test]
    fn test_accuracy_threshold_is_inclusive() {
        let mut inspections: Vec<_> = (0..19).map(|_| inspection("plains", "meadow")).collect();
        inspections.push(inspection("desert", "desert"));
        let stats = accuracy_stats(&inspections, 0.95, 20);
        assert_eq!(stats.replaced, 19);
        assert_eq!(stats.not_replaced, 1);
        assert_eq!(stats.status, TestStatus::Pass);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].expected_change, "desert");

        let stats = accuracy_stats(&inspections, 0.96, 20);
        assert_eq!(stats.status, TestStatus::Fail);
    }

    #[test]
    fn test_accuracy_failures_are_capped() {
        let inspections: Vec<_> = (0..50).map(|_| inspection("plains", "plains")).collect();
        let stats = accuracy_stats(&inspections, 0.95, 20);
        assert_eq!(stats.failures.len(), 20);
        assert_eq!(stats.not_replaced, 50);
    }
}
