//! Canonical hashing of inspection results for the determinism check.
//!
//! Two runs match when their canonical digests are equal. Records are sorted
//! by coordinate before serialization, so collection order never matters.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::parsing::BiomeInspection;

/// Serialized form of one record. Field order is the serialization order.
#[derive(Serialize)]
struct CanonicalRecord<'a> {
    actual_label: &'a str,
    x: i32,
    y: i32,
    z: i32,
}

/// `sha256:<hex>` over the sorted, compact JSON array of records.
pub fn canonical_digest(records: &[BiomeInspection]) -> String {
    let mut sorted: Vec<&BiomeInspection> = records.iter().collect();
    sorted.sort_by(|a, b| {
        (a.x, a.y, a.z, &a.actual_label).cmp(&(b.x, b.y, b.z, &b.actual_label))
    });
    let canonical: Vec<CanonicalRecord<'_>> = sorted
        .into_iter()
        .map(|r| CanonicalRecord {
            actual_label: &r.actual_label,
            x: r.x,
            y: r.y,
            z: r.z,
        })
        .collect();
    // Serializing a Vec of plain structs cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    format!("sha256:{:x}", Sha256::digest(&bytes))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeterminismRecord {
    pub run1_hash: String,
    pub run2_hash: String,
    #[serde(rename = "match")]
    pub matched: bool,
}

impl DeterminismRecord {
    pub fn compare(run1: &[BiomeInspection], run2: &[BiomeInspection]) -> Self {
        let run1_hash = canonical_digest(run1);
        let run2_hash = canonical_digest(run2);
        let matched = run1_hash == run2_hash;
        Self {
            run1_hash,
            run2_hash,
            matched,
        }
    }
}

/// A coordinate whose label differs between runs. `None` means the
/// coordinate was absent from that run, or reported fewer times there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordDifference {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub run1: Option<String>,
    pub run2: Option<String>,
}

/// Differing coordinates in coordinate order, at most `limit` of them.
///
/// Labels are compared per coordinate as sorted lists, so a coordinate
/// reported twice in one run and once in the other still shows up. Non-empty
/// whenever the two digests differ.
pub fn diff_records(
    run1: &[BiomeInspection],
    run2: &[BiomeInspection],
    limit: usize,
) -> Vec<RecordDifference> {
    let index = |records: &[BiomeInspection]| -> BTreeMap<(i32, i32, i32), Vec<String>> {
        let mut by_coord: BTreeMap<_, Vec<String>> = BTreeMap::new();
        for r in records {
            by_coord.entry((r.x, r.y, r.z)).or_default().push(r.actual_label.clone());
        }
        for labels in by_coord.values_mut() {
            labels.sort_unstable();
        }
        by_coord
    };
    let first = index(run1);
    let second = index(run2);

    let mut keys: Vec<_> = first.keys().chain(second.keys()).copied().collect();
    keys.sort_unstable();
    keys.dedup();

    let empty = Vec::new();
    keys.into_iter()
        .flat_map(|key| {
            let a = first.get(&key).unwrap_or(&empty);
            let b = second.get(&key).unwrap_or(&empty);
            (0..a.len().max(b.len())).filter_map(move |i| {
                let (run1, run2) = (a.get(i), b.get(i));
                (run1 != run2).then(|| RecordDifference {
                    x: key.0,
                    y: key.1,
                    z: key.2,
                    run1: run1.cloned(),
                    run2: run2.cloned(),
                })
            })
        })
        .take(limit)
        .collect()
}

/// Log each difference at warn level.
pub fn log_differences(differences: &[RecordDifference]) {
    for d in differences {
        warn!(
            x = d.x,
            y = d.y,
            z = d.z,
            run1 = d.run1.as_deref().unwrap_or("<missing>"),
            run2 = d.run2.as_deref().unwrap_or("<missing>"),
            "Determinism mismatch"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(x: i32, y: i32, z: i32, label: &str) -> BiomeInspection {
        BiomeInspection {
            x,
            y,
            z,
            baseline_label: "minecraft:plains".to_string(),
            actual_label: label.to_string(),
        }
    }

    #[test]
    fn test_identical_runs_match() {
        let run1 = vec![record(0, 64, 0, "plains")];
        let run2 = vec![record(0, 64, 0, "plains")];
        let result = DeterminismRecord::compare(&run1, &run2);
        assert!(result.matched);
        assert_eq!(result.run1_hash, result.run2_hash);
        assert!(result.run1_hash.starts_with("sha256:"));
        assert_eq!(result.run1_hash.len(), "sha256:".len() + 64);
        assert!(diff_records(&run1, &run2, 10).is_empty());
    }

    #[test]
    fn test_label_change_breaks_match_with_single_diff() {
        let run1 = vec![record(0, 64, 0, "plains")];
        let run2 = vec![record(0, 64, 0, "desert")];
        let result = DeterminismRecord::compare(&run1, &run2);
        assert!(!result.matched);

        let diff = diff_records(&run1, &run2, 10);
        assert_eq!(
            diff,
            vec![RecordDifference {
                x: 0,
                y: 64,
                z: 0,
                run1: Some("plains".to_string()),
                run2: Some("desert".to_string()),
            }]
        );
    }

    #[test]
    fn test_baseline_label_is_not_hashed() {
        let mut other = record(1, 2, 3, "meadow");
        other.baseline_label = "minecraft:desert".to_string();
        assert_eq!(
            canonical_digest(&[record(1, 2, 3, "meadow")]),
            canonical_digest(&[other])
        );
    }

    #[test]
    fn test_missing_coordinates_are_reported() {
        let run1 = vec![record(0, 64, 0, "plains"), record(16, 64, 0, "plains")];
        let run2 = vec![record(0, 64, 0, "plains")];
        let diff = diff_records(&run1, &run2, 10);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].run2, None);
    }

    #[test]
    fn test_repeated_coordinate_is_reported() {
        let run1 = vec![record(0, 64, 0, "plains"), record(0, 64, 0, "desert")];
        let run2 = vec![record(0, 64, 0, "desert")];
        assert!(!DeterminismRecord::compare(&run1, &run2).matched);

        let diff = diff_records(&run1, &run2, 10);
        assert_eq!(
            diff,
            vec![RecordDifference {
                x: 0,
                y: 64,
                z: 0,
                run1: Some("plains".to_string()),
                run2: None,
            }]
        );
    }

    #[test]
    fn test_diff_is_bounded() {
        let run1: Vec<_> = (0..30).map(|i| record(i, 64, 0, "plains")).collect();
        let run2: Vec<_> = (0..30).map(|i| record(i, 64, 0, "desert")).collect();
        assert_eq!(diff_records(&run1, &run2, 10).len(), 10);
    }

    #[test]
    fn test_record_serializes_match_key() {
        let value = serde_json::to_value(DeterminismRecord::compare(&[], &[])).unwrap();
        assert_eq!(value["match"], true);
    }

    proptest! {
        #[test]
        fn prop_digest_is_order_independent(
            raw in prop::collection::vec((-500i32..500, 0i32..128, -500i32..500, 0usize..4), 0..40),
            seed in any::<u64>(),
        ) {
            let labels = ["plains", "desert", "meadow", "forest"];
            let records: Vec<_> = raw.iter().map(|&(x, y, z, l)| record(x, y, z, labels[l])).collect();
            let mut shuffled = records.clone();
            // Deterministic rotation plus reversal stands in for a shuffle.
            if !shuffled.is_empty() {
                let k = (seed as usize) % shuffled.len();
                shuffled.rotate_left(k);
                shuffled.reverse();
            }
            prop_assert_eq!(canonical_digest(&records), canonical_digest(&shuffled));
        }

        #[test]
        fn prop_digest_mismatch_always_has_a_difference(
            first in prop::collection::vec((0i32..4, 0usize..3), 0..12),
            second in prop::collection::vec((0i32..4, 0usize..3), 0..12),
        ) {
            let labels = ["plains", "desert", "meadow"];
            let run1: Vec<_> = first.iter().map(|&(x, l)| record(x, 64, 0, labels[l])).collect();
            let run2: Vec<_> = second.iter().map(|&(x, l)| record(x, 64, 0, labels[l])).collect();
            let matched = DeterminismRecord::compare(&run1, &run2).matched;
            prop_assert_eq!(matched, diff_records(&run1, &run2, usize::MAX).is_empty());
        }
    }
}
