//! Property-Based Tests for Row Deduplication
//!
//! For any fetched list, every identifier appears at most once in the output,
//! survivors keep their first-seen order, and the output is a subsequence of
//! the input.

use fleetsync_cache::{dedup_by_key, Deduplicator};
use fleetsync_core::{Record, RowKey};
use fleetsync_test_utils::generators::{arb_rows_with_duplicates, arb_rows_with_gaps};
use proptest::prelude::*;
use std::collections::HashSet;

fn seq(row: &Record) -> i64 {
    row.get("seq").and_then(|v| v.as_i64()).unwrap_or(-1)
}

/// Whether `sub` appears in `full` in order, compared by `seq`.
fn is_subsequence(sub: &[Record], full: &[Record]) -> bool {
    let mut remaining = full.iter().map(seq);
    sub.iter().map(seq).all(|s| remaining.any(|f| f == s))
}

proptest! {
    #[test]
    fn dedup_yields_each_id_once(rows in arb_rows_with_duplicates(40)) {
        let out = Deduplicator::default().dedup(rows);
        let mut seen = HashSet::new();
        for row in &out {
            let key = row.key("id").unwrap();
            prop_assert!(seen.insert(key), "identifier repeated in output");
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence(rows in arb_rows_with_duplicates(40)) {
        let out = Deduplicator::default().dedup(rows.clone());
        for row in &out {
            let key = row.key("id").unwrap();
            let first = rows.iter().find(|r| r.key("id").as_ref() == Some(&key)).unwrap();
            prop_assert_eq!(seq(row), seq(first));
        }

        let distinct: HashSet<RowKey> = rows.iter().filter_map(|r| r.key("id")).collect();
        prop_assert_eq!(out.len(), distinct.len());
    }

    #[test]
    fn dedup_output_is_subsequence(rows in arb_rows_with_duplicates(40)) {
        let out = Deduplicator::default().dedup(rows.clone());
        prop_assert!(is_subsequence(&out, &rows));
    }

    #[test]
    fn dedup_keeps_rows_without_identifier(rows in arb_rows_with_gaps(40)) {
        let missing = rows.iter().filter(|r| r.key("id").is_none()).count();
        let out = Deduplicator::default().dedup(rows.clone());
        prop_assert_eq!(out.iter().filter(|r| r.key("id").is_none()).count(), missing);
        prop_assert!(is_subsequence(&out, &rows));
    }

    #[test]
    fn dedup_is_idempotent(rows in arb_rows_with_duplicates(40)) {
        let once = Deduplicator::default().dedup(rows);
        let twice = Deduplicator::default().dedup(once.clone());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn dedup_by_key_matches_record_dedup(ids in prop::collection::vec(0u8..8, 0..30)) {
        let out = dedup_by_key(ids.clone(), |n| Some(*n));
        let mut expected = Vec::new();
        for id in ids {
            if !expected.contains(&id) {
                expected.push(id);
            }
        }
        prop_assert_eq!(out, expected);
    }
}

#[test]
fn duplicate_scenario_from_fetch() {
    let rows: Vec<Record> = [1, 2, 2, 3]
        .into_iter()
        .map(|id| Record::new().with("id", id))
        .collect();
    let out = Deduplicator::default().dedup(rows);
    let ids: Vec<RowKey> = out.iter().filter_map(|r| r.key("id")).collect();
    assert_eq!(ids, vec![RowKey::Int(1), RowKey::Int(2), RowKey::Int(3)]);
}
