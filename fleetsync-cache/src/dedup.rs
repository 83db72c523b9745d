//! Client-side deduplication of fetched rows by primary key.
//!
//! The backend normally returns distinct identifiers, but retries and
//! replication lag can repeat rows. Deduplication keeps the first occurrence
//! of each identifier and never reorders what survives.

use std::collections::HashSet;
use std::hash::Hash;

use fleetsync_core::{Record, TableRow, DEFAULT_ID_FIELD};

/// What the caller knows about identifier uniqueness of its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupHint {
    /// Scan the input.
    #[default]
    Unknown,
    /// Input is already distinct; return it untouched.
    KnownDistinct,
}

/// Deduplicates records on one identifier field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplicator {
    id_field: String,
    hint: DedupHint,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FIELD)
    }
}

impl Deduplicator {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            hint: DedupHint::Unknown,
        }
    }

    /// Skip the scan entirely.
    pub fn assume_distinct(mut self) -> Self {
        self.hint = DedupHint::KnownDistinct;
        self
    }

    pub fn with_hint(mut self, hint: DedupHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn hint(&self) -> DedupHint {
        self.hint
    }

    /// One record per identifier, first occurrence wins.
    ///
    /// Records without a usable identifier cannot collide and stay in place.
    pub fn dedup(&self, rows: Vec<Record>) -> Vec<Record> {
        match self.hint {
            DedupHint::KnownDistinct => rows,
            DedupHint::Unknown => dedup_by_key(rows, |row| row.key(&self.id_field)),
        }
    }
}

/// Keep the first row for every key produced by `key`.
///
/// Rows for which `key` returns `None` are always kept. When no duplicate is
/// found the input vector is returned as is.
pub fn dedup_by_key<T, K, F>(rows: Vec<T>, mut key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: FnMut(&T) -> Option<K>,
{
    let mut seen = HashSet::with_capacity(rows.len());
    let first_duplicate = rows.iter().position(|row| match key(row) {
        Some(k) => !seen.insert(k),
        None => false,
    });

    let Some(first_duplicate) = first_duplicate else {
        return rows;
    };

    let mut kept = Vec::with_capacity(rows.len() - 1);
    let mut rest = rows.into_iter();
    kept.extend(rest.by_ref().take(first_duplicate));
    rest.next();
    for row in rest {
        let first_seen = match key(&row) {
            Some(k) => seen.insert(k),
            None => true,
        };
        if first_seen {
            kept.push(row);
        }
    }
    kept
}

/// Deduplicate typed rows on their primary key.
pub fn dedup_rows<T: TableRow>(rows: Vec<T>) -> Vec<T> {
    dedup_by_key(rows, |row| Some(row.row_key()))
}
