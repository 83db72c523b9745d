//! Point-in-time view of a cached resource.
//!
//! Snapshots carry staleness metadata next to the rows so a consumer always
//! knows whether it is looking at confirmed, stale, or optimistic data.

use chrono::Utc;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use fleetsync_core::{decode_all, Record, ResourceKey, SyncError, SyncResult, Timestamp};

/// Cached state of one resource key.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub key: ResourceKey,
    /// Last known rows; `None` until the first successful fetch or local
    /// mutation.
    pub data: Option<Arc<Vec<Record>>>,
    /// When `data` was last confirmed by the backend.
    pub updated_at: Option<Timestamp>,
    /// Error of the most recent refresh, cleared by the next success.
    pub error: Option<SyncError>,
    pub is_stale: bool,
    /// A refresh is in flight.
    pub is_validating: bool,
    /// Set while `data` contains local changes the backend has not confirmed.
    pub optimistic_since: Option<Timestamp>,
}

impl ResourceSnapshot {
    /// Snapshot of a key that has never been fetched.
    pub fn empty(key: ResourceKey) -> Self {
        Self {
            key,
            data: None,
            updated_at: None,
            error: None,
            is_stale: true,
            is_validating: false,
            optimistic_since: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Rows, empty when nothing is cached yet.
    pub fn rows(&self) -> &[Record] {
        self.data.as_deref().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_optimistic(&self) -> bool {
        self.optimistic_since.is_some()
    }

    /// Time since the backend last confirmed the data.
    pub fn age(&self) -> Option<Duration> {
        self.updated_at
            .map(|at| Utc::now().signed_duration_since(at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Decode the rows into typed values.
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<Vec<T>> {
        decode_all(self.rows())
    }

    /// Whether two snapshots differ in anything a consumer renders.
    ///
    /// Timestamps and the time-dependent stale flag are ignored so that a
    /// refresh returning identical rows does not wake observers.
    pub fn differs_from(&self, other: &ResourceSnapshot) -> bool {
        self.data != other.data
            || self.error != other.error
            || self.is_validating != other.is_validating
            || self.optimistic_since.is_some() != other.optimistic_since.is_some()
    }
}
