//! Cache/revalidation store.
//!
//! Every registered resource key owns one [`CacheEntry`]. Reads return the
//! cached value immediately and start a background refresh when it is stale.
//! Refreshes run Fetcher -> Deduplicator -> entry update -> notify.
//!
//! # Invariants
//!
//! - At most one refresh per key is in flight. A refresh requested while one
//!   is outstanding joins it, unless the entry was mutated locally after the
//!   outstanding one started. In that case the request waits for it and then
//!   starts a new one, so results for a key are never observed out of order.
//! - A failed refresh never clears cached rows (stale-while-error).
//! - A refresh that started before a local mutation does not overwrite the
//!   mutated rows.
//! - A refresh only installs into the entry it was started for; a key that
//!   was unregistered and registered again never sees the old result.
//! - A debounce timer armed on behalf of tables stays armed until every one
//!   of those tables released it.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use fleetsync_core::{
    CacheError, Fetcher, Record, ResourceKey, SelectQuery, SyncConfig, SyncError, SyncResult,
    TableName, Timestamp,
};

use crate::dedup::Deduplicator;
use crate::optimistic::OptimisticUpdate;
use crate::snapshot::ResourceSnapshot;
use crate::stats::{CacheStats, StatsCounters};

/// Rows shared between the cache and its readers.
pub type Rows = Arc<Vec<Record>>;

type SharedRefresh = Shared<BoxFuture<'static, SyncResult<Rows>>>;

struct InFlight {
    id: u64,
    /// Entry generation when the refresh started.
    generation: u64,
    future: SharedRefresh,
}

struct ScheduledRefresh {
    id: u64,
    handle: AbortHandle,
    /// Tables whose change channels armed the timer.
    armed_by: BTreeSet<TableName>,
    /// Armed directly, not on behalf of a table.
    unowned: bool,
}

impl ScheduledRefresh {
    fn is_orphaned(&self) -> bool {
        self.armed_by.is_empty() && !self.unowned
    }
}

/// Cached state and bookkeeping for one resource key.
struct CacheEntry {
    query: SelectQuery,
    dedup: Deduplicator,
    value: Option<Rows>,
    updated_at: Option<Timestamp>,
    last_error: Option<SyncError>,
    optimistic_since: Option<Timestamp>,
    /// Bumped by every local mutation.
    generation: u64,
    in_flight: Option<InFlight>,
    scheduled: Option<ScheduledRefresh>,
    notifier: watch::Sender<ResourceSnapshot>,
}

/// State captured before an optimistic update, for rollback.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    key: ResourceKey,
    value: Option<Rows>,
    optimistic_since: Option<Timestamp>,
    /// Generation right after the optimistic update was applied.
    applied_generation: u64,
}

impl Checkpoint {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Rows as they were before the optimistic update.
    pub fn previous(&self) -> Option<&Rows> {
        self.value.as_ref()
    }
}

struct StoreInner {
    fetcher: Arc<dyn Fetcher>,
    config: SyncConfig,
    entries: DashMap<ResourceKey, CacheEntry>,
    stats: StatsCounters,
    timer_ids: AtomicU64,
    flight_ids: AtomicU64,
}

/// Keyed cache of backend reads with revalidation and coalescing.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<StoreInner>,
}

enum RefreshStep {
    Join(SharedRefresh),
    Wait(SharedRefresh),
}

impl ResourceStore {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                fetcher,
                config,
                entries: DashMap::new(),
                stats: StatsCounters::default(),
                timer_ids: AtomicU64::new(0),
                flight_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Register a resource key backed by `query`.
    ///
    /// Registering the same key with the same query again is a no-op.
    pub fn register(&self, key: ResourceKey, query: SelectQuery) -> SyncResult<()> {
        let dedup = Deduplicator::new(query.id_field.clone());
        self.register_with(key, query, dedup)
    }

    /// Register with an explicit deduplication policy.
    pub fn register_with(
        &self,
        key: ResourceKey,
        query: SelectQuery,
        dedup: Deduplicator,
    ) -> SyncResult<()> {
        match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(existing) => {
                if existing.get().query == query {
                    Ok(())
                } else {
                    Err(CacheError::DuplicateResource {
                        key: key.to_string(),
                    }
                    .into())
                }
            }
            Entry::Vacant(slot) => {
                debug!(key = %key, table = %query.table, "Registered resource");
                let (notifier, _rx) = watch::channel(ResourceSnapshot::empty(key));
                slot.insert(CacheEntry {
                    query,
                    dedup,
                    value: None,
                    updated_at: None,
                    last_error: None,
                    optimistic_since: None,
                    generation: 0,
                    in_flight: None,
                    scheduled: None,
                    notifier,
                });
                Ok(())
            }
        }
    }

    /// Drop a key and cancel its scheduled refresh.
    ///
    /// A refresh already in flight completes and its result is discarded.
    pub fn unregister(&self, key: &ResourceKey) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, entry)) => {
                if let Some(timer) = entry.scheduled {
                    timer.handle.abort();
                }
                debug!(key = %key, "Unregistered resource");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, key: &ResourceKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn query(&self, key: &ResourceKey) -> SyncResult<SelectQuery> {
        Ok(self.entry(key)?.query.clone())
    }

    /// Registered keys that read from `table`.
    pub fn keys_for_table(&self, table: &TableName) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| &entry.value().query.table == table)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Keys to refresh after `table` changed: readers of the table plus the
    /// configured dependents that are registered.
    pub fn affected_keys(&self, table: &TableName) -> Vec<ResourceKey> {
        let mut keys = self.keys_for_table(table);
        for dependent in self.inner.config.dependencies.dependents(table) {
            if !keys.contains(dependent) && self.is_registered(dependent) {
                keys.push(dependent.clone());
            }
        }
        keys
    }

    /// Current state of `key` without side effects.
    pub fn snapshot(&self, key: &ResourceKey) -> SyncResult<ResourceSnapshot> {
        let entry = self.entry(key)?;
        Ok(self.build_snapshot(key, &entry))
    }

    /// Current state of `key`; starts a background refresh when stale.
    ///
    /// Must be called within a tokio runtime.
    pub fn get(&self, key: &ResourceKey) -> SyncResult<ResourceSnapshot> {
        let mut entry = self.entry_mut(key)?;
        let snapshot = self.build_snapshot(key, &entry);
        if snapshot.is_stale {
            StatsCounters::bump(&self.inner.stats.misses);
            if entry.in_flight.is_none() {
                let _ = self.start_refresh(key, &mut entry);
                return Ok(self.build_snapshot(key, &entry));
            }
        } else {
            StatsCounters::bump(&self.inner.stats.hits);
        }
        Ok(snapshot)
    }

    /// Observe every change to `key`.
    ///
    /// Receivers are woken only when rows, error, validating, or optimistic
    /// state change.
    pub fn watch(&self, key: &ResourceKey) -> SyncResult<watch::Receiver<ResourceSnapshot>> {
        Ok(self.entry(key)?.notifier.subscribe())
    }

    /// Fetch `key` from the backend and update the cache.
    ///
    /// Concurrent calls share one fetch. The fetch keeps running even if every
    /// caller stops waiting. On failure the cached rows are kept and the
    /// error is both recorded on the entry and returned.
    pub async fn refresh(&self, key: &ResourceKey) -> SyncResult<Rows> {
        loop {
            let step = {
                let mut entry = self.entry_mut(key)?;
                let outstanding = entry
                    .in_flight
                    .as_ref()
                    .map(|flight| (flight.generation, flight.future.clone()));
                match outstanding {
                    Some((generation, future)) if generation == entry.generation => {
                        StatsCounters::bump(&self.inner.stats.coalesced);
                        RefreshStep::Join(future)
                    }
                    Some((_, future)) => RefreshStep::Wait(future),
                    None => RefreshStep::Join(self.start_refresh(key, &mut entry)),
                }
            };
            match step {
                RefreshStep::Join(future) => return future.await,
                RefreshStep::Wait(future) => {
                    let _ = future.await;
                }
            }
        }
    }

    /// Refresh every key affected by a change on `table`.
    pub async fn refresh_table(&self, table: &TableName) -> Vec<(ResourceKey, SyncResult<Rows>)> {
        let keys = self.affected_keys(table);
        let results =
            futures_util::future::join_all(keys.iter().map(|key| self.refresh(key))).await;
        keys.into_iter().zip(results).collect()
    }

    /// Apply `update` to the cached rows immediately, without a backend
    /// round trip. The entry is marked optimistic until the next refresh
    /// lands.
    pub fn mutate_local<F>(&self, key: &ResourceKey, update: F) -> SyncResult<Checkpoint>
    where
        F: FnOnce(&mut Vec<Record>) -> SyncResult<()>,
    {
        let mut entry = self.entry_mut(key)?;
        let mut rows = entry
            .value
            .as_deref()
            .cloned()
            .unwrap_or_default();
        update(&mut rows)?;

        let previous = entry.value.replace(Arc::new(rows));
        let previous_optimistic = entry.optimistic_since;
        entry.optimistic_since = Some(Utc::now());
        entry.generation += 1;
        StatsCounters::bump(&self.inner.stats.optimistic_updates);
        self.publish(key, &entry);

        Ok(Checkpoint {
            key: key.clone(),
            value: previous,
            optimistic_since: previous_optimistic,
            applied_generation: entry.generation,
        })
    }

    /// Apply an optimistic row change.
    pub fn optimistic_update(
        &self,
        key: &ResourceKey,
        update: OptimisticUpdate,
    ) -> SyncResult<Checkpoint> {
        let id_field = self.entry(key)?.query.id_field.clone();
        self.mutate_local(key, |rows| update.apply(rows, &id_field))
    }

    /// Undo an optimistic update.
    ///
    /// Returns `false` without touching the entry if anything changed it
    /// since the update was applied; the caller should refresh instead.
    pub fn rollback(&self, checkpoint: Checkpoint) -> SyncResult<bool> {
        let mut entry = self.entry_mut(&checkpoint.key)?;
        if entry.generation != checkpoint.applied_generation {
            return Ok(false);
        }
        entry.value = checkpoint.value;
        entry.optimistic_since = checkpoint.optimistic_since;
        entry.generation += 1;
        self.publish(&checkpoint.key, &entry);
        Ok(true)
    }

    /// Refresh `key` once `delay` has passed without another call for the
    /// same key. Each call re-arms the timer.
    ///
    /// Must be called within a tokio runtime.
    pub fn schedule_refresh(&self, key: &ResourceKey, delay: Duration) -> SyncResult<()> {
        self.arm_timer(key, delay, None)
    }

    /// Like [`schedule_refresh`](Self::schedule_refresh), on behalf of a
    /// change on `table`. The timer survives until `table` and every other
    /// table that re-armed it release it through
    /// [`cancel_scheduled_for`](Self::cancel_scheduled_for).
    pub fn schedule_refresh_for(
        &self,
        key: &ResourceKey,
        delay: Duration,
        table: &TableName,
    ) -> SyncResult<()> {
        self.arm_timer(key, delay, Some(table))
    }

    /// Cancel the pending scheduled refresh of `key`, if any, whoever armed
    /// it.
    pub fn cancel_scheduled(&self, key: &ResourceKey) -> bool {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            return false;
        };
        match entry.scheduled.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Withdraw `table` from every pending timer. Timers no other table or
    /// direct caller armed are cancelled; returns how many.
    pub fn cancel_scheduled_for(&self, table: &TableName) -> usize {
        let mut cancelled = 0;
        for mut entry in self.inner.entries.iter_mut() {
            let orphaned = match entry.scheduled.as_mut() {
                Some(timer) => timer.armed_by.remove(table) && timer.is_orphaned(),
                None => false,
            };
            if orphaned {
                if let Some(timer) = entry.scheduled.take() {
                    timer.handle.abort();
                    cancelled += 1;
                }
            }
        }
        if cancelled > 0 {
            debug!(table = %table, cancelled, "Cancelled debounce timers");
        }
        cancelled
    }

    pub fn has_scheduled(&self, key: &ResourceKey) -> bool {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.scheduled.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(self.inner.entries.len())
    }

    fn arm_timer(
        &self,
        key: &ResourceKey,
        delay: Duration,
        table: Option<&TableName>,
    ) -> SyncResult<()> {
        let mut entry = self.entry_mut(key)?;
        let (mut armed_by, mut unowned) = match entry.scheduled.take() {
            Some(previous) => {
                previous.handle.abort();
                (previous.armed_by, previous.unowned)
            }
            None => (BTreeSet::new(), false),
        };
        match table {
            Some(table) => {
                armed_by.insert(table.clone());
            }
            None => unowned = true,
        }

        let id = self.inner.timer_ids.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let store = self.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            store.fire_scheduled(&timer_key, id).await;
        });
        entry.scheduled = Some(ScheduledRefresh {
            id,
            handle: handle.abort_handle(),
            armed_by,
            unowned,
        });
        Ok(())
    }

    async fn fire_scheduled(&self, key: &ResourceKey, id: u64) {
        {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return;
            };
            if entry.scheduled.as_ref().map(|timer| timer.id) != Some(id) {
                return;
            }
            entry.scheduled = None;
        }
        debug!(key = %key, "Debounced refresh firing");
        if let Err(err) = self.refresh(key).await {
            warn!(key = %key, error = %err, "Debounced refresh failed");
        }
    }

    fn start_refresh(&self, key: &ResourceKey, entry: &mut CacheEntry) -> SharedRefresh {
        let id = self.inner.flight_ids.fetch_add(1, Ordering::Relaxed);
        let generation = entry.generation;
        let store = self.clone();
        let task_key = key.clone();
        let query = entry.query.clone();
        let dedup = entry.dedup.clone();
        let handle = tokio::spawn(async move {
            let mut guard = FlightGuard {
                store: store.clone(),
                key: task_key.clone(),
                id,
                done: false,
            };
            let result = store.run_refresh(task_key, query, dedup, id, generation).await;
            guard.done = true;
            result
        });

        let abort_key = key.clone();
        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::RefreshAborted {
                    key: abort_key.to_string(),
                    reason: err.to_string(),
                }
                .into()),
            }
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            id,
            generation,
            future: future.clone(),
        });
        self.publish(key, entry);
        future
    }

    async fn run_refresh(
        self,
        key: ResourceKey,
        query: SelectQuery,
        dedup: Deduplicator,
        id: u64,
        generation: u64,
    ) -> SyncResult<Rows> {
        StatsCounters::bump(&self.inner.stats.refreshes);
        debug!(key = %key, table = %query.table, "Refreshing resource");
        let fetched = self.inner.fetcher.select(&query).await;

        let result = fetched.map(|rows| {
            let fetched_len = rows.len();
            let rows = dedup.dedup(rows);
            if rows.len() != fetched_len {
                debug!(
                    key = %key,
                    removed = fetched_len - rows.len(),
                    "Dropped duplicate rows"
                );
            }
            Arc::new(rows)
        });

        let Some(mut entry) = self.inner.entries.get_mut(&key) else {
            debug!(key = %key, "Resource unregistered during refresh, discarding result");
            return result;
        };
        if entry.in_flight.as_ref().map(|flight| flight.id) != Some(id) {
            debug!(key = %key, "Resource re-registered during refresh, discarding result");
            return result;
        }
        entry.in_flight = None;

        match &result {
            Ok(rows) if entry.generation == generation => {
                entry.value = Some(rows.clone());
                entry.updated_at = Some(Utc::now());
                entry.last_error = None;
                entry.optimistic_since = None;
            }
            Ok(_) => {
                debug!(key = %key, "Local mutation during refresh, keeping local rows");
                entry.last_error = None;
            }
            Err(err) => {
                StatsCounters::bump(&self.inner.stats.failures);
                warn!(key = %key, error = %err, "Refresh failed, serving cached rows");
                entry.last_error = Some(err.clone());
            }
        }
        self.publish(&key, &entry);
        result
    }

    /// Clear a flight whose task ended without finishing `run_refresh`.
    fn abandon_flight(&self, key: &ResourceKey, id: u64) {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            return;
        };
        if entry.in_flight.as_ref().map(|flight| flight.id) != Some(id) {
            return;
        }
        entry.in_flight = None;
        StatsCounters::bump(&self.inner.stats.failures);
        warn!(key = %key, "Refresh task ended abnormally, serving cached rows");
        entry.last_error = Some(
            CacheError::RefreshAborted {
                key: key.to_string(),
                reason: "refresh task panicked or was cancelled".to_string(),
            }
            .into(),
        );
        self.publish(key, &entry);
    }

    fn publish(&self, key: &ResourceKey, entry: &CacheEntry) {
        let next = self.build_snapshot(key, entry);
        entry.notifier.send_if_modified(|current| {
            let changed = current.differs_from(&next);
            *current = next;
            changed
        });
    }

    fn build_snapshot(&self, key: &ResourceKey, entry: &CacheEntry) -> ResourceSnapshot {
        ResourceSnapshot {
            key: key.clone(),
            data: entry.value.clone(),
            updated_at: entry.updated_at,
            error: entry.last_error.clone(),
            is_stale: self.is_stale(entry),
            is_validating: entry.in_flight.is_some(),
            optimistic_since: entry.optimistic_since,
        }
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        if entry.value.is_none() || entry.last_error.is_some() {
            return true;
        }
        let now = Utc::now();
        let older_than = |at: Timestamp, limit: Duration| {
            now.signed_duration_since(at)
                .to_std()
                .map(|age| age > limit)
                .unwrap_or(false)
        };
        if let Some(since) = entry.optimistic_since {
            return older_than(since, self.inner.config.optimistic_ttl());
        }
        match entry.updated_at {
            Some(at) => older_than(at, self.inner.config.revalidate_interval()),
            None => true,
        }
    }

    fn entry(
        &self,
        key: &ResourceKey,
    ) -> SyncResult<Ref<'_, ResourceKey, CacheEntry>> {
        self.inner.entries.get(key).ok_or_else(|| unknown(key))
    }

    fn entry_mut(&self, key: &ResourceKey) -> SyncResult<RefMut<'_, ResourceKey, CacheEntry>> {
        self.inner.entries.get_mut(key).ok_or_else(|| unknown(key))
    }
}

/// Releases the entry's in-flight slot if the refresh task unwinds or is
/// aborted before completing.
struct FlightGuard {
    store: ResourceStore,
    key: ResourceKey,
    id: u64,
    done: bool,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            self.store.abandon_flight(&self.key, self.id);
        }
    }
}

fn unknown(key: &ResourceKey) -> SyncError {
    CacheError::UnknownResource {
        key: key.to_string(),
    }
    .into()
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore")
            .field("entries", &self.inner.entries.len())
            .field("config", &self.inner.config)
            .finish()
    }
}
