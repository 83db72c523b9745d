//! Integration tests for the resource store against the mock backend.

use fleetsync_cache::{OptimisticUpdate, OptimisticWriter, ResourceStore, WriteOp};
use async_trait::async_trait;
use fleetsync_core::{
    BackendError, CacheError, Fetcher, Record, ResourceKey, RowKey, SelectQuery, SyncError,
    SyncResult,
};
use fleetsync_test_utils::assertions::{assert_connectivity_error, assert_constraint_error, ids};
use fleetsync_test_utils::fixtures::{
    fast_config, fleet_backend, locations, tasks, team_members, vehicle, vehicles, vehicles_query,
};
use fleetsync_test_utils::MockBackend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn vehicles_key() -> ResourceKey {
    ResourceKey::new("vehicles")
}

fn store_over(backend: &MockBackend) -> ResourceStore {
    let store = ResourceStore::new(Arc::new(backend.clone()), fast_config());
    store.register(vehicles_key(), vehicles_query()).unwrap();
    store
}

/// Let spawned timer and refresh tasks run.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// REFRESH AND COALESCING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_share_one_fetch() {
    let backend = fleet_backend().with_select_latency(Duration::from_millis(50));
    let store = store_over(&backend);

    let (key_a, key_b) = (vehicles_key(), vehicles_key());
    let (a, b) = tokio::join!(store.refresh(&key_a), store.refresh(&key_b));

    assert_eq!(a.unwrap().len(), 3);
    assert_eq!(b.unwrap().len(), 3);
    assert_eq!(backend.select_calls(&vehicles()), 1);
    assert_eq!(store.stats().coalesced, 1);
    assert_eq!(store.stats().refreshes, 1);
}

#[tokio::test(start_paused = true)]
async fn refresh_completes_after_caller_gives_up() {
    let backend = fleet_backend().with_select_latency(Duration::from_millis(50));
    let store = store_over(&backend);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), store.refresh(&vehicles_key())).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert_eq!(snapshot.rows().len(), 3);
    assert!(!snapshot.is_validating);
    assert_eq!(backend.select_calls(&vehicles()), 1);
}

#[tokio::test]
async fn refresh_drops_duplicate_rows() {
    let backend = MockBackend::new();
    backend.seed(
        &vehicles(),
        vec![
            vehicle(1, "Van 1", 1),
            vehicle(2, "Van 2", 1),
            vehicle(2, "Van 2 (replica)", 1),
            vehicle(3, "Truck 3", 2),
        ],
    );
    let store = ResourceStore::new(Arc::new(backend.clone()), fast_config());
    store
        .register(vehicles_key(), SelectQuery::new(vehicles()))
        .unwrap();

    let rows = store.refresh(&vehicles_key()).await.unwrap();
    assert_eq!(ids(&rows), vec![RowKey::Int(1), RowKey::Int(2), RowKey::Int(3)]);
    assert_eq!(rows[1].get("name"), Some(&serde_json::json!("Van 2")));
}

#[tokio::test]
async fn get_on_empty_entry_starts_background_refresh() {
    let backend = fleet_backend();
    let store = store_over(&backend);

    let first = store.get(&vehicles_key()).unwrap();
    assert!(!first.has_data());
    assert!(first.is_stale);
    assert!(first.is_validating);

    let rows = store.refresh(&vehicles_key()).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(backend.select_calls(&vehicles()), 1);

    let second = store.get(&vehicles_key()).unwrap();
    assert!(!second.is_stale);
    assert_eq!(second.rows().len(), 3);
    let stats = store.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_rows() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    store.refresh(&vehicles_key()).await.unwrap();

    backend.fail_next_select(&vehicles(), BackendError::connectivity("connection reset"));
    let result = store.refresh(&vehicles_key()).await;
    assert_connectivity_error(&result);

    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert_eq!(snapshot.rows().len(), 3);
    assert!(snapshot.is_stale);
    assert!(snapshot.error.as_ref().is_some_and(SyncError::is_connectivity));
    assert_eq!(store.stats().failures, 1);

    store.refresh(&vehicles_key()).await.unwrap();
    let recovered = store.snapshot(&vehicles_key()).unwrap();
    assert!(recovered.error.is_none());
    assert!(!recovered.is_stale);
}

#[tokio::test]
async fn unknown_key_is_an_error() {
    let store = ResourceStore::new(Arc::new(MockBackend::new()), fast_config());
    let err = store.refresh(&ResourceKey::new("nope")).await.unwrap_err();
    assert!(matches!(err, SyncError::Cache(CacheError::UnknownResource { .. })));
}

/// Panics on the first select, then serves one vehicle.
struct PanicOnceFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for PanicOnceFetcher {
    async fn select(&self, _query: &SelectQuery) -> SyncResult<Vec<Record>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("fetcher crashed");
        }
        Ok(vec![vehicle(1, "Van 1", 1)])
    }
}

#[tokio::test]
async fn panicked_refresh_releases_in_flight_slot() {
    let fetcher = Arc::new(PanicOnceFetcher {
        calls: AtomicUsize::new(0),
    });
    let store = ResourceStore::new(fetcher.clone(), fast_config());
    store.register(vehicles_key(), vehicles_query()).unwrap();

    let err = store.refresh(&vehicles_key()).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Cache(CacheError::RefreshAborted { .. })
    ));
    settle().await;
    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert!(!snapshot.is_validating);
    assert!(snapshot.error.is_some());

    let rows = store.refresh(&vehicles_key()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert!(!snapshot.is_validating);
    assert!(snapshot.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn refresh_spanning_reregister_does_not_install_old_query_rows() {
    let backend = fleet_backend().with_select_latency(Duration::from_millis(50));
    let store = ResourceStore::new(Arc::new(backend.clone()), fast_config());
    let key = ResourceKey::new("fleet");
    store.register(key.clone(), vehicles_query()).unwrap();

    let pending = tokio::spawn({
        let store = store.clone();
        let key = key.clone();
        async move { store.refresh(&key).await }
    });
    settle().await;
    assert!(store.unregister(&key));
    store
        .register(key.clone(), SelectQuery::new(locations()))
        .unwrap();

    tokio::time::advance(Duration::from_millis(60)).await;
    settle().await;
    let old_rows = pending.await.unwrap().unwrap();
    assert_eq!(old_rows.len(), 3);
    let snapshot = store.snapshot(&key).unwrap();
    assert!(!snapshot.has_data());
    assert!(!snapshot.is_validating);

    let rows = store.refresh(&key).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(backend.select_calls(&locations()), 1);
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[test]
fn register_is_idempotent_for_the_same_query() {
    let store = store_over(&MockBackend::new());
    assert!(store.register(vehicles_key(), vehicles_query()).is_ok());

    let err = store
        .register(vehicles_key(), SelectQuery::new(vehicles()))
        .unwrap_err();
    assert!(matches!(err, SyncError::Cache(CacheError::DuplicateResource { .. })));
}

#[test]
fn affected_keys_follow_dependency_edges() {
    let store = ResourceStore::new(Arc::new(MockBackend::new()), fast_config());
    store
        .register(ResourceKey::new("tasks"), SelectQuery::new(tasks()))
        .unwrap();
    store
        .register(ResourceKey::new("tasks:open"), SelectQuery::new(tasks()))
        .unwrap();
    store
        .register(ResourceKey::new("team_members"), SelectQuery::new(team_members()))
        .unwrap();

    // "vehicles" is a configured dependent of tasks but not registered here.
    assert_eq!(
        store.affected_keys(&tasks()),
        vec![
            ResourceKey::new("tasks"),
            ResourceKey::new("tasks:open"),
            ResourceKey::new("team_members"),
        ]
    );
    assert_eq!(
        store.keys_for_table(&team_members()),
        vec![ResourceKey::new("team_members")]
    );
    assert!(store.affected_keys(&vehicles()).is_empty());
}

// ============================================================================
// OBSERVERS
// ============================================================================

#[tokio::test]
async fn watchers_see_refreshed_rows() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    let mut rx = store.watch(&vehicles_key()).unwrap();

    store.refresh(&vehicles_key()).await.unwrap();
    rx.changed().await.unwrap();
    let latest = rx.borrow_and_update().clone();
    assert_eq!(latest.rows().len(), 3);
    assert!(!latest.is_validating);
}

// ============================================================================
// OPTIMISTIC UPDATES
// ============================================================================

#[tokio::test]
async fn optimistic_update_is_visible_before_round_trip() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    store.refresh(&vehicles_key()).await.unwrap();

    store
        .optimistic_update(&vehicles_key(), OptimisticUpdate::Upsert(vehicle(4, "Van 4", 2)))
        .unwrap();

    let snapshot = store.get(&vehicles_key()).unwrap();
    assert!(snapshot.is_optimistic());
    assert_eq!(
        ids(snapshot.rows()),
        vec![RowKey::Int(1), RowKey::Int(2), RowKey::Int(3), RowKey::Int(4)]
    );
    assert_eq!(backend.select_calls(&vehicles()), 1);

    store.refresh(&vehicles_key()).await.unwrap();
    let confirmed = store.snapshot(&vehicles_key()).unwrap();
    assert!(!confirmed.is_optimistic());
    assert_eq!(confirmed.rows().len(), 3);
}

#[tokio::test]
async fn rollback_refuses_after_newer_mutation() {
    let store = store_over(&fleet_backend());
    store.refresh(&vehicles_key()).await.unwrap();

    let first = store
        .optimistic_update(&vehicles_key(), OptimisticUpdate::Remove(RowKey::Int(1)))
        .unwrap();
    store
        .optimistic_update(&vehicles_key(), OptimisticUpdate::Remove(RowKey::Int(2)))
        .unwrap();

    assert!(!store.rollback(first).unwrap());
    assert_eq!(ids(store.snapshot(&vehicles_key()).unwrap().rows()), vec![RowKey::Int(3)]);
}

#[tokio::test(start_paused = true)]
async fn refresh_started_before_local_mutation_is_discarded() {
    let backend = fleet_backend().with_select_latency(Duration::from_millis(50));
    let store = store_over(&backend);

    let pending = {
        let store = store.clone();
        tokio::spawn(async move { store.refresh(&vehicles_key()).await })
    };
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 1);

    store
        .optimistic_update(&vehicles_key(), OptimisticUpdate::Append(vehicle(9, "Van 9", 1)))
        .unwrap();

    let fetched = pending.await.unwrap().unwrap();
    assert_eq!(fetched.len(), 3);

    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert!(snapshot.is_optimistic());
    assert_eq!(ids(snapshot.rows()), vec![RowKey::Int(9)]);
}

#[tokio::test]
async fn rejected_write_restores_cached_rows() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    store.refresh(&vehicles_key()).await.unwrap();
    let writer = OptimisticWriter::new(store.clone(), Arc::new(backend.clone()));

    let row = Record::new()
        .with("name", "Ghost van")
        .with("status", "available")
        .with("location_id", 99);
    let result = writer.write(&vehicles_key(), WriteOp::Insert(row)).await;

    assert_constraint_error(&result);
    let message = result.unwrap_err().user_message();
    assert_eq!(message, "Location does not exist: create it first.");

    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert!(!snapshot.is_optimistic());
    assert_eq!(
        ids(snapshot.rows()),
        vec![RowKey::Int(1), RowKey::Int(2), RowKey::Int(3)]
    );
    assert_eq!(backend.rows(&vehicles()).len(), 3);
}

#[tokio::test]
async fn accepted_write_reconciles_from_backend() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    store.refresh(&vehicles_key()).await.unwrap();
    let writer = OptimisticWriter::new(store.clone(), Arc::new(backend.clone()));

    let stored = writer
        .write(
            &vehicles_key(),
            WriteOp::Update {
                id: RowKey::Int(2),
                patch: Record::new().with("status", "maintenance"),
            },
        )
        .await
        .unwrap();
    assert_eq!(stored.get("status"), Some(&serde_json::json!("maintenance")));

    let snapshot = store.snapshot(&vehicles_key()).unwrap();
    assert!(!snapshot.is_optimistic());
    assert_eq!(snapshot.rows()[1].get("status"), Some(&serde_json::json!("maintenance")));
    assert_eq!(backend.select_calls(&vehicles()), 2);
}

// ============================================================================
// SCHEDULED REFRESH
// ============================================================================

#[tokio::test(start_paused = true)]
async fn burst_of_schedules_refreshes_once_after_quiet_period() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    let debounce = store.config().debounce();

    store.schedule_refresh(&vehicles_key(), debounce).unwrap();
    tokio::time::advance(Duration::from_millis(30)).await;
    store.schedule_refresh(&vehicles_key(), debounce).unwrap();
    tokio::time::advance(Duration::from_millis(50)).await;
    store.schedule_refresh(&vehicles_key(), debounce).unwrap();

    // t = 229ms
    tokio::time::advance(Duration::from_millis(149)).await;
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 0);
    assert!(store.has_scheduled(&vehicles_key()));

    // t = 231ms
    tokio::time::advance(Duration::from_millis(2)).await;
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 1);
    assert!(!store.has_scheduled(&vehicles_key()));
}

#[tokio::test(start_paused = true)]
async fn spaced_schedules_refresh_each_time() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    let debounce = store.config().debounce();

    for expected in 1..=3 {
        store.schedule_refresh(&vehicles_key(), debounce).unwrap();
        tokio::time::advance(debounce + Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(backend.select_calls(&vehicles()), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn unregister_cancels_scheduled_refresh() {
    let backend = fleet_backend();
    let store = store_over(&backend);

    store
        .schedule_refresh(&vehicles_key(), Duration::from_millis(150))
        .unwrap();
    assert!(store.unregister(&vehicles_key()));

    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_scheduled_refresh() {
    let backend = fleet_backend();
    let store = store_over(&backend);

    store
        .schedule_refresh(&vehicles_key(), Duration::from_millis(150))
        .unwrap();
    assert!(store.cancel_scheduled(&vehicles_key()));
    assert!(!store.cancel_scheduled(&vehicles_key()));

    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 0);
}

#[tokio::test(start_paused = true)]
async fn timer_armed_by_two_tables_survives_one_release() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    let delay = Duration::from_millis(150);

    store
        .schedule_refresh_for(&vehicles_key(), delay, &vehicles())
        .unwrap();
    store
        .schedule_refresh_for(&vehicles_key(), delay, &tasks())
        .unwrap();

    assert_eq!(store.cancel_scheduled_for(&vehicles()), 0);
    assert!(store.has_scheduled(&vehicles_key()));
    assert_eq!(store.cancel_scheduled_for(&tasks()), 1);
    assert!(!store.has_scheduled(&vehicles_key()));

    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 0);
}

#[tokio::test(start_paused = true)]
async fn table_release_leaves_directly_scheduled_refresh() {
    let backend = fleet_backend();
    let store = store_over(&backend);
    let delay = Duration::from_millis(150);

    store
        .schedule_refresh_for(&vehicles_key(), delay, &tasks())
        .unwrap();
    store.schedule_refresh(&vehicles_key(), delay).unwrap();
    assert_eq!(store.cancel_scheduled_for(&tasks()), 0);
    assert_eq!(store.cancel_scheduled_for(&team_members()), 0);
    assert!(store.has_scheduled(&vehicles_key()));

    tokio::time::advance(Duration::from_millis(160)).await;
    settle().await;
    assert_eq!(backend.select_calls(&vehicles()), 1);
}
