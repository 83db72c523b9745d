//! Watchers against the mock backend.

use fleetsync_cli::config::ResourceConfig;
use fleetsync_cli::watch::{register_all, render_snapshot, Watchers};
use fleetsync_core::{BackendError, ResourceKey, SelectQuery};
use fleetsync_realtime::{RealtimeMode, SyncContext};
use fleetsync_test_utils::fixtures::{fast_config, fleet_backend, location, locations, vehicles_query};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;

fn resources() -> Vec<ResourceConfig> {
    vec![
        ResourceConfig {
            key: ResourceKey::new("vehicles"),
            query: vehicles_query(),
            realtime: RealtimeMode::Enabled,
        },
        ResourceConfig {
            key: ResourceKey::new("locations"),
            query: SelectQuery::new(locations()),
            realtime: RealtimeMode::Disabled,
        },
    ]
}

#[tokio::test]
async fn prints_initial_snapshot_per_resource() {
    let backend = fleet_backend();
    let ctx = SyncContext::with_backend(backend.clone(), fast_config()).unwrap();
    register_all(&ctx, &resources()).unwrap();

    let mut watchers = Watchers::spawn(&ctx, &resources()).unwrap();
    assert_eq!(watchers.len(), 2);

    // The first line per key may still be validating; wait for settled ones.
    let mut settled: BTreeMap<String, Value> = BTreeMap::new();
    while settled.len() < 2 {
        let line = timeout(Duration::from_secs(5), watchers.next_line())
            .await
            .unwrap()
            .unwrap();
        if line["validating"] == false {
            let key = line["key"].as_str().unwrap().to_string();
            settled.insert(key, line);
        }
    }
    let seen: Vec<Value> = settled.into_values().collect();

    assert_eq!(seen[0]["key"], "locations");
    assert_eq!(seen[0]["rows"].as_array().unwrap().len(), 2);
    assert_eq!(seen[0]["realtime"], Value::Null);
    assert_eq!(seen[1]["key"], "vehicles");
    assert_eq!(seen[1]["rows"].as_array().unwrap().len(), 3);
    assert_eq!(seen[1]["rows"][0]["id"], 1);
    assert_eq!(seen[1]["error"], Value::Null);

    watchers.shutdown().await;
    ctx.shutdown().await;
}

#[tokio::test]
async fn unregistered_resource_is_rejected() {
    let backend = fleet_backend();
    let ctx = SyncContext::with_backend(backend, fast_config()).unwrap();
    assert!(Watchers::spawn(&ctx, &resources()).is_err());
}

#[tokio::test]
async fn render_reports_errors_and_rows() {
    let backend = fleet_backend();
    backend.fail_next_select(&locations(), BackendError::connectivity("connection refused"));
    let ctx = SyncContext::with_backend(backend.clone(), fast_config()).unwrap();
    let key = ResourceKey::new("locations");
    ctx.register(key.clone(), SelectQuery::new(locations())).unwrap();

    assert!(ctx.store().refresh(&key).await.is_err());
    let failed = render_snapshot(&ctx.store().snapshot(&key).unwrap(), None);
    assert!(failed["error"].is_string());
    assert_eq!(failed["rows"].as_array().unwrap().len(), 0);

    backend.seed(&locations(), vec![location(1, "Depot")]);
    ctx.store().refresh(&key).await.unwrap();
    let ok = render_snapshot(&ctx.store().snapshot(&key).unwrap(), None);
    assert_eq!(ok["rows"][0]["name"], "Depot");
    assert_eq!(ok["optimistic"], false);
}
