//! FLEETSYNC Test Utilities
//!
//! Centralized test infrastructure for the FLEETSYNC workspace:
//! - An in-memory mock backend implementing every backend seam
//! - Proptest generators for rows, events, and configuration
//! - Fixtures for the fleet dashboard tables
//! - Assertions for FLEETSYNC error categories

pub mod mock;

pub use mock::{ForeignKey, MockBackend};

// Re-export core types for convenience
pub use fleetsync_core::{
    BackendError, ChangeEvent, ChangeKind, DependencyMap, FeedMessage, Record, ResourceKey,
    RowKey, SelectQuery, SyncConfig, SyncError, SyncResult, TableName,
};

/// Table name from a literal known to be valid.
#[track_caller]
pub fn table(name: &str) -> TableName {
    TableName::new(name).expect("test table name must be valid")
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for FLEETSYNC types.

    use super::*;
    use fleetsync_core::{ReconnectConfig, Timestamp, VehicleStatus};
    use proptest::prelude::*;
    use std::time::Duration;
    use uuid::Uuid;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    /// Generate a valid table name.
    pub fn arb_table_name() -> impl Strategy<Value = TableName> {
        "[a-z_][a-z0-9_]{0,20}".prop_map(|name| table(&name))
    }

    /// Identifiers from a small range so that lists contain duplicates.
    pub fn arb_row_id() -> impl Strategy<Value = i64> {
        0i64..12
    }

    pub fn arb_vehicle_status() -> impl Strategy<Value = VehicleStatus> {
        prop_oneof![
            Just(VehicleStatus::Available),
            Just(VehicleStatus::InUse),
            Just(VehicleStatus::Maintenance),
            Just(VehicleStatus::Retired),
        ]
    }

    /// A row carrying `id` and a random payload.
    pub fn arb_record(id: i64) -> impl Strategy<Value = Record> {
        ("[a-z ]{1,12}", any::<bool>())
            .prop_map(move |(name, active)| {
                Record::new()
                    .with("id", id)
                    .with("name", name)
                    .with("active", active)
            })
    }

    /// Rows with possibly repeated identifiers. Every row carries a unique
    /// `seq` so tests can tell equal identifiers apart.
    pub fn arb_rows_with_duplicates(max_len: usize) -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec((arb_row_id(), "[a-z]{1,8}"), 0..max_len).prop_map(|items| {
            items
                .into_iter()
                .enumerate()
                .map(|(seq, (id, label))| {
                    Record::new()
                        .with("id", id)
                        .with("seq", seq as i64)
                        .with("label", label)
                })
                .collect()
        })
    }

    /// Rows where some identifiers are missing entirely.
    pub fn arb_rows_with_gaps(max_len: usize) -> impl Strategy<Value = Vec<Record>> {
        prop::collection::vec(prop::option::weighted(0.8, arb_row_id()), 0..max_len).prop_map(
            |ids| {
                ids.into_iter()
                    .enumerate()
                    .map(|(seq, id)| {
                        let row = Record::new().with("seq", seq as i64);
                        match id {
                            Some(id) => row.with("id", id),
                            None => row,
                        }
                    })
                    .collect()
            },
        )
    }

    pub fn arb_change_kind() -> impl Strategy<Value = ChangeKind> {
        prop_oneof![
            Just(ChangeKind::Insert),
            Just(ChangeKind::Update),
            Just(ChangeKind::Delete),
        ]
    }

    /// A change event on `table` for a row with a random id.
    pub fn arb_change_event(table: TableName) -> impl Strategy<Value = ChangeEvent> {
        (arb_change_kind(), arb_row_id()).prop_map(move |(kind, id)| {
            let row = Record::new().with("id", id);
            match kind {
                ChangeKind::Insert => ChangeEvent::insert(table.clone(), row),
                ChangeKind::Update => ChangeEvent::update(table.clone(), None, row),
                ChangeKind::Delete => ChangeEvent::delete(table.clone(), row),
            }
        })
    }

    pub fn arb_reconnect_config() -> impl Strategy<Value = ReconnectConfig> {
        (1u64..1_000, 1u64..20, 1.0f64..3.0, 0u64..200).prop_map(
            |(initial_ms, factor, multiplier, jitter_ms)| ReconnectConfig {
                initial_ms,
                max_ms: initial_ms * factor,
                multiplier,
                jitter_ms,
            },
        )
    }

    /// Generate a SyncConfig that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = SyncConfig> {
        (
            1u64..2_000,
            1_000u64..120_000,
            100u64..60_000,
            1u32..10,
            arb_reconnect_config(),
        )
            .prop_map(|(debounce, revalidate, ttl, degraded, reconnect)| {
                SyncConfig::default()
                    .with_debounce(Duration::from_millis(debounce))
                    .with_revalidate_interval(Duration::from_millis(revalidate))
                    .with_optimistic_ttl(Duration::from_millis(ttl))
                    .with_degraded_after(degraded)
                    .with_reconnect(reconnect)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! The fleet dashboard tables with a few rows each.

    use super::*;
    use std::time::Duration;

    pub fn locations() -> TableName {
        table("locations")
    }

    pub fn vehicles() -> TableName {
        table("vehicles")
    }

    pub fn team_members() -> TableName {
        table("team_members")
    }

    pub fn tasks() -> TableName {
        table("tasks")
    }

    pub fn vehicle(id: i64, name: &str, location_id: i64) -> Record {
        Record::new()
            .with("id", id)
            .with("name", name)
            .with("plate", format!("FS-{id:03}"))
            .with("status", "available")
            .with("location_id", location_id)
    }

    pub fn location(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    /// The default referential constraints of the fleet schema.
    pub fn fleet_foreign_keys() -> Vec<ForeignKey> {
        vec![
            ForeignKey::new(vehicles(), "location_id", locations()),
            ForeignKey::new(tasks(), "vehicle_id", vehicles()),
            ForeignKey::new(tasks(), "team_member_id", team_members()),
        ]
    }

    /// Mock backend with the fleet schema and seed rows.
    pub fn fleet_backend() -> MockBackend {
        let backend = fleet_foreign_keys()
            .into_iter()
            .fold(MockBackend::new(), MockBackend::with_foreign_key);
        backend.seed(
            &locations(),
            vec![location(1, "Depot North"), location(2, "Depot South")],
        );
        backend.seed(
            &vehicles(),
            vec![
                vehicle(1, "Van 1", 1),
                vehicle(2, "Van 2", 1),
                vehicle(3, "Truck 3", 2),
            ],
        );
        backend.seed(
            &team_members(),
            vec![Record::new()
                .with("id", "0190f1a2-0000-7000-8000-000000000001")
                .with("full_name", "Robin Driver")
                .with("role", "driver")],
        );
        backend.seed(
            &tasks(),
            vec![Record::new()
                .with("id", "0190f1a2-0000-7000-8000-0000000000a1")
                .with("title", "Deliver parts")
                .with("status", "pending")
                .with("vehicle_id", 1)
                .with("team_member_id", "0190f1a2-0000-7000-8000-000000000001")],
        );
        backend
    }

    /// Query for the whole vehicles table ordered by id.
    pub fn vehicles_query() -> SelectQuery {
        SelectQuery::new(vehicles()).order_by(fleetsync_core::OrderBy::asc("id"))
    }

    /// Config with short intervals for timing tests.
    pub fn fast_config() -> SyncConfig {
        SyncConfig::default()
            .with_debounce(Duration::from_millis(150))
            .with_revalidate_interval(Duration::from_millis(1_000))
            .with_optimistic_ttl(Duration::from_millis(500))
            .with_dependencies(DependencyMap::fleet_defaults())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for FLEETSYNC error categories.

    use super::*;

    /// Assert that a SyncResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &SyncResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a SyncResult is a constraint violation.
    #[track_caller]
    pub fn assert_constraint_error<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::Backend(BackendError::Constraint { .. })) => {}
            other => panic!("Expected Constraint error, got: {:?}", other),
        }
    }

    /// Assert that a SyncResult is a connectivity error.
    #[track_caller]
    pub fn assert_connectivity_error<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(SyncError::Backend(BackendError::Connectivity { .. })) => {}
            other => panic!("Expected Connectivity error, got: {:?}", other),
        }
    }

    /// Identifiers of `rows` under `id`, in order.
    pub fn ids(rows: &[Record]) -> Vec<RowKey> {
        rows.iter().filter_map(|r| r.key("id")).collect()
    }
}
