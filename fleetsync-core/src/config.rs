//! Configuration types for the synchronization layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::identity::{DurationMs, ResourceKey, TableName};

/// Reconnect backoff for realtime channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: DurationMs,
    pub max_ms: DurationMs,
    pub multiplier: f64,
    pub jitter_ms: DurationMs,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 5_000,
            multiplier: 1.5,
            jitter_ms: 100,
        }
    }
}

impl ReconnectConfig {
    /// Next backoff step after `current_ms`, capped at `max_ms`.
    pub fn next_backoff(&self, current_ms: DurationMs) -> DurationMs {
        let next = (current_ms as f64 * self.multiplier) as DurationMs;
        next.min(self.max_ms)
    }
}

/// Cross-table invalidation edges: a change on the table also refreshes the
/// listed resource keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyMap(BTreeMap<TableName, Vec<ResourceKey>>);

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edges the fleet dashboard relies on: task writes change the
    /// per-member and per-vehicle task aggregates.
    pub fn fleet_defaults() -> Self {
        let mut map = Self::new();
        if let Ok(tasks) = TableName::new("tasks") {
            map.add(tasks.clone(), ResourceKey::new("team_members"));
            map.add(tasks, ResourceKey::new("vehicles"));
        }
        map
    }

    pub fn add(&mut self, table: TableName, key: ResourceKey) {
        let keys = self.0.entry(table).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    pub fn with(mut self, table: TableName, key: ResourceKey) -> Self {
        self.add(table, key);
        self
    }

    pub fn dependents(&self, table: &TableName) -> &[ResourceKey] {
        self.0.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Tuning for the cache and the realtime bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Quiet period after the last change event before refreshing.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: DurationMs,
    /// Polling interval for non-realtime consumers; cached values older than
    /// this report stale.
    #[serde(default = "default_revalidate_interval_ms")]
    pub revalidate_interval_ms: DurationMs,
    /// How long an unreconciled optimistic value is trusted.
    #[serde(default = "default_optimistic_ttl_ms")]
    pub optimistic_ttl_ms: DurationMs,
    /// Consecutive channel failures before realtime reports degraded.
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,
    #[serde(default)]
    pub dependencies: DependencyMap,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_debounce_ms() -> DurationMs {
    150
}

fn default_revalidate_interval_ms() -> DurationMs {
    30_000
}

fn default_optimistic_ttl_ms() -> DurationMs {
    5_000
}

fn default_degraded_after_failures() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            revalidate_interval_ms: default_revalidate_interval_ms(),
            optimistic_ttl_ms: default_optimistic_ttl_ms(),
            degraded_after_failures: default_degraded_after_failures(),
            dependencies: DependencyMap::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as DurationMs;
        self
    }

    pub fn with_revalidate_interval(mut self, interval: Duration) -> Self {
        self.revalidate_interval_ms = interval.as_millis() as DurationMs;
        self
    }

    pub fn with_optimistic_ttl(mut self, ttl: Duration) -> Self {
        self.optimistic_ttl_ms = ttl.as_millis() as DurationMs;
        self
    }

    pub fn with_degraded_after(mut self, failures: u32) -> Self {
        self.degraded_after_failures = failures;
        self
    }

    pub fn with_dependencies(mut self, dependencies: DependencyMap) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_millis(self.revalidate_interval_ms)
    }

    pub fn optimistic_ttl(&self) -> Duration {
        Duration::from_millis(self.optimistic_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_ms == 0 {
            return Err(invalid("debounce_ms", self.debounce_ms, "must be > 0"));
        }
        if self.revalidate_interval_ms == 0 {
            return Err(invalid(
                "revalidate_interval_ms",
                self.revalidate_interval_ms,
                "must be > 0",
            ));
        }
        if self.optimistic_ttl_ms == 0 {
            return Err(invalid(
                "optimistic_ttl_ms",
                self.optimistic_ttl_ms,
                "must be > 0",
            ));
        }
        if self.degraded_after_failures == 0 {
            return Err(invalid(
                "degraded_after_failures",
                self.degraded_after_failures,
                "must be > 0",
            ));
        }
        if self.reconnect.initial_ms == 0 {
            return Err(invalid(
                "reconnect.initial_ms",
                self.reconnect.initial_ms,
                "must be > 0",
            ));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid(
                "reconnect.max_ms",
                self.reconnect.max_ms,
                "must be >= initial_ms",
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(invalid(
                "reconnect.multiplier",
                self.reconnect.multiplier,
                "must be >= 1.0",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
