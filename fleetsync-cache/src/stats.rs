//! Counters for cache usage.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// `get` calls answered with fresh data.
    pub hits: u64,
    /// `get` calls that found stale or absent data.
    pub misses: u64,
    /// Fetcher invocations.
    pub refreshes: u64,
    /// Refresh requests that joined one already in flight.
    pub coalesced: u64,
    /// Refreshes that failed.
    pub failures: u64,
    pub optimistic_updates: u64,
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub refreshes: AtomicU64,
    pub coalesced: AtomicU64,
    pub failures: AtomicU64,
    pub optimistic_updates: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entry_count: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            optimistic_updates: self.optimistic_updates.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = StatsCounters::default();
        StatsCounters::bump(&counters.refreshes);
        StatsCounters::bump(&counters.refreshes);
        StatsCounters::bump(&counters.coalesced);
        let stats = counters.snapshot(3);
        assert_eq!(stats.refreshes, 2);
        assert_eq!(stats.coalesced, 1);
        assert_eq!(stats.entry_count, 3);
    }
}
