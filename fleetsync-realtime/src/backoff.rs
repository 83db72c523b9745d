//! Reconnect backoff with jitter.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fleetsync_core::{DurationMs, ReconnectConfig};

/// Exponential backoff state for one reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current_ms: DurationMs,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_ms = config.initial_ms;
        Self { config, current_ms }
    }

    /// Delay before the next attempt. Advances the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered_backoff(self.current_ms, self.config.jitter_ms);
        self.current_ms = self.config.next_backoff(self.current_ms);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.config.initial_ms;
    }
}

/// `base_ms` plus up to `jitter_ms` of clock-derived noise.
pub fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(jitter_ms: u64) -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter_ms,
        }
    }

    #[test]
    fn test_backoff_grows_to_cap_and_resets() {
        let mut backoff = Backoff::new(config(0));
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn jitter_stays_in_bounds(base in 0u64..10_000, jitter in 0u64..1_000) {
            let delay = jittered_backoff(base, jitter);
            prop_assert!(delay >= base);
            prop_assert!(delay <= base + jitter);
        }
    }
}
