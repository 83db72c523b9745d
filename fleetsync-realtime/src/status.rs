//! Realtime status reported per table subscription.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state of one table's change channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RealtimeStatus {
    /// First subscribe attempt in progress.
    Connecting,
    /// Channel open and delivering events.
    Live,
    /// Channel lost; `attempt` consecutive failures so far.
    Reconnecting { attempt: u32 },
    /// Too many consecutive failures. Reconnects continue at the maximum
    /// backoff and consumers fall back to polling.
    Degraded,
    /// Subscription released or bridge shut down.
    Closed,
}

impl RealtimeStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, RealtimeStatus::Live)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, RealtimeStatus::Degraded)
    }
}

impl fmt::Display for RealtimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealtimeStatus::Connecting => f.write_str("connecting"),
            RealtimeStatus::Live => f.write_str("live"),
            RealtimeStatus::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            RealtimeStatus::Degraded => f.write_str("degraded"),
            RealtimeStatus::Closed => f.write_str("closed"),
        }
    }
}

/// Whether a resource handle follows the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeMode {
    /// Subscribe to the table's change channel; poll only while degraded.
    #[default]
    Enabled,
    /// Poll at the revalidate interval.
    Disabled,
}
