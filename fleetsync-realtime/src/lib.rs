//! FLEETSYNC Realtime - Change Feed Bridge
//!
//! Turns backend change notifications into debounced cache refreshes and
//! exposes the consumer API (`SyncContext`, `ResourceHandle`).

pub mod backoff;
pub mod bridge;
pub mod context;
pub mod status;

pub use backoff::{jittered_backoff, Backoff};
pub use bridge::{RealtimeBridge, RealtimeGuard};
pub use context::{ResourceHandle, SyncContext};
pub use status::{RealtimeMode, RealtimeStatus};
