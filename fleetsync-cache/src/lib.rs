//! FLEETSYNC Cache - Revalidating Resource Store
//!
//! Keeps the last known rows for every registered resource key, revalidates
//! them in the background, coalesces concurrent fetches, and applies
//! optimistic updates that roll back when the backend rejects a write.

pub mod dedup;
pub mod optimistic;
pub mod snapshot;
pub mod stats;
pub mod store;

pub use dedup::{dedup_by_key, dedup_rows, DedupHint, Deduplicator};
pub use optimistic::{OptimisticUpdate, OptimisticWriter, WriteOp};
pub use snapshot::ResourceSnapshot;
pub use stats::CacheStats;
pub use store::{Checkpoint, ResourceStore, Rows};
