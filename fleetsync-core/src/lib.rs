//! FLEETSYNC Core - Data Types
//!
//! Pure data structures and the seams to the managed backend. All other
//! crates depend on this one. No caching or scheduling logic lives here.

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod models;
pub mod query;
pub mod record;

pub use backend::{ChangeFeed, FeedSubscription, Fetcher, RowWriter};
pub use config::{DependencyMap, ReconnectConfig, SyncConfig};
pub use error::{
    BackendError, CacheError, ConfigError, RecordError, SubscriptionError, SyncError, SyncResult,
};
pub use event::{ChangeEvent, ChangeKind, FeedMessage};
pub use identity::{DurationMs, ResourceKey, TableName, Timestamp};
pub use models::{Location, Task, TaskStatus, TeamMember, Vehicle, VehicleStatus};
pub use query::{Filter, OrderBy, SelectQuery};
pub use record::{decode_all, Record, RowKey, TableRow, DEFAULT_ID_FIELD};
