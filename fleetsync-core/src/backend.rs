//! Traits for the managed backend collaborators.
//!
//! The wire protocol and authentication belong to the backend service. The
//! synchronization layer only sees these three seams.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::event::FeedMessage;
use crate::identity::TableName;
use crate::query::SelectQuery;
use crate::record::{Record, RowKey};

/// Issues reads against the backend.
///
/// One call is one network round trip. Implementations do not retry and do
/// not cache; both belong to the caller.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn select(&self, query: &SelectQuery) -> SyncResult<Vec<Record>>;
}

/// Write path of the backend. Each call returns the row as stored.
#[async_trait]
pub trait RowWriter: Send + Sync {
    async fn insert(&self, table: &TableName, row: Record) -> SyncResult<Record>;

    async fn update(
        &self,
        table: &TableName,
        id_field: &str,
        id: &RowKey,
        patch: Record,
    ) -> SyncResult<Record>;

    async fn delete(&self, table: &TableName, id_field: &str, id: &RowKey) -> SyncResult<Record>;
}

/// An open change channel for one table.
///
/// When `events` yields `None` the backend dropped the channel.
#[derive(Debug)]
pub struct FeedSubscription {
    pub channel_id: String,
    pub events: mpsc::Receiver<FeedMessage>,
}

/// Backend change-notification channel.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, table: &TableName) -> SyncResult<FeedSubscription>;

    async fn unsubscribe(&self, channel_id: &str) -> SyncResult<()>;
}
