//! Optimistic updates and the write flow built on them.

use std::sync::Arc;
use tracing::{debug, warn};

use fleetsync_core::{
    CacheError, Record, ResourceKey, RowKey, RowWriter, SyncResult, TableName,
};

use crate::store::ResourceStore;

/// A local change applied to cached rows before the backend confirms it.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticUpdate {
    /// Replace the row with the same identifier, or append it.
    Upsert(Record),
    /// Append unconditionally. Used for inserts whose identifier the backend
    /// assigns.
    Append(Record),
    /// Remove the row with this identifier, if present.
    Remove(RowKey),
    /// Merge fields into the row with this identifier, if present.
    Patch { id: RowKey, patch: Record },
}

impl OptimisticUpdate {
    pub fn apply(&self, rows: &mut Vec<Record>, id_field: &str) -> SyncResult<()> {
        match self {
            OptimisticUpdate::Upsert(row) => {
                let id = row.key(id_field).ok_or_else(|| CacheError::MissingRowKey {
                    key: row_label(row),
                    id_field: id_field.to_string(),
                })?;
                match position(rows, id_field, &id) {
                    Some(index) => rows[index] = row.clone(),
                    None => rows.push(row.clone()),
                }
            }
            OptimisticUpdate::Append(row) => rows.push(row.clone()),
            OptimisticUpdate::Remove(id) => {
                rows.retain(|row| row.key(id_field).as_ref() != Some(id));
            }
            OptimisticUpdate::Patch { id, patch } => {
                if let Some(index) = position(rows, id_field, id) {
                    rows[index].merge(patch);
                }
            }
        }
        Ok(())
    }
}

fn position(rows: &[Record], id_field: &str, id: &RowKey) -> Option<usize> {
    rows.iter()
        .position(|row| row.key(id_field).as_ref() == Some(id))
}

fn row_label(row: &Record) -> String {
    serde_json::Value::Object(row.as_map().clone()).to_string()
}

/// A write sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(Record),
    Update { id: RowKey, patch: Record },
    Delete(RowKey),
}

impl WriteOp {
    /// The local change that anticipates this write.
    pub fn optimistic(&self, id_field: &str) -> OptimisticUpdate {
        match self {
            WriteOp::Insert(row) if row.key(id_field).is_some() => {
                OptimisticUpdate::Upsert(row.clone())
            }
            WriteOp::Insert(row) => OptimisticUpdate::Append(row.clone()),
            WriteOp::Update { id, patch } => OptimisticUpdate::Patch {
                id: id.clone(),
                patch: patch.clone(),
            },
            WriteOp::Delete(id) => OptimisticUpdate::Remove(id.clone()),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WriteOp::Insert(_) => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete(_) => "delete",
        }
    }
}

/// Runs writes against the backend with an optimistic local update.
///
/// The cached rows of the target key change immediately. A rejected write
/// restores them and returns the backend error unchanged; an accepted write
/// refreshes the key and every key that depends on its table.
#[derive(Clone)]
pub struct OptimisticWriter {
    store: ResourceStore,
    writer: Arc<dyn RowWriter>,
}

impl OptimisticWriter {
    pub fn new(store: ResourceStore, writer: Arc<dyn RowWriter>) -> Self {
        Self { store, writer }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    pub async fn write(&self, key: &ResourceKey, op: WriteOp) -> SyncResult<Record> {
        let query = self.store.query(key)?;
        let checkpoint = self
            .store
            .optimistic_update(key, op.optimistic(&query.id_field))?;

        let result = self.send(&query.table, &query.id_field, op.clone()).await;

        match result {
            Ok(row) => {
                debug!(key = %key, op = op.name(), "Write accepted");
                self.reconcile(key, &query.table).await;
                Ok(row)
            }
            Err(err) => {
                warn!(key = %key, op = op.name(), error = %err, "Write rejected, rolling back");
                if !self.store.rollback(checkpoint)? {
                    debug!(key = %key, "Resource changed since the write, refreshing instead");
                    if let Err(refresh_err) = self.store.refresh(key).await {
                        warn!(key = %key, error = %refresh_err, "Refresh after rejected write failed");
                    }
                }
                Err(err)
            }
        }
    }

    async fn send(&self, table: &TableName, id_field: &str, op: WriteOp) -> SyncResult<Record> {
        match op {
            WriteOp::Insert(row) => self.writer.insert(table, row).await,
            WriteOp::Update { id, patch } => self.writer.update(table, id_field, &id, patch).await,
            WriteOp::Delete(id) => self.writer.delete(table, id_field, &id).await,
        }
    }

    async fn reconcile(&self, key: &ResourceKey, table: &TableName) {
        let mut keys = self.store.affected_keys(table);
        if !keys.contains(key) {
            keys.push(key.clone());
        }
        let results =
            futures_util::future::join_all(keys.iter().map(|k| self.store.refresh(k))).await;
        for (k, result) in keys.iter().zip(results) {
            if let Err(err) = result {
                warn!(key = %k, error = %err, "Refresh after write failed");
            }
        }
    }
}

impl std::fmt::Debug for OptimisticWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticWriter")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
