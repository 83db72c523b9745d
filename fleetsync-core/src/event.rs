//! Row change notifications pushed by the backend.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::identity::{TableName, Timestamp};
use crate::record::{Record, RowKey};

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: TableName,
    /// New row image (inserts and updates).
    #[serde(default)]
    pub record: Option<Record>,
    /// Previous row image (updates and deletes), when the backend sends it.
    #[serde(default)]
    pub old_record: Option<Record>,
    #[serde(default = "Utc::now")]
    pub commit_timestamp: Timestamp,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: TableName) -> Self {
        Self {
            kind,
            table,
            record: None,
            old_record: None,
            commit_timestamp: Utc::now(),
        }
    }

    pub fn insert(table: TableName, record: Record) -> Self {
        Self {
            record: Some(record),
            ..Self::new(ChangeKind::Insert, table)
        }
    }

    pub fn update(table: TableName, old_record: Option<Record>, record: Record) -> Self {
        Self {
            record: Some(record),
            old_record,
            ..Self::new(ChangeKind::Update, table)
        }
    }

    pub fn delete(table: TableName, old_record: Record) -> Self {
        Self {
            old_record: Some(old_record),
            ..Self::new(ChangeKind::Delete, table)
        }
    }

    /// Identifier of the affected row, from whichever image carries it.
    pub fn row_key(&self, id_field: &str) -> Option<RowKey> {
        self.record
            .as_ref()
            .and_then(|r| r.key(id_field))
            .or_else(|| self.old_record.as_ref().and_then(|r| r.key(id_field)))
    }
}

/// Message delivered on a change feed subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// The backend reported a channel-level problem; the channel may still
    /// be open.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_event_wire_format() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "type": "UPDATE",
            "table": "vehicles",
            "record": {"id": 1, "status": "in_use"},
            "old_record": {"id": 1},
            "commit_timestamp": "2024-05-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.table.as_str(), "vehicles");
        assert_eq!(event.row_key("id"), Some(RowKey::Int(1)));
    }

    #[test]
    fn test_change_event_defaults() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "type": "DELETE",
            "table": "tasks",
            "old_record": {"id": "abc"}
        }))
        .unwrap();
        assert!(event.record.is_none());
        assert_eq!(event.row_key("id"), Some(RowKey::Text("abc".to_string())));
    }

    #[test]
    fn test_change_event_constructors() {
        let table = TableName::new("locations").unwrap();
        let event = ChangeEvent::insert(table.clone(), Record::new().with("id", 9));
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.row_key("id"), Some(RowKey::Int(9)));

        let event = ChangeEvent::delete(table, Record::new().with("id", 9));
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.record.is_none());
    }
}
