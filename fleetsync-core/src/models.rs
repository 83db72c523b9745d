//! Typed rows for the fleet dashboard tables.
//!
//! The dashboard reads these tables; their schema lives in the backend.
//! Only fields the synchronization layer and the CLI touch are modelled
//! strictly, everything else rides along in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::identity::Timestamp;
use crate::record::{RowKey, TableRow};

/// Operational state of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Available,
    InUse,
    Maintenance,
    Retired,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
    pub address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for Location {
    const TABLE: &'static str = "locations";

    fn row_key(&self) -> RowKey {
        RowKey::Int(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: i64,
    pub name: String,
    pub plate: Option<String>,
    pub status: VehicleStatus,
    /// Must reference an existing location.
    pub location_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for Vehicle {
    const TABLE: &'static str = "vehicles";

    fn row_key(&self) -> RowKey {
        RowKey::Int(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: Uuid,
    pub full_name: String,
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for TeamMember {
    const TABLE: &'static str = "team_members";

    fn row_key(&self) -> RowKey {
        RowKey::from(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub vehicle_id: Option<i64>,
    pub team_member_id: Option<Uuid>,
    pub due_at: Option<Timestamp>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TableRow for Task {
    const TABLE: &'static str = "tasks";

    fn row_key(&self) -> RowKey {
        RowKey::from(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use serde_json::json;

    #[test]
    fn test_vehicle_decodes_from_record() {
        let record = Record::from_value(json!({
            "id": 4,
            "name": "Truck 4",
            "plate": "AB-123",
            "status": "in_use",
            "location_id": 2,
            "odometer_km": 120_000
        }))
        .unwrap();
        let vehicle: Vehicle = record.decode().unwrap();
        assert_eq!(vehicle.status, VehicleStatus::InUse);
        assert_eq!(vehicle.location_id, Some(2));
        assert_eq!(vehicle.extra.get("odometer_km"), Some(&json!(120_000)));
        assert_eq!(vehicle.row_key(), RowKey::Int(4));
    }

    #[test]
    fn test_task_encode_keeps_extra_fields() {
        let id = Uuid::now_v7();
        let mut extra = Map::new();
        extra.insert("priority".to_string(), json!("high"));
        let task = Task {
            id,
            title: "Deliver parts".to_string(),
            status: TaskStatus::Pending,
            vehicle_id: Some(1),
            team_member_id: None,
            due_at: None,
            extra,
        };
        let record = Record::encode(&task).unwrap();
        assert_eq!(record.get("priority"), Some(&json!("high")));
        assert_eq!(record.key(Task::ID_FIELD), Some(RowKey::from(id)));
        let back: Task = record.decode().unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_table_names() {
        assert_eq!(Vehicle::TABLE, "vehicles");
        assert_eq!(Location::TABLE, "locations");
        assert_eq!(TeamMember::TABLE, "team_members");
        assert_eq!(Task::TABLE, "tasks");
    }
}
