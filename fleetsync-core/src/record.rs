//! Row representation shared by fetchers, the cache, and change events.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{RecordError, SyncResult};

/// Default primary key column.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Identifier value of a row.
///
/// Only integers and strings (UUIDs included) identify rows. Any other JSON
/// type in the identifier column means the row has no usable key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl RowKey {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Text(s) => Value::from(s.clone()),
        }
    }
}

impl From<i64> for RowKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<uuid::Uuid> for RowKey {
    fn from(value: uuid::Uuid) -> Self {
        Self::Text(value.to_string())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A single row as returned by the backend: a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(RecordError::NotAnObject {
                found: json_type_name(&other).to_string(),
            }),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Identifier of this row under `id_field`, if present and usable.
    pub fn key(&self, id_field: &str) -> Option<RowKey> {
        self.0.get(id_field).and_then(RowKey::from_value)
    }

    /// Overlay `patch` onto this record, field by field.
    pub fn merge(&mut self, patch: &Record) {
        for (field, value) in &patch.0 {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Keep only the listed columns. An empty projection keeps everything.
    pub fn project(&self, columns: &[String]) -> Record {
        if columns.is_empty() {
            return self.clone();
        }
        Record(
            self.0
                .iter()
                .filter(|(field, _)| columns.iter().any(|c| c == *field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Decode into a typed row.
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            RecordError::Decode {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Encode a typed row.
    pub fn encode<T: Serialize>(row: &T) -> SyncResult<Self> {
        let value = serde_json::to_value(row).map_err(|e| RecordError::Encode {
            reason: e.to_string(),
        })?;
        Ok(Self::from_value(value)?)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Decode a slice of records into typed rows.
pub fn decode_all<T: DeserializeOwned>(records: &[Record]) -> SyncResult<Vec<T>> {
    records.iter().map(Record::decode).collect()
}

/// A typed row bound to a backend table.
pub trait TableRow: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Backend table this row type is read from.
    const TABLE: &'static str;

    /// Primary key column.
    const ID_FIELD: &'static str = DEFAULT_ID_FIELD;

    fn row_key(&self) -> RowKey;
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
