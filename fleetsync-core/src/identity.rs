//! Identity types for FLEETSYNC resources and tables

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds for intervals and timeouts.
pub type DurationMs = u64;

static TABLE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z_][a-z0-9_]*\.)?[a-z_][a-z0-9_]*$").expect("Invalid table name regex")
});

/// Name of a backend table or view, optionally schema-qualified.
///
/// Table names end up in request paths and channel topics, so they are
/// restricted to lowercase SQL identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Validate and wrap a table name.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if TABLE_NAME_RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(ConfigError::InvalidValue {
                field: "table".to_string(),
                value: name,
                reason: "must be a lowercase SQL identifier".to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The table part without any schema prefix.
    pub fn relation(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical name under which a cached dataset is tracked.
///
/// Usually a table name, optionally followed by a mode
/// (`"tasks"`, `"tasks:open"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build the conventional key for a table and an optional mode.
    pub fn for_table(table: &TableName, mode: Option<&str>) -> Self {
        match mode {
            Some(mode) if !mode.is_empty() => Self(format!("{}:{}", table, mode)),
            _ => Self(table.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
