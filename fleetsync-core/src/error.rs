//! Error types for FLEETSYNC operations

use thiserror::Error;

/// Errors surfaced by the managed backend on reads and writes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unreachable: {reason}")]
    Connectivity { reason: String },

    #[error("Constraint {constraint} violated on {table}: {reason}")]
    Constraint {
        table: String,
        constraint: String,
        reason: String,
    },

    #[error("Permission denied on {table}: {reason}")]
    Permission { table: String, reason: String },

    #[error("Invalid backend response: {reason}")]
    InvalidResponse { reason: String },
}

impl BackendError {
    pub fn connectivity(reason: impl Into<String>) -> Self {
        Self::Connectivity {
            reason: reason.into(),
        }
    }

    pub fn constraint(
        table: impl Into<String>,
        constraint: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Constraint {
            table: table.into(),
            constraint: constraint.into(),
            reason: reason.into(),
        }
    }

    pub fn permission(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permission {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Text suitable for showing inline next to a failed write.
    ///
    /// Referential violations name the missing parent entity, derived from
    /// the constraint's column (`vehicles_location_id_fkey` -> "location").
    pub fn user_message(&self) -> String {
        match self {
            Self::Connectivity { .. } => {
                "Cannot reach the server. Showing the last known data.".to_string()
            }
            Self::Permission { table, .. } => {
                format!("You do not have permission to change {}.", table)
            }
            Self::Constraint {
                table,
                constraint,
                reason,
            } => match referenced_entity(table, constraint) {
                Some(entity) => format!("{} does not exist: create it first.", entity),
                None if !constraint.ends_with("_fkey") && constraint.ends_with("_key") => {
                    "A record with the same value already exists.".to_string()
                }
                None => reason.clone(),
            },
            Self::InvalidResponse { .. } => {
                "The server returned an unexpected response.".to_string()
            }
        }
    }
}

/// Turn `vehicles_location_id_fkey` on `vehicles` into "Location".
fn referenced_entity(table: &str, constraint: &str) -> Option<String> {
    let stem = constraint.strip_suffix("_fkey")?;
    let relation = table.rsplit('.').next().unwrap_or(table);
    let column = stem
        .strip_prefix(relation)
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(stem);
    let entity = column.strip_suffix("_id").unwrap_or(column).replace('_', " ");
    let mut chars = entity.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

/// Realtime channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Failed to open change channel for {table}: {reason}")]
    ChannelFailed { table: String, reason: String },

    #[error("Change channel for {table} dropped: {reason}")]
    ChannelDropped { table: String, reason: String },

    #[error("Realtime degraded for {table} after {attempts} failed attempts")]
    Degraded { table: String, attempts: u32 },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Unknown resource: {key}")]
    UnknownResource { key: String },

    #[error("Resource already registered with a different query: {key}")]
    DuplicateResource { key: String },

    #[error("Row for {key} has no identifier field {id_field}")]
    MissingRowKey { key: String, id_field: String },

    #[error("Refresh of {key} aborted: {reason}")]
    RefreshAborted { key: String, reason: String },
}

/// Record conversion errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Expected a JSON object, got {found}")]
    NotAnObject { found: String },

    #[error("Failed to decode record: {reason}")]
    Decode { reason: String },

    #[error("Failed to encode record: {reason}")]
    Encode { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all FLEETSYNC errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Connectivity { .. }))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Constraint { .. }))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Backend(BackendError::Permission { .. }))
    }

    /// Inline message for the user; backend errors get a friendly rendering.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(err) => err.user_message(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for FLEETSYNC operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_constraint() {
        let err = BackendError::constraint(
            "vehicles",
            "vehicles_location_id_fkey",
            "insert or update violates foreign key constraint",
        );
        let msg = format!("{}", err);
        assert!(msg.contains("vehicles_location_id_fkey"));
        assert!(msg.contains("vehicles"));
    }

    #[test]
    fn test_user_message_names_missing_parent() {
        let err = BackendError::constraint("vehicles", "vehicles_location_id_fkey", "fk");
        assert_eq!(err.user_message(), "Location does not exist: create it first.");

        let err = BackendError::constraint("tasks", "tasks_team_member_id_fkey", "fk");
        assert_eq!(
            err.user_message(),
            "Team member does not exist: create it first."
        );
    }

    #[test]
    fn test_user_message_unique_violation() {
        let err = BackendError::constraint("vehicles", "vehicles_plate_key", "duplicate");
        assert!(err.user_message().contains("already exists"));
    }

    #[test]
    fn test_user_message_falls_back_to_reason() {
        let err = BackendError::constraint("tasks", "tasks_status_check", "bad status");
        assert_eq!(err.user_message(), "bad status");
    }

    #[test]
    fn test_subscription_error_display_degraded() {
        let err = SubscriptionError::Degraded {
            table: "vehicles".to_string(),
            attempts: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("degraded"));
        assert!(msg.contains("vehicles"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_sync_error_from_variants() {
        let backend = SyncError::from(BackendError::connectivity("timeout"));
        assert!(matches!(backend, SyncError::Backend(_)));
        assert!(backend.is_connectivity());
        assert!(!backend.is_constraint());

        let sub = SyncError::from(SubscriptionError::ChannelDropped {
            table: "tasks".to_string(),
            reason: "closed".to_string(),
        });
        assert!(matches!(sub, SyncError::Subscription(_)));

        let cache = SyncError::from(CacheError::UnknownResource {
            key: "nope".to_string(),
        });
        assert!(matches!(cache, SyncError::Cache(_)));

        let record = SyncError::from(RecordError::NotAnObject {
            found: "array".to_string(),
        });
        assert!(matches!(record, SyncError::Record(_)));

        let config = SyncError::from(ConfigError::MissingRequired {
            field: "debounce_ms".to_string(),
        });
        assert!(matches!(config, SyncError::Config(_)));
    }

    #[test]
    fn test_sync_error_permission_predicate() {
        let err = SyncError::from(BackendError::permission("tasks", "rls"));
        assert!(err.is_permission());
        assert!(err.user_message().contains("permission"));
    }
}
