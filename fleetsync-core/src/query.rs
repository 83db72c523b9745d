//! Read descriptions handed to a [`Fetcher`](crate::Fetcher).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::TableName;
use crate::record::{Record, DEFAULT_ID_FIELD};

/// Sort order for a select.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Equality filter on one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub equals: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, equals: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.get(&self.column) == Some(&self.equals)
    }
}

/// A read against one table or view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: TableName,
    /// Column projection; empty selects every column.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub order: Option<OrderBy>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// Column used to deduplicate and to address rows for optimistic updates.
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}

impl SelectQuery {
    pub fn new(table: TableName) -> Self {
        Self {
            table,
            columns: Vec::new(),
            order: None,
            filters: Vec::new(),
            id_field: default_id_field(),
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    /// Whether a row satisfies every filter of this query.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Column list in `a,b,c` form, `*` when unprojected.
    pub fn select_list(&self) -> String {
        if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicles() -> TableName {
        TableName::new("vehicles").unwrap()
    }

    #[test]
    fn test_select_query_builder() {
        let query = SelectQuery::new(vehicles())
            .columns(["id", "name"])
            .order_by(OrderBy::desc("name"))
            .filter(Filter::eq("status", "available"));

        assert_eq!(query.select_list(), "id,name");
        assert_eq!(query.order, Some(OrderBy::desc("name")));
        assert_eq!(query.id_field, "id");
        assert_eq!(query.filters.len(), 1);
    }

    #[test]
    fn test_select_list_defaults_to_star() {
        assert_eq!(SelectQuery::new(vehicles()).select_list(), "*");
    }

    #[test]
    fn test_filters_match_records() {
        let query = SelectQuery::new(vehicles()).filter(Filter::eq("status", "available"));
        assert!(query.matches(&Record::new().with("status", "available")));
        assert!(!query.matches(&Record::new().with("status", "retired")));
        assert!(!query.matches(&Record::new()));
    }

    #[test]
    fn test_select_query_deserializes_with_defaults() {
        let query: SelectQuery = serde_json::from_str(r#"{"table": "tasks"}"#).unwrap();
        assert!(query.columns.is_empty());
        assert_eq!(query.id_field, "id");
        assert!(query.order.is_none());
    }
}
