//! REST adapter for a PostgREST-style table API.
//!
//! Reads are `GET {base}/{table}?select=..&order=..&col=eq.value`; writes use
//! `POST`/`PATCH`/`DELETE` with `Prefer: return=representation` so the stored
//! row comes back in the response. Failures are classified into the backend
//! error categories the cache layer understands.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use fleetsync_core::{
    BackendError, ConfigError, Fetcher, Record, RowKey, RowWriter, SelectQuery, SyncResult,
    TableName,
};

use crate::config::BackendConfig;

static CONSTRAINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"constraint "([^"]+)""#).expect("Invalid constraint regex"));

/// Error body returned by the REST layer.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

/// Classify a non-success response.
pub fn map_error_response(table: &TableName, status: u16, body: &str) -> BackendError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.code.as_deref().unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {status}"));

    if code.starts_with("23") {
        let constraint = parsed
            .message
            .iter()
            .chain(parsed.details.iter())
            .find_map(|text| CONSTRAINT_RE.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| code.to_string());
        return BackendError::constraint(table.as_str(), constraint, message);
    }
    if code == "42501" || code == "PGRST301" || status == 401 || status == 403 {
        return BackendError::permission(table.as_str(), message);
    }
    if status >= 500 {
        return BackendError::connectivity(format!("HTTP {status}: {message}"));
    }
    let detail = if code.is_empty() {
        message
    } else {
        format!("{code}: {message}")
    };
    BackendError::invalid_response(format!("HTTP {status}: {detail}"))
}

/// Classify a transport failure.
pub fn map_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::invalid_response(err.to_string())
    } else {
        BackendError::connectivity(err.to_string())
    }
}

/// Query-string parameters for a select.
pub fn query_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.select_list())];
    if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    for filter in &query.filters {
        params.push((filter.column.clone(), filter_value(&filter.equals)));
    }
    params
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::String(s) => format!("eq.{s}"),
        other => format!("eq.{other}"),
    }
}

fn id_param(id_field: &str, id: &RowKey) -> (String, String) {
    (id_field.to_string(), format!("eq.{id}"))
}

/// Rows of a JSON array body.
pub fn decode_rows(body: &str) -> SyncResult<Vec<Record>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| BackendError::invalid_response(format!("body is not JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(BackendError::invalid_response("expected a JSON array of rows").into());
    };
    items
        .into_iter()
        .map(|item| {
            Record::from_value(item)
                .map_err(|e| BackendError::invalid_response(e.to_string()).into())
        })
        .collect()
}

fn single_row(rows: Vec<Record>, table: &TableName, action: &str) -> SyncResult<Record> {
    rows.into_iter().next().ok_or_else(|| {
        BackendError::invalid_response(format!("{action} on {table} returned no row")).into()
    })
}

/// `Fetcher` and `RowWriter` over HTTP.
#[derive(Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl RestBackend {
    pub fn new(config: &BackendConfig) -> SyncResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::connectivity(format!("failed to build HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("apikey"),
            header_value("backend.api_key", &config.api_key)?,
        );
        headers.insert(
            HeaderName::from_static("authorization"),
            header_value(
                "backend.access_token",
                &format!("Bearer {}", config.bearer_token()),
            )?,
        );

        Ok(Self {
            client,
            base_url: config.rest_base(),
            headers,
        })
    }

    fn table_url(&self, table: &TableName) -> String {
        format!("{}/{}", self.base_url, table.relation())
    }

    /// Schema-qualified tables select their schema through profile headers.
    fn with_profile(request: RequestBuilder, table: &TableName, write: bool) -> RequestBuilder {
        match table.as_str().split_once('.') {
            Some((schema, _)) => {
                let header = if write { "content-profile" } else { "accept-profile" };
                request.header(header, schema)
            }
            None => request,
        }
    }

    async fn execute(&self, table: &TableName, request: RequestBuilder) -> SyncResult<Vec<Record>> {
        let response = request
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_error_response(table, status.as_u16(), &body).into());
        }
        decode_rows(&body)
    }

    fn write_request(&self, request: RequestBuilder, table: &TableName) -> RequestBuilder {
        Self::with_profile(request, table, true).header("prefer", "return=representation")
    }
}

fn header_value(field: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        value: "<redacted>".to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Fetcher for RestBackend {
    async fn select(&self, query: &SelectQuery) -> SyncResult<Vec<Record>> {
        let request = self
            .client
            .get(self.table_url(&query.table))
            .query(&query_params(query));
        let request = Self::with_profile(request, &query.table, false);
        let rows = self.execute(&query.table, request).await?;
        debug!(table = %query.table, rows = rows.len(), "Select completed");
        Ok(rows)
    }
}

#[async_trait]
impl RowWriter for RestBackend {
    async fn insert(&self, table: &TableName, row: Record) -> SyncResult<Record> {
        let request = self.client.post(self.table_url(table)).json(&row);
        let rows = self
            .execute(table, self.write_request(request, table))
            .await?;
        single_row(rows, table, "insert")
    }

    async fn update(
        &self,
        table: &TableName,
        id_field: &str,
        id: &RowKey,
        patch: Record,
    ) -> SyncResult<Record> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[id_param(id_field, id)])
            .json(&patch);
        let rows = self
            .execute(table, self.write_request(request, table))
            .await?;
        single_row(rows, table, "update")
    }

    async fn delete(&self, table: &TableName, id_field: &str, id: &RowKey) -> SyncResult<Record> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&[id_param(id_field, id)]);
        let rows = self
            .execute(table, self.write_request(request, table))
            .await?;
        single_row(rows, table, "delete")
    }
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
