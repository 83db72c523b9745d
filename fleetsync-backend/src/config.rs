//! Connection settings for the managed backend.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use fleetsync_core::{ConfigError, DurationMs};

/// Where the backend lives and how to authenticate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://project.example.co`.
    pub url: String,
    /// Public API key, sent as `apikey` and as the default bearer token.
    pub api_key: String,
    /// User access token; replaces the API key as bearer token when set.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Realtime endpoint. Derived from `url` when absent.
    #[serde(default)]
    pub realtime_url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: DurationMs,
}

fn default_request_timeout_ms() -> DurationMs {
    10_000
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            access_token: None,
            realtime_url: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `{url}/rest/v1`
    pub fn rest_base(&self) -> String {
        format!("{}/rest/v1", self.url.trim_end_matches('/'))
    }

    /// The configured realtime URL, or `{url}/realtime/v1/websocket` with the
    /// scheme switched to `ws`/`wss`.
    pub fn realtime_endpoint(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let base = self.url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/realtime/v1/websocket")
    }

    pub fn bearer_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "backend.url".to_string(),
            });
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "backend.url".to_string(),
                value: self.url.clone(),
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "backend.api_key".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.request_timeout_ms".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if let Some(url) = &self.realtime_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidValue {
                    field: "backend.realtime_url".to_string(),
                    value: url.clone(),
                    reason: "must start with ws:// or wss://".to_string(),
                });
            }
        }
        Ok(())
    }
}
