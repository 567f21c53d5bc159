//! Conversation history lookup over HTTP
//!
//! Available with the `http` feature. One POST per page; records are
//! returned as opaque JSON values.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{ChatFlowError, Result};
use crate::types::config::ClientConfig;

/// Query for one page of history records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// User whose history is requested
    pub username: String,
    /// First day included
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    /// Last day included
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// 1-based page number
    pub page: u32,
    /// Records per page
    pub page_size: u32,
    /// Server-specific filters
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub filters: Map<String, Value>,
}

impl HistoryQuery {
    /// First page of 20 records for `username`
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            start_date: None,
            end_date: None,
            page: 1,
            page_size: 20,
            filters: Map::new(),
        }
    }

    /// Restrict to a date range (inclusive)
    #[must_use]
    pub const fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    /// Select a page
    #[must_use]
    pub const fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Add a filter
    #[must_use]
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }
}

/// One page of history records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryPage {
    /// Total number of records across all pages
    pub total: u64,
    /// Records of this page
    pub records: Vec<Value>,
}

/// HTTP client for the history endpoint
#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    url: String,
    key: Option<String>,
    token: Option<String>,
}

impl HistoryClient {
    /// Create a client for the configured `history_url`
    ///
    /// # Errors
    /// Returns `InvalidConfig` if no history URL is configured or the HTTP
    /// client cannot be built
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let url = config
            .history_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ChatFlowError::invalid_config("history_url is not set"))?;
        url::Url::parse(&url)?;
        let http = reqwest::Client::builder()
            .timeout(config.response_timeout.max(Duration::from_secs(1)))
            .build()
            .map_err(|e| ChatFlowError::invalid_config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url,
            key: config.key.clone(),
            token: config.token.clone(),
        })
    }

    /// Fetch one page of history
    ///
    /// # Errors
    /// - `RequestFailed` on transport errors or non-success HTTP status
    /// - `InvalidResponse` if the body is not a history page
    pub async fn fetch(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let mut request = self.http.post(&self.url).json(query);
        if let Some(key) = &self.key {
            request = request.header("key", key);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        log::debug!(
            "fetching history page {} for {}",
            query.page,
            query.username
        );
        let response = request
            .send()
            .await
            .map_err(|e| ChatFlowError::request_failed(format!("history request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChatFlowError::request_failed(format!(
                "history request returned HTTP {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatFlowError::invalid_response(format!("history body: {e}")))?;
        parse_page(body)
    }
}

/// Decode a history body, accepting both a bare page and one wrapped in `data`
///
/// # Errors
/// Returns `InvalidResponse` if the body is not a history page
pub fn parse_page(body: Value) -> Result<HistoryPage> {
    let page = match body {
        Value::Object(mut map) if !map.contains_key("records") && map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(page)
        .map_err(|e| ChatFlowError::invalid_response(format!("history page: {e}")))
}
