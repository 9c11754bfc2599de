//! Storage seams for the request ledger and the model price table.
//!
//! Both stores are shared by every in-flight request; implementations are
//! responsible for their own synchronisation.

use crate::cost::{ModelPrice, UsageData};
use crate::error::Result;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Row id of a ledger entry.
pub type EntryId = i64;

/// What is known about an exchange when the request arrives.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub request_id: String,
    pub client_addr: String,
    pub request_headers: String,
    pub request_body: String,
    pub request_type: String,
    pub model: String,
    pub is_streaming: bool,
    pub additional_params: String,
}

/// What is known once the exchange (or one phase of it) completes.
#[derive(Debug, Clone, Default)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: String,
    pub body: String,
    pub elapsed_ms: i64,
    pub usage: Option<String>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub client_addr: String,
    pub request_headers: String,
    pub request_body: String,
    pub request_type: String,
    pub model: String,
    pub is_streaming: bool,
    pub processing_time_ms: i64,
    pub response_status: u16,
    pub response_headers: String,
    pub response_body: String,
    pub additional_params: String,
    pub usage: Option<String>,
    pub cost: f64,
}

impl LedgerEntry {
    pub fn parsed_usage(&self) -> Option<UsageData> {
        self.usage
            .as_deref()
            .filter(|u| !u.is_empty())
            .and_then(|u| UsageData::parse(u).ok())
    }
}

#[async_trait]
pub trait RequestLedger: Send + Sync {
    async fn create(&self, entry: NewEntry) -> Result<EntryId>;
    async fn update(&self, id: EntryId, record: ResponseRecord) -> Result<()>;
    async fn get(&self, id: EntryId) -> Result<Option<LedgerEntry>>;
    /// Newest first. Returns the page and the total number of entries.
    async fn list(&self, offset: u64, limit: u64) -> Result<(Vec<LedgerEntry>, u64)>;
}

#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn get_price(&self, model: &str) -> Result<Option<ModelPrice>>;
    async fn list_prices(&self) -> Result<Vec<PriceRow>>;
    async fn upsert_price(&self, price: &ModelPrice) -> Result<()>;
    async fn is_empty(&self) -> Result<bool>;
}

/// A stored price plus when it was first recorded.
#[derive(Debug, Clone, Serialize)]
pub struct PriceRow {
    #[serde(flatten)]
    pub price: ModelPrice,
    pub created_at: DateTime<Utc>,
}

const REDACTED_HEADERS: [&str; 2] = ["authorization", "x-api-key"];

/// Serialise headers as `{"name": ["value", ...]}`. Credentials are masked.
pub fn headers_to_json(headers: &HeaderMap) -> String {
    let mut map: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let value = if REDACTED_HEADERS.contains(&name.as_str()) {
            "[redacted]".to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        map.entry(name.as_str()).or_default().push(value);
    }
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

/// A fresh 32-hex-character request id.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_headers_to_json_groups_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", HeaderValue::from_static("1"));
        headers.append("x-a", HeaderValue::from_static("2"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        assert_eq!(
            headers_to_json(&headers),
            r#"{"content-type":["application/json"],"x-a":["1","2"]}"#
        );
        assert_eq!(headers_to_json(&HeaderMap::new()), "{}");
    }

    #[test]
    fn test_headers_to_json_masks_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-secret"));
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-secret"));

        let json = headers_to_json(&headers);
        assert!(!json.contains("sk-secret"));
        assert_eq!(
            json,
            r#"{"authorization":["[redacted]"],"x-api-key":["[redacted]"]}"#
        );
    }

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_request_id());
    }
}
