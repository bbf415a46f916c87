//! Backend HTTP API client.
//!
//! All four endpoints are plain POSTs with JSON request bodies under
//! `/api/v1/main`. Responses are a mixed bag the backend is not going to
//! change: `/register` and `/masterList` return JSON, `/automations`
//! returns a bare `name:id,...` string, and `/wifiList` returns an object
//! of numbered `wn{n}`/`wp{n}` pairs. The parsing quirks live here so the
//! rest of the crate sees typed values.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::identity::NetworkCredential;
use crate::rules::{parse_name_id_index, IndexEntry, MasterEntry};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// Typed view of the backend's main HTTP API.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Registers or refreshes the device; returns the response document
    /// (carrying at least the assigned `id`).
    async fn register(&self, doc: &Value) -> Result<Value, ApiError>;

    /// Fetches the backend-managed credential list.
    async fn wifi_list(&self) -> Result<Vec<NetworkCredential>, ApiError>;

    /// Fetches the automation rule name/id index.
    async fn automation_index(&self) -> Result<Vec<IndexEntry>, ApiError>;

    /// Fetches the reference entity list.
    async fn master_list(&self) -> Result<Vec<MasterEntry>, ApiError>;
}

/// reqwest-backed [`BackendApi`] implementation.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    async fn post(&self, name: &str, body: &Value) -> Result<reqwest::Response, ApiError> {
        debug!("POST {}", self.endpoint(name));
        let response = self
            .client
            .post(self.endpoint(name))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn register(&self, doc: &Value) -> Result<Value, ApiError> {
        let response = self.post("register", doc).await?;
        Ok(response.json().await?)
    }

    async fn wifi_list(&self) -> Result<Vec<NetworkCredential>, ApiError> {
        let response = self.post("wifiList", &json!({"wifi": "get"})).await?;
        let doc: Value = response.json().await?;
        Ok(parse_wifi_pairs(&doc))
    }

    async fn automation_index(&self) -> Result<Vec<IndexEntry>, ApiError> {
        let response = self.post("automations", &json!({"list": "get"})).await?;
        let raw = response.text().await?;
        Ok(parse_name_id_index(&raw))
    }

    async fn master_list(&self) -> Result<Vec<MasterEntry>, ApiError> {
        let response = self.post("masterList", &json!({"list": "get"})).await?;
        let entries: Vec<MasterEntry> = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        Ok(entries)
    }
}

/// Extracts ordered credentials from the `/wifiList` response shape
/// `{ wn1, wp1, wn2, wp2, ... }`. Stops at the first missing `wn{n}`;
/// a missing password yields an open-network credential.
pub fn parse_wifi_pairs(doc: &Value) -> Vec<NetworkCredential> {
    let mut credentials = Vec::new();
    for n in 1.. {
        let Some(ssid) = doc.get(format!("wn{}", n)).and_then(Value::as_str) else {
            break;
        };
        let secret = doc
            .get(format!("wp{}", n))
            .and_then(Value::as_str)
            .unwrap_or("");
        credentials.push(NetworkCredential {
            ssid: ssid.to_string(),
            secret: secret.to_string(),
        });
    }
    credentials
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_pairs_parse_in_order() {
        let doc = json!({
            "wn1": "home", "wp1": "pw1",
            "wn2": "shed", "wp2": "pw2",
            "wn3": "cafe"
        });
        let creds = parse_wifi_pairs(&doc);
        assert_eq!(creds.len(), 3);
        assert_eq!(creds[0].ssid, "home");
        assert_eq!(creds[1].secret, "pw2");
        assert_eq!(creds[2].secret, "", "missing wp yields open network");
    }

    #[test]
    fn wifi_pairs_stop_at_gap() {
        let doc = json!({"wn1": "a", "wp1": "x", "wn3": "c", "wp3": "z"});
        let creds = parse_wifi_pairs(&doc);
        assert_eq!(creds.len(), 1);
    }

    #[test]
    fn wifi_pairs_empty_object() {
        assert!(parse_wifi_pairs(&json!({})).is_empty());
    }
}
