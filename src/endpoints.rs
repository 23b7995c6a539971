//! Endpoint discovery
//!
//! The discovery URL answers with a nested map:
//!
//! ```text
//! {"endpoints": {"GraphQL": {"device": {"wss": "...", "https": "..."}}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::{NiceGoError, Result};

/// API name → service name → scheme → URL.
///
/// Kept as the document the gateway sent. Entries of any other shape are
/// carried along and only matter if looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoints(Map<String, Value>);

#[derive(Deserialize)]
struct DiscoveryResponse {
    endpoints: Endpoints,
}

impl Endpoints {
    pub fn get(&self, api: &str, service: &str, scheme: &str) -> Option<&str> {
        self.0.get(api)?.get(service)?.get(scheme)?.as_str()
    }

    pub fn url(&self, api: &str, service: &str, scheme: &str) -> Result<Url> {
        let raw = self
            .get(api, service, scheme)
            .ok_or_else(|| NiceGoError::api(format!("Endpoint {api}.{service}.{scheme} missing")))?;
        Url::parse(raw).map_err(|e| NiceGoError::api_with(format!("Invalid endpoint {raw}"), e))
    }

    /// WebSocket endpoint of the device subscription gateway.
    pub fn device_wss(&self) -> Result<Url> {
        self.url("GraphQL", "device", "wss")
    }

    /// HTTPS endpoint of the device GraphQL API.
    pub fn device_https(&self) -> Result<Url> {
        self.url("GraphQL", "device", "https")
    }

    /// Set one URL, replacing any non-object entry on the way.
    pub fn insert(&mut self, api: &str, service: &str, scheme: &str, url: impl Into<String>) {
        let api = self.0.entry(api).or_insert(Value::Null);
        if !api.is_object() {
            *api = Value::Null;
        }
        let service = &mut api[service];
        if !service.is_object() {
            *service = Value::Null;
        }
        service[scheme] = Value::String(url.into());
    }
}

/// Fetch the endpoint map from `discovery_url`.
pub async fn discover(http: &reqwest::Client, discovery_url: &str) -> Result<Endpoints> {
    debug!(url = %discovery_url, "Discovering endpoints");

    let response = http.get(discovery_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(NiceGoError::api(format!(
            "Endpoint discovery failed ({status}): {body}"
        )));
    }

    let discovered: DiscoveryResponse = response.json().await?;
    Ok(discovered.endpoints)
}
