//! Configuration for nice-go

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{NiceGoError, Result};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Discovery URL returning the service endpoint map
    #[serde(default = "default_endpoints_url")]
    pub endpoints_url: String,

    /// Identity provider settings
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Seconds to wait for `connection_ack` after `connection_init`
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Seconds to wait for `start_ack` after a subscribe request
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,

    /// Seconds of silence on the channel before it is considered lost
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,

    /// Reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Region hosting the user pool
    #[serde(default = "default_region")]
    pub region: String,

    /// App client ID of the user pool
    #[serde(default)]
    pub client_id: String,

    /// Override for the provider endpoint (defaults to the regional endpoint)
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,

    /// Largest exponent applied to the base delay
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
}

fn default_endpoints_url() -> String {
    "https://prod.api.nortek-smartcontrol.com/endpoints".to_string()
}

fn default_region() -> String {
    "eu-west-1".to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_subscribe_timeout() -> u64 {
    10
}

fn default_receive_timeout() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_exponent() -> u32 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints_url: default_endpoints_url(),
            identity: IdentityConfig::default(),
            handshake_timeout_secs: default_handshake_timeout(),
            subscribe_timeout_secs: default_subscribe_timeout(),
            receive_timeout_secs: default_receive_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            client_id: String::new(),
            endpoint: None,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_exponent: default_max_exponent(),
        }
    }
}

impl ClientConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| NiceGoError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| NiceGoError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }
}

impl IdentityConfig {
    /// Provider endpoint, regional unless overridden
    pub fn endpoint_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://cognito-idp.{}.amazonaws.com/", self.region))
    }
}

impl BackoffConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }
}
