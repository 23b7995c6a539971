//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use nice_go::mock::{MockConnector, MockIdentityProvider};
use nice_go::{ClientConfig, Session};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nice_go=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Upper bound for anything a test awaits.
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn config_for(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.endpoints_url = format!("{}/endpoints", server.uri());
    config.handshake_timeout_secs = 2;
    config.subscribe_timeout_secs = 2;
    config.backoff.base_ms = 1;
    config
}

/// Serve the endpoint map, pointing the device API at `server` itself.
pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/endpoints"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "endpoints": {
                "GraphQL": {
                    "device": {
                        "wss": "wss://gateway.example.test/graphql",
                        "https": format!("{}/graphql", server.uri()),
                    }
                }
            }
        })))
        .mount(server)
        .await;
}

pub struct Harness {
    pub server: MockServer,
    pub session: Session,
    pub identity: Arc<MockIdentityProvider>,
    pub connector: Arc<MockConnector>,
}

impl Harness {
    /// Session wired to a mock server with discovery mounted, not yet authenticated.
    pub async fn new() -> Self {
        Self::with_identity(MockIdentityProvider::new("test_token").with_refresh_token("refresh"))
            .await
    }

    pub async fn with_identity(identity: MockIdentityProvider) -> Self {
        init_tracing();
        let server = MockServer::start().await;
        mount_discovery(&server).await;

        let identity = Arc::new(identity);
        let connector = Arc::new(MockConnector::new());
        let session = Session::with_parts(
            config_for(&server),
            Arc::clone(&identity) as Arc<dyn nice_go::IdentityProvider>,
            Arc::clone(&connector) as Arc<dyn nice_go::gateway::Connector>,
        );

        Self {
            server,
            session,
            identity,
            connector,
        }
    }

    /// Authenticated session.
    pub async fn authenticated() -> Self {
        let harness = Self::new().await;
        harness
            .session
            .authenticate("username", "password", reqwest::Client::new())
            .await
            .unwrap();
        harness
    }
}

pub fn barrier_list() -> Value {
    json!({
        "data": {
            "devicesListAll": {
                "devices": [{
                    "state": {
                        "connectionState": { "connected": true, "updatedTimestamp": "1234567890" },
                        "deviceId": "test_id",
                        "desired": "{\"test\": \"value\"}",
                        "reported": "{\"test\": \"value\"}",
                        "timestamp": "1234567890",
                        "version": 1
                    },
                    "id": "test_id",
                    "type": "test_type",
                    "controlLevel": "test_control_level",
                    "attr": [{ "key": "test_key", "value": "test_value" }]
                }]
            }
        }
    })
}
