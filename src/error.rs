//! Error types for nice-go

use thiserror::Error;

use crate::identity::IdentityError;

pub type Result<T, E = NiceGoError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum NiceGoError {
    #[error("Not authenticated")]
    NoAuth,

    #[error("Authentication failed: {0}")]
    AuthFailed(#[source] IdentityError),

    #[error("API error: {message}")]
    Api {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Attribute with key {0} not found.")]
    AttributeNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NiceGoError {
    /// Api error without an underlying cause.
    pub fn api(message: impl Into<String>) -> Self {
        NiceGoError::Api {
            message: message.into(),
            source: None,
        }
    }

    /// Api error wrapping the cause that produced it.
    pub fn api_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        NiceGoError::Api {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failures of the subscription channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("WebSocket connection is closed")]
    Closed,

    #[error("No WebSocket connection ready")]
    Unavailable,

    #[error("Connection to the websocket server timed out")]
    HandshakeTimeout,

    #[error("Subscription to the websocket server timed out")]
    SubscribeTimeout,

    #[error("No message received within {0:?}")]
    ReceiveTimeout(std::time::Duration),

    #[error("Keepalive not received within {0:?}")]
    KeepaliveTimeout(std::time::Duration),

    #[error("Expected connection_ack, but received {0}")]
    UnexpectedFrame(String),

    #[error("Received invalid JSON message: {0}")]
    Malformed(String),

    #[error("Received error message: {0}")]
    Remote(String),

    #[error("WebSocket connection closed")]
    ConnectionClosed,

    #[error("WebSocket transport error: {0}")]
    Transport(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),
}

impl ChannelError {
    /// Whether the connect loop treats this as a lost connection worth retrying.
    ///
    /// Misuse (`Unavailable`, `UnknownSubscription`) is never retried.
    pub fn is_connection_loss(&self) -> bool {
        !matches!(
            self,
            ChannelError::Unavailable | ChannelError::UnknownSubscription(_)
        )
    }
}
