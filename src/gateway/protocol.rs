//! graphql-ws Wire Protocol
//!
//! Single responsibility: Build outbound frames and classify inbound ones.
//!
//! # Connection URL
//!
//! The gateway authenticates the upgrade request through two query
//! parameters on the WebSocket endpoint:
//!
//! ```text
//! wss://<device-endpoint>?header=<base64(json)>&payload=e30=
//!
//! header  = base64({"Authorization": <id_token>, "host": <https host>})
//! payload = base64("{}")
//! ```
//!
//! # Frames
//!
//! ```text
//! -> {"type": "connection_init"}
//! <- {"type": "connection_ack", "payload": {"connectionTimeoutMs": 300000}}
//!
//! -> {"id": <uuid>, "type": "start", "payload": {
//!        "data": "<json string: query + variables>",
//!        "extensions": {"authorization": {"Authorization": <id_token>, "host": <host>}}
//!    }}
//! <- {"id": <uuid>, "type": "start_ack"}
//!
//! <- {"id": <uuid>, "type": "data", "payload": {...}}
//! <- {"type": "ka"}
//! <- {"type": "error", "payload": {...}}
//!
//! -> {"id": <uuid>, "type": "stop"}
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

use crate::error::ChannelError;

pub const CONNECTION_INIT: &str = "connection_init";
pub const CONNECTION_ACK: &str = "connection_ack";
pub const START: &str = "start";
pub const START_ACK: &str = "start_ack";
pub const STOP: &str = "stop";
pub const DATA: &str = "data";
pub const ERROR: &str = "error";
pub const KEEPALIVE: &str = "ka";

/// Base64 of `{}`.
const EMPTY_PAYLOAD: &str = "e30=";

/// Device state feed for one receiver.
pub const WATCH_QUERY: &str = "subscription devicesStatesUpdateFeed($receiver: ID!) { \
devicesStatesUpdateFeed(receiver: $receiver) { receiver item { __typename deviceId \
desired reported timestamp version connectionState { connected updatedTimestamp } } } }";

#[derive(Serialize)]
struct Authorization<'a> {
    #[serde(rename = "Authorization")]
    authorization: &'a str,
    host: &'a str,
}

#[derive(Serialize)]
struct StartFrame<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    payload: StartPayload<'a>,
}

#[derive(Serialize)]
struct StartPayload<'a> {
    /// The subscription request, serialized a second time.
    data: String,
    extensions: Extensions<'a>,
}

#[derive(Serialize)]
struct Extensions<'a> {
    authorization: Authorization<'a>,
}

/// Add the `header` and `payload` query parameters to the device WebSocket endpoint.
pub fn connection_url(endpoint: &Url, id_token: &str, host: &str) -> Result<Url, ChannelError> {
    let header = serde_json::to_vec(&Authorization {
        authorization: id_token,
        host,
    })
    .map_err(|e| ChannelError::Transport(format!("Failed to encode header: {}", e)))?;

    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("header", &STANDARD.encode(header))
        .append_pair("payload", EMPTY_PAYLOAD);
    Ok(url)
}

pub fn connection_init() -> Value {
    json!({ "type": CONNECTION_INIT })
}

/// Subscribe `receiver` to the device state feed under `id`.
pub fn start(id: &str, receiver: &str, id_token: &str, host: &str) -> Result<Value, ChannelError> {
    let data = json!({
        "query": WATCH_QUERY,
        "variables": { "receiver": receiver },
    })
    .to_string();

    serde_json::to_value(StartFrame {
        id,
        kind: START,
        payload: StartPayload {
            data,
            extensions: Extensions {
                authorization: Authorization {
                    authorization: id_token,
                    host,
                },
            },
        },
    })
    .map_err(|e| ChannelError::Transport(format!("Failed to encode start frame: {}", e)))
}

pub fn stop(id: &str) -> Value {
    json!({ "type": STOP, "id": id })
}

/// Parse an inbound text frame. Frames without a string `type` are malformed.
pub fn parse_frame(text: &str) -> Result<Value, ChannelError> {
    let frame: Value =
        serde_json::from_str(text).map_err(|_| ChannelError::Malformed(text.to_string()))?;
    if frame_type(&frame).is_none() {
        return Err(ChannelError::Malformed(text.to_string()));
    }
    Ok(frame)
}

pub fn frame_type(frame: &Value) -> Option<&str> {
    frame.get("type")?.as_str()
}

pub fn frame_id(frame: &Value) -> Option<&str> {
    frame.get("id")?.as_str()
}

/// Keepalive window announced in `connection_ack`, if any.
pub fn keepalive_window_ms(ack: &Value) -> Option<u64> {
    ack.pointer("/payload/connectionTimeoutMs")?.as_u64()
}
