//! WebSocket Transport Layer
//!
//! Single responsibility: Open a WebSocket with a sub-protocol and move text frames.
//! No knowledge of the graphql-ws protocol, subscriptions, or sessions.
//!
//! The transport is split into a [`FrameSink`] and a [`FrameStream`] at
//! connect time so the channel can send (subscribe, stop) while another task
//! is blocked receiving.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::Message,
        Error as WsError,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::ChannelError;

/// Sub-protocol token required by the gateway.
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// One inbound event from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame
    Text(String),
    /// Close frame received or stream ended
    Closed,
    /// Transport-level failure
    Error(String),
}

/// Send half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Receive half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Wait for the next text frame or a terminal condition.
    ///
    /// Non-text frames (binary, ping, pong) are skipped.
    async fn recv(&mut self) -> Inbound;
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
        protocol: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ChannelError>;
}

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

pub struct WsSink(SplitSink<Ws, Message>);

pub struct WsStream(SplitStream<Ws>);

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &Url,
        protocol: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ChannelError> {
        debug!(host = ?url.host_str(), path = %url.path(), "Connecting to WebSocket");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Transport(format!("Failed to build request: {}", e)))?;
        let protocol = HeaderValue::from_str(protocol)
            .map_err(|e| ChannelError::Transport(format!("Invalid sub-protocol: {}", e)))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| ChannelError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(host = ?url.host_str(), "WebSocket connected");
        Ok((Box::new(WsSink(sink)), Box::new(WsStream(stream))))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
                other => ChannelError::Transport(format!("Failed to send: {}", other)),
            })
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        match self.0.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(ChannelError::Transport(format!("Failed to close: {}", e))),
        }
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn recv(&mut self) -> Inbound {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => return Inbound::Text(text),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Server closed connection");
                    return Inbound::Closed;
                }
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | None => return Inbound::Closed,
                Some(Err(e)) => return Inbound::Error(e.to_string()),
            }
        }
    }
}
