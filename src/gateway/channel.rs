//! Subscription Channel
//!
//! Single responsibility: One graphql-ws connection from handshake to close.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──init()──▶ AwaitingAck ──connection_ack──▶ Ready ──close()──▶ Closing ──▶ Closed
//!                                │                         │
//!                                └──── timeout / close ────┴──▶ Faulted
//! ```
//!
//! A channel is never reopened. The session's connect loop builds a new one
//! after a fault.
//!
//! # Concurrency
//!
//! The send and receive halves sit behind separate locks: one task drives
//! [`Channel::poll`] while others call [`Channel::subscribe`] and
//! [`Channel::unsubscribe`]. A subscribe registers its `start_ack` waiter
//! before the `start` frame goes out, and the polling task resolves it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::correlation::Registry;
use super::protocol::{self, frame_id, frame_type};
use super::transport::{Connector, FrameSink, FrameStream, Inbound, GRAPHQL_WS_PROTOCOL};
use crate::config::ClientConfig;
use crate::error::{ChannelError, NiceGoError, Result};
use crate::events::Event;

/// Receives events produced by the channel (`connected`, `data`).
pub type Dispatch = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    AwaitingAck,
    Ready,
    Closing,
    Closed,
    Faulted,
}

/// Bounded waits applied by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    pub handshake: Duration,
    pub subscribe: Duration,
    pub receive: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ChannelTimeouts {
    fn from(config: &ClientConfig) -> Self {
        Self {
            handshake: config.handshake_timeout(),
            subscribe: config.subscribe_timeout(),
            receive: config.receive_timeout(),
        }
    }
}

/// A frame handed to [`Channel::send`].
#[derive(Debug, Clone)]
pub enum Outbound {
    Json(Value),
    /// Already serialized text, sent as is
    Raw(String),
}

impl From<Value> for Outbound {
    fn from(value: Value) -> Self {
        Outbound::Json(value)
    }
}

impl From<String> for Outbound {
    fn from(text: String) -> Self {
        Outbound::Raw(text)
    }
}

impl From<&str> for Outbound {
    fn from(text: &str) -> Self {
        Outbound::Raw(text.to_string())
    }
}

struct Keepalive {
    window: Duration,
    deadline: Instant,
}

pub struct Channel {
    sink: Mutex<Box<dyn FrameSink>>,
    stream: Mutex<Box<dyn FrameStream>>,
    registry: Registry,
    subscriptions: Mutex<Vec<String>>,
    state: StdMutex<ChannelState>,
    keepalive: StdMutex<Keepalive>,
    dispatch: Dispatch,
    id_token: String,
    host: String,
    timeouts: ChannelTimeouts,
}

impl Channel {
    /// Open a connection to `endpoint` and complete the handshake.
    ///
    /// `host` is the HTTPS API host the gateway expects in the auth header.
    ///
    /// # Errors
    /// - `Config` if `host` is missing
    /// - `WebSocket` if the connection or handshake fails
    pub async fn connect(
        connector: &dyn Connector,
        id_token: &str,
        endpoint: &Url,
        dispatch: Dispatch,
        host: Option<&str>,
        timeouts: ChannelTimeouts,
    ) -> Result<Self> {
        let channel = Self::open(connector, id_token, endpoint, dispatch, host, timeouts).await?;
        if let Err(e) = channel.init().await {
            channel.shutdown_transport().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Open the connection without the handshake. Call [`Channel::init`] next.
    pub async fn open(
        connector: &dyn Connector,
        id_token: &str,
        endpoint: &Url,
        dispatch: Dispatch,
        host: Option<&str>,
        timeouts: ChannelTimeouts,
    ) -> Result<Self> {
        let host = host.ok_or_else(|| NiceGoError::Config("host must be provided".into()))?;
        let url = protocol::connection_url(endpoint, id_token, host)?;

        info!(endpoint = %endpoint, "Opening subscription channel");
        let (sink, stream) = connector.connect(&url, GRAPHQL_WS_PROTOCOL).await?;

        Ok(Self::from_transport(sink, stream, id_token, host, dispatch, timeouts))
    }

    /// Wrap an already open transport. Call [`Channel::init`] before use.
    pub fn from_transport(
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        id_token: &str,
        host: &str,
        dispatch: Dispatch,
        timeouts: ChannelTimeouts,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            registry: Registry::new(),
            subscriptions: Mutex::new(Vec::new()),
            state: StdMutex::new(ChannelState::Connecting),
            keepalive: StdMutex::new(Keepalive {
                window: timeouts.receive,
                deadline: Instant::now() + timeouts.receive,
            }),
            dispatch,
            id_token: id_token.to_string(),
            host: host.to_string(),
            timeouts,
        }
    }

    /// Send `connection_init` and wait for `connection_ack`.
    ///
    /// Dispatches [`Event::Connected`] on success.
    pub async fn init(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed.into());
        }

        self.send(protocol::connection_init()).await?;
        self.set_state(ChannelState::AwaitingAck);

        let inbound = {
            let mut stream = self.stream.lock().await;
            timeout(self.timeouts.handshake, stream.recv()).await
        };

        let text = match inbound {
            Ok(Inbound::Text(text)) => text,
            Ok(Inbound::Closed) => return Err(self.fault(ChannelError::ConnectionClosed).await),
            Ok(Inbound::Error(e)) => return Err(self.fault(ChannelError::Transport(e)).await),
            Err(_) => return Err(self.fault(ChannelError::HandshakeTimeout).await),
        };

        let ack = match protocol::parse_frame(&text) {
            Ok(frame) => frame,
            Err(e) => return Err(self.fault(e).await),
        };
        let kind = frame_type(&ack).unwrap_or_default();
        if kind != protocol::CONNECTION_ACK {
            return Err(self
                .fault(ChannelError::UnexpectedFrame(kind.to_string()))
                .await);
        }

        if let Some(ms) = protocol::keepalive_window_ms(&ack) {
            self.lock_keepalive().window = Duration::from_millis(ms);
        }
        self.reset_keepalive();
        self.set_state(ChannelState::Ready);

        info!("Subscription channel ready");
        (self.dispatch)(Event::Connected);
        Ok(())
    }

    /// Serialize (if needed) and write one frame.
    pub async fn send(&self, frame: impl Into<Outbound>) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed.into());
        }

        let text = match frame.into() {
            Outbound::Json(value) => serde_json::to_string(&value)?,
            Outbound::Raw(text) => text,
        };

        self.sink.lock().await.send_text(text).await?;
        Ok(())
    }

    /// Receive and handle one inbound frame.
    ///
    /// Waits at most the receive timeout, or until the keepalive deadline if
    /// that comes first. Any failure faults the channel and fails every
    /// outstanding waiter.
    pub async fn poll(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed.into());
        }

        let receive_deadline = Instant::now() + self.timeouts.receive;
        let (keepalive_deadline, window) = {
            let keepalive = self.lock_keepalive();
            (keepalive.deadline, keepalive.window)
        };
        let deadline = receive_deadline.min(keepalive_deadline);

        let inbound = {
            let mut stream = self.stream.lock().await;
            timeout_at(deadline, stream.recv()).await
        };

        match inbound {
            Ok(Inbound::Text(text)) => match self.received_message(&text).await {
                Ok(()) => Ok(()),
                Err(e) => Err(self.fault(e).await),
            },
            Ok(Inbound::Closed) => Err(self.fault(ChannelError::ConnectionClosed).await),
            Ok(Inbound::Error(e)) => Err(self.fault(ChannelError::Transport(e)).await),
            Err(_) if keepalive_deadline <= receive_deadline => {
                Err(self.fault(ChannelError::KeepaliveTimeout(window)).await)
            }
            Err(_) => Err(self
                .fault(ChannelError::ReceiveTimeout(self.timeouts.receive))
                .await),
        }
    }

    async fn received_message(&self, text: &str) -> std::result::Result<(), ChannelError> {
        let frame = protocol::parse_frame(text)?;

        match frame_type(&frame) {
            Some(protocol::DATA) => {
                let payload = frame.get("payload").cloned().unwrap_or(Value::Null);
                (self.dispatch)(Event::Data(payload));
            }
            Some(protocol::ERROR) => return Err(ChannelError::Remote(frame.to_string())),
            Some(protocol::KEEPALIVE) => {
                debug!("Keepalive received");
                self.reset_keepalive();
            }
            _ => {}
        }

        self.registry.on_frame(&frame).await;
        Ok(())
    }

    /// Subscribe `receiver` to the device state feed.
    ///
    /// Returns the subscription id once the gateway acknowledges it.
    ///
    /// # Errors
    /// - `Closed` if the channel has closed or faulted
    /// - `Unavailable` until the handshake has completed
    /// - `SubscribeTimeout` if no `start_ack` arrives in time
    pub async fn subscribe(&self, receiver: &str) -> Result<String> {
        match self.state() {
            ChannelState::Ready => {}
            ChannelState::Closed | ChannelState::Faulted => return Err(ChannelError::Closed.into()),
            _ => return Err(ChannelError::Unavailable.into()),
        }

        let subscription_id = Uuid::new_v4().to_string();
        let frame = protocol::start(&subscription_id, receiver, &self.id_token, &self.host)?;

        let expected = subscription_id.clone();
        let ack = self
            .registry
            .wait_for(
                protocol::START_ACK,
                Some(Box::new(move |frame| {
                    Ok(frame_id(frame) == Some(expected.as_str()))
                })),
            )
            .await;

        self.send(frame).await?;

        match timeout(self.timeouts.subscribe, ack).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ChannelError::SubscribeTimeout.into()),
        }

        self.subscriptions.lock().await.push(subscription_id.clone());
        info!(subscription = %subscription_id, receiver = %receiver, "Subscribed");
        Ok(subscription_id)
    }

    /// Stop a subscription created by this channel.
    ///
    /// # Errors
    /// `UnknownSubscription` if `subscription_id` is not active here.
    /// Nothing is sent in that case.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(position) = subscriptions.iter().position(|s| s == subscription_id) else {
            return Err(ChannelError::UnknownSubscription(subscription_id.to_string()).into());
        };

        self.send(protocol::stop(subscription_id)).await?;
        subscriptions.remove(position);

        debug!(subscription = %subscription_id, "Unsubscribed");
        Ok(())
    }

    /// Stop every subscription and close the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let previous = self.replace_state(ChannelState::Closing);
        match previous {
            ChannelState::Closing | ChannelState::Closed => {
                self.set_state(previous);
                return Ok(());
            }
            ChannelState::Faulted => {
                self.shutdown_transport().await;
                return Ok(());
            }
            _ => {}
        }

        let active = self.subscriptions.lock().await.clone();
        for id in active {
            if let Err(e) = self.unsubscribe(&id).await {
                warn!(subscription = %id, error = %e, "Failed to stop subscription");
            }
        }

        self.shutdown_transport().await;
        info!("Subscription channel closed");
        Ok(())
    }

    /// True once the channel has closed or faulted.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ChannelState::Closed | ChannelState::Faulted)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    /// Keepalive window in effect, from `connection_ack` or the receive timeout.
    pub fn keepalive_window(&self) -> Duration {
        self.lock_keepalive().window
    }

    #[cfg(test)]
    fn registry(&self) -> &Registry {
        &self.registry
    }

    async fn fault(&self, error: ChannelError) -> NiceGoError {
        warn!(error = %error, "Subscription channel faulted");
        self.set_state(ChannelState::Faulted);
        self.registry.fail_all(error.clone()).await;
        error.into()
    }

    async fn shutdown_transport(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "Error closing transport");
        }
        self.set_state(ChannelState::Closed);
        self.registry.fail_all(ChannelError::Closed).await;
    }

    fn set_state(&self, state: ChannelState) {
        self.replace_state(state);
    }

    fn replace_state(&self, state: ChannelState) -> ChannelState {
        std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            state,
        )
    }

    fn lock_keepalive(&self) -> std::sync::MutexGuard<'_, Keepalive> {
        self.keepalive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reset_keepalive(&self) {
        let mut keepalive = self.lock_keepalive();
        keepalive.deadline = Instant::now() + keepalive.window;
    }
}
