//! Test doubles for the gateway transport and the identity provider.
//!
//! [`MockConnector`] hands out scripted connections in order. Each connection
//! comes with a [`MockHandle`] that feeds inbound frames and observes what
//! the client sent.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use url::Url;

use crate::error::ChannelError;
use crate::gateway::transport::{Connector, FrameSink, FrameStream, Inbound};
use crate::identity::{IdentityError, IdentityProvider, Tokens};

/// Send half of a mock connection.
pub struct MockSink {
    sent: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Receive half of a mock connection. Reports `Closed` once its handle is dropped.
pub struct MockStream {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Test side of a mock connection.
pub struct MockHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    sent: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

/// Create a connected sink, stream and handle.
pub fn mock_transport() -> (MockSink, MockStream, MockHandle) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    (
        MockSink {
            sent: sent_tx,
            closed: Arc::clone(&closed),
        },
        MockStream {
            inbound: inbound_rx,
        },
        MockHandle {
            inbound: inbound_tx,
            sent: sent_rx,
            closed,
        },
    )
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        // The handle may already be gone; the frame is simply lost
        let _ = self.sent.send(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FrameStream for MockStream {
    async fn recv(&mut self) -> Inbound {
        self.inbound.recv().await.unwrap_or(Inbound::Closed)
    }
}

impl MockHandle {
    /// Queue an inbound event.
    pub fn push(&self, inbound: Inbound) {
        let _ = self.inbound.send(inbound);
    }

    /// Queue an inbound text frame.
    pub fn push_json(&self, frame: Value) {
        self.push(Inbound::Text(frame.to_string()));
    }

    /// Simulate the server closing the connection.
    pub fn close_remote(&self) {
        self.push(Inbound::Closed);
    }

    /// Next frame sent by the client, parsed as JSON.
    pub async fn next_sent(&mut self) -> Option<Value> {
        let text = self.sent.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Frames sent so far and not yet observed.
    pub fn try_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            frames.push(text);
        }
        frames
    }

    /// Whether the client closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connector that replays scripted connections in order.
///
/// Connecting with an empty script fails with a transport error.
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<(MockSink, MockStream)>>,
    urls: Mutex<Vec<Url>>,
    protocols: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next connection and return its handle.
    pub fn push_connection(&self) -> MockHandle {
        let (sink, stream, handle) = mock_transport();
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back((sink, stream));
        handle
    }

    /// Number of connection attempts, including failed ones.
    pub fn connect_count(&self) -> usize {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// URLs of every connection attempt, in order.
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sub-protocols requested by every connection attempt.
    pub fn protocols(&self) -> Vec<String> {
        self.protocols
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &Url,
        protocol: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ChannelError> {
        self.urls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());
        self.protocols
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(protocol.to_string());

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some((sink, stream)) => Ok((Box::new(sink), Box::new(stream))),
            None => Err(ChannelError::Transport("connection refused".into())),
        }
    }
}

/// Identity provider with a fixed answer.
pub struct MockIdentityProvider {
    result: Result<Tokens, IdentityError>,
    password_calls: AtomicU32,
    refresh_calls: AtomicU32,
}

impl MockIdentityProvider {
    /// Always returns `id_token` with no refresh token.
    pub fn new(id_token: impl Into<String>) -> Self {
        Self {
            result: Ok(Tokens {
                id_token: id_token.into(),
                refresh_token: None,
            }),
            password_calls: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
        }
    }

    /// Include a refresh token in successful answers.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        if let Ok(tokens) = &mut self.result {
            tokens.refresh_token = Some(refresh_token.into());
        }
        self
    }

    /// Fail every call with `error`.
    pub fn with_error(mut self, error: IdentityError) -> Self {
        self.result = Err(error);
        self
    }

    pub fn password_calls(&self) -> u32 {
        self.password_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockIdentityProvider {
    fn default() -> Self {
        Self::new("test_token")
    }
}

impl IdentityProvider for MockIdentityProvider {
    fn obtain_token(&self, _username: &str, _password: &str) -> Result<Tokens, IdentityError> {
        self.password_calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }

    fn refresh(&self, _refresh_token: &str) -> Result<Tokens, IdentityError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}
