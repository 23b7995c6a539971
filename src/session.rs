//! Gateway Session
//!
//! Single responsibility: Own the credentials, the endpoint map and the
//! current subscription channel, and keep the channel alive.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                        Session                          │
//! │  - authenticate() → id token + endpoint discovery       │
//! │  - connect() → reconnect loop with backoff              │
//! │  - device control over HTTPS GraphQL                    │
//! └────────────────────────────────────────────────────────┘
//!                 │                          │
//!                 ▼                          ▼
//!        Channel (graphql-ws)        EventDispatcher
//! ```
//!
//! # Reconnection Policy
//!
//! [`Session::connect`] runs until [`Session::close`] is called:
//! 1. Open a fresh channel and complete the handshake
//! 2. Poll it until it faults
//! 3. Dispatch `connection_lost`, wait out the backoff delay, go to 1
//!
//! Errors that no retry can fix (no token, no endpoints) end the loop
//! immediately. The loop reuses the id token it started with; callers that
//! run long enough for it to expire must re-authenticate and reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tokio::sync::{watch, OnceCell, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::ExponentialBackoff;
use crate::config::ClientConfig;
use crate::device::Barrier;
use crate::endpoints::{self, Endpoints};
use crate::error::{ChannelError, NiceGoError, Result};
use crate::events::{Event, EventDispatcher};
use crate::gateway::{Channel, ChannelTimeouts, Connector, Dispatch, WsConnector};
use crate::graphql::{self, BarrierCommand, DevicesControl, DevicesListAll, GraphQlRequest};
use crate::identity::{CognitoIdentityProvider, Credentials, IdentityProvider};

#[derive(Default)]
struct AuthState {
    id_token: Option<String>,
    endpoints: Option<Endpoints>,
    http: Option<reqwest::Client>,
}

struct Inner {
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
    connector: Arc<dyn Connector>,
    auth: RwLock<AuthState>,
    channel: RwLock<Option<Arc<Channel>>>,
    events: Arc<EventDispatcher>,
    closing: AtomicBool,
    closed: OnceCell<()>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a gateway session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Session backed by the user pool in `config.identity` and a real WebSocket.
    pub fn new(config: ClientConfig) -> Self {
        let identity = Arc::new(CognitoIdentityProvider::new(&config.identity));
        Self::with_parts(config, identity, Arc::new(WsConnector))
    }

    /// Session with explicit collaborators.
    pub fn with_parts(
        config: ClientConfig,
        identity: Arc<dyn IdentityProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                connector,
                auth: RwLock::new(AuthState::default()),
                channel: RwLock::new(None),
                events: Arc::new(EventDispatcher::new()),
                closing: AtomicBool::new(false),
                closed: OnceCell::new(),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Log in and discover endpoints. `http` is kept for every later HTTP call.
    ///
    /// Returns the refresh token, if the provider issued one.
    ///
    /// # Errors
    /// - `AuthFailed` if the provider rejects the credentials
    /// - `Api` for any other provider failure or a failed discovery
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        http: reqwest::Client,
    ) -> Result<Option<String>> {
        self.inner.auth.write().await.http = Some(http);
        self.authenticate_with(Credentials::Password {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    /// Like [`Session::authenticate`], trading a stored refresh token instead.
    pub async fn authenticate_refresh(
        &self,
        refresh_token: &str,
        http: reqwest::Client,
    ) -> Result<Option<String>> {
        self.inner.auth.write().await.http = Some(http);
        self.authenticate_with(Credentials::RefreshToken(refresh_token.to_string()))
            .await
    }

    async fn authenticate_with(&self, credentials: Credentials) -> Result<Option<String>> {
        let identity = Arc::clone(&self.inner.identity);
        let tokens = tokio::task::spawn_blocking(move || identity.authenticate(&credentials))
            .await
            .map_err(|e| NiceGoError::api_with("Identity worker failed", e))?
            .map_err(|e| {
                error!(code = %e.code, "Exception while authenticating");
                if e.is_not_authorized() {
                    NiceGoError::AuthFailed(e)
                } else {
                    NiceGoError::api_with("Identity provider error", e)
                }
            })?;

        let http = {
            let mut auth = self.inner.auth.write().await;
            auth.id_token = Some(tokens.id_token);
            auth.http.clone()
        }
        .ok_or_else(|| NiceGoError::Config("HTTP client not provided".into()))?;

        let endpoints = endpoints::discover(&http, &self.inner.config.endpoints_url).await?;
        self.inner.auth.write().await.endpoints = Some(endpoints);

        info!("Authenticated");
        Ok(tokens.refresh_token)
    }

    pub async fn id_token(&self) -> Option<String> {
        self.inner.auth.read().await.id_token.clone()
    }

    pub async fn endpoints(&self) -> Option<Endpoints> {
        self.inner.auth.read().await.endpoints.clone()
    }

    // =========================================================================
    // Subscription channel
    // =========================================================================

    /// Keep a subscription channel open until the session is closed.
    ///
    /// With `reconnect` false the first lost connection closes the session
    /// and is returned as the error.
    ///
    /// # Errors
    /// - `NoAuth` if not authenticated
    /// - `Api` if endpoints were never discovered
    /// - `WebSocket` if the connection is lost and `reconnect` is false
    pub async fn connect(&self, reconnect: bool) -> Result<()> {
        let mut backoff = ExponentialBackoff::new(&self.inner.config.backoff);
        let mut shutdown = self.inner.shutdown.subscribe();

        while !self.is_closed() {
            let error = match self.run_channel(&mut shutdown).await {
                Ok(()) => continue,
                Err(_) if self.is_closed() => break,
                Err(NiceGoError::WebSocket(e)) if e.is_connection_loss() => e,
                Err(e) => return Err(e),
            };

            self.dispatch(Event::ConnectionLost(error.clone()));
            self.discard_channel().await;

            if !reconnect {
                self.close().await;
                return Err(error.into());
            }
            if self.is_closed() {
                break;
            }

            let delay = backoff.delay();
            warn!(
                error = %error,
                retry_ms = delay.as_millis() as u64,
                "Connection lost, reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|closing| *closing) => break,
            }
        }

        Ok(())
    }

    /// One channel from connect to fault. `Ok` means the session is closing.
    async fn run_channel(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let (id_token, endpoints) = {
            let auth = self.inner.auth.read().await;
            let id_token = auth.id_token.clone().ok_or(NiceGoError::NoAuth)?;
            let endpoints = auth
                .endpoints
                .clone()
                .ok_or_else(|| NiceGoError::api("Endpoints not available"))?;
            (id_token, endpoints)
        };
        let wss = endpoints.device_wss()?;
        let https = endpoints.device_https()?;

        let opening = Channel::open(
            self.inner.connector.as_ref(),
            &id_token,
            &wss,
            self.dispatcher(),
            https.host_str(),
            ChannelTimeouts::from(&self.inner.config),
        );
        let channel = tokio::select! {
            opened = opening => Arc::new(opened?),
            _ = shutdown.wait_for(|closing| *closing) => return Ok(()),
        };

        // Published before init(): `connected` listeners subscribe through the session
        *self.inner.channel.write().await = Some(Arc::clone(&channel));
        if self.is_closed() {
            // close() ran while connecting and found no channel to close
            self.discard_channel().await;
            return Ok(());
        }

        tokio::select! {
            ready = channel.init() => ready?,
            _ = shutdown.wait_for(|closing| *closing) => return Ok(()),
        }

        loop {
            tokio::select! {
                polled = channel.poll() => polled?,
                _ = shutdown.wait_for(|closing| *closing) => return Ok(()),
            }
        }
    }

    async fn discard_channel(&self) {
        let channel = self.inner.channel.write().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing channel");
            }
        }
    }

    /// The current channel, if one is connected.
    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.channel.read().await.clone()
    }

    /// Subscribe `receiver` on the current channel.
    ///
    /// # Errors
    /// `WebSocket(Unavailable)` if no channel is connected.
    pub async fn subscribe(&self, receiver: &str) -> Result<String> {
        let channel = self.channel().await.ok_or(ChannelError::Unavailable)?;
        channel.subscribe(receiver).await
    }

    /// Stop a subscription on the current channel.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let channel = self.channel().await.ok_or(ChannelError::Unavailable)?;
        channel.unsubscribe(subscription_id).await
    }

    /// Stop the connect loop and close the channel. Safe to call repeatedly
    /// and from several tasks; all callers return once the close completes.
    pub async fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        self.inner
            .closed
            .get_or_init(|| async {
                self.discard_channel().await;
                info!("Session closed");
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Register a listener. See [`EventDispatcher::on`].
    pub fn on<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.events.on(event, handler);
    }

    /// Run every listener registered for `event` as a background task.
    ///
    /// Listeners still running when the last session handle is dropped are
    /// left to finish.
    ///
    /// # Panics
    /// If called outside a tokio runtime while `event` has listeners.
    pub fn dispatch(&self, event: Event) {
        self.inner.events.dispatch(event);
    }

    /// Wait for every listener dispatched so far to finish.
    pub async fn wait_for_events(&self) {
        self.inner.events.wait_idle().await;
    }

    fn dispatcher(&self) -> Dispatch {
        let events = Arc::clone(&self.inner.events);
        Arc::new(move |event| events.dispatch(event))
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub async fn get_all_barriers(&self) -> Result<Vec<Barrier>> {
        let data: DevicesListAll = self.execute(&graphql::get_all_barriers()).await?;
        data.devices_list_all
            .devices
            .into_iter()
            .map(|record| Barrier::from_record(record, self.clone()))
            .collect()
    }

    pub async fn open_barrier(&self, barrier_id: &str) -> Result<bool> {
        self.control(barrier_id, BarrierCommand::Open).await
    }

    pub async fn close_barrier(&self, barrier_id: &str) -> Result<bool> {
        self.control(barrier_id, BarrierCommand::Close).await
    }

    pub async fn light_on(&self, barrier_id: &str) -> Result<bool> {
        self.control(barrier_id, BarrierCommand::LightOn).await
    }

    pub async fn light_off(&self, barrier_id: &str) -> Result<bool> {
        self.control(barrier_id, BarrierCommand::LightOff).await
    }

    pub async fn vacation_mode_on(&self, barrier_id: &str) -> Result<bool> {
        self.control(barrier_id, BarrierCommand::VacationModeOn).await
    }

    pub async fn vacation_mode_off(&self, barrier_id: &str) -> Result<bool> {
        self.control(barrier_id, BarrierCommand::VacationModeOff).await
    }

    async fn control(&self, barrier_id: &str, command: BarrierCommand) -> Result<bool> {
        debug!(barrier = %barrier_id, command = command.name(), "Sending command");
        let data: DevicesControl = self.execute(&graphql::control(barrier_id, command)).await?;
        Ok(data.devices_control)
    }

    /// Token, HTTP client and device API URL, checked in that order.
    async fn device_api(&self) -> Result<(String, reqwest::Client, Url)> {
        let auth = self.inner.auth.read().await;
        let id_token = auth.id_token.clone().ok_or(NiceGoError::NoAuth)?;
        let http = auth
            .http
            .clone()
            .ok_or_else(|| NiceGoError::Config("HTTP client not provided".into()))?;
        let url = auth
            .endpoints
            .as_ref()
            .ok_or_else(|| NiceGoError::api("Endpoints not available"))?
            .device_https()?;
        Ok((id_token, http, url))
    }

    async fn execute<T: DeserializeOwned>(&self, request: &GraphQlRequest) -> Result<T> {
        let (id_token, http, url) = self.device_api().await?;

        let response = http
            .post(url)
            .header(AUTHORIZATION, id_token)
            .header(CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NiceGoError::api(format!(
                "{} failed ({status}): {body}",
                request.operation_name
            )));
        }

        let body = response.bytes().await?;
        debug!(operation = request.operation_name, bytes = body.len(), "Device API response");
        graphql::GraphQlResponse::<T>::from_slice(&body)?.into_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockIdentityProvider};

    fn session() -> Session {
        Session::with_parts(
            ClientConfig::default(),
            Arc::new(MockIdentityProvider::default()),
            Arc::new(MockConnector::new()),
        )
    }

    #[tokio::test]
    async fn test_connect_requires_token() {
        let result = session().connect(true).await;
        assert!(matches!(result, Err(NiceGoError::NoAuth)));
    }

    #[tokio::test]
    async fn test_subscribe_without_channel() {
        let result = session().subscribe("receiver").await;
        assert!(matches!(
            result,
            Err(NiceGoError::WebSocket(ChannelError::Unavailable))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = session();
        session.close().await;
        session.close().await;
        assert!(session.is_closed());

        // closed sessions do not connect
        assert!(session.connect(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_calls_require_token_first() {
        let session = session();
        assert!(matches!(
            session.get_all_barriers().await,
            Err(NiceGoError::NoAuth)
        ));
        assert!(matches!(
            session.light_off("barrier").await,
            Err(NiceGoError::NoAuth)
        ));
    }
}
