//! Identity Provider
//!
//! Single responsibility: Turn credentials into [`Tokens`].
//!
//! The session only needs two calls from the provider:
//!
//! - `obtain_token(username, password)` for a fresh login
//! - `refresh(refresh_token)` to trade a stored refresh token for new tokens
//!
//! Both are blocking. The session runs them through
//! `tokio::task::spawn_blocking` so they never stall the executor.
//!
//! [`CognitoIdentityProvider`] speaks the user pool JSON API directly
//! (`USER_PASSWORD_AUTH` and `REFRESH_TOKEN_AUTH` flows).

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::IdentityConfig;

/// Tokens produced by a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tokens {
    #[serde(rename = "IdToken")]
    pub id_token: String,
    /// Absent on refresh-token grants
    #[serde(rename = "RefreshToken", default)]
    pub refresh_token: Option<String>,
}

/// Credentials accepted by [`IdentityProvider`].
#[derive(Clone)]
pub enum Credentials {
    Password { username: String, password: String },
    RefreshToken(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::RefreshToken(_) => f.write_str("RefreshToken(..)"),
        }
    }
}

/// An error reported by the identity provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct IdentityError {
    /// Provider error code, e.g. `NotAuthorizedException`
    pub code: String,
    pub message: String,
}

impl IdentityError {
    pub const NOT_AUTHORIZED: &'static str = "NotAuthorizedException";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The provider rejected the credentials themselves.
    pub fn is_not_authorized(&self) -> bool {
        self.code == Self::NOT_AUTHORIZED
    }
}

/// Blocking identity collaborator.
pub trait IdentityProvider: Send + Sync {
    /// Log in with username and password.
    fn obtain_token(&self, username: &str, password: &str) -> Result<Tokens, IdentityError>;

    /// Trade a refresh token for new tokens.
    fn refresh(&self, refresh_token: &str) -> Result<Tokens, IdentityError>;

    /// Dispatch on credential kind.
    fn authenticate(&self, credentials: &Credentials) -> Result<Tokens, IdentityError> {
        match credentials {
            Credentials::Password { username, password } => self.obtain_token(username, password),
            Credentials::RefreshToken(token) => self.refresh(token),
        }
    }
}

/// User pool client over the provider's JSON API.
#[derive(Debug, Clone)]
pub struct CognitoIdentityProvider {
    endpoint: String,
    client_id: String,
}

#[derive(Deserialize)]
struct InitiateAuthResponse {
    #[serde(rename = "AuthenticationResult")]
    authentication_result: Option<Tokens>,
    #[serde(rename = "ChallengeName")]
    challenge_name: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type")]
    kind: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

impl CognitoIdentityProvider {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            endpoint: config.endpoint_url(),
            client_id: config.client_id.clone(),
        }
    }

    fn initiate_auth(
        &self,
        flow: &str,
        parameters: serde_json::Value,
    ) -> Result<Tokens, IdentityError> {
        debug!(flow = %flow, endpoint = %self.endpoint, "Initiating auth");

        let body = json!({
            "AuthFlow": flow,
            "ClientId": self.client_id,
            "AuthParameters": parameters,
        });

        // Built per call: this runs on a blocking worker, never on the executor.
        let client = reqwest::blocking::Client::new();
        let response = client
            .post(&self.endpoint)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header(
                "X-Amz-Target",
                "AWSCognitoIdentityProviderService.InitiateAuth",
            )
            .body(body.to_string())
            .send()
            .map_err(|e| IdentityError::new("RequestFailed", e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| IdentityError::new("RequestFailed", e.to_string()))?;

        if !status.is_success() {
            return Err(parse_error_body(&text, status.as_u16()));
        }

        let parsed: InitiateAuthResponse = serde_json::from_str(&text)
            .map_err(|e| IdentityError::new("InvalidResponse", e.to_string()))?;

        debug!(flow = %flow, "Authentication response received");

        match parsed.authentication_result {
            Some(tokens) => Ok(tokens),
            None => Err(IdentityError::new(
                "ChallengeRequired",
                format!(
                    "Unsupported challenge {}",
                    parsed.challenge_name.unwrap_or_else(|| "<none>".into())
                ),
            )),
        }
    }
}

impl IdentityProvider for CognitoIdentityProvider {
    fn obtain_token(&self, username: &str, password: &str) -> Result<Tokens, IdentityError> {
        self.initiate_auth(
            "USER_PASSWORD_AUTH",
            json!({ "USERNAME": username, "PASSWORD": password }),
        )
    }

    fn refresh(&self, refresh_token: &str) -> Result<Tokens, IdentityError> {
        self.initiate_auth(
            "REFRESH_TOKEN_AUTH",
            json!({ "REFRESH_TOKEN": refresh_token }),
        )
    }
}

/// Error bodies look like `{"__type": "...#NotAuthorizedException", "message": "..."}`.
fn parse_error_body(text: &str, status: u16) -> IdentityError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => {
            let code = body
                .kind
                .as_deref()
                .map(|k| k.rsplit('#').next().unwrap_or(k).to_string())
                .unwrap_or_else(|| format!("Http{status}"));
            IdentityError::new(code, body.message.unwrap_or_default())
        }
        Err(_) => IdentityError::new(format!("Http{status}"), text.to_string()),
    }
}
