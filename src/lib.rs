//! nice-go - Client for the Nice G.O. barrier gateway
//!
//! Authenticates against the vendor user pool, discovers the service
//! endpoints, keeps a live graphql-ws subscription open for device state
//! and controls gates and garage doors over the HTTPS GraphQL API.
//!
//! ## Architecture
//!
//! | Layer       | Module                          |
//! |-------------|---------------------------------|
//! | Identity    | `identity` (user pool login)    |
//! | Discovery   | `endpoints`                     |
//! | Live state  | `gateway` (graphql-ws channel)  |
//! | Session     | `session` (reconnect loop)      |
//! | Devices     | `device`, `graphql`             |
//!
//! ## Usage
//!
//! ```ignore
//! use nice_go::{ClientConfig, Event, Session};
//!
//! let session = Session::new(ClientConfig::load("nice-go.toml")?);
//! session.authenticate("user@example.com", "password", reqwest::Client::new()).await?;
//!
//! session.on("data", |event: Event| async move {
//!     println!("{:?}", event.device_state());
//!     Ok(())
//! });
//!
//! let runner = session.clone();
//! tokio::spawn(async move { runner.connect(true).await });
//!
//! for barrier in session.get_all_barriers().await? {
//!     barrier.open().await?;
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod device;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod gateway;
pub mod graphql;
pub mod identity;
pub mod mock;
pub mod session;

// Re-exports
pub use backoff::ExponentialBackoff;
pub use config::{BackoffConfig, ClientConfig, IdentityConfig};
pub use device::{Attribute, Barrier, BarrierState, ConnectionState};
pub use endpoints::Endpoints;
pub use error::{ChannelError, NiceGoError, Result};
pub use events::{Event, EventDispatcher};
pub use gateway::{Channel, ChannelState, ChannelTimeouts};
pub use identity::{CognitoIdentityProvider, Credentials, IdentityError, IdentityProvider, Tokens};
pub use session::Session;
