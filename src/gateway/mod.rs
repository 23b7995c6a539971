//! Device Subscription Gateway
//!
//! A graphql-ws WebSocket channel carrying live device state.
//!
//! # Architecture
//!
//! | Module        | Responsibility                                      |
//! |---------------|-----------------------------------------------------|
//! | `transport`   | WebSocket connect/send/receive                      |
//! | `protocol`    | graphql-ws frames, connection URL                   |
//! | `correlation` | Waiting for a reply frame (`start_ack`, ...)        |
//! | `channel`     | Handshake, keepalive, subscriptions, close          |
//!
//! The reconnect loop lives in [`crate::session`]; a [`Channel`] lives for
//! exactly one connection.
//!
//! # Usage
//!
//! ```ignore
//! use nice_go::gateway::{Channel, ChannelTimeouts, WsConnector};
//!
//! let channel = Channel::connect(
//!     &WsConnector,
//!     &id_token,
//!     &wss_endpoint,
//!     dispatch,
//!     Some("api.example.com"),
//!     ChannelTimeouts::default(),
//! ).await?;
//!
//! let subscription = channel.subscribe(&receiver).await?;
//! loop {
//!     channel.poll().await?;
//! }
//! ```

pub mod channel;
pub mod correlation;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, ChannelState, ChannelTimeouts, Dispatch, Outbound};
pub use correlation::{Pending, Predicate, Registry};
pub use transport::{Connector, FrameSink, FrameStream, Inbound, WsConnector, GRAPHQL_WS_PROTOCOL};
