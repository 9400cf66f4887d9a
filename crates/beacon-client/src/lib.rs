//! Beacon Client
//!
//! Async runtime for the Beacon connection manager. Drives the Sans-IO
//! [`beacon_core::Connection`] machine against a real transport: spawns open
//! attempts, timers and reader tasks, dispatches inbound events to listeners,
//! and memoizes concurrent `connect()` calls into a single attempt.
//!
//! # Components
//!
//! - [`Realtime`]: the long-lived manager handle
//! - [`Transport`] / [`TransportLink`]: the seam a transport implements
//! - [`CredentialSource`]: supplies the bearer credential on demand
//! - [`ListenerRegistry`] / [`Subscription`]: event handlers that survive
//!   reconnects
//! - [`StateObservers`] / [`ErrorObservers`]: connected status and terminal
//!   failures, delivered in commit order
//! - [`SystemEnv`]: production clock
//!
//! # Transport (optional)
//!
//! With the `websocket` feature enabled, this crate also provides
//! [`websocket::WebSocketTransport`], built on `tokio-tungstenite`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod credential;
mod listeners;
mod realtime;
mod system_env;
mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use beacon_core::{
    AppPhase, CloseReason, ConnectError, ConnectFailure, ConnectionState, Credential, Envelope,
    RoomKind,
};
pub use config::{DEFAULT_BASE_URL, RealtimeConfig};
pub use credential::{CredentialSource, StaticCredential};
pub use listeners::{
    ErrorHandler, ErrorObservers, EventHandler, ListenerId, ListenerRegistry, ObserverHandler,
    Observers, StateHandler, StateObservers, Subscription,
};
pub use realtime::Realtime;
pub use system_env::SystemEnv;
pub use transport::{Inbound, OpenRequest, Transport, TransportLink};
